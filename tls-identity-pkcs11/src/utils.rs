// Descriptive strings fetched from a provider (slot description, token
// label) are fixed-width fields padded with spaces, and some providers pad
// with tabs or NULs instead. Trim the padding before the value reaches the
// PIN callback or the log.
pub(crate) fn trim_padded(raw: &str) -> &str {
    raw.trim_end_matches(|c| c == ' ' || c == '\t' || c == '\0')
}
