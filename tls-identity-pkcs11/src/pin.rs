//! The PIN-entry callback contract.
//!
//! Tokens that require an interactive login obtain their PIN through a
//! caller-supplied callback. The callback may block indefinitely (for
//! example on human interaction); no timeout is imposed here.

use std::fmt;

use zeroize::Zeroizing;

/// Status flags passed to the PIN callback, taken from the token's own
/// report for the attempt being made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinFlags {
    /// An incorrect PIN has been entered at least once since the last
    /// successful login.
    pub count_low: bool,
    /// Supplying another incorrect PIN will lock the token.
    pub final_try: bool,
}

/// A single PIN prompt.
///
/// The token flags are a fresh snapshot for this attempt; they may differ
/// from one attempt to the next.
#[derive(Debug, Clone, Copy)]
pub struct PinRequest<'a> {
    /// The attempt number, starting at 1 and increasing by one for every
    /// re-prompt after an incorrect PIN.
    pub attempt: u32,
    /// Human-readable description of the slot holding the token.
    pub slot_description: &'a str,
    /// The token's label.
    pub token_label: &'a str,
    /// PIN-status flags for this attempt.
    pub flags: PinFlags,
}

/// A PIN value returned by the callback.
///
/// The backing buffer is overwritten with zeros when the value is dropped,
/// which happens immediately after each login attempt. This is a best-effort
/// scrub: copies made by the provider library or left in stack frames are
/// outside this crate's control.
pub struct Pin(Zeroizing<String>);

impl Pin {
    /// Wraps a PIN value.
    pub fn new(pin: impl Into<String>) -> Self {
        Pin(Zeroizing::new(pin.into()))
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin([redacted])")
    }
}

/// Callback invoked to obtain a PIN for a token login.
///
/// Returning `Err` aborts the login for that slot; the error text is logged
/// and the slot is skipped.
pub type PinCallback = Box<dyn Fn(&PinRequest<'_>) -> Result<Pin, String>>;
