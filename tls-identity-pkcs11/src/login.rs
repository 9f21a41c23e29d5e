//! Per-slot login control.
//!
//! Establishes an authenticated session on one slot, using either the
//! token's out-of-band authentication path or an interactive PIN loop.

use log::{debug, warn};
use pkcs11::errors::Error;
use pkcs11::types::{CKR_PIN_INCORRECT, CK_SESSION_HANDLE, CK_SLOT_ID};

use crate::pin::{PinCallback, PinFlags, PinRequest};
use crate::provider::{TokenInfo, TokenOps};

/// Why a slot could not be logged in. Terminal for that slot only;
/// enumeration continues with the next slot.
#[derive(thiserror::Error, Debug)]
pub(crate) enum LoginFailure {
    #[error("token info query failed: {0}")]
    TokenInfo(#[source] Error),

    #[error("login required but no PIN callback is registered")]
    NoPinCallback,

    #[error("PIN entry aborted: {0}")]
    Aborted(String),

    #[error("token rejected the login: {0}")]
    Rejected(#[source] Error),
}

/// Which authentication path the token's current flags call for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPath {
    /// Private objects are accessible without logging in.
    NoLoginNeeded,
    /// The token authenticates the user out of band (PIN pad, fingerprint
    /// reader); login is attempted once with no credential.
    ProtectedPath,
    /// A PIN must be obtained from the callback and may be re-prompted.
    PinEntry,
}

fn classify(info: &TokenInfo) -> AuthPath {
    if !info.login_required {
        AuthPath::NoLoginNeeded
    } else if info.protected_auth_path {
        AuthPath::ProtectedPath
    } else {
        AuthPath::PinEntry
    }
}

/// Authenticates `session` against the token in `slot`.
///
/// On success the session can be searched for private objects. Any failure
/// only eliminates this slot; the caller closes the session and moves on.
pub(crate) fn authenticate(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
    slot: CK_SLOT_ID,
    slot_description: &str,
    pin_callback: Option<&PinCallback>,
) -> Result<(), LoginFailure> {
    let info = provider.token_info(slot).map_err(LoginFailure::TokenInfo)?;

    match classify(&info) {
        AuthPath::NoLoginNeeded => {
            debug!("slot {}: no login required", slot);
            Ok(())
        }
        AuthPath::ProtectedPath => protected_login(provider, session, slot),
        AuthPath::PinEntry => pin_loop(provider, session, slot, slot_description, info, pin_callback),
    }
}

// The out-of-band mechanism handles its own retries, so a failure here is
// terminal.
fn protected_login(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
    slot: CK_SLOT_ID,
) -> Result<(), LoginFailure> {
    provider
        .login_user(session, None)
        .map_err(LoginFailure::Rejected)?;
    debug!("slot {}: protected authentication path login succeeded", slot);
    Ok(())
}

fn pin_loop(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
    slot: CK_SLOT_ID,
    slot_description: &str,
    first_info: TokenInfo,
    pin_callback: Option<&PinCallback>,
) -> Result<(), LoginFailure> {
    let pin_callback = pin_callback.ok_or(LoginFailure::NoPinCallback)?;

    let mut info = first_info;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if attempt > 1 {
            // The PIN-status flags may have changed after a failed attempt;
            // take a fresh snapshot for this prompt.
            info = provider.token_info(slot).map_err(LoginFailure::TokenInfo)?;
        }

        let request = PinRequest {
            attempt,
            slot_description,
            token_label: &info.label,
            flags: PinFlags {
                count_low: info.pin_count_low,
                final_try: info.pin_final_try,
            },
        };
        let pin = pin_callback(&request).map_err(LoginFailure::Aborted)?;
        let outcome = provider.login_user(session, Some(pin.expose()));
        // The PIN buffer is zeroed here, whatever the outcome.
        drop(pin);

        match outcome {
            Ok(()) => {
                debug!("slot {}: login succeeded on attempt {}", slot, attempt);
                return Ok(());
            }
            Err(Error::Pkcs11(rv)) if rv == CKR_PIN_INCORRECT => {
                warn!("slot {}: PIN incorrect on attempt {}", slot, attempt);
            }
            Err(err) => return Err(LoginFailure::Rejected(err)),
        }
    }
}
