//! The per-session identity that owns the provider module, the token
//! session and the located private key.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use pkcs11::types::{CK_OBJECT_HANDLE, CK_SESSION_HANDLE};

use crate::login;
use crate::objects;
use crate::objects::ClientCertificate;
use crate::pin::PinCallback;
use crate::provider::{Pkcs11Module, TokenOps};
use crate::{NssDbParams, TokenIdentityError, SIGNING_MECHANISM};

/// A client-certificate identity backed by a PKCS#11 token.
///
/// Created once per HTTP session and torn down with it. The identity starts
/// unprovisioned; the first call to [`TokenIdentity::provide_certificate`]
/// that finds a usable certificate/key pair fixes one token session and one
/// key handle for the rest of the identity's lifetime.
///
/// Must not be shared across sessions or threads: the provider module and
/// the token session are exclusively owned.
pub struct TokenIdentity {
    provider: Box<dyn TokenOps>,
    module_path: PathBuf,
    pin_callback: Option<PinCallback>,
    credential: Option<Credential>,
}

/// The state fixed by a successful provisioning run. The key handle is a
/// reference into the session, not owned memory: it is only meaningful
/// while `session` stays open, which is why the two travel together.
pub(crate) struct Credential {
    pub session: CK_SESSION_HANDLE,
    pub key: CK_OBJECT_HANDLE,
    pub certificate: ClientCertificate,
}

impl TokenIdentity {
    /// Loads the PKCS#11 provider module at `module_path`.
    ///
    /// The `pin_callback` is invoked whenever a token requires an
    /// interactive login; without one, such tokens are skipped.
    pub fn new<P: AsRef<Path>>(
        module_path: P,
        pin_callback: Option<PinCallback>,
    ) -> Result<Self, TokenIdentityError> {
        let module = Pkcs11Module::load(module_path.as_ref())?;
        Ok(Self::assemble(
            Box::new(module),
            module_path.as_ref().to_path_buf(),
            pin_callback,
        ))
    }

    /// Loads a provider module that needs an NSS-style database
    /// configuration (directory, file prefixes, security-module database)
    /// instead of a bare path.
    pub fn with_nss_params<P: AsRef<Path>>(
        module_path: P,
        params: &NssDbParams<'_>,
        pin_callback: Option<PinCallback>,
    ) -> Result<Self, TokenIdentityError> {
        let module = Pkcs11Module::load_with_nss_params(module_path.as_ref(), params)?;
        Ok(Self::assemble(
            Box::new(module),
            module_path.as_ref().to_path_buf(),
            pin_callback,
        ))
    }

    fn assemble(
        provider: Box<dyn TokenOps>,
        module_path: PathBuf,
        pin_callback: Option<PinCallback>,
    ) -> Self {
        TokenIdentity {
            provider,
            module_path,
            pin_callback,
            credential: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(provider: Box<dyn TokenOps>, pin_callback: Option<PinCallback>) -> Self {
        Self::assemble(provider, PathBuf::from("<test provider>"), pin_callback)
    }

    /// Provides the client certificate, provisioning it from the token on
    /// first use.
    ///
    /// Invoked by the TLS layer when the server requests a client
    /// certificate. `_acceptable_issuers` (the server's certificate-issuer
    /// list) is accepted for callback compatibility but not used to filter
    /// candidates: any importable certificate/key pair is offered.
    ///
    /// Returns `None` when no slot yields a usable pair; the handshake then
    /// proceeds without a client certificate. This is not an error.
    pub fn provide_certificate(
        &mut self,
        _acceptable_issuers: &[&[u8]],
    ) -> Option<&ClientCertificate> {
        if self.credential.is_none() {
            debug!(
                "provisioning client certificate from module {}",
                self.module_path.display()
            );
            self.credential = provision(&*self.provider, self.pin_callback.as_ref());
        }
        self.credential.as_ref().map(|credential| &credential.certificate)
    }

    /// The provisioned certificate, if any.
    pub fn certificate(&self) -> Option<&ClientCertificate> {
        self.credential.as_ref().map(|credential| &credential.certificate)
    }

    /// Signs `digest` on the token with the provisioned private key.
    ///
    /// Invoked by the TLS layer when the handshake needs the
    /// certificate-verify signature. Fails with
    /// [`TokenIdentityError::NotProvisioned`] when no certificate and key
    /// are fixed; a signing failure at this point aborts the handshake
    /// attempt, since no fallback slot remains to try.
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, TokenIdentityError> {
        sign_with(&*self.provider, self.credential.as_ref(), digest)
    }
}

impl fmt::Debug for TokenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIdentity")
            .field("module_path", &self.module_path)
            .field("pin_callback", &self.pin_callback.is_some())
            .field("provisioned", &self.credential.is_some())
            .finish()
    }
}

impl Drop for TokenIdentity {
    fn drop(&mut self) {
        if let Some(credential) = self.credential.take() {
            self.provider.close_session(credential.session);
        }
        // Dropping the provider finalizes the module, exactly once.
    }
}

/// Walks the slots in enumeration order and fixes the first one where login
/// and the object search both succeed. Every other opened session is closed
/// before the next slot is tried; the winning session is left open and
/// enumeration stops immediately.
pub(crate) fn provision(
    provider: &dyn TokenOps,
    pin_callback: Option<&PinCallback>,
) -> Option<Credential> {
    let slots = match provider.slots_with_token() {
        Ok(slots) => slots,
        Err(err) => {
            debug!("slot enumeration failed, no client certificate available: {}", err);
            return None;
        }
    };
    if slots.is_empty() {
        debug!("no slots with a token present");
        return None;
    }

    for slot in slots {
        let descriptor = match provider.slot_info(slot) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!("slot {}: info query failed, skipped: {}", slot, err);
                continue;
            }
        };
        if !descriptor.token_present {
            debug!("slot {}: empty, ignoring", slot);
            continue;
        }

        let session = match provider.open_session(slot) {
            Ok(session) => session,
            Err(err) => {
                warn!("slot {}: could not open session: {}", slot, err);
                continue;
            }
        };

        match login::authenticate(provider, session, slot, &descriptor.description, pin_callback) {
            Ok(()) => match objects::find_credential(provider, session) {
                Ok(Some(matched)) => {
                    debug!("slot {}: client certificate and key fixed", slot);
                    return Some(Credential {
                        session,
                        key: matched.key,
                        certificate: matched.certificate,
                    });
                }
                Ok(None) => debug!("slot {}: no usable certificate/key pair", slot),
                Err(err) => warn!("slot {}: object search failed: {}", slot, err),
            },
            Err(err) => debug!("slot {}: login failed: {}", slot, err),
        }

        provider.close_session(session);
    }

    None
}

/// The signing delegate: initializes a sign operation with the fixed
/// mechanism against the fixed key, then obtains the signature.
pub(crate) fn sign_with(
    provider: &dyn TokenOps,
    credential: Option<&Credential>,
    digest: &[u8],
) -> Result<Vec<u8>, TokenIdentityError> {
    let credential = credential.ok_or(TokenIdentityError::NotProvisioned)?;

    provider
        .sign_init(credential.session, SIGNING_MECHANISM, credential.key)
        .map_err(TokenIdentityError::SignInit)?;
    provider
        .sign(credential.session, digest)
        .map_err(TokenIdentityError::Sign)
}
