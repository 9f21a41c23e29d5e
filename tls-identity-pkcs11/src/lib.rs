//! A crate that lets an HTTP client authenticate a TLS handshake with a
//! client certificate and private key held on a PKCS#11 token (smartcard,
//! HSM, or software module such as SoftHSM or the NSS softoken), instead of
//! reading key material from disk.
//!
//! When the server requests a client certificate mid-handshake, the
//! [`TokenIdentity`] enumerates the slots exposed by the provider module,
//! authenticates to the first token that needs it (interactively via a PIN
//! callback, or through the token's own protected authentication path),
//! locates a certificate/private-key pair on the token, and later signs the
//! handshake digest on the token itself. The private key never leaves the
//! device.
//!
//! # Example
//!
//! ```rust,no_run
//! use tls_identity_pkcs11::{Pin, PinCallback, TokenIdentity};
//! # fn main() -> Result<(), tls_identity_pkcs11::TokenIdentityError> {
//! let pin_fn: PinCallback = Box::new(|_request| {
//!     // Prompt the user here; the request carries the attempt number, the
//!     // slot description, the token label and the PIN-status flags.
//!     Ok(Pin::new("123456"))
//! });
//! let mut identity = TokenIdentity::new("/usr/lib/opensc-pkcs11.so", Some(pin_fn))?;
//! // Invoked by the TLS layer when the server asks for a client certificate:
//! if let Some(certificate) = identity.provide_certificate(&[]) {
//!     let _der = certificate.der();
//! }
//! // Later, when the handshake needs a signature over its digest:
//! # let digest = [0u8; 36];
//! let _signature = identity.sign(&digest)?;
//! # Ok(())
//! # }
//! ```
//!
//! Only RSA certificate/key pairs are supported: the private-key search and
//! the signing mechanism are fixed to the RSA family rather than derived
//! from the certificate. Sessions are not shared or pooled; every
//! [`TokenIdentity`] owns its provider module and its one token session.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

#[cfg(feature = "pkcs11")]
pub(crate) mod identity;
#[cfg(feature = "pkcs11")]
pub(crate) mod login;
#[cfg(all(test, feature = "pkcs11"))]
pub(crate) mod mock;
#[cfg(feature = "pkcs11")]
pub(crate) mod objects;
pub(crate) mod pin;
#[cfg(feature = "pkcs11")]
pub(crate) mod provider;
#[cfg(feature = "pkcs11")]
pub(crate) mod utils;

#[cfg(feature = "pkcs11")]
pub use identity::TokenIdentity;
#[cfg(feature = "pkcs11")]
pub use objects::ClientCertificate;
pub use pin::{Pin, PinCallback, PinFlags, PinRequest};

#[cfg(feature = "pkcs11")]
use pkcs11::types::{CKK_RSA, CKM_RSA_PKCS, CK_KEY_TYPE, CK_MECHANISM_TYPE};
use thiserror::Error;

/// The opaque byte string a token assigns to a certificate object and to the
/// private-key object that belongs to it. Carried byte-for-byte from the
/// certificate search into the key search.
#[cfg(feature = "pkcs11")]
pub(crate) type CorrelationId = Vec<u8>;

// Only the RSA family is supported. The key-type filter is a fixed constant
// rather than derived from the certificate's public-key algorithm, and the
// signing mechanism must stay in agreement with it.
#[cfg(feature = "pkcs11")]
pub(crate) const FIXED_KEY_TYPE: CK_KEY_TYPE = CKK_RSA;
#[cfg(feature = "pkcs11")]
pub(crate) const SIGNING_MECHANISM: CK_MECHANISM_TYPE = CKM_RSA_PKCS;

/// An error related to a [`TokenIdentity`].
///
/// Per-slot failures (a wrong PIN, a token without a usable certificate) are
/// not errors: they only remove that slot from consideration while a
/// certificate is being provisioned.
#[derive(Error, Debug)]
pub enum TokenIdentityError {
    /// The PKCS#11 provider module could not be loaded or initialized.
    #[cfg(feature = "pkcs11")]
    #[error("could not load PKCS#11 provider module {path}: {source}")]
    ProviderLoad {
        /// Path of the provider module that failed to load.
        path: String,
        /// The provider's diagnostic, including the raw return value.
        #[source]
        source: pkcs11::errors::Error,
    },

    /// No certificate and private key have been provisioned yet, so there is
    /// nothing to sign with.
    #[error("no client certificate and key have been provisioned")]
    NotProvisioned,

    /// The token rejected the attempt to initialize the signing operation.
    #[cfg(feature = "pkcs11")]
    #[error("could not initialize the token signing operation")]
    SignInit(#[source] pkcs11::errors::Error),

    /// The token failed the signing operation itself.
    #[cfg(feature = "pkcs11")]
    #[error("token signing operation failed")]
    Sign(#[source] pkcs11::errors::Error),

    /// A client-certificate provider is already installed on this session.
    #[error("a client-certificate provider is already installed")]
    ProviderAlreadyInstalled,

    /// This build of the crate does not include PKCS#11 provider support.
    #[error("this build does not include PKCS#11 provider support")]
    ProvisioningUnavailable,
}

/// Configuration for loading an NSS-style provider module, which expects a
/// certificate/key database instead of a bare module path.
#[derive(Debug, Clone, Copy)]
pub struct NssDbParams<'a> {
    /// Directory holding the NSS database.
    pub directory: &'a str,
    /// Prefix of the certificate database files.
    pub cert_prefix: &'a str,
    /// Prefix of the key database files.
    pub key_prefix: &'a str,
    /// Path of the security-module database.
    pub secmod_db: &'a str,
}

/// The single optional client-certificate provider slot of an HTTP session.
///
/// A session can hold at most one provider; installing a second one is a
/// configuration error rather than a silent replacement.
#[derive(Debug, Default)]
pub struct ProviderSlot {
    identity: Option<TokenIdentity>,
}

impl ProviderSlot {
    /// Creates an empty provider slot.
    pub fn new() -> Self {
        ProviderSlot::default()
    }

    /// Installs `identity` as the session's client-certificate provider.
    ///
    /// Fails with [`TokenIdentityError::ProviderAlreadyInstalled`] if a
    /// provider is already installed; the rejected identity is dropped and
    /// its provider module released.
    pub fn install(&mut self, identity: TokenIdentity) -> Result<(), TokenIdentityError> {
        if self.identity.is_some() {
            return Err(TokenIdentityError::ProviderAlreadyInstalled);
        }
        self.identity = Some(identity);
        Ok(())
    }

    /// The installed provider, if any.
    pub fn identity(&self) -> Option<&TokenIdentity> {
        self.identity.as_ref()
    }

    /// Mutable access to the installed provider, if any.
    pub fn identity_mut(&mut self) -> Option<&mut TokenIdentity> {
        self.identity.as_mut()
    }

    /// Removes and returns the installed provider.
    pub fn take(&mut self) -> Option<TokenIdentity> {
        self.identity.take()
    }
}

/// A client-certificate identity backed by a PKCS#11 token.
///
/// This build was made without PKCS#11 provider support; both constructors
/// fail with [`TokenIdentityError::ProvisioningUnavailable`].
#[cfg(not(feature = "pkcs11"))]
#[derive(Debug)]
pub struct TokenIdentity {
    _unsupported: (),
}

#[cfg(not(feature = "pkcs11"))]
impl TokenIdentity {
    /// Always fails: this build has no PKCS#11 provider support.
    pub fn new<P: AsRef<std::path::Path>>(
        _module_path: P,
        _pin_callback: Option<PinCallback>,
    ) -> Result<Self, TokenIdentityError> {
        Err(TokenIdentityError::ProvisioningUnavailable)
    }

    /// Always fails: this build has no PKCS#11 provider support.
    pub fn with_nss_params<P: AsRef<std::path::Path>>(
        _module_path: P,
        _params: &NssDbParams<'_>,
        _pin_callback: Option<PinCallback>,
    ) -> Result<Self, TokenIdentityError> {
        Err(TokenIdentityError::ProvisioningUnavailable)
    }
}
