//! The seam to the PKCS#11 provider module.
//!
//! [`TokenOps`] captures the fixed request/response contract this crate
//! consumes from a provider; [`Pkcs11Module`] implements it against a real
//! Cryptoki library. The unit tests substitute a scripted provider.

use std::ffi::CString;
use std::path::Path;

use log::debug;
use pkcs11::errors::Error;
use pkcs11::types::{
    CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_ID, CKA_KEY_TYPE, CKF_LOGIN_REQUIRED, CKF_OS_LOCKING_OK,
    CKF_PROTECTED_AUTHENTICATION_PATH, CKF_SERIAL_SESSION, CKF_TOKEN_PRESENT,
    CKF_USER_PIN_COUNT_LOW, CKF_USER_PIN_FINAL_TRY, CKU_USER, CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE,
    CK_CERTIFICATE_TYPE, CK_C_INITIALIZE_ARGS, CK_KEY_TYPE, CK_MECHANISM, CK_MECHANISM_TYPE,
    CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CK_VOID_PTR,
    CK_UNAVAILABLE_INFORMATION,
};
use pkcs11::Ctx;

use crate::utils::trim_padded;
use crate::{NssDbParams, TokenIdentityError};

// An object search is drained in batches of this many handles.
const FIND_OBJECTS_BATCH: CK_ULONG = 16;

/// Transient description of a slot; only the description text outlives the
/// enumeration step, as part of PIN prompts.
#[derive(Debug, Clone)]
pub(crate) struct SlotDescriptor {
    pub token_present: bool,
    pub description: String,
}

/// Transient snapshot of a token's login requirements. Re-fetched after
/// every failed login attempt because the flags may change between attempts.
#[derive(Debug, Clone)]
pub(crate) struct TokenInfo {
    pub login_required: bool,
    pub protected_auth_path: bool,
    pub pin_count_low: bool,
    pub pin_final_try: bool,
    pub label: String,
}

/// One `(attribute, value)` filter of an object search.
#[derive(Debug, Clone)]
pub(crate) enum SearchFilter {
    Class(CK_OBJECT_CLASS),
    CertificateType(CK_CERTIFICATE_TYPE),
    KeyType(CK_KEY_TYPE),
    Id(Vec<u8>),
}

impl SearchFilter {
    fn scalar(&self) -> Option<CK_ULONG> {
        match self {
            SearchFilter::Class(value) => Some(*value),
            SearchFilter::CertificateType(value) => Some(*value),
            SearchFilter::KeyType(value) => Some(*value),
            SearchFilter::Id(_) => None,
        }
    }
}

/// The operations this crate consumes from a token provider.
///
/// Every call blocks the calling thread until the provider returns.
pub(crate) trait TokenOps {
    /// Slots the provider reports as holding a token.
    fn slots_with_token(&self) -> Result<Vec<CK_SLOT_ID>, Error>;

    fn slot_info(&self, slot: CK_SLOT_ID) -> Result<SlotDescriptor, Error>;

    fn token_info(&self, slot: CK_SLOT_ID) -> Result<TokenInfo, Error>;

    fn open_session(&self, slot: CK_SLOT_ID) -> Result<CK_SESSION_HANDLE, Error>;

    fn close_session(&self, session: CK_SESSION_HANDLE);

    /// Logs in as the user role. `None` means no credential is sent, which
    /// is how tokens with a protected authentication path are unlocked.
    fn login_user(&self, session: CK_SESSION_HANDLE, pin: Option<&str>) -> Result<(), Error>;

    /// Runs a complete object search: initialize, drain, finalize.
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        filters: &[SearchFilter],
    ) -> Result<Vec<CK_OBJECT_HANDLE>, Error>;

    fn read_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, Error>;

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error>;

    /// Signs `digest` with the operation prepared by [`TokenOps::sign_init`].
    ///
    /// On the wire this is two calls: a NULL-buffer probe for the signature
    /// length, then a second call to fill a buffer of exactly that length.
    /// The provider contract does not guarantee the length can be known in
    /// advance.
    fn sign(&self, session: CK_SESSION_HANDLE, digest: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A loaded PKCS#11 provider module.
///
/// Exclusively owned by one identity; dropping it finalizes the module.
#[derive(Debug)]
pub(crate) struct Pkcs11Module {
    ctx: Ctx,
}

impl Pkcs11Module {
    /// Loads and initializes the provider module at `path`.
    pub(crate) fn load(path: &Path) -> Result<Self, TokenIdentityError> {
        let ctx = Ctx::new_and_initialize(path).map_err(|source| load_error(path, source))?;
        Ok(Pkcs11Module { ctx })
    }

    /// Loads the provider module at `path` and initializes it with an
    /// NSS-style database configuration instead of the default arguments.
    pub(crate) fn load_with_nss_params(
        path: &Path,
        params: &NssDbParams<'_>,
    ) -> Result<Self, TokenIdentityError> {
        let config = format!(
            "configdir='{}' certPrefix='{}' keyPrefix='{}' secmod='{}' flags=readOnly",
            params.directory, params.cert_prefix, params.key_prefix, params.secmod_db
        );
        let config = CString::new(config)
            .map_err(|_| load_error(path, Error::InvalidInput("NSS parameters contain a NUL byte")))?;

        let mut ctx = Ctx::new(path).map_err(|source| load_error(path, source))?;
        let mut args = CK_C_INITIALIZE_ARGS::new();
        args.flags = CKF_OS_LOCKING_OK;
        // The NSS softoken reads its database configuration from the
        // reserved initialization field.
        args.pReserved = config.as_ptr() as CK_VOID_PTR;
        ctx.initialize(Some(args))
            .map_err(|source| load_error(path, source))?;
        Ok(Pkcs11Module { ctx })
    }
}

fn load_error(path: &Path, source: Error) -> TokenIdentityError {
    TokenIdentityError::ProviderLoad {
        path: path.display().to_string(),
        source,
    }
}

impl TokenOps for Pkcs11Module {
    fn slots_with_token(&self) -> Result<Vec<CK_SLOT_ID>, Error> {
        self.ctx.get_slot_list(true)
    }

    fn slot_info(&self, slot: CK_SLOT_ID) -> Result<SlotDescriptor, Error> {
        let info = self.ctx.get_slot_info(slot)?;
        let description = info.slotDescription.to_string();
        Ok(SlotDescriptor {
            token_present: info.flags & CKF_TOKEN_PRESENT != 0,
            description: trim_padded(&description).to_string(),
        })
    }

    fn token_info(&self, slot: CK_SLOT_ID) -> Result<TokenInfo, Error> {
        let info = self.ctx.get_token_info(slot)?;
        let label = info.label.to_string();
        Ok(TokenInfo {
            login_required: info.flags & CKF_LOGIN_REQUIRED != 0,
            protected_auth_path: info.flags & CKF_PROTECTED_AUTHENTICATION_PATH != 0,
            pin_count_low: info.flags & CKF_USER_PIN_COUNT_LOW != 0,
            pin_final_try: info.flags & CKF_USER_PIN_FINAL_TRY != 0,
            label: trim_padded(&label).to_string(),
        })
    }

    fn open_session(&self, slot: CK_SLOT_ID) -> Result<CK_SESSION_HANDLE, Error> {
        self.ctx.open_session(slot, CKF_SERIAL_SESSION, None, None)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) {
        if let Err(err) = self.ctx.close_session(session) {
            debug!("failed to close token session {}: {}", session, err);
        }
    }

    fn login_user(&self, session: CK_SESSION_HANDLE, pin: Option<&str>) -> Result<(), Error> {
        self.ctx.login(session, CKU_USER, pin)
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        filters: &[SearchFilter],
    ) -> Result<Vec<CK_OBJECT_HANDLE>, Error> {
        // CK_ATTRIBUTE stores a pointer to its value, so the scalar values
        // need backing storage that stays alive until the search finishes.
        let scalars: Vec<CK_ULONG> = filters.iter().filter_map(SearchFilter::scalar).collect();
        let mut next_scalar = 0;
        let mut template = Vec::with_capacity(filters.len());
        for filter in filters {
            let attribute = match filter {
                SearchFilter::Class(_) => CK_ATTRIBUTE::new(CKA_CLASS),
                SearchFilter::CertificateType(_) => CK_ATTRIBUTE::new(CKA_CERTIFICATE_TYPE),
                SearchFilter::KeyType(_) => CK_ATTRIBUTE::new(CKA_KEY_TYPE),
                SearchFilter::Id(id) => {
                    template.push(CK_ATTRIBUTE::new(CKA_ID).with_bytes(id));
                    continue;
                }
            };
            template.push(attribute.with_ck_ulong(&scalars[next_scalar]));
            next_scalar += 1;
        }

        // A session can have at most one active search at a time, so the
        // search is finalized before returning, even on failure.
        self.ctx.find_objects_init(session, &template)?;
        let mut handles = Vec::new();
        let result = loop {
            match self.ctx.find_objects(session, FIND_OBJECTS_BATCH) {
                Ok(batch) if batch.is_empty() => break Ok(handles),
                Ok(batch) => handles.extend_from_slice(&batch),
                Err(err) => break Err(err),
            }
        };
        let _ = self.ctx.find_objects_final(session);
        result
    }

    fn read_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, Error> {
        // The provider reports the length first; a second call fills the
        // buffer.
        let mut probe = vec![CK_ATTRIBUTE::new(attribute)];
        self.ctx.get_attribute_value(session, object, &mut probe)?;
        let length = probe[0].ulValueLen;
        if length == CK_UNAVAILABLE_INFORMATION {
            return Err(Error::UnavailableInformation);
        }

        let value = vec![0; length as usize];
        let mut template = vec![CK_ATTRIBUTE::new(attribute).with_bytes(value.as_slice())];
        self.ctx.get_attribute_value(session, object, &mut template)?;
        Ok(value)
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        let mechanism = CK_MECHANISM {
            mechanism,
            pParameter: std::ptr::null_mut(),
            ulParameterLen: 0,
        };
        self.ctx.sign_init(session, &mechanism, key)
    }

    fn sign(&self, session: CK_SESSION_HANDLE, digest: &[u8]) -> Result<Vec<u8>, Error> {
        self.ctx.sign(session, digest)
    }
}
