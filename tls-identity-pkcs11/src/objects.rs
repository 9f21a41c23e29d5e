//! Locating the certificate and private-key objects on a token.
//!
//! Within one authenticated session, the matcher first looks for an X.509
//! certificate object that imports cleanly, then for the private-key object
//! carrying the same token-assigned ID. Both searches must succeed on the
//! same slot for it to be usable.

use std::fmt;

use log::{debug, trace};
use pkcs11::errors::Error;
use pkcs11::types::{
    CKA_ID, CKA_SUBJECT, CKA_VALUE, CKC_X_509, CKO_CERTIFICATE, CKO_PRIVATE_KEY,
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE,
};
use simple_asn1::ASN1Block;

use crate::provider::{SearchFilter, TokenOps};
use crate::{CorrelationId, FIXED_KEY_TYPE};

/// An X.509 client certificate imported from a token, as DER bytes ready to
/// be handed to the TLS layer.
pub struct ClientCertificate {
    der: Vec<u8>,
}

impl ClientCertificate {
    /// Imports certificate bytes fetched from a token. Objects whose value
    /// is not a plausible DER-encoded certificate are rejected so the
    /// search can move on to the next candidate.
    pub(crate) fn from_der(der: Vec<u8>) -> Result<Self, ImportError> {
        let blocks = simple_asn1::from_der(&der).map_err(ImportError::Der)?;
        match blocks.first() {
            // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm,
            // signatureValue }
            Some(ASN1Block::Sequence(_, parts)) if parts.len() == 3 => {
                Ok(ClientCertificate { der })
            }
            _ => Err(ImportError::NotACertificate),
        }
    }

    /// The DER encoding of the certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("der_len", &self.der.len())
            .finish()
    }
}

// ASN1DecodeErr does not implement the Error trait, so it is formatted
// rather than chained as a source.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ImportError {
    #[error("certificate value is not valid DER: {0}")]
    Der(simple_asn1::ASN1DecodeErr),

    #[error("certificate value is not an X.509 certificate sequence")]
    NotACertificate,
}

/// A certificate and the private key that belongs to it, located on one
/// token. The key handle is only valid while the session that produced it
/// stays open.
pub(crate) struct MatchedCredential {
    pub certificate: ClientCertificate,
    pub key: CK_OBJECT_HANDLE,
}

/// Runs the certificate search followed by the key search.
///
/// `Ok(None)` means this slot has no usable pair; the caller closes the
/// session and moves on. Repeated calls over the same catalog of objects
/// yield the same outcome: each search is initialized, drained and
/// finalized per call, and no state is carried between calls.
pub(crate) fn find_credential(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
) -> Result<Option<MatchedCredential>, Error> {
    let Some((certificate, correlation_id)) = find_certificate(provider, session)? else {
        debug!("no importable X.509 certificate on this token");
        return Ok(None);
    };

    match find_private_key(provider, session, &correlation_id)? {
        Some(key) => Ok(Some(MatchedCredential { certificate, key })),
        None => {
            debug!(
                "no private key matches certificate id {}",
                hex::encode(&correlation_id)
            );
            Ok(None)
        }
    }
}

// The first certificate object that imports successfully wins; candidates
// with missing attributes or unimportable encodings are skipped silently.
fn find_certificate(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
) -> Result<Option<(ClientCertificate, CorrelationId)>, Error> {
    let filters = [
        SearchFilter::Class(CKO_CERTIFICATE),
        SearchFilter::CertificateType(CKC_X_509),
    ];
    for object in provider.find_objects(session, &filters)? {
        let der = match provider.read_attribute(session, object, CKA_VALUE) {
            Ok(der) => der,
            Err(err) => {
                debug!("certificate object {}: missing value, skipped: {}", object, err);
                continue;
            }
        };
        let correlation_id = match provider.read_attribute(session, object, CKA_ID) {
            Ok(id) => id,
            Err(err) => {
                debug!("certificate object {}: missing id, skipped: {}", object, err);
                continue;
            }
        };
        // The subject is fetched but not used as a match constraint.
        if let Ok(subject) = provider.read_attribute(session, object, CKA_SUBJECT) {
            trace!("certificate object {}: subject of {} bytes", object, subject.len());
        }

        match ClientCertificate::from_der(der) {
            Ok(certificate) => {
                debug!(
                    "imported X.509 certificate, id {}",
                    hex::encode(&correlation_id)
                );
                return Ok(Some((certificate, correlation_id)));
            }
            Err(err) => {
                debug!("certificate object {}: not importable, skipped: {}", object, err);
            }
        }
    }
    Ok(None)
}

// The key must carry the same ID the certificate did. The key type is fixed
// to the RSA family, not derived from the certificate.
fn find_private_key(
    provider: &dyn TokenOps,
    session: CK_SESSION_HANDLE,
    correlation_id: &[u8],
) -> Result<Option<CK_OBJECT_HANDLE>, Error> {
    let filters = [
        SearchFilter::Class(CKO_PRIVATE_KEY),
        SearchFilter::KeyType(FIXED_KEY_TYPE),
        SearchFilter::Id(correlation_id.to_vec()),
    ];
    Ok(provider.find_objects(session, &filters)?.first().copied())
}
