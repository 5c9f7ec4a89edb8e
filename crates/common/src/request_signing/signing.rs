//! Request signing and verification.
//!
//! Both sides build the same [`SignableContent`] from the `requestId` and
//! `timestamp` headers. The caller signs it with its private key and sends the
//! base64url signature in the `sign` header; the callee verifies it with the
//! matching public key.

use std::fmt;

use base64::{engine::general_purpose, Engine};
use error_stack::Report;
use http::header::HeaderName;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha2::Sha256;
use uuid::Uuid;

use crate::constants::{HEADER_REQUEST_ID, HEADER_SIGN, HEADER_TIMESTAMP};
use crate::error::InternalCallError;
use crate::request_signing::keys::{decode_base64_any, parse_public_key, KeyMaterial};

/// `requestId=<id>&timestamp=<ts>`. No escaping: the id is a UUID and the
/// timestamp a decimal integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignableContent(String);

impl SignableContent {
    #[must_use]
    pub fn new(request_id: &str, timestamp: i64) -> Self {
        Self(format!("requestId={}&timestamp={}", request_id, timestamp))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SignableContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signs `content` and returns the base64url (unpadded) signature.
///
/// # Errors
///
/// Returns a configuration error if the RSA operation fails.
pub fn sign(
    content: &SignableContent,
    key: &SigningKey<Sha256>,
) -> Result<String, Report<InternalCallError>> {
    let signature = key.try_sign(content.as_bytes()).map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to sign request: {}",
            e
        )))
    })?;

    Ok(general_purpose::URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Checks `signature` against `content`.
///
/// Malformed base64, a wrong signature length and a mismatching signature all
/// yield `false`.
#[must_use]
pub fn verify(content: &SignableContent, signature: &str, key: &VerifyingKey<Sha256>) -> bool {
    let Some(bytes) = decode_base64_any(signature) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(content.as_bytes(), &signature).is_ok()
}

/// Verifies against an encoded public key, folding key errors into `false`.
///
/// Callers that load keys once should prefer [`KeyMaterial`] and [`verify`],
/// which surface a malformed key as a configuration error at startup instead.
#[must_use]
pub fn verify_with_encoded_key(content: &SignableContent, signature: &str, public_key: &str) -> bool {
    match parse_public_key(public_key) {
        Ok(key) => verify(content, signature, &VerifyingKey::<Sha256>::new(key)),
        Err(e) => {
            log::error!("internal call public key is unusable: {:?}", e);
            false
        }
    }
}

/// The `(timestamp, requestId, sign)` header triple of one signed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: i64,
    pub request_id: String,
    pub sign: String,
}

impl SignedHeaders {
    #[must_use]
    pub fn to_pairs(&self) -> [(HeaderName, String); 3] {
        [
            (HEADER_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_REQUEST_ID, self.request_id.clone()),
            (HEADER_SIGN, self.sign.clone()),
        ]
    }
}

/// Generates a fresh 128-bit random request id.
#[must_use]
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct RequestSigner {
    key: SigningKey<Sha256>,
}

impl RequestSigner {
    #[must_use]
    pub fn new(key: SigningKey<Sha256>) -> Self {
        Self { key }
    }

    /// # Errors
    ///
    /// Returns a configuration error if no private key is loaded.
    pub fn from_key_material(keys: &KeyMaterial) -> Result<Self, Report<InternalCallError>> {
        Ok(Self::new(keys.signing_key()?.clone()))
    }

    /// Signs the given request id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if signing fails.
    pub fn sign_request(
        &self,
        request_id: &str,
        timestamp: i64,
    ) -> Result<SignedHeaders, Report<InternalCallError>> {
        let content = SignableContent::new(request_id, timestamp);
        let sign = sign(&content, &self.key)?;

        Ok(SignedHeaders {
            timestamp,
            request_id: request_id.to_string(),
            sign,
        })
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}
