//! RSA key material management.
//!
//! Keys are exchanged as base64 encoded DER (PKCS#8 for private keys, X.509
//! SubjectPublicKeyInfo for public keys) or as PEM. They are parsed once at
//! startup into [`KeyMaterial`] and never reloaded.

use std::fmt;

use base64::{engine::general_purpose, Engine};
use error_stack::{Report, ResultExt};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::constants::{DEFAULT_RSA_KEY_BITS, MIN_RSA_KEY_BITS};
use crate::error::InternalCallError;
use crate::settings::SigningSettings;

const PEM_PREFIX: &str = "-----BEGIN";

/// Decodes base64 in either alphabet, with or without padding.
pub(crate) fn decode_base64_any(encoded: &str) -> Option<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let unpadded = compact.trim_end_matches('=');
    general_purpose::URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(unpadded))
        .ok()
}

/// Parses a PKCS#8 private key from base64 DER or PEM.
///
/// # Errors
///
/// Returns a configuration error if the key is not valid base64, PEM or PKCS#8.
pub fn parse_private_key(encoded: &str) -> Result<RsaPrivateKey, Report<InternalCallError>> {
    let trimmed = encoded.trim();
    if trimmed.starts_with(PEM_PREFIX) {
        return RsaPrivateKey::from_pkcs8_pem(trimmed).map_err(|e| {
            Report::new(InternalCallError::configuration(format!(
                "Failed to parse PEM private key: {}",
                e
            )))
        });
    }

    let der = decode_base64_any(trimmed).ok_or_else(|| {
        Report::new(InternalCallError::configuration(
            "Failed to decode base64 private key",
        ))
    })?;

    RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to parse PKCS#8 private key: {}",
            e
        )))
    })
}

/// Parses an X.509 SubjectPublicKeyInfo public key from base64 DER or PEM.
///
/// # Errors
///
/// Returns a configuration error if the key is not valid base64, PEM or SPKI.
pub fn parse_public_key(encoded: &str) -> Result<RsaPublicKey, Report<InternalCallError>> {
    let trimmed = encoded.trim();
    if trimmed.starts_with(PEM_PREFIX) {
        return RsaPublicKey::from_public_key_pem(trimmed).map_err(|e| {
            Report::new(InternalCallError::configuration(format!(
                "Failed to parse PEM public key: {}",
                e
            )))
        });
    }

    let der = decode_base64_any(trimmed).ok_or_else(|| {
        Report::new(InternalCallError::configuration(
            "Failed to decode base64 public key",
        ))
    })?;

    RsaPublicKey::from_public_key_der(&der).map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to parse public key: {}",
            e
        )))
    })
}

/// The process-wide key pair. Either half may be absent: a pure callee only
/// needs the public key, a pure caller only the private key.
#[derive(Clone, Default)]
pub struct KeyMaterial {
    signing_key: Option<SigningKey<Sha256>>,
    verifying_key: Option<VerifyingKey<Sha256>>,
}

impl KeyMaterial {
    /// Loads whichever keys are configured.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a configured key cannot be parsed.
    pub fn from_settings(settings: &SigningSettings) -> Result<Self, Report<InternalCallError>> {
        Self::from_encoded(
            settings.private_key.as_deref(),
            settings.public_key.as_deref(),
        )
    }

    /// Loads keys from their encoded form. Empty strings count as absent.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a provided key cannot be parsed.
    pub fn from_encoded(
        private_key: Option<&str>,
        public_key: Option<&str>,
    ) -> Result<Self, Report<InternalCallError>> {
        let signing_key = match private_key.filter(|k| !k.trim().is_empty()) {
            Some(encoded) => {
                let key = parse_private_key(encoded).attach("while loading the signing key")?;
                Some(SigningKey::<Sha256>::new(key))
            }
            None => None,
        };

        let verifying_key = match public_key.filter(|k| !k.trim().is_empty()) {
            Some(encoded) => {
                let key = parse_public_key(encoded).attach("while loading the verifying key")?;
                Some(VerifyingKey::<Sha256>::new(key))
            }
            None => None,
        };

        if signing_key.is_none() && verifying_key.is_none() {
            log::warn!("internal call key material is empty, signing and verification disabled");
        }

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// # Errors
    ///
    /// Returns a configuration error if no private key was configured.
    pub fn signing_key(&self) -> Result<&SigningKey<Sha256>, Report<InternalCallError>> {
        self.signing_key.as_ref().ok_or_else(|| {
            Report::new(InternalCallError::configuration(
                "internal call private key is not configured",
            ))
        })
    }

    /// # Errors
    ///
    /// Returns a configuration error if no public key was configured.
    pub fn verifying_key(&self) -> Result<&VerifyingKey<Sha256>, Report<InternalCallError>> {
        self.verifying_key.as_ref().ok_or_else(|| {
            Report::new(InternalCallError::configuration(
                "internal call public key is not configured",
            ))
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("signing_key", &self.signing_key.is_some())
            .field("verifying_key", &self.verifying_key.is_some())
            .finish()
    }
}

/// A freshly generated key pair in the exchange encoding (base64url DER).
#[derive(Debug, Clone)]
pub struct EncodedKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generates an RSA key pair of `bits` bits.
///
/// # Errors
///
/// Returns a configuration error if `bits` is below the minimum or if key
/// generation or encoding fails.
pub fn generate_key_pair(bits: usize) -> Result<EncodedKeyPair, Report<InternalCallError>> {
    if bits < MIN_RSA_KEY_BITS {
        return Err(Report::new(InternalCallError::configuration(format!(
            "RSA key size must be at least {} bits, got {}",
            MIN_RSA_KEY_BITS, bits
        ))));
    }

    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to generate RSA key: {}",
            e
        )))
    })?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_der = private_key.to_pkcs8_der().map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to encode private key: {}",
            e
        )))
    })?;
    let public_der = public_key.to_public_key_der().map_err(|e| {
        Report::new(InternalCallError::configuration(format!(
            "Failed to encode public key: {}",
            e
        )))
    })?;

    Ok(EncodedKeyPair {
        private_key: general_purpose::URL_SAFE_NO_PAD.encode(private_der.as_bytes()),
        public_key: general_purpose::URL_SAFE_NO_PAD.encode(public_der.as_bytes()),
    })
}

/// Generates a key pair with the default size.
///
/// # Errors
///
/// See [`generate_key_pair`].
pub fn generate_default_key_pair() -> Result<EncodedKeyPair, Report<InternalCallError>> {
    generate_key_pair(DEFAULT_RSA_KEY_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::tests::test_key_pair;

    #[test]
    fn test_generated_keys_round_trip_through_parsers() {
        let pair = test_key_pair();
        assert!(parse_private_key(&pair.private_key).is_ok());
        assert!(parse_public_key(&pair.public_key).is_ok());
    }

    #[test]
    fn test_parse_accepts_standard_alphabet_with_padding() {
        let pair = test_key_pair();
        let der = decode_base64_any(&pair.public_key).unwrap();
        let standard = general_purpose::STANDARD.encode(der);

        assert!(parse_public_key(&standard).is_ok());
    }

    #[test]
    fn test_parse_accepts_pem() {
        let pair = test_key_pair();
        let key = parse_public_key(&pair.public_key).unwrap();
        let pem = key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        assert!(parse_public_key(&pem).is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_public_key("not a key!!!").unwrap_err();
        assert_eq!(err.current_context().kind(), ErrorKind::Configuration);

        let err = parse_private_key("aGVsbG8").unwrap_err();
        assert_eq!(err.current_context().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_key_material_with_only_public_key() {
        let pair = test_key_pair();
        let keys = KeyMaterial::from_encoded(None, Some(&pair.public_key)).unwrap();

        assert!(keys.verifying_key().is_ok());
        let err = keys.signing_key().unwrap_err();
        assert!(err.current_context().message().contains("private key"));
    }

    #[test]
    fn test_key_material_treats_empty_as_absent() {
        let keys = KeyMaterial::from_encoded(Some(""), Some("  ")).unwrap();
        assert!(keys.signing_key().is_err());
        assert!(keys.verifying_key().is_err());
    }

    #[test]
    fn test_key_material_rejects_malformed_key_at_load() {
        let result = KeyMaterial::from_encoded(None, Some("definitely-not-a-key"));
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_rejects_small_keys() {
        let err = generate_key_pair(512).unwrap_err();
        assert!(err.current_context().message().contains("at least"));
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let pair = test_key_pair();
        let keys = KeyMaterial::from_encoded(Some(&pair.private_key), None).unwrap();
        let rendered = format!("{:?}", keys);
        assert_eq!(
            rendered,
            "KeyMaterial { signing_key: true, verifying_key: false }"
        );
    }
}
