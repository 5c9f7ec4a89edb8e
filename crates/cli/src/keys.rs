//! Key generation and offline sign/verify of signature header triples.

use std::fs;
use std::path::{Path, PathBuf};

use internal_call_common::constants::{HEADER_REQUEST_ID, HEADER_SIGN, HEADER_TIMESTAMP};
use internal_call_common::request_signing::{
    generate_key_pair, generate_request_id, verify, verify_with_encoded_key, KeyMaterial,
    RequestSigner, SignableContent,
};
use serde::Serialize;

use crate::config::load_keys;
use crate::error::CliError;
use crate::OutputFormat;

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// Generate a key pair and print it, or write it to `output` as two files.
pub fn keygen(bits: usize, output: Option<PathBuf>, verbose: bool) -> Result<(), CliError> {
    if verbose {
        println!("Generating {}-bit RSA key pair...", bits);
    }
    let pair = generate_key_pair(bits)?;

    match output {
        Some(dir) => {
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(PRIVATE_KEY_FILE), &pair.private_key)?;
            fs::write(dir.join(PUBLIC_KEY_FILE), &pair.public_key)?;
            println!("Key pair written to: {}", dir.display());
            println!("  Private key: {}", dir.join(PRIVATE_KEY_FILE).display());
            println!("  Public key: {}", dir.join(PUBLIC_KEY_FILE).display());
        }
        None => {
            println!("[signing]");
            println!("public_key = \"{}\"", pair.public_key);
            println!("private_key = \"{}\"", pair.private_key);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct SignatureHeaders {
    timestamp: String,
    #[serde(rename = "requestId")]
    request_id: String,
    sign: String,
}

/// Sign a `(requestId, timestamp)` pair with the configured private key.
///
/// Missing values default to a fresh request id and the current time.
pub fn sign(
    file: &Path,
    request_id: Option<String>,
    timestamp: Option<i64>,
    format: OutputFormat,
    verbose: bool,
) -> Result<(), CliError> {
    let (_, keys) = load_keys(file, verbose)?;
    let request_id = request_id.unwrap_or_else(generate_request_id);
    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let headers = sign_with(&keys, &request_id, timestamp)?;
    match format {
        OutputFormat::Text => {
            println!("{}: {}", HEADER_TIMESTAMP, headers.timestamp);
            println!("{}: {}", HEADER_REQUEST_ID, headers.request_id);
            println!("{}: {}", HEADER_SIGN, headers.sign);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&headers)?),
    }
    Ok(())
}

fn sign_with(
    keys: &KeyMaterial,
    request_id: &str,
    timestamp: i64,
) -> Result<SignatureHeaders, CliError> {
    let signed = RequestSigner::from_key_material(keys)?.sign_request(request_id, timestamp)?;
    Ok(SignatureHeaders {
        timestamp: signed.timestamp.to_string(),
        request_id: signed.request_id,
        sign: signed.sign,
    })
}

/// Check a signature header triple against a public key.
///
/// An inline `public_key` takes precedence over the key configured in `file`.
pub fn verify_headers(
    file: Option<&Path>,
    public_key: Option<&str>,
    request_id: &str,
    timestamp: i64,
    signature: &str,
    verbose: bool,
) -> Result<(), CliError> {
    match (public_key, file) {
        (Some(public_key), _) => check_encoded(public_key, request_id, timestamp, signature)?,
        (None, Some(file)) => {
            let (_, keys) = load_keys(file, verbose)?;
            check(&keys, request_id, timestamp, signature)?;
        }
        (None, None) => {
            return Err(CliError::Config(
                "either --file or --public-key is required".to_string(),
            ))
        }
    }
    println!("Signature is valid");
    Ok(())
}

fn check(
    keys: &KeyMaterial,
    request_id: &str,
    timestamp: i64,
    signature: &str,
) -> Result<(), CliError> {
    let content = SignableContent::new(request_id, timestamp);
    if verify(&content, signature, keys.verifying_key()?) {
        Ok(())
    } else {
        Err(mismatch(&content))
    }
}

fn check_encoded(
    public_key: &str,
    request_id: &str,
    timestamp: i64,
    signature: &str,
) -> Result<(), CliError> {
    let content = SignableContent::new(request_id, timestamp);
    if verify_with_encoded_key(&content, signature, public_key) {
        Ok(())
    } else {
        Err(mismatch(&content))
    }
}

fn mismatch(content: &SignableContent) -> CliError {
    CliError::Verification(format!("signature does not match '{}'", content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key_material() -> KeyMaterial {
        let pair = generate_key_pair(1024).unwrap();
        KeyMaterial::from_encoded(Some(&pair.private_key), Some(&pair.public_key)).unwrap()
    }

    #[test]
    fn test_keygen_writes_parseable_files() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("keys");

        keygen(1024, Some(out.clone()), false).unwrap();

        let private_key = fs::read_to_string(out.join(PRIVATE_KEY_FILE)).unwrap();
        let public_key = fs::read_to_string(out.join(PUBLIC_KEY_FILE)).unwrap();
        assert!(KeyMaterial::from_encoded(Some(&private_key), Some(&public_key)).is_ok());
    }

    #[test]
    fn test_keygen_rejects_small_keys() {
        assert!(matches!(keygen(256, None, false), Err(CliError::Config(_))));
    }

    #[test]
    fn test_signed_headers_check_out() {
        let keys = key_material();
        let headers = sign_with(&keys, "R1", 1_700_000_000_000).unwrap();

        assert_eq!(headers.timestamp, "1700000000000");
        assert!(check(&keys, "R1", 1_700_000_000_000, &headers.sign).is_ok());
        assert!(matches!(
            check(&keys, "R2", 1_700_000_000_000, &headers.sign),
            Err(CliError::Verification(_))
        ));
    }

    #[test]
    fn test_inline_public_key_checks_signature() {
        let pair = generate_key_pair(1024).unwrap();
        let keys = KeyMaterial::from_encoded(Some(&pair.private_key), None).unwrap();
        let headers = sign_with(&keys, "R1", 1_700_000_000_000).unwrap();

        assert!(check_encoded(&pair.public_key, "R1", 1_700_000_000_000, &headers.sign).is_ok());
        assert!(verify_headers(
            None,
            Some(&pair.public_key),
            "R1",
            1_700_000_000_000,
            &headers.sign,
            false
        )
        .is_ok());
        assert!(matches!(
            check_encoded(&pair.public_key, "R1", 1_700_000_000_001, &headers.sign),
            Err(CliError::Verification(_))
        ));
        assert!(matches!(
            check_encoded("not a key", "R1", 1_700_000_000_000, &headers.sign),
            Err(CliError::Verification(_))
        ));
    }

    #[test]
    fn test_verify_needs_a_key_source() {
        assert!(matches!(
            verify_headers(None, None, "R1", 1, "sig", false),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_sign_requires_private_key() {
        let pair = generate_key_pair(1024).unwrap();
        let keys = KeyMaterial::from_encoded(None, Some(&pair.public_key)).unwrap();

        assert!(matches!(
            sign_with(&keys, "R1", 1),
            Err(CliError::Config(_))
        ));
    }
}
