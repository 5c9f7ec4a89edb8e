//! Configuration management commands.
//!
//! Configuration is loaded from TOML files and merged with environment variables
//! prefixed with `INTERNAL_CALL__`. For example, `INTERNAL_CALL__SIGNING__PUBLIC_KEY`
//! will override `signing.public_key` in the TOML file.

use std::path::Path;

use internal_call_common::request_signing::KeyMaterial;
use internal_call_common::settings::Settings;
use validator::Validate;

use crate::error::CliError;

const REDACTED: &str = "<redacted>";

/// Load and merge configuration from TOML file with environment variables.
pub(crate) fn load_and_merge_config(file: &Path, verbose: bool) -> Result<Settings, CliError> {
    if !file.is_file() {
        return Err(CliError::Config(format!(
            "Config file not found: {}",
            file.display()
        )));
    }

    if verbose {
        println!("Loading config from: {}", file.display());
        println!("Environment variables with INTERNAL_CALL__ prefix will be merged");
    }

    let settings = Settings::from_path(file)
        .map_err(|e| CliError::Config(format!("Failed to parse and merge config: {e}")))?;

    settings
        .validate()
        .map_err(|e| CliError::Config(format!("Settings validation failed: {e}")))?;

    Ok(settings)
}

/// Load settings and parse the configured keys.
pub(crate) fn load_keys(file: &Path, verbose: bool) -> Result<(Settings, KeyMaterial), CliError> {
    let settings = load_and_merge_config(file, verbose)?;
    let keys = KeyMaterial::from_settings(&settings.signing)?;
    Ok((settings, keys))
}

/// Validate configuration file, including that configured keys parse.
pub fn validate(file: &Path, verbose: bool) -> Result<(), CliError> {
    let (settings, keys) = load_keys(file, verbose)?;

    println!("Configuration is valid");
    println!("  File: {}", file.display());
    println!(
        "  Private key: {}",
        presence(keys.signing_key().is_ok())
    );
    println!(
        "  Public key: {}",
        presence(keys.verifying_key().is_ok())
    );
    println!(
        "  Freshness window: {} ms",
        settings.signing.freshness_window_ms
    );
    println!("  Nonce TTL: {} s", settings.signing.nonce_ttl_secs);

    if verbose {
        println!("  Max clock skew: {} ms", settings.signing.max_clock_skew_ms);
        println!(
            "  Client timeouts: connect {} ms, read {} ms",
            settings.client.connect_timeout_ms, settings.client.read_timeout_ms
        );
        match settings.server.invocation_deadline() {
            Some(deadline) => println!("  Invocation deadline: {} ms", deadline.as_millis()),
            None => println!("  Invocation deadline: none"),
        }
        println!("  Log level: {}", settings.logging.level);
    }

    Ok(())
}

/// Print the merged configuration as JSON with key material redacted.
pub fn show(file: &Path, verbose: bool) -> Result<(), CliError> {
    let settings = redacted(load_and_merge_config(file, verbose)?);
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn redacted(mut settings: Settings) -> Settings {
    if settings.signing.private_key.is_some() {
        settings.signing.private_key = Some(REDACTED.to_string());
    }
    settings
}

fn presence(configured: bool) -> &'static str {
    if configured {
        "configured"
    } else {
        "not configured"
    }
}
