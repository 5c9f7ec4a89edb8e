use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_FRESHNESS_WINDOW, DEFAULT_NONCE_TTL, DEFAULT_READ_TIMEOUT,
};

pub const ENVIRONMENT_PREFIX: &str = "INTERNAL_CALL";

fn default_freshness_window_ms() -> u64 {
    DEFAULT_FRESHNESS_WINDOW.as_millis() as u64
}

fn default_nonce_ttl_secs() -> u64 {
    DEFAULT_NONCE_TTL.as_secs()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The nonce must outlive the freshness window, otherwise a request could be
/// replayed after its marker expired but while it is still fresh. Requests
/// stamped ahead of the local clock stay fresh for up to
/// `freshness_window_ms + max_clock_skew_ms`; the verifier extends their
/// reservation past `nonce_ttl_secs` to match.
fn validate_nonce_ttl(signing: &SigningSettings) -> Result<(), ValidationError> {
    if signing.nonce_ttl_secs.saturating_mul(1000) < signing.freshness_window_ms {
        let mut err = ValidationError::new("nonce_ttl_too_short");
        err.message = Some("nonce_ttl_secs must cover freshness_window_ms".into());
        return Err(err);
    }
    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    level
        .parse::<LevelFilter>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unknown_log_level"))
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_nonce_ttl"))]
pub struct SigningSettings {
    /// Base64 (or PEM) X.509 public key used to verify inbound calls.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Base64 (or PEM) PKCS#8 private key used to sign outbound calls.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_freshness_window_ms")]
    #[validate(range(min = 1, max = 86_400_000))]
    pub freshness_window_ms: u64,
    /// Minimum time a request id stays reserved, at most one day.
    #[serde(default = "default_nonce_ttl_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub nonce_ttl_secs: u64,
    /// How far a request timestamp may run ahead of the local clock.
    #[serde(default = "default_freshness_window_ms")]
    #[validate(range(max = 86_400_000))]
    pub max_clock_skew_ms: u64,
}

impl SigningSettings {
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    #[must_use]
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            public_key: None,
            private_key: None,
            freshness_window_ms: default_freshness_window_ms(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            max_clock_skew_ms: default_freshness_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ClientSettings {
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    #[validate(range(min = 1))]
    pub read_timeout_ms: u64,
}

impl ClientSettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ServerSettings {
    /// Budget for one inbound call, at most one hour; `0` disables the
    /// deadline.
    ///
    /// Checked only before the operation is invoked: a spent budget answers
    /// 501 "deadline exceeded", but an operation that is already running is
    /// not interrupted and may overrun it. Operations that can take long
    /// should watch `CallContext::remaining`.
    #[serde(default)]
    #[validate(range(max = 3_600_000))]
    pub invocation_deadline_ms: u64,
}

impl ServerSettings {
    #[must_use]
    pub fn invocation_deadline(&self) -> Option<Duration> {
        (self.invocation_deadline_ms > 0).then(|| Duration::from_millis(self.invocation_deadline_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,
}

impl LoggingSettings {
    #[must_use]
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate(nested)]
    pub signing: SigningSettings,
    #[serde(default)]
    #[validate(nested)]
    pub client: ClientSettings,
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Parses TOML and merges environment variables prefixed with
    /// `INTERNAL_CALL__`, e.g. `INTERNAL_CALL__SIGNING__PUBLIC_KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or a value has the wrong type.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let toml = File::from_str(toml_str, FileFormat::Toml);
        Self::build(toml)
    }

    /// Like [`Settings::from_toml`], reading the TOML from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = File::from(path).format(FileFormat::Toml);
        Self::build(file)
    }

    fn build<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let environment = Environment::default()
            .prefix(ENVIRONMENT_PREFIX)
            .separator("__")
            .try_parsing(true);

        let config = Config::builder()
            .add_source(source)
            .add_source(environment)
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERRIDDEN_VARS: [&str; 2] = [
        "INTERNAL_CALL__SIGNING__PUBLIC_KEY",
        "INTERNAL_CALL__SIGNING__FRESHNESS_WINDOW_MS",
    ];

    /// Parses with the variables the env tests set held unset.
    fn parse(toml_str: &str) -> Result<Settings, ConfigError> {
        temp_env::with_vars_unset(OVERRIDDEN_VARS, || Settings::from_toml(toml_str))
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        let settings = parse("").unwrap();

        assert_eq!(settings.signing.freshness_window(), Duration::from_millis(10_000));
        assert_eq!(settings.signing.nonce_ttl(), Duration::from_secs(10));
        assert_eq!(settings.signing.max_clock_skew(), Duration::from_millis(10_000));
        assert!(settings.signing.public_key.is_none());
        assert_eq!(settings.client.connect_timeout(), Duration::from_millis(2_000));
        assert!(settings.server.invocation_deadline().is_none());
        assert_eq!(settings.logging.level_filter(), LevelFilter::Info);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_from_valid_toml() {
        let toml_str = r#"
            [signing]
            public_key = "MFwwDQYJ"
            private_key = "MIIBVAIB"
            freshness_window_ms = 5000
            nonce_ttl_secs = 5

            [client]
            connect_timeout_ms = 100
            read_timeout_ms = 200

            [server]
            invocation_deadline_ms = 750

            [logging]
            level = "debug"
            "#;

        let settings = parse(toml_str).unwrap();
        assert_eq!(settings.signing.public_key.as_deref(), Some("MFwwDQYJ"));
        assert_eq!(settings.signing.private_key.as_deref(), Some("MIIBVAIB"));
        assert_eq!(settings.signing.freshness_window_ms, 5000);
        assert_eq!(settings.client.read_timeout(), Duration::from_millis(200));
        assert_eq!(
            settings.server.invocation_deadline(),
            Some(Duration::from_millis(750))
        );
        assert_eq!(settings.logging.level_filter(), LevelFilter::Debug);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_invalid_toml_syntax() {
        let toml_str = r#"
            [signing
            public_key = "abc"
            "#;

        assert!(parse(toml_str).is_err());
    }

    #[test]
    fn test_settings_wrong_type() {
        let toml_str = r#"
            [signing]
            freshness_window_ms = "soon"
            "#;

        assert!(parse(toml_str).is_err());
    }

    #[test]
    fn test_validation_rejects_nonce_ttl_shorter_than_window() {
        let toml_str = r#"
            [signing]
            freshness_window_ms = 30000
            nonce_ttl_secs = 10
            "#;

        let settings = parse(toml_str).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_durations() {
        for toml_str in [
            "[signing]\nnonce_ttl_secs = 9223372036854775807",
            "[signing]\nmax_clock_skew_ms = 9223372036854775807",
            "[server]\ninvocation_deadline_ms = 9223372036854775807",
        ] {
            let settings = parse(toml_str).unwrap();
            assert!(settings.validate().is_err(), "accepted {}", toml_str);
        }

        let settings = parse("[signing]\nnonce_ttl_secs = 86400\n[server]\ninvocation_deadline_ms = 3600000").unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_timeouts() {
        let toml_str = r#"
            [client]
            connect_timeout_ms = 0
            "#;

        let settings = parse(toml_str).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let toml_str = r#"
            [logging]
            level = "chatty"
            "#;

        let settings = parse(toml_str).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_overrides_key() {
        let toml_str = r#"
            [signing]
            public_key = "from-file"
            "#;

        temp_env::with_var(
            "INTERNAL_CALL__SIGNING__PUBLIC_KEY",
            Some("from-env"),
            || {
                let settings = Settings::from_toml(toml_str).unwrap();
                assert_eq!(settings.signing.public_key.as_deref(), Some("from-env"));
            },
        );
    }

    #[test]
    fn test_env_sets_numeric_value() {
        temp_env::with_var(
            "INTERNAL_CALL__SIGNING__FRESHNESS_WINDOW_MS",
            Some("2500"),
            || {
                let settings = Settings::from_toml("").unwrap();
                assert_eq!(settings.signing.freshness_window_ms, 2500);
            },
        );
    }
}
