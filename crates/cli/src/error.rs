//! CLI error types.

use std::fmt;

use error_stack::Report;
use internal_call_common::error::{ErrorKind, InternalCallError};

#[derive(Debug)]
pub enum CliError {
    /// Configuration file or key error
    Config(String),
    /// IO error
    Io(std::io::Error),
    /// JSON parsing error
    Json(String),
    /// Signed call failed
    Call(String),
    /// Signature did not verify
    Verification(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Io(err) => write!(f, "IO error: {}", err),
            CliError::Json(msg) => write!(f, "JSON error: {}", msg),
            CliError::Call(msg) => write!(f, "Call failed: {}", msg),
            CliError::Verification(msg) => write!(f, "Verification failed: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Json(err.to_string())
    }
}

impl From<Report<InternalCallError>> for CliError {
    fn from(report: Report<InternalCallError>) -> Self {
        log::debug!("{:?}", report);
        let err = report.current_context();
        match err.kind() {
            ErrorKind::Configuration => CliError::Config(err.message().to_string()),
            _ => CliError::Call(err.to_string()),
        }
    }
}
