use std::fmt;

use thiserror::Error;

use crate::envelope::EnvelopeCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalCallError {
    /// The callee rejected the caller's signature headers (envelope code 400).
    #[error("Client protocol error: {message}")]
    ClientProtocol { message: String },

    /// An expected domain failure surfaced by the callee (envelope code 500).
    #[error("Business error: {message}")]
    Business { message: String },

    /// An unexpected callee-side failure (envelope code 501).
    #[error("System error: {message}")]
    System { message: String },

    /// Non-2xx status, I/O failure or an undecodable response.
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Replay store error: {message}")]
    Store { message: String },
}

/// Programmatic classification of an [`InternalCallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClientProtocol,
    Business,
    System,
    Transport,
    Configuration,
    Store,
}

impl InternalCallError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ClientProtocol { .. } => ErrorKind::ClientProtocol,
            Self::Business { .. } => ErrorKind::Business,
            Self::System { .. } => ErrorKind::System,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Store { .. } => ErrorKind::Store,
        }
    }

    /// The message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::ClientProtocol { message }
            | Self::Business { message }
            | Self::System { message }
            | Self::Transport { message }
            | Self::Configuration { message }
            | Self::Store { message } => message,
        }
    }

    /// Rebuilds the caller-side error for a failed envelope.
    ///
    /// Returns `None` for [`EnvelopeCode::Success`].
    #[must_use]
    pub fn from_envelope(code: EnvelopeCode, msg: Option<String>) -> Option<Self> {
        let message = msg.unwrap_or_default();
        match code {
            EnvelopeCode::Success => None,
            EnvelopeCode::ClientError => Some(Self::ClientProtocol { message }),
            EnvelopeCode::BusinessError => Some(Self::Business { message }),
            EnvelopeCode::SystemError => Some(Self::System { message }),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Marks an error type as business-level or system-level.
///
/// Any type implementing this trait converts into [`OperationError`] with `?`,
/// so an operation decides at the call site which envelope code a failure
/// produces: business failures become 500, everything else 501.
pub trait ErrorClass: fmt::Display {
    fn is_business(&self) -> bool;
}

/// Failure returned by a business operation wrapped by the inbound verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    Business(String),
    System(String),
}

impl OperationError {
    pub fn business(message: impl Into<String>) -> Self {
        Self::Business(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    #[must_use]
    pub fn code(&self) -> EnvelopeCode {
        match self {
            Self::Business(_) => EnvelopeCode::BusinessError,
            Self::System(_) => EnvelopeCode::SystemError,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Business(message) | Self::System(message) => message,
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Business(msg) => write!(f, "business failure: {}", msg),
            Self::System(msg) => write!(f, "system failure: {}", msg),
        }
    }
}

impl<E: ErrorClass> From<E> for OperationError {
    fn from(err: E) -> Self {
        if err.is_business() {
            Self::Business(err.to_string())
        } else {
            Self::System(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum LedgerError {
        InsufficientBalance,
        Corrupted,
    }

    impl fmt::Display for LedgerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                LedgerError::InsufficientBalance => write!(f, "insufficient balance"),
                LedgerError::Corrupted => write!(f, "ledger corrupted"),
            }
        }
    }

    impl ErrorClass for LedgerError {
        fn is_business(&self) -> bool {
            matches!(self, LedgerError::InsufficientBalance)
        }
    }

    fn debit(fail: LedgerError) -> Result<(), OperationError> {
        Err::<(), _>(fail)?;
        Ok(())
    }

    #[test]
    fn test_marked_error_becomes_business() {
        let err = debit(LedgerError::InsufficientBalance).unwrap_err();
        assert_eq!(err, OperationError::Business("insufficient balance".into()));
        assert_eq!(err.code(), EnvelopeCode::BusinessError);
    }

    #[test]
    fn test_unmarked_error_becomes_system() {
        let err = debit(LedgerError::Corrupted).unwrap_err();
        assert_eq!(err.code(), EnvelopeCode::SystemError);
        assert_eq!(err.message(), "ledger corrupted");
    }

    #[test]
    fn test_from_envelope_maps_every_failure_code() {
        let cases = [
            (EnvelopeCode::ClientError, ErrorKind::ClientProtocol),
            (EnvelopeCode::BusinessError, ErrorKind::Business),
            (EnvelopeCode::SystemError, ErrorKind::System),
        ];
        for (code, kind) in cases {
            let err = InternalCallError::from_envelope(code, Some("boom".into()))
                .expect("failure codes should map to an error");
            assert_eq!(err.kind(), kind);
            assert_eq!(err.message(), "boom");
        }
        assert!(InternalCallError::from_envelope(EnvelopeCode::Success, None).is_none());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            InternalCallError::transport("HTTP 502").to_string(),
            "Transport error: HTTP 502"
        );
        assert_eq!(
            InternalCallError::Business {
                message: "insufficient balance".into()
            }
            .to_string(),
            "Business error: insufficient balance"
        );
    }
}
