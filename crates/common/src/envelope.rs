//! The fixed `{code, msg, data}` response envelope.
//!
//! Every protocol outcome, including rejected signatures and failed business
//! operations, travels to the caller as an HTTP 200 carrying one of these.
//! The four codes are the wire contract between caller and callee and must
//! never be renumbered.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InternalCallError, OperationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum EnvelopeCode {
    Success,
    ClientError,
    BusinessError,
    SystemError,
}

impl EnvelopeCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::ClientError => 400,
            Self::BusinessError => 500,
            Self::SystemError => 501,
        }
    }
}

impl TryFrom<u16> for EnvelopeCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Success),
            400 => Ok(Self::ClientError),
            500 => Ok(Self::BusinessError),
            501 => Ok(Self::SystemError),
            other => Err(format!("unknown envelope code {}", other)),
        }
    }
}

impl From<EnvelopeCode> for u16 {
    fn from(code: EnvelopeCode) -> Self {
        code.as_u16()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: EnvelopeCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(data: Option<T>) -> Self {
        Self {
            code: EnvelopeCode::Success,
            msg: None,
            data,
        }
    }

    pub fn client_error(msg: impl Into<String>) -> Self {
        Self::failure(EnvelopeCode::ClientError, msg)
    }

    pub fn business_error(msg: impl Into<String>) -> Self {
        Self::failure(EnvelopeCode::BusinessError, msg)
    }

    pub fn system_error(msg: impl Into<String>) -> Self {
        Self::failure(EnvelopeCode::SystemError, msg)
    }

    fn failure(code: EnvelopeCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: Some(msg.into()),
            data: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == EnvelopeCode::Success
    }

    /// Splits the envelope into its payload or the matching caller-side error.
    ///
    /// # Errors
    ///
    /// Returns the [`InternalCallError`] reconstructed from a non-success code.
    pub fn into_result(self) -> Result<Option<T>, InternalCallError> {
        match InternalCallError::from_envelope(self.code, self.msg) {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

impl<T> From<OperationError> for Envelope<T> {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Business(msg) => Self::business_error(msg),
            OperationError::System(msg) => Self::system_error(msg),
        }
    }
}

/// Decoded payload of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput<T> {
    /// The callee returned no data.
    Empty,
    Single(T),
    List(Vec<T>),
}

impl<T: DeserializeOwned> CallOutput<T> {
    /// Decodes the `data` field of a success envelope into the target type.
    ///
    /// A JSON array is decoded element-wise, anything else as one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not match the target type.
    pub fn from_data(data: Option<Value>) -> Result<Self, serde_json::Error> {
        match data {
            None | Some(Value::Null) => Ok(Self::Empty),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<T>, _>>()
                .map(Self::List),
            Some(value) => serde_json::from_value(value).map(Self::Single),
        }
    }
}

impl<T> CallOutput<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the value of a single-object result.
    pub fn single(self) -> Option<T> {
        match self {
            Self::Single(value) => Some(value),
            Self::Empty | Self::List(_) => None,
        }
    }

    /// Returns every decoded value; a single object becomes a one-element list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Empty => Vec::new(),
            Self::Single(value) => vec![value],
            Self::List(values) => values,
        }
    }
}
