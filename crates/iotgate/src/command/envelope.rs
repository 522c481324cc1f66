//! Request Envelope
//!
//! `{"command": "<name>", "data": { ... }}`

use serde_json::{Map, Value};
use thiserror::Error;

/// Why raw bytes are not a valid envelope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("malformed JSON: {0}")]
    InvalidJson(String),

    #[error("JSON must be an object")]
    NotAnObject,

    #[error("JSON must have a string 'command'")]
    MissingCommand,

    #[error("JSON must have an object 'data'")]
    MissingData,
}

/// A decoded request
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub command: String,
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(command: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Decode raw message bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        let command = match object.remove("command") {
            Some(Value::String(command)) => command,
            _ => return Err(EnvelopeError::MissingCommand),
        };
        let data = match object.remove("data") {
            Some(Value::Object(data)) => data,
            _ => return Err(EnvelopeError::MissingData),
        };

        Ok(Self { command, data })
    }
}
