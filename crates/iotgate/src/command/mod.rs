//! Commands
//!
//! Everything between a decoded envelope and the response written back to
//! the client:
//! - [`Envelope`] decoding
//! - the [`CommandRegistry`] mapping names to handler factories
//! - the [`CommandRouter`] that schedules lookup and execution on the pool
//! - the built-in device-management handlers

mod builtin;
mod envelope;
mod registry;
mod router;

pub use builtin::{
    REGISTER_COMPANY, REGISTER_IOT, REGISTER_PRODUCT, RegisterCompany, RegisterIoT,
    RegisterProduct, UPDATE_IOT, UpdateIoT, register_builtins,
};
pub use envelope::{Envelope, EnvelopeError};
pub use registry::{CommandFactory, CommandRegistry, Dependencies};
pub use router::CommandRouter;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::net::Connection;
use crate::plugin::PluginError;
use crate::store::StoreError;

/// A unit of work built for one request
pub trait Command: Send {
    fn execute(self: Box<Self>) -> Result<Response, CommandError>;
}

/// Errors a handler reports back to the client
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Error: '{field}' is missing from {context} data.")]
    MissingField {
        field: &'static str,
        context: &'static str,
    },

    #[error("Error: '{0}' cannot be empty.")]
    EmptyField(&'static str),

    #[error("Error: '{0}' must be a string, number or boolean.")]
    InvalidField(&'static str),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// A connection paired with its decoded envelope
#[derive(Clone)]
pub struct Request {
    connection: Arc<dyn Connection>,
    envelope: Envelope,
}

impl Request {
    pub fn new(connection: Arc<dyn Connection>, envelope: Envelope) -> Self {
        Self {
            connection,
            envelope,
        }
    }

    pub fn command(&self) -> &str {
        &self.envelope.command
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.envelope.data
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Write `response` back through the originating connection
    pub fn respond(&self, response: &Response) {
        respond(self.connection.as_ref(), response);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("transport", &self.connection.transport())
            .field("peer", &self.connection.peer())
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Serialize and send a response, logging delivery failures
pub(crate) fn respond(connection: &dyn Connection, response: &Response) {
    let payload = match serde_json::to_vec(response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            return;
        }
    };
    if let Err(e) = connection.send(&payload) {
        warn!(
            "Failed to deliver response to {} peer {}: {}",
            connection.transport(),
            connection.peer(),
            e
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// `{"status", "command", "message", ...extra}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn success(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            command: Some(command.into()),
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn error(command: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            command: command.map(str::to_string),
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// Add an extra top-level field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
