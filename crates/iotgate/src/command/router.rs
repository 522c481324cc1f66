//! Command Router
//!
//! Two-stage dispatch on the shared worker pool:
//! 1. a HIGH priority routing task resolves the command name and builds the
//!    handler
//! 2. the handler's `execute` runs as a separate MEDIUM priority task
//!
//! Envelope errors are answered immediately without touching the pool.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::registry::CommandRegistry;
use super::{Command, Envelope, Request, Response, respond};
use crate::net::{Connection, MessageHandler};
use crate::pool::{TaskPriority, WorkerPool};

const SHUTTING_DOWN: &str = "gateway is shutting down";

/// Routes decoded requests to registered handlers
#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<CommandRegistry>,
    pool: WorkerPool,
}

impl CommandRouter {
    pub fn new(registry: Arc<CommandRegistry>, pool: WorkerPool) -> Self {
        Self { registry, pool }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Decode `message` and schedule it. Every failure is answered on
    /// `connection`.
    pub fn dispatch(&self, connection: Arc<dyn Connection>, message: &[u8]) {
        let envelope = match Envelope::parse(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejected message from {}: {}", connection.peer(), e);
                respond(
                    connection.as_ref(),
                    &Response::error(None, format!("Invalid request: {}", e)),
                );
                return;
            }
        };

        let request = Request::new(Arc::clone(&connection), envelope);
        let reply_to = request.clone();
        let router = self.clone();
        let submitted = self
            .pool
            .submit(TaskPriority::High, move || router.route(request));

        if submitted.is_err() {
            reply_to.respond(&Response::error(Some(reply_to.command()), SHUTTING_DOWN));
        }
    }

    /// Runs on a worker: resolve the handler and queue its execution
    fn route(&self, request: Request) {
        let name = request.command().to_string();
        let created = catch_unwind(AssertUnwindSafe(|| {
            self.registry.create(&name, request.clone())
        }));
        let Ok(created) = created else {
            error!("Factory for command '{}' panicked", name);
            request.respond(&Response::error(
                Some(&name),
                "Internal error processing request",
            ));
            return;
        };
        let Some(command) = created else {
            debug!("Unknown command '{}' from {}", name, request.connection().peer());
            request.respond(&Response::error(
                Some(&name),
                format!("Unknown command: '{}'", name),
            ));
            return;
        };

        let reply_to = request.clone();
        let submitted = self
            .pool
            .submit(TaskPriority::Medium, move || run_command(command, request));
        if submitted.is_err() {
            reply_to.respond(&Response::error(Some(&name), SHUTTING_DOWN));
        }
    }
}

fn run_command(command: Box<dyn Command>, request: Request) {
    let name = request.command();
    let response = match catch_unwind(AssertUnwindSafe(|| command.execute())) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!("Command '{}' failed: {}", name, e);
            Response::error(Some(name), e.to_string())
        }
        Err(_) => {
            error!("Command '{}' panicked", name);
            Response::error(Some(name), "Internal error processing request")
        }
    };
    request.respond(&response);
}

impl MessageHandler for CommandRouter {
    fn on_message(&self, connection: Arc<dyn Connection>, message: Bytes) {
        self.dispatch(connection, &message);
    }
}
