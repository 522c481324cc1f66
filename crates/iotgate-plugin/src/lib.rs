//! Plugin SDK for the IoT gateway
//!
//! A plugin is a separate executable announced to the gateway by a `.plugin`
//! manifest. The gateway starts it on first use and talks to it over
//! stdin/stdout using the line protocol in [`protocol`]. [`serve`] runs that
//! protocol so a plugin only has to map requests to replies:
//!
//! ```no_run
//! use iotgate_plugin::{Reply, serve};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     serve(|request, log| {
//!         log.info(format!("handling {}", request.command));
//!         Reply::success("ok")
//!     })
//!     .await
//! }
//! ```

pub mod protocol;

pub use protocol::{LogLevel, PluginMessage, Reply, ReplyStatus};

use std::io;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One command invocation received from the gateway
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// Name the command is registered under
    pub command: String,
    /// Manifest entry type the gateway resolved the name to
    pub entry: String,
    pub data: Map<String, Value>,
}

/// Sends log records to the gateway, which re-emits them in its own logs
#[derive(Debug, Clone)]
pub struct Logger {
    tx: mpsc::UnboundedSender<PluginMessage>,
}

impl Logger {
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        // The gateway stopped reading; nothing left to tell it
        let _ = self.tx.send(PluginMessage::Log {
            level,
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

/// Serve the plugin protocol on stdin/stdout until the gateway sends `stop`
/// or closes stdin
pub async fn serve<H>(handler: H) -> io::Result<()>
where
    H: Fn(PluginRequest, &Logger) -> Reply + Send + Sync + 'static,
{
    serve_with(tokio::io::stdin(), tokio::io::stdout(), handler).await
}

/// Serve the plugin protocol over arbitrary streams
///
/// Each request runs on the blocking thread pool, so slow handlers do not
/// hold up other requests.
pub async fn serve_with<R, W, H>(input: R, mut output: W, handler: H) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: Fn(PluginRequest, &Logger) -> Reply + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let (tx, mut rx) = mpsc::unbounded_channel::<PluginMessage>();
    let logger = Logger { tx: tx.clone() };

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = message.to_line().map_err(io::Error::other)?;
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let _ = tx.send(PluginMessage::Ready);

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match PluginMessage::from_line(&line) {
            Ok(PluginMessage::Request {
                id,
                command,
                entry,
                data,
            }) => {
                let handler = Arc::clone(&handler);
                let logger = logger.clone();
                let tx = tx.clone();
                in_flight.spawn_blocking(move || {
                    let request = PluginRequest {
                        command,
                        entry,
                        data,
                    };
                    let reply = handler(request, &logger);
                    let _ = tx.send(PluginMessage::Response { id, reply });
                });
            }
            Ok(PluginMessage::Stop) => break,
            Ok(other) => logger.warn(format!("Ignoring unexpected message: {:?}", other)),
            Err(e) => logger.warn(format!("Ignoring malformed message: {}", e)),
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(logger);
    drop(tx);
    writer.await.map_err(io::Error::other)?
}
