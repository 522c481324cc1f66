//! Plugins
//!
//! Commands contributed at runtime by dropping `.plugin` manifests into the
//! plugin directory. Each manifest names an executable that serves the
//! plugin protocol; its concrete `Command` entries are registered with the
//! [`CommandRegistry`](crate::command::CommandRegistry) and forwarded to the
//! process when invoked.

mod loader;
mod manifest;
mod naming;
mod process;
mod supervisor;
mod watcher;

pub use loader::{PluginCommand, PluginLoader};
pub use manifest::{COMMAND_CAPABILITY, CommandEntry, EntryDecl, EntryKind, PluginManifest};
pub use naming::command_name;
pub use process::{PluginProcess, ProcessConfig};
pub use supervisor::{RestartPolicy, Supervisor};
pub use watcher::PluginWatcher;

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or talking to plugins
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to read plugin archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid plugin manifest: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("Plugin archive {0} declares no commands")]
    NoCommands(String),

    #[error("Failed to watch plugin directory: {0}")]
    Watch(#[from] notify::Error),

    #[error("Failed to start plugin '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("Plugin '{0}' did not answer in time")]
    Timeout(String),

    #[error("Plugin '{0}' exited unexpectedly")]
    Crashed(String),

    #[error("Plugin '{name}' is restarting, retry in {retry_in:?}")]
    Restarting { name: String, retry_in: Duration },

    #[error("Plugin '{0}' exceeded its restart limit")]
    Exhausted(String),

    #[error("Plugin '{0}' has been stopped")]
    Stopped(String),

    #[error("Protocol error from plugin '{name}': {reason}")]
    Protocol { name: String, reason: String },
}

#[cfg(test)]
pub(crate) mod testing {
    /// Shell plugin that answers every request with `pong` and logs it
    pub(crate) const PONG_SCRIPT: &str = r#"
echo '{"type":"ready"}'
while read -r line; do
  case "$line" in
    *'"type":"stop"'*) exit 0 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "{\"type\":\"log\",\"level\":\"info\",\"message\":\"request $id\"}"
  echo "{\"type\":\"response\",\"id\":$id,\"reply\":{\"status\":\"success\",\"message\":\"pong\",\"request\":$id}}"
done
"#;
}
