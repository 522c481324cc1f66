//! Plugin Loader
//!
//! Turns `.plugin` manifests into registry entries. Loading a manifest for a
//! plugin that is already loaded replaces it: its process is stopped and its
//! command names point at the new process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use iotgate_plugin::ReplyStatus;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::PluginError;
use super::manifest::PluginManifest;
use super::process::{PluginProcess, ProcessConfig};
use super::supervisor::RestartPolicy;
use crate::command::{Command, CommandError, CommandRegistry, Dependencies, Request, Response, Status};
use crate::config::PluginConfig;

/// Handler that forwards one request to a plugin process
pub struct PluginCommand {
    process: PluginProcess,
    name: String,
    entry: String,
    data: Map<String, Value>,
}

impl PluginCommand {
    pub fn new(process: PluginProcess, entry: impl Into<String>, request: Request) -> Self {
        Self {
            process,
            name: request.command().to_string(),
            entry: entry.into(),
            data: request.data().clone(),
        }
    }
}

impl Command for PluginCommand {
    fn execute(self: Box<Self>) -> Result<Response, CommandError> {
        let reply = self.process.request(&self.name, &self.entry, self.data)?;
        Ok(Response {
            status: match reply.status {
                ReplyStatus::Success => Status::Success,
                ReplyStatus::Error => Status::Error,
            },
            command: Some(self.name),
            message: reply.message,
            extra: reply.extra,
        })
    }
}

struct LoadedPlugin {
    archive: PathBuf,
    process: PluginProcess,
    commands: Vec<String>,
}

/// Loads plugin archives into the command registry
pub struct PluginLoader {
    registry: Arc<CommandRegistry>,
    config: PluginConfig,
    restart_policy: RestartPolicy,
    runtime: Handle,
    /// Loaded plugins by plugin name
    loaded: Mutex<HashMap<String, LoadedPlugin>>,
}

impl PluginLoader {
    pub fn new(registry: Arc<CommandRegistry>, config: PluginConfig, runtime: Handle) -> Self {
        Self {
            registry,
            config,
            restart_policy: RestartPolicy::default(),
            runtime,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Whether `path` is an existing file with the archive extension
    pub fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext == self.config.extension.as_str())
            && path.is_file()
    }

    /// Names of loaded plugins, sorted
    pub fn plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Load every archive already in the plugin directory. Returns how many
    /// loaded successfully.
    pub async fn scan(&self) -> usize {
        let dir = self.directory();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan plugin directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut archives = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if self.is_archive(&path) {
                        archives.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading plugin directory {}: {}", dir.display(), e);
                    break;
                }
            }
        }
        archives.sort();

        let mut count = 0;
        for archive in archives {
            match self.load_archive(&archive).await {
                Ok(_) => count += 1,
                Err(e) => warn!("Failed to load plugin archive {}: {}", archive.display(), e),
            }
        }
        info!("Loaded {} plugin(s) from {}", count, dir.display());
        count
    }

    /// Load one archive and register its commands. Returns the registered
    /// command names.
    pub async fn load_archive(&self, archive: &Path) -> Result<Vec<String>, PluginError> {
        let manifest = PluginManifest::load(archive)?;
        let entries = manifest.commands();
        if entries.is_empty() {
            return Err(PluginError::NoCommands(archive.display().to_string()));
        }

        let dir = archive.parent().unwrap_or(Path::new("."));
        let process_config = ProcessConfig::new(&manifest.plugin.name, manifest.executable_in(dir))
            .with_args(manifest.plugin.args.clone())
            .with_working_dir(dir)
            .with_ready_timeout(self.config.ready_timeout())
            .with_request_timeout(self.config.request_timeout())
            .with_restart_policy(self.restart_policy.clone());
        let process = PluginProcess::new(process_config, self.runtime.clone());

        let mut commands = Vec::with_capacity(entries.len());
        for entry in entries {
            let handler_process = process.clone();
            let type_name = entry.type_name;
            self.registry.add(
                entry.name.clone(),
                move |request: Request, _: &Dependencies| -> Box<dyn Command> {
                    Box::new(PluginCommand::new(
                        handler_process.clone(),
                        type_name.as_str(),
                        request,
                    ))
                },
            );
            debug!("Plugin '{}' provides '{}'", manifest.plugin.name, entry.name);
            commands.push(entry.name);
        }

        let previous = self.loaded.lock().insert(
            manifest.plugin.name.clone(),
            LoadedPlugin {
                archive: archive.to_path_buf(),
                process,
                commands: commands.clone(),
            },
        );

        if let Some(previous) = previous {
            for stale in previous.commands.iter().filter(|c| !commands.contains(c)) {
                self.registry.remove(stale);
            }
            previous.process.stop().await;
            info!(
                "Replaced plugin '{}' (was {})",
                manifest.plugin.name,
                previous.archive.display()
            );
        }

        info!(
            "Loaded plugin '{}' from {}: {}",
            manifest.plugin.name,
            archive.display(),
            commands.join(", ")
        );
        Ok(commands)
    }

    /// Stop every plugin process
    pub async fn stop_all(&self) {
        let plugins: Vec<LoadedPlugin> = self.loaded.lock().drain().map(|(_, p)| p).collect();
        for plugin in plugins {
            plugin.process.stop().await;
        }
    }
}
