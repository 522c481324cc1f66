//! Plugin Directory Watcher
//!
//! Loads archives as they are created or rewritten in the plugin directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::PluginError;
use super::loader::PluginLoader;

/// Quiet period that lets a file copy finish before it is loaded
const SETTLE: Duration = Duration::from_millis(250);

/// Watches the plugin directory and feeds changes to the loader
pub struct PluginWatcher {
    loader: Arc<PluginLoader>,
    /// Channel receiver for file events
    rx: mpsc::Receiver<PathBuf>,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl PluginWatcher {
    pub fn new(loader: Arc<PluginLoader>) -> Result<Self, PluginError> {
        let dir = loader.directory().to_path_buf();
        let (tx, rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for path in Self::changed_paths(&event) {
                        let _ = tx.blocking_send(path);
                    }
                }
                Err(e) => {
                    error!("Plugin watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching plugin directory: {}", dir.display());

        Ok(Self {
            loader,
            rx,
            _watcher: watcher,
        })
    }

    /// Paths created or modified by `event`
    fn changed_paths(event: &Event) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => event.paths.clone(),
            _ => {
                debug!("Ignoring event kind: {:?}", event.kind);
                Vec::new()
            }
        }
    }

    /// Run the watcher loop
    pub async fn run(mut self) {
        info!("Starting plugin watcher loop");

        while let Some(path) = self.rx.recv().await {
            // Writes arrive as bursts of events; load each file once
            tokio::time::sleep(SETTLE).await;
            let mut changed = vec![path];
            while let Ok(path) = self.rx.try_recv() {
                if !changed.contains(&path) {
                    changed.push(path);
                }
            }

            for path in changed {
                self.handle_change(&path).await;
            }
        }

        info!("Plugin watcher loop ended");
    }

    async fn handle_change(&self, path: &Path) {
        if !self.loader.is_archive(path) {
            debug!("Ignoring non-archive change: {}", path.display());
            return;
        }

        info!("Plugin archive changed: {}", path.display());
        if let Err(e) = self.loader.load_archive(path).await {
            warn!("Failed to load plugin archive {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRegistry;
    use crate::config::PluginConfig;
    use tokio::runtime::Handle;
    use tokio::time::{Instant, sleep};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_archive_is_registered() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(CommandRegistry::default());
        let config = PluginConfig {
            directory: dir.path().to_path_buf(),
            ..PluginConfig::default()
        };
        let loader = Arc::new(PluginLoader::new(
            Arc::clone(&registry),
            config,
            Handle::current(),
        ));

        let watcher = PluginWatcher::new(Arc::clone(&loader)).unwrap();
        let task = tokio::spawn(watcher.run());

        std::fs::write(dir.path().join("ignored.txt"), "[plugin]").unwrap();
        std::fs::write(
            dir.path().join("lights.plugin"),
            "[plugin]\nname = \"lights\"\nexecutable = \"lights-plugin\"\n\n\
             [[entries]]\ntype = \"SwitchLightCommand\"\nimplements = [\"Command\"]\n",
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.contains("Switch Light") && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        assert!(registry.contains("Switch Light"));
        assert_eq!(loader.plugins(), vec!["lights".to_string()]);

        task.abort();
    }
}
