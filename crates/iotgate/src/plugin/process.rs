//! Plugin Processes
//!
//! Each plugin runs as a child process speaking the line protocol from
//! `iotgate_plugin::protocol`. The process is started on the first request,
//! must announce `ready` within the configured timeout, and is restarted
//! with exponential backoff after it dies.
//!
//! Requests come from pool workers, which are plain threads: [`PluginProcess::request`]
//! blocks on the gateway runtime until the matching response arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use iotgate_plugin::{LogLevel, PluginMessage, Reply};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PluginError;
use super::supervisor::{RestartPolicy, Supervisor};

/// How long a stopping plugin gets to exit before it is killed
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How to launch one plugin
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
    pub restart_policy: RestartPolicy,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            ready_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

enum State {
    /// Not started yet
    Idle,
    Running(Running),
    /// Crashed; the next start is allowed after this instant
    BackingOff(Instant),
    Exhausted,
    Stopped,
}

struct Running {
    generation: u64,
    outbound: mpsc::UnboundedSender<PluginMessage>,
    /// Dropping this also stops the process
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    config: ProcessConfig,
    runtime: Handle,
    state: Mutex<State>,
    supervisor: Mutex<Supervisor>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_request: AtomicU64,
    next_generation: AtomicU64,
}

/// Handle to one plugin's process. Clones share the process.
#[derive(Clone)]
pub struct PluginProcess {
    inner: Arc<Inner>,
}

impl PluginProcess {
    /// Create the handle. Nothing is spawned until the first request.
    pub fn new(config: ProcessConfig, runtime: Handle) -> Self {
        let supervisor = Supervisor::new(config.restart_policy.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                state: Mutex::new(State::Idle),
                supervisor: Mutex::new(supervisor),
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Running(running) if !running.outbound.is_closed())
    }

    /// Run one command in the plugin and wait for its reply
    ///
    /// Blocks the calling thread; must not be called from async code.
    pub fn request(
        &self,
        command: &str,
        entry: &str,
        data: Map<String, Value>,
    ) -> Result<Reply, PluginError> {
        let outbound = self.ensure_running()?;

        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        let message = PluginMessage::Request {
            id,
            command: command.to_string(),
            entry: entry.to_string(),
            data,
        };
        if outbound.send(message).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(PluginError::Crashed(self.name().to_string()));
        }

        let timeout = self.inner.config.request_timeout;
        match self.inner.runtime.block_on(async { tokio::time::timeout(timeout, rx).await }) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(PluginError::Crashed(self.name().to_string())),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(PluginError::Timeout(self.name().to_string()))
            }
        }
    }

    /// Stop the process if it is running. Later requests fail.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), State::Stopped);
        if let State::Running(running) = previous {
            let _ = running.stop.send(());
            if let Err(e) = running.task.await {
                warn!("Plugin '{}' supervisor task failed: {}", self.name(), e);
            }
        }
    }

    fn ensure_running(&self) -> Result<mpsc::UnboundedSender<PluginMessage>, PluginError> {
        let inner = &self.inner;
        let name = || inner.config.name.clone();
        let mut state = inner.state.lock();

        match &*state {
            State::Running(running) if !running.outbound.is_closed() => {
                return Ok(running.outbound.clone());
            }
            // Exited; its supervisor task is about to record the crash
            State::Running(_) => return Err(PluginError::Crashed(name())),
            State::BackingOff(until) => {
                let now = Instant::now();
                if now < *until {
                    return Err(PluginError::Restarting {
                        name: name(),
                        retry_in: *until - now,
                    });
                }
            }
            State::Exhausted => return Err(PluginError::Exhausted(name())),
            State::Stopped => return Err(PluginError::Stopped(name())),
            State::Idle => {}
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        match inner.runtime.block_on(launch(inner, generation)) {
            Ok(running) => {
                let outbound = running.outbound.clone();
                *state = State::Running(running);
                inner.supervisor.lock().on_start();
                Ok(outbound)
            }
            Err(e) => {
                error!("Failed to start plugin '{}': {}", inner.config.name, e);
                *state = inner.crashed_state();
                Err(e)
            }
        }
    }
}

impl Inner {
    /// Next state after the process died
    fn crashed_state(&self) -> State {
        match self.supervisor.lock().on_crash() {
            Some(delay) => {
                warn!("Plugin '{}' will restart in {:?}", self.config.name, delay);
                State::BackingOff(Instant::now() + delay)
            }
            None => {
                error!(
                    "Plugin '{}' exceeded its restart limit, giving up",
                    self.config.name
                );
                State::Exhausted
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let name = &self.config.name;
        match PluginMessage::from_line(line) {
            Ok(PluginMessage::Response { id, reply }) => match self.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!("Dropping late response {} from plugin '{}'", id, name),
            },
            Ok(PluginMessage::Log { level, message }) => emit_log(name, level, &message),
            Ok(other) => warn!("Unexpected message from plugin '{}': {:?}", name, other),
            Err(e) => warn!("Malformed message from plugin '{}': {}", name, e),
        }
    }

    /// Wake every waiting request with an error
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

/// Spawn the process and wait for its handshake
async fn launch(inner: &Arc<Inner>, generation: u64) -> Result<Running, PluginError> {
    let config = &inner.config;
    let spawn_error = |reason: String| PluginError::Spawn {
        name: config.name.clone(),
        reason,
    };

    info!(
        "Starting plugin '{}': {}",
        config.name,
        config.program.display()
    );

    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Plugin stderr goes to our stderr
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("stdout not captured".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    tokio::time::timeout(config.ready_timeout, wait_ready(&config.name, &mut lines))
        .await
        .map_err(|_| PluginError::Timeout(config.name.clone()))??;
    debug!("Plugin '{}' is ready", config.name);

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(supervise(
        Arc::downgrade(inner),
        config.name.clone(),
        generation,
        child,
        stdin,
        lines,
        outbound_rx,
        stop_rx,
    ));

    Ok(Running {
        generation,
        outbound,
        stop,
        task,
    })
}

async fn wait_ready(
    name: &str,
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<(), PluginError> {
    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| PluginError::Crashed(name.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        match PluginMessage::from_line(&line) {
            Ok(PluginMessage::Ready) => return Ok(()),
            Ok(PluginMessage::Log { level, message }) => emit_log(name, level, &message),
            Ok(other) => {
                return Err(PluginError::Protocol {
                    name: name.to_string(),
                    reason: format!("expected ready, got {:?}", other),
                });
            }
            Err(e) => {
                return Err(PluginError::Protocol {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

async fn write_message(stdin: &mut ChildStdin, message: &PluginMessage) -> std::io::Result<()> {
    let line = message.to_line().map_err(std::io::Error::other)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Owns the child: forwards requests, routes responses and logs, and
/// records the exit
#[allow(clippy::too_many_arguments)]
async fn supervise(
    inner: Weak<Inner>,
    name: String,
    generation: u64,
    mut child: Child,
    mut stdin: ChildStdin,
    mut lines: Lines<BufReader<ChildStdout>>,
    mut outbound: mpsc::UnboundedReceiver<PluginMessage>,
    mut stop: oneshot::Receiver<()>,
) {
    let stopping = loop {
        tokio::select! {
            _ = &mut stop => break true,
            Some(message) = outbound.recv() => {
                if let Err(e) = write_message(&mut stdin, &message).await {
                    warn!("Failed to write to plugin '{}': {}", name, e);
                    break false;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match inner.upgrade() {
                    Some(inner) => inner.handle_line(&line),
                    None => break true,
                },
                Ok(None) => break false,
                Err(e) => {
                    warn!("Failed to read from plugin '{}': {}", name, e);
                    break false;
                }
            },
        }
    };

    // Requests sent from here on fail fast
    drop(outbound);

    if stopping {
        let _ = write_message(&mut stdin, &PluginMessage::Stop).await;
    }
    drop(stdin);

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) if stopping => info!("Plugin '{}' stopped ({})", name, status),
        Ok(Ok(status)) => error!("Plugin '{}' exited unexpectedly ({})", name, status),
        Ok(Err(e)) => warn!("Failed to wait for plugin '{}': {}", name, e),
        Err(_) => {
            warn!("Plugin '{}' did not exit in time, killing", name);
            if let Err(e) = child.kill().await {
                error!("Failed to kill plugin '{}': {}", name, e);
            }
        }
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.fail_pending();
    if stopping {
        return;
    }

    let mut state = inner.state.lock();
    if matches!(&*state, State::Running(running) if running.generation == generation) {
        *state = inner.crashed_state();
    }
}

/// Re-emit a plugin log record under the `plugin` target
fn emit_log(plugin: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(target: "plugin", "[{}] {}", plugin, message),
        LogLevel::Debug => tracing::debug!(target: "plugin", "[{}] {}", plugin, message),
        LogLevel::Info => tracing::info!(target: "plugin", "[{}] {}", plugin, message),
        LogLevel::Warn => tracing::warn!(target: "plugin", "[{}] {}", plugin, message),
        LogLevel::Error => tracing::error!(target: "plugin", "[{}] {}", plugin, message),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugin::testing::PONG_SCRIPT;
    use iotgate_plugin::ReplyStatus;
    use tokio::runtime::Runtime;

    fn shell(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig::new(name, "/bin/sh")
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_ready_timeout(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(5))
            .with_restart_policy(RestartPolicy {
                max_restarts: 2,
                initial_backoff: Duration::from_millis(200),
                ..RestartPolicy::default()
            })
    }

    #[test]
    fn test_spawns_lazily_and_answers() {
        let runtime = Runtime::new().unwrap();
        let process = PluginProcess::new(shell("pong", PONG_SCRIPT), runtime.handle().clone());
        assert!(!process.is_running());

        let reply = process.request("Ping", "PingCommand", Map::new()).unwrap();
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(reply.message, "pong");
        assert!(process.is_running());

        // Second request reuses the same process
        let reply = process.request("Ping", "PingCommand", Map::new()).unwrap();
        assert_eq!(reply.message, "pong");

        runtime.block_on(process.stop());
        assert!(!process.is_running());
        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Stopped(_))
        ));
    }

    #[test]
    fn test_concurrent_requests_are_matched_by_id() {
        let runtime = Runtime::new().unwrap();
        let process = PluginProcess::new(shell("pong", PONG_SCRIPT), runtime.handle().clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let process = process.clone();
                std::thread::spawn(move || process.request("Ping", "PingCommand", Map::new()))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap().message, "pong");
        }
        runtime.block_on(process.stop());
    }

    #[test]
    fn test_crash_backs_off_then_restarts() {
        let runtime = Runtime::new().unwrap();
        let script = r#"echo '{"type":"ready"}'; read line; exit 3"#;
        let process = PluginProcess::new(shell("flaky", script), runtime.handle().clone());

        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Crashed(_))
        ));

        // The exit is recorded asynchronously
        let deadline = Instant::now() + Duration::from_secs(5);
        let restarting = loop {
            match process.request("Ping", "PingCommand", Map::new()) {
                Err(PluginError::Restarting { .. }) => break true,
                _ if Instant::now() > deadline => break false,
                _ => std::thread::sleep(Duration::from_millis(20)),
            }
        };
        assert!(restarting);

        std::thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Crashed(_))
        ));
    }

    #[test]
    fn test_restart_limit() {
        let runtime = Runtime::new().unwrap();
        let config = shell("broken", "exit 1").with_restart_policy(RestartPolicy {
            max_restarts: 0,
            ..RestartPolicy::default()
        });
        let process = PluginProcess::new(config, runtime.handle().clone());

        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Crashed(_))
        ));
        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Exhausted(_))
        ));
    }

    #[test]
    fn test_ready_timeout() {
        let runtime = Runtime::new().unwrap();
        let config =
            shell("sleepy", "sleep 5").with_ready_timeout(Duration::from_millis(100));
        let process = PluginProcess::new(config, runtime.handle().clone());

        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Timeout(_))
        ));
        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Restarting { .. })
        ));
    }

    #[test]
    fn test_request_timeout() {
        let runtime = Runtime::new().unwrap();
        let script = r#"echo '{"type":"ready"}'; while read -r line; do :; done"#;
        let config = shell("silent", script).with_request_timeout(Duration::from_millis(200));
        let process = PluginProcess::new(config, runtime.handle().clone());

        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Timeout(_))
        ));
        runtime.block_on(process.stop());
    }

    #[test]
    fn test_handshake_must_be_ready() {
        let runtime = Runtime::new().unwrap();
        let script = r#"echo '{"type":"stop"}'; sleep 5"#;
        let process = PluginProcess::new(shell("rude", script), runtime.handle().clone());

        assert!(matches!(
            process.request("Ping", "PingCommand", Map::new()),
            Err(PluginError::Protocol { .. })
        ));
    }
}
