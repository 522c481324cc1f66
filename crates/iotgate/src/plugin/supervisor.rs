//! Plugin restart supervision with exponential backoff

use std::time::{Duration, Instant};

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum number of restarts before giving up
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// A plugin that stays up this long gets its restart count cleared
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            restart_window: Duration::from_secs(300),
        }
    }
}

/// Restart bookkeeping for one plugin
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    restart_count: u32,
    current_backoff: Duration,
    last_start: Option<Instant>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial_backoff = policy.initial_backoff;
        Self {
            policy,
            restart_count: 0,
            current_backoff: initial_backoff,
            last_start: None,
        }
    }

    /// The process completed its handshake
    pub fn on_start(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// The process exited or failed to start. Returns how long to wait
    /// before the next start, or `None` once the restart limit is reached.
    pub fn on_crash(&mut self) -> Option<Duration> {
        if let Some(started) = self.last_start.take() {
            if started.elapsed() >= self.policy.restart_window {
                self.reset();
            }
        }

        self.restart_count += 1;
        if self.restart_count > self.policy.max_restarts {
            return None;
        }

        let delay = self.current_backoff;
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.current_backoff = self.policy.initial_backoff;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.restart_count > self.policy.max_restarts
    }
}
