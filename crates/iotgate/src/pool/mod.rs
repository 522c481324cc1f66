//! Worker Pool
//!
//! A resizable set of OS worker threads pulling from one [`PriorityQueue`].
//! Pause, resize and shutdown are all expressed as control tasks travelling
//! through the same queue as ordinary work:
//!
//! - a pause barrier outranks everything and parks the worker that takes it
//!   on the shared pause semaphore until `resume()`
//! - a kill task outranks user work and ends the worker that takes it
//! - a shutdown barrier ranks below all user work, so queued work drains first
//!
//! The live worker count is eventually consistent: workers decrement it
//! themselves on exit.

mod queue;
mod semaphore;
mod task;

pub use queue::PriorityQueue;
pub use semaphore::Semaphore;
pub use task::{TaskError, TaskHandle, TaskId, TaskPriority};

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use task::{Completion, Job, Task};

/// Errors from pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool '{0}' is shutting down")]
    Rejected(String),

    #[error("Worker count must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub configured_workers: usize,
    pub live_workers: usize,
    pub queued_tasks: usize,
    pub paused: bool,
    pub shutting_down: bool,
}

/// Configured size and outstanding pause barriers. Guarded by one mutex so
/// pause, resume, resize and shutdown never interleave.
#[derive(Debug)]
struct Shape {
    configured: usize,
    pause_barriers: usize,
}

struct PoolInner {
    name: String,
    queue: Arc<PriorityQueue<Task>>,
    shape: Mutex<Shape>,
    pause_permits: Semaphore,
    rejecting: AtomicBool,
    live: AtomicUsize,
    next_task_id: AtomicU64,
    next_worker_id: AtomicUsize,
    exit_lock: Mutex<()>,
    exited: Condvar,
}

impl PoolInner {
    fn next_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    fn inject(&self, job: fn() -> Job, count: usize) {
        for _ in 0..count {
            self.queue.enqueue(Task::control(self.next_id(), job()));
        }
    }

    fn worker_exited(&self) {
        let _guard = self.exit_lock.lock();
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.exited.notify_all();
    }
}

/// Priority-aware, resizable thread pool.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool named `"pool"` with `workers` threads
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        Self::with_name("pool", workers)
    }

    /// Create a named pool. Worker threads are called `{name}-worker-{n}`.
    pub fn with_name(name: impl Into<String>, workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::InvalidWorkerCount(0));
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                queue: Arc::new(PriorityQueue::new()),
                shape: Mutex::new(Shape {
                    configured: 0,
                    pause_barriers: 0,
                }),
                pause_permits: Semaphore::new(0),
                rejecting: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                next_task_id: AtomicU64::new(0),
                next_worker_id: AtomicUsize::new(0),
                exit_lock: Mutex::new(()),
                exited: Condvar::new(),
            }),
        };

        for spawned in 0..workers {
            if let Err(e) = pool.spawn_worker() {
                pool.inner.shape.lock().configured = spawned;
                pool.shutdown();
                return Err(e);
            }
        }
        pool.inner.shape.lock().configured = workers;

        info!("Worker pool '{}' started with {} workers", pool.inner.name, workers);
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `work` at MEDIUM priority without a result handle
    pub fn execute<F>(&self, work: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::work(self.inner.next_id(), TaskPriority::Medium, work);
        self.enqueue(task)
    }

    /// Queue `work` at `priority` and return a handle to its result
    pub fn submit<T, F>(&self, priority: TaskPriority, work: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let id = self.inner.next_id();
        let completion = Completion::new();
        let cell = Arc::clone(&completion);
        let task = Task::work(id, priority, move || {
            match catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => cell.complete(value),
                Err(panic) => {
                    cell.fail(panic_message(&*panic));
                    // Let the worker log it like any other panic
                    resume_unwind(panic);
                }
            }
        });

        self.enqueue(task)?;
        Ok(TaskHandle::new(id, completion, Arc::downgrade(&self.inner.queue)))
    }

    // Checked under the shape lock so no work lands behind the shutdown
    // barriers, where no worker would ever take it.
    fn enqueue(&self, task: Task) -> Result<(), PoolError> {
        let _shape = self.inner.shape.lock();
        self.check_accepting()?;
        self.inner.queue.enqueue(task);
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), PoolError> {
        if self.inner.rejecting.load(Ordering::SeqCst) {
            return Err(PoolError::Rejected(self.inner.name.clone()));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shape
    // ─────────────────────────────────────────────────────────────────────────

    /// Grow or shrink the pool to `count` workers.
    ///
    /// Growth is immediate. Shrinking queues kill tasks, so
    /// [`worker_count`](Self::worker_count) catches up once idle workers
    /// take them.
    pub fn set_worker_count(&self, count: usize) -> Result<(), PoolError> {
        if count == 0 {
            return Err(PoolError::InvalidWorkerCount(count));
        }

        let mut shape = self.inner.shape.lock();
        self.check_accepting()?;

        let current = shape.configured;
        if count < current {
            self.inner.inject(|| Job::KillWorker, current - count);
            shape.configured = count;
        } else if count > current {
            let paused = shape.pause_barriers > 0;
            for _ in current..count {
                self.spawn_worker()?;
                shape.configured += 1;
                if paused {
                    self.inner.inject(|| Job::PauseBarrier, 1);
                    shape.pause_barriers += 1;
                }
            }
        }

        info!(
            "Worker pool '{}' resized from {} to {} workers",
            self.inner.name, current, count
        );
        Ok(())
    }

    /// Number of worker threads currently alive
    pub fn worker_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of workers the pool is converging to
    pub fn configured_workers(&self) -> usize {
        self.inner.shape.lock().configured
    }

    /// Park every worker once it finishes its current task. No-op while
    /// already paused.
    pub fn pause(&self) {
        let mut shape = self.inner.shape.lock();
        if shape.pause_barriers > 0 || self.inner.rejecting.load(Ordering::SeqCst) {
            return;
        }
        self.inner.inject(|| Job::PauseBarrier, shape.configured);
        shape.pause_barriers = shape.configured;
        debug!("Worker pool '{}' paused", self.inner.name);
    }

    /// Release every worker parked by [`pause`](Self::pause)
    pub fn resume(&self) {
        let mut shape = self.inner.shape.lock();
        if shape.pause_barriers == 0 {
            return;
        }
        self.inner.pause_permits.release(shape.pause_barriers);
        shape.pause_barriers = 0;
        debug!("Worker pool '{}' resumed", self.inner.name);
    }

    /// Stop accepting work and let every worker exit after the queue drains
    pub fn shutdown(&self) {
        let mut shape = self.inner.shape.lock();
        if self.inner.rejecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pause_permits.release(shape.pause_barriers);
        shape.pause_barriers = 0;
        self.inner.inject(|| Job::ShutdownBarrier, shape.configured);
        info!("Worker pool '{}' shutting down", self.inner.name);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.rejecting.load(Ordering::SeqCst)
    }

    /// Block until every worker has exited or `timeout` elapses.
    ///
    /// Returns `true` when the pool terminated in time.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.exit_lock.lock();
        while self.inner.live.load(Ordering::SeqCst) > 0 {
            if self.inner.exited.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.inner.live.load(Ordering::SeqCst) == 0
    }

    pub fn status(&self) -> PoolStatus {
        let shape = self.inner.shape.lock();
        PoolStatus {
            name: self.inner.name.clone(),
            configured_workers: shape.configured,
            live_workers: self.worker_count(),
            queued_tasks: self.inner.queue.len(),
            paused: shape.pause_barriers > 0,
            shutting_down: self.is_shutdown(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_worker(&self) -> Result<(), PoolError> {
        let n = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);

        self.inner.live.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.inner.name, n))
            .spawn(move || run_worker(inner));

        if let Err(e) = spawned {
            self.inner.worker_exited();
            return Err(PoolError::Spawn(e));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("live", &self.worker_count())
            .finish()
    }
}

fn run_worker(inner: Arc<PoolInner>) {
    let name = thread::current().name().unwrap_or("worker").to_string();
    debug!("{} started", name);

    loop {
        let task = inner.queue.dequeue();
        match task.job {
            Job::Run(work) => {
                let Some(work) = work.into_inner() else {
                    continue;
                };
                if let Err(panic) = catch_unwind(AssertUnwindSafe(work)) {
                    error!("{}: {} panicked: {}", name, task.id, panic_message(&*panic));
                }
            }
            Job::PauseBarrier => inner.pause_permits.acquire(),
            Job::KillWorker | Job::ShutdownBarrier => break,
        }
    }

    debug!("{} exiting", name);
    inner.worker_exited();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
