//! Tasks and Task Handles
//!
//! A [`Task`] is what actually sits in the pool's queue: either user work or
//! one of the internal control signals. User code only ever sees
//! [`TaskPriority`] and [`TaskHandle`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::queue::PriorityQueue;

// ─────────────────────────────────────────────────────────────────────────────
// Priorities
// ─────────────────────────────────────────────────────────────────────────────

/// Priority levels available to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// Full dequeue order, lowest first. Control levels stay crate-private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Priority {
    /// Drains behind every piece of ordinary work
    ShutdownBarrier,
    Low,
    Medium,
    High,
    KillWorker,
    /// Pre-empts everything, including pending kills
    PauseBarrier,
}

impl From<TaskPriority> for Priority {
    fn from(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::High => Priority::High,
            TaskPriority::Medium => Priority::Medium,
            TaskPriority::Low => Priority::Low,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier used to find a queued task again (for cancellation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Boxed user work. The mutex makes a queued task shareable between the
/// threads that peek at the heap; only the dequeuing worker ever takes it.
pub(crate) type Work = Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>;

/// What a worker does with a dequeued task
pub(crate) enum Job {
    Run(Work),
    PauseBarrier,
    KillWorker,
    ShutdownBarrier,
}

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) job: Job,
}

impl Task {
    pub(crate) fn work(id: TaskId, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> Self {
        let work: Box<dyn FnOnce() + Send + 'static> = Box::new(work);
        Self {
            id,
            priority: priority.into(),
            job: Job::Run(Mutex::new(Some(work))),
        }
    }

    pub(crate) fn control(id: TaskId, job: Job) -> Self {
        let priority = match job {
            Job::PauseBarrier => Priority::PauseBarrier,
            Job::KillWorker => Priority::KillWorker,
            Job::ShutdownBarrier => Priority::ShutdownBarrier,
            Job::Run(_) => Priority::Medium,
        };
        Self { id, priority, job }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// Ordering (and therefore equality) is by priority only; the queue breaks
// ties by insertion order.
impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Task {}

impl PartialEq<TaskId> for Task {
    fn eq(&self, id: &TaskId) -> bool {
        self.id == *id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned when reading a task's result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Timed out waiting for task result")]
    Timeout,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task result was already taken")]
    AlreadyTaken,
}

enum State<T> {
    Pending,
    Done(T),
    Failed(String),
    Cancelled,
    Taken,
}

/// Write-once cell shared between a handle and the task that fills it
pub(crate) struct Completion<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, value: T) {
        self.settle(State::Done(value));
    }

    pub(crate) fn fail(&self, message: String) {
        self.settle(State::Failed(message));
    }

    // Only a pending cell can be settled; later writes are ignored.
    fn settle(&self, outcome: State<T>) {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = outcome;
            self.ready.notify_all();
        }
    }
}

/// Handle to the result of a submitted task
pub struct TaskHandle<T> {
    id: TaskId,
    completion: Arc<Completion<T>>,
    queue: Weak<PriorityQueue<Task>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: TaskId,
        completion: Arc<Completion<T>>,
        queue: Weak<PriorityQueue<Task>>,
    ) -> Self {
        Self {
            id,
            completion,
            queue,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel the task if it is still waiting in the queue.
    ///
    /// Returns `false` once the task has started, finished, or was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.completion.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        if queue.remove(&self.id) {
            *state = State::Cancelled;
            self.completion.ready.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.completion.state.lock(), State::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        matches!(
            *self.completion.state.lock(),
            State::Done(_) | State::Failed(_) | State::Taken
        )
    }

    /// Block until the task finishes or is cancelled, then take its result
    pub fn get(&self) -> Result<T, TaskError> {
        let mut state = self.completion.state.lock();
        while matches!(*state, State::Pending) {
            self.completion.ready.wait(&mut state);
        }
        take(&mut state)
    }

    /// Like [`get`](Self::get) but gives up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.completion.state.lock();
        while matches!(*state, State::Pending) {
            if self
                .completion
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        take(&mut state)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

fn take<T>(state: &mut State<T>) -> Result<T, TaskError> {
    match std::mem::replace(state, State::Taken) {
        State::Done(value) => Ok(value),
        State::Pending => {
            *state = State::Pending;
            Err(TaskError::Timeout)
        }
        State::Failed(message) => {
            *state = State::Failed(message.clone());
            Err(TaskError::Panicked(message))
        }
        State::Cancelled => {
            *state = State::Cancelled;
            Err(TaskError::Cancelled)
        }
        State::Taken => Err(TaskError::AlreadyTaken),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_levels_bracket_user_levels() {
        assert!(Priority::PauseBarrier > Priority::KillWorker);
        assert!(Priority::KillWorker > Priority::from(TaskPriority::High));
        assert!(Priority::from(TaskPriority::High) > Priority::from(TaskPriority::Medium));
        assert!(Priority::from(TaskPriority::Medium) > Priority::from(TaskPriority::Low));
        assert!(Priority::from(TaskPriority::Low) > Priority::ShutdownBarrier);
    }

    #[test]
    fn test_completion_is_write_once() {
        let completion = Completion::new();
        let handle = TaskHandle::new(TaskId(1), Arc::clone(&completion), Weak::new());

        completion.complete(7);
        completion.fail("late".into());

        assert!(handle.is_done());
        assert_eq!(handle.get(), Ok(7));
        assert_eq!(handle.get(), Err(TaskError::AlreadyTaken));
    }

    #[test]
    fn test_get_timeout_on_pending() {
        let completion = Completion::<()>::new();
        let handle = TaskHandle::new(TaskId(2), completion, Weak::new());

        let started = Instant::now();
        assert_eq!(
            handle.get_timeout(Duration::from_millis(30)),
            Err(TaskError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!handle.is_done());
    }

    #[test]
    fn test_failed_task_reports_panic_repeatedly() {
        let completion = Completion::<u8>::new();
        let handle = TaskHandle::new(TaskId(3), Arc::clone(&completion), Weak::new());
        completion.fail("boom".into());

        assert_eq!(handle.get(), Err(TaskError::Panicked("boom".into())));
        assert_eq!(handle.get(), Err(TaskError::Panicked("boom".into())));
    }
}
