//! Background maintenance scheduler
//!
//! Index builds and compactions run on a small pool of worker threads fed
//! by a priority queue. Each task belongs to a table and carries a
//! `CancelToken`; dropping a table cancels everything queued or running
//! for it. A `(table, kind)` pair is queued at most once, so repeated
//! inserts do not pile up identical builds.

use crate::cancel::CancelToken;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tessera_core::{Error, Result};
use tracing::{debug, error, info, warn};

/// Priority levels for maintenance work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Compaction
    Low = 0,
    /// Automatic builds of sealed segments
    Normal = 1,
    /// User-requested index builds
    High = 2,
}

/// What a maintenance task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Build sealed raw segments
    Build,
    /// Rebuild every segment to a new descriptor
    CreateIndex,
    /// Merge small segments
    Compact,
}

impl TaskKind {
    /// Lowercase name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Build => "build",
            TaskKind::CreateIndex => "create_index",
            TaskKind::Compact => "compact",
        }
    }

    /// Priority the task is queued with
    pub fn priority(&self) -> TaskPriority {
        match self {
            TaskKind::Build => TaskPriority::Normal,
            TaskKind::CreateIndex => TaskPriority::High,
            TaskKind::Compact => TaskPriority::Low,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackpressureError {
    /// The queue is at `max_queue_depth`
    #[error("maintenance queue is full")]
    QueueFull,
    /// The scheduler was shut down
    #[error("maintenance scheduler is shut down")]
    ShutDown,
}

impl From<BackpressureError> for Error {
    fn from(e: BackpressureError) -> Self {
        Error::not_ready(e.to_string())
    }
}

/// Scheduler metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting in the queue
    pub queue_depth: usize,
    /// Tasks being executed
    pub active_tasks: usize,
    /// Tasks finished since creation, failures included
    pub tasks_completed: u64,
    /// Tasks that returned an error or panicked
    pub tasks_failed: u64,
    /// Worker threads
    pub worker_count: usize,
}

/// Whether a listed task is waiting or executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In the queue
    Queued,
    /// Picked up by a worker
    Running,
}

/// One row of the scheduler's task table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    /// Owning table
    pub table: String,
    /// What the task does
    pub kind: TaskKind,
    /// Queued or running
    pub state: TaskState,
}

/// Point-in-time dump of the scheduler: counters plus every live task,
/// ordered by submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTableDump {
    /// Counters at the time of the dump
    pub stats: SchedulerStats,
    /// Queued and running tasks
    pub tasks: Vec<TaskEntry>,
}

type Work = Box<dyn FnOnce(&CancelToken) -> Result<()> + Send>;

#[derive(Default)]
struct Outcome {
    result: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl Outcome {
    fn finish(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Handle to a submitted task
pub struct TaskHandle {
    table: String,
    kind: TaskKind,
    cancel: CancelToken,
    outcome: Arc<Outcome>,
}

impl TaskHandle {
    /// Table the task works on
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Task kind
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Token observed by the task
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask the task to stop; it commits nothing after observing this
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the task has finished
    pub fn is_finished(&self) -> bool {
        self.outcome.result.lock().is_some()
    }

    /// Block until the task finishes and return its result
    pub fn wait(self) -> Result<()> {
        let mut result = self.outcome.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.outcome.done.wait(&mut result);
        }
    }
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    table: String,
    kind: TaskKind,
    cancel: CancelToken,
    outcome: Arc<Outcome>,
    work: Work,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then older first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<TaskEnvelope>,
    queued: HashSet<(String, TaskKind)>,
}

struct SchedulerInner {
    queue: Mutex<QueueState>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    /// Tokens of queued and running tasks, by sequence
    tokens: Mutex<HashMap<u64, (String, TaskKind, CancelToken)>>,
}

/// Priority queue of table maintenance tasks run by worker threads
pub struct MaintenanceScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl MaintenanceScheduler {
    /// Start `num_threads` workers named `tessera-maint-N`
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tokens: Mutex::new(HashMap::new()),
        });

        let scheduler = MaintenanceScheduler {
            inner,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads,
        };
        for i in 0..num_threads {
            let inner = Arc::clone(&scheduler.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("tessera-maint-{}", i))
                .spawn(move || worker_loop(&inner));
            match spawned {
                Ok(handle) => scheduler.workers.lock().push(handle),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(Error::io("spawn maintenance worker", e));
                }
            }
        }
        Ok(scheduler)
    }

    /// Queue `work` for `table`.
    ///
    /// Returns `Ok(None)` when a task of the same kind is already queued for
    /// the table; that task will observe any state the caller produced.
    pub fn submit(
        &self,
        table: &str,
        kind: TaskKind,
        work: impl FnOnce(&CancelToken) -> Result<()> + Send + 'static,
    ) -> std::result::Result<Option<TaskHandle>, BackpressureError> {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(BackpressureError::ShutDown);
        }
        let cancel = CancelToken::new();
        let outcome = Arc::new(Outcome::default());
        {
            let mut queue = self.inner.queue.lock();
            let key = (table.to_string(), kind);
            if queue.queued.contains(&key) {
                return Ok(None);
            }
            if queue.heap.len() >= self.inner.max_queue_depth {
                return Err(BackpressureError::QueueFull);
            }
            let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            self.inner
                .tokens
                .lock()
                .insert(sequence, (table.to_string(), kind, cancel.clone()));
            queue.queued.insert(key);
            queue.heap.push(TaskEnvelope {
                priority: kind.priority(),
                sequence,
                table: table.to_string(),
                kind,
                cancel: cancel.clone(),
                outcome: Arc::clone(&outcome),
                work: Box::new(work),
            });
        }
        self.inner.work_ready.notify_one();
        debug!(target: "tessera::background", table, kind = %kind, "Queued maintenance task");
        Ok(Some(TaskHandle {
            table: table.to_string(),
            kind,
            cancel,
            outcome,
        }))
    }

    /// Cancel every queued or running task of `table`; returns how many
    pub fn cancel_table(&self, table: &str) -> usize {
        let tokens = self.inner.tokens.lock();
        let mut cancelled = 0;
        for (owner, _, token) in tokens.values() {
            if owner == table {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(target: "tessera::background", table, cancelled, "Cancelled maintenance tasks");
        }
        cancelled
    }

    /// Block until every queued and in-flight task has completed.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.heap.is_empty() || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop accepting work, run what is queued and join the workers
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            // Holding the queue lock rules out a lost wakeup.
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!(target: "tessera::background", "Maintenance worker exited by panic");
            }
        }
    }

    /// Metrics snapshot
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue.lock().heap.len(),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            tasks_failed: self.inner.tasks_failed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }

    /// Every queued and running task with the current counters
    pub fn dump(&self) -> TaskTableDump {
        let mut rows: Vec<(u64, TaskEntry)> = {
            let queue = self.inner.queue.lock();
            let queued: HashSet<u64> = queue.heap.iter().map(|t| t.sequence).collect();
            let tokens = self.inner.tokens.lock();
            tokens
                .iter()
                .map(|(sequence, (table, kind, _))| {
                    let state = if queued.contains(sequence) {
                        TaskState::Queued
                    } else {
                        TaskState::Running
                    };
                    (
                        *sequence,
                        TaskEntry {
                            table: table.clone(),
                            kind: *kind,
                            state,
                        },
                    )
                })
                .collect()
        };
        rows.sort_by_key(|(sequence, _)| *sequence);
        TaskTableDump {
            stats: self.stats(),
            tasks: rows.into_iter().map(|(_, entry)| entry).collect(),
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` and wakes drain waiters, even if the task panicked
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
    sequence: u64,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        self.inner.tokens.lock().remove(&self.sequence);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        let queue = self.inner.queue.lock();
        if prev_active == 1 && queue.heap.is_empty() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.heap.pop() {
                    queue.queued.remove(&(task.table.clone(), task.kind));
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard {
            inner,
            sequence: task.sequence,
        };
        let TaskEnvelope {
            table,
            kind,
            cancel,
            outcome,
            work,
            ..
        } = task;

        let result = if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            let run = std::panic::AssertUnwindSafe(|| work(&cancel));
            match std::panic::catch_unwind(run) {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "(non-string panic)".to_string());
                    error!(
                        target: "tessera::background",
                        table = %table,
                        kind = %kind,
                        panic = %message,
                        "Maintenance task panicked"
                    );
                    Err(Error::not_ready(format!("maintenance task panicked: {}", message)))
                }
            }
        };
        match &result {
            Ok(()) => {
                debug!(target: "tessera::background", table = %table, kind = %kind, "Maintenance task done")
            }
            Err(Error::Cancelled) => {
                info!(target: "tessera::background", table = %table, kind = %kind, "Maintenance task cancelled")
            }
            Err(e) => {
                inner.tasks_failed.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "tessera::background",
                    table = %table,
                    kind = %kind,
                    error = %e,
                    "Maintenance task failed"
                );
            }
        }
        outcome.finish(result);
    }
}
