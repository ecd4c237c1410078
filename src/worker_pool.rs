//! # Worker Pool Module
//!
//! The background execution pool behind deferred responses. N `may` worker
//! coroutines share one queue; [`WorkerPool::submit`] enqueues a task and
//! returns a [`TaskHandle`] whose [`on_complete`](TaskHandle::on_complete)
//! callback fires exactly once, on the worker that finished the task.
//!
//! ## Features
//!
//! - **Shared Queue**: Workers share one receiver and balance automatically
//! - **Bounded**: Submissions past `queue_bound` wait (`Block`) or fail (`Shed`)
//! - **Panic Recovery**: A panicking task completes its handle with an error
//! - **Metrics**: Queue depth, dispatch, completion and shed counts
//!
//! ## Configuration
//!
//! - `BRRTE_ASYNC_WORKERS`: Number of worker coroutines (default: 4)
//! - `BRRTE_ASYNC_QUEUE_BOUND`: Maximum queued plus running tasks (default: 1024)
//! - `BRRTE_BACKPRESSURE_MODE`: `block` or `shed` (default: block)
//! - `BRRTE_BACKPRESSURE_TIMEOUT_MS`: How long `block` waits for room (default: 50)

use crate::response::HandlerResponse;
use crate::runtime_config::{BackpressureMode, PoolConfig};
use may::sync::mpsc;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::SendError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Work accepted by the pool.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static>;

/// Receives a task's outcome.
pub type Completion = Box<dyn FnOnce(anyhow::Result<HandlerResponse>) + Send + 'static>;

enum HandleState {
    /// Task still running; callback registered or not yet
    Pending(Option<Completion>),
    /// Task finished before anyone registered a callback
    Done(anyhow::Result<HandlerResponse>),
    /// Callback has run
    Fired,
}

/// Caller side of a submitted task.
pub struct TaskHandle {
    id: u64,
    state: Arc<Mutex<HandleState>>,
}

/// Worker side of a submitted task. Consumed by [`complete`](Self::complete).
struct Completer {
    id: u64,
    state: Arc<Mutex<HandleState>>,
}

impl TaskHandle {
    fn pair(id: u64) -> (TaskHandle, Completer) {
        let state = Arc::new(Mutex::new(HandleState::Pending(None)));
        (
            TaskHandle {
                id,
                state: Arc::clone(&state),
            },
            Completer { id, state },
        )
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        !matches!(*self.state.lock(), HandleState::Pending(_))
    }

    /// Run `callback` with the task's outcome, exactly once.
    ///
    /// If the task already finished, the callback runs now on the caller;
    /// otherwise it runs on the worker that finishes the task.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(anyhow::Result<HandlerResponse>) + Send + 'static,
    {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HandleState::Fired) {
            HandleState::Pending(_) => {
                *state = HandleState::Pending(Some(Box::new(callback)));
            }
            HandleState::Done(result) => {
                drop(state);
                debug!(task_id = self.id, "Task already complete - callback runs on caller");
                callback(result);
            }
            HandleState::Fired => {
                warn!(task_id = self.id, "Completion callback registered after firing");
            }
        }
    }
}

impl Completer {
    fn complete(self, result: anyhow::Result<HandlerResponse>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, HandleState::Fired) {
            HandleState::Pending(Some(callback)) => {
                drop(state);
                callback(result);
            }
            HandleState::Pending(None) => {
                *state = HandleState::Done(result);
            }
            HandleState::Done(previous) => {
                *state = HandleState::Done(previous);
                warn!(task_id = self.id, "Task completed twice - second outcome dropped");
            }
            HandleState::Fired => {
                warn!(task_id = self.id, "Task completed after callback fired");
            }
        }
    }
}

struct Job {
    id: u64,
    task: Task,
    completer: Completer,
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Number of submissions rejected by backpressure
    pub shed_count: AtomicU64,
    /// Tasks queued or running
    pub queue_depth: AtomicUsize,
    /// Total tasks accepted
    pub dispatched_count: AtomicU64,
    /// Total tasks finished
    pub completed_count: AtomicU64,
}

impl WorkerPoolMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }
}

/// Bounded pool of worker coroutines.
pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    metrics: Arc<WorkerPoolMetrics>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Spawn `config.num_workers` coroutines sharing one queue.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(rx);
        let metrics = Arc::new(WorkerPoolMetrics::new());

        info!(
            pool_name = %name,
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            backpressure_mode = ?config.backpressure_mode,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);
            let pool_name = name.clone();

            // SAFETY: may::coroutine::Builder::spawn() is unsafe because the
            // coroutine must not use thread-local storage that outlives it.
            // The worker only touches the shared receiver, the metrics, and
            // the jobs it receives.
            let spawned = unsafe {
                may::coroutine::Builder::new()
                    .name(format!("{pool_name}-{worker_id}"))
                    .stack_size(config.stack_size)
                    .spawn(move || worker_loop(&pool_name, worker_id, &rx, &metrics))
            };

            if let Err(e) = spawned {
                error!(
                    pool_name = %name,
                    worker_id = worker_id,
                    error = %e,
                    "Failed to spawn worker coroutine"
                );
            }
        }

        Self {
            name,
            config,
            sender: Mutex::new(Some(tx)),
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue `task`.
    ///
    /// Never blocks beyond the backpressure timeout. A rejected submission
    /// still yields a handle; it completes with an error.
    pub fn submit<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<HandlerResponse> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, completer) = TaskHandle::pair(id);

        if let Err(reason) = self.admit() {
            self.metrics.record_shed();
            warn!(
                pool_name = %self.name,
                task_id = id,
                queue_depth = self.metrics.get_queue_depth(),
                reason = %reason,
                "Task rejected by backpressure"
            );
            completer.complete(Err(anyhow::anyhow!(
                "background pool '{}' rejected task: {reason}",
                self.name
            )));
            return handle;
        }

        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            completer.complete(Err(anyhow::anyhow!(
                "background pool '{}' is shut down",
                self.name
            )));
            return handle;
        };

        self.metrics.record_dispatch();
        let job = Job {
            id,
            task: Box::new(task),
            completer,
        };
        if let Err(SendError(job)) = sender.send(job) {
            self.metrics.record_completion();
            error!(
                pool_name = %self.name,
                task_id = id,
                "Worker pool channel disconnected"
            );
            job.completer.complete(Err(anyhow::anyhow!(
                "background pool '{}' workers are not responding",
                self.name
            )));
        } else {
            debug!(pool_name = %self.name, task_id = id, "Task submitted");
        }
        handle
    }

    fn admit(&self) -> Result<(), &'static str> {
        let bound = self.config.queue_bound;
        if self.metrics.get_queue_depth() < bound {
            return Ok(());
        }
        match self.config.backpressure_mode {
            BackpressureMode::Shed => Err("queue full"),
            BackpressureMode::Block => {
                let deadline =
                    Instant::now() + Duration::from_millis(self.config.backpressure_timeout_ms);
                while self.metrics.get_queue_depth() >= bound {
                    if Instant::now() >= deadline {
                        return Err("queue full after backpressure timeout");
                    }
                    may::coroutine::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
        }
    }

    /// Stop accepting tasks. Workers drain the queue and exit.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            info!(
                pool_name = %self.name,
                pending = self.metrics.get_queue_depth(),
                "Worker pool shutting down"
            );
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn worker_loop(
    pool_name: &str,
    worker_id: usize,
    rx: &mpsc::Receiver<Job>,
    metrics: &WorkerPoolMetrics,
) {
    debug!(pool_name = %pool_name, worker_id = worker_id, "Worker coroutine started");

    while let Ok(job) = rx.recv() {
        let Job {
            id,
            task,
            completer,
        } = job;
        debug!(pool_name = %pool_name, worker_id = worker_id, task_id = id, "Worker running task");

        let result = match catch_unwind(AssertUnwindSafe(task)) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(
                    pool_name = %pool_name,
                    worker_id = worker_id,
                    task_id = id,
                    panic_message = %message,
                    "Background task panicked"
                );
                Err(anyhow::anyhow!("background task panicked: {message}"))
            }
        };

        metrics.record_completion();
        completer.complete(result);
    }

    debug!(pool_name = %pool_name, worker_id = worker_id, "Worker coroutine exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_metrics() {
        let metrics = WorkerPoolMetrics::new();

        assert_eq!(metrics.get_shed_count(), 0);
        assert_eq!(metrics.get_queue_depth(), 0);

        metrics.record_dispatch();
        assert_eq!(metrics.get_dispatched_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 1);

        metrics.record_completion();
        assert_eq!(metrics.get_completed_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 0);

        metrics.record_shed();
        assert_eq!(metrics.get_shed_count(), 1);
    }

    #[test]
    fn test_callback_after_completion_runs_on_caller() {
        let (handle, completer) = TaskHandle::pair(1);
        completer.complete(Ok(HandlerResponse::ok()));
        assert!(handle.is_complete());
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        handle.on_complete(move |r| *sink.lock() = Some(r.map(|resp| resp.status.as_u16()).ok()));
        assert_eq!(*seen.lock(), Some(Some(200)));
    }

    #[test]
    fn test_callback_before_completion_fires_once() {
        let (handle, completer) = TaskHandle::pair(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        completer.complete(Err(anyhow::anyhow!("failed")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
