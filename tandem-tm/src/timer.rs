//! Timed task scheduling.
//!
//! A single worker task owns a time-ordered heap of scheduled tasks, sleeps
//! until the next one is due, executes it and loops. Task errors are caught
//! and logged; a task must never block the worker for long, so long-running
//! work (background recovery) is dispatched onto its own task and only
//! triggered from here.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use tandem_core::Result;

use crate::transaction::Transaction;

/// A unit of timed work.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &str;

    /// Runs the task. Errors are logged by the scheduler, never surfaced.
    async fn execute(&self) -> Result<()>;
}

/// Cancellation handle returned by [`TaskScheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct QueuedTask {
    due: Instant,
    id: u64,
    task: Arc<dyn ScheduledTask>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed so the earliest due task sits on top of the max-heap
        other.due.cmp(&self.due).then(other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct SchedulerShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    cancelled: Mutex<HashSet<u64>>,
    notify: Notify,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// Single-worker timed task runner.
#[derive(Default)]
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Creates a scheduler; the worker task starts lazily on the first
    /// schedule call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run at `due`.
    pub fn schedule(&self, task: Arc<dyn ScheduledTask>, due: Instant) -> TaskHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = task.name(), id, "scheduling task");
        self.shared
            .queue
            .lock()
            .expect("task queue poisoned")
            .push(QueuedTask { due, id, task });
        self.ensure_worker();
        self.shared.notify.notify_one();
        TaskHandle(id)
    }

    /// Cancels a scheduled task; already-executed or unknown handles are
    /// ignored.
    pub fn cancel(&self, handle: TaskHandle) {
        self.shared
            .cancelled
            .lock()
            .expect("cancelled set poisoned")
            .insert(handle.0);
        self.shared.notify.notify_one();
    }

    /// Number of tasks currently queued.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().expect("task queue poisoned").len()
    }

    /// Stops the worker, waiting up to `grace` for it to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let worker = self.worker.lock().expect("scheduler worker poisoned").take();
        if let Some(handle) = worker {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("task scheduler did not stop within the grace period");
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().expect("scheduler worker poisoned");
        let running = worker.as_ref().map(|w| !w.is_finished()).unwrap_or(false);
        if !running && !self.shared.shutdown.load(Ordering::SeqCst) {
            let shared = Arc::clone(&self.shared);
            *worker = Some(tokio::spawn(run_loop(shared)));
        }
    }
}

async fn run_loop(shared: Arc<SchedulerShared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let next_due = shared
            .queue
            .lock()
            .expect("task queue poisoned")
            .peek()
            .map(|queued| queued.due);

        match next_due {
            None => shared.notify.notified().await,
            Some(due) if due <= Instant::now() => {
                let popped = shared.queue.lock().expect("task queue poisoned").pop();
                let Some(queued) = popped else { continue };
                let was_cancelled = shared
                    .cancelled
                    .lock()
                    .expect("cancelled set poisoned")
                    .remove(&queued.id);
                if was_cancelled {
                    tracing::debug!(task = queued.task.name(), "skipping cancelled task");
                    continue;
                }
                tracing::debug!(task = queued.task.name(), "executing task");
                if let Err(error) = queued.task.execute().await {
                    tracing::warn!(task = queued.task.name(), %error, "scheduled task failed");
                }
            }
            Some(due) => {
                tokio::select! {
                    _ = sleep_until(due) => {}
                    _ = shared.notify.notified() => {}
                }
            }
        }
    }
    tracing::debug!("task scheduler worker stopped");
}

// ============================================================================
// Coordinator tasks
// ============================================================================

/// Marks its transaction rollback-only when the deadline fires.
pub struct TransactionTimeoutTask {
    transaction: std::sync::Weak<Transaction>,
}

impl TransactionTimeoutTask {
    /// Creates the timeout task for `transaction`.
    pub fn new(transaction: &Arc<Transaction>) -> Self {
        Self {
            transaction: Arc::downgrade(transaction),
        }
    }
}

#[async_trait]
impl ScheduledTask for TransactionTimeoutTask {
    fn name(&self) -> &str {
        "transaction timeout"
    }

    async fn execute(&self) -> Result<()> {
        let Some(transaction) = self.transaction.upgrade() else {
            return Ok(());
        };
        match transaction.set_rollback_only() {
            Ok(()) => {
                tracing::warn!(gtrid = %transaction.gtrid(), "transaction timed out, marked rollback-only");
            }
            Err(_) => {
                // already completing or completed, nothing to do
                tracing::debug!(gtrid = %transaction.gtrid(), "timeout fired on a completing transaction");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTask;

    #[async_trait]
    impl ScheduledTask for FailingTask {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self) -> Result<()> {
            Err(tandem_core::TransactionError::System("boom".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_at_due_time() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            Arc::new(CountingTask { runs: Arc::clone(&runs) }),
            Instant::now() + Duration::from_secs(5),
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_in_due_order() {
        let scheduler = TaskScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            Arc::new(CountingTask { runs: Arc::clone(&second) }),
            Instant::now() + Duration::from_secs(10),
        );
        scheduler.schedule(
            Arc::new(CountingTask { runs: Arc::clone(&first) }),
            Instant::now() + Duration::from_secs(2),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(second.load(Ordering::SeqCst), 1);

        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(
            Arc::new(CountingTask { runs: Arc::clone(&runs) }),
            Instant::now() + Duration::from_secs(5),
        );
        scheduler.cancel(handle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        scheduler.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_does_not_stop_the_worker() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Arc::new(FailingTask), Instant::now() + Duration::from_secs(1));
        scheduler.schedule(
            Arc::new(CountingTask { runs: Arc::clone(&runs) }),
            Instant::now() + Duration::from_secs(2),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown(Duration::from_secs(5)).await;
    }
}
