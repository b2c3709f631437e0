//! Transaction manager façade and the per-process service context.
//!
//! [`ServiceContext`] bundles the services every transaction needs (journal,
//! UID generator, resource registry, task scheduler, two-phase executor). It
//! is constructed once per process and passed through constructors; tests
//! build their own. [`TransactionManager`] drives transaction lifecycles,
//! tracks the in-flight set recovery consults, and owns startup, background
//! recovery scheduling and graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use tandem_core::{Result, TransactionError, Uid, UidGenerator};

use crate::config::Configuration;
use crate::journal::DiskJournal;
use crate::recovery::{InFlightSnapshot, Recoverer, RecoveryResult};
use crate::resource::{ResourceProducer, ResourceRegistry};
use crate::timer::{ScheduledTask, TaskHandle, TaskScheduler, TransactionTimeoutTask};
use crate::transaction::Transaction;
use crate::twopc::Executor;

/// The services one coordinator process shares across its transactions.
pub struct ServiceContext {
    config: Configuration,
    journal: Arc<DiskJournal>,
    uid_generator: Arc<UidGenerator>,
    registry: Arc<ResourceRegistry>,
    task_scheduler: Arc<TaskScheduler>,
    executor: Executor,
}

impl ServiceContext {
    /// Builds the context from a configuration.
    pub fn new(config: Configuration) -> Arc<Self> {
        let journal = Arc::new(DiskJournal::new(&config));
        let uid_generator = Arc::new(UidGenerator::new(config.server_id()));
        let executor = Executor::from_config(&config);
        Arc::new(Self {
            config,
            journal,
            uid_generator,
            registry: Arc::new(ResourceRegistry::new()),
            task_scheduler: Arc::new(TaskScheduler::new()),
            executor,
        })
    }

    /// The configuration this process runs with.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The decision journal.
    pub fn journal(&self) -> &Arc<DiskJournal> {
        &self.journal
    }

    /// The gtrid/bqual generator.
    pub fn uid_generator(&self) -> &Arc<UidGenerator> {
        &self.uid_generator
    }

    /// The process-wide resource registry.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// The timed task scheduler.
    pub fn task_scheduler(&self) -> &Arc<TaskScheduler> {
        &self.task_scheduler
    }

    /// The two-phase job dispatch backend.
    pub fn executor(&self) -> Executor {
        self.executor
    }
}

struct InFlightEntry {
    transaction: Arc<Transaction>,
    timeout_task: TaskHandle,
}

/// Transaction lifecycle façade.
pub struct TransactionManager {
    services: Arc<ServiceContext>,
    recoverer: Arc<Recoverer>,
    in_flight: Mutex<HashMap<Uid, InFlightEntry>>,
    shutting_down: AtomicBool,
    self_handle: Weak<TransactionManager>,
}

impl TransactionManager {
    /// Creates a manager over the given service context.
    pub fn new(services: Arc<ServiceContext>) -> Arc<Self> {
        let recoverer = Arc::new(Recoverer::new(
            Arc::clone(services.registry()),
            Arc::clone(services.journal()),
            services.config(),
        ));
        Arc::new_cyclic(|self_handle| Self {
            services,
            recoverer,
            in_flight: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            self_handle: self_handle.clone(),
        })
    }

    /// The service context this manager runs on.
    pub fn services(&self) -> &Arc<ServiceContext> {
        &self.services
    }

    /// The recovery engine.
    pub fn recoverer(&self) -> &Arc<Recoverer> {
        &self.recoverer
    }

    /// Opens the journal, runs startup recovery and schedules the periodic
    /// background recovery when configured.
    pub async fn start(&self) -> Result<()> {
        self.services.journal().open()?;
        let result = self.run_recovery().await;
        if let Some(error) = result.completion_error() {
            return Err(error.clone());
        }
        self.schedule_background_recovery(Instant::now());
        tracing::info!(
            server_id = self.services.config().server_id(),
            "transaction manager started"
        );
        Ok(())
    }

    /// Begins a new transaction and installs its timeout task.
    pub async fn begin(&self) -> Result<Arc<Transaction>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TransactionError::Protocol(
                "transaction manager is shutting down".to_string(),
            ));
        }
        let transaction = Arc::new(Transaction::new(Arc::clone(&self.services)));
        let timeout_task = self.services.task_scheduler().schedule(
            Arc::new(TransactionTimeoutTask::new(&transaction)),
            transaction.deadline(),
        );
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .insert(
                transaction.gtrid().clone(),
                InFlightEntry {
                    transaction: Arc::clone(&transaction),
                    timeout_task,
                },
            );
        tracing::debug!(gtrid = %transaction.gtrid(), "began transaction");
        Ok(transaction)
    }

    /// Commits `transaction` and retires it from the in-flight set.
    pub async fn commit(&self, transaction: &Arc<Transaction>) -> Result<()> {
        let outcome = transaction.commit().await;
        self.forget(transaction);
        outcome
    }

    /// Rolls `transaction` back and retires it from the in-flight set.
    pub async fn rollback(&self, transaction: &Arc<Transaction>) -> Result<()> {
        let outcome = transaction.rollback().await;
        self.forget(transaction);
        outcome
    }

    /// Suspends every branch of `transaction`; it may be resumed from any
    /// task.
    pub async fn suspend(&self, transaction: &Arc<Transaction>) -> Result<()> {
        transaction.suspend().await
    }

    /// Resumes a previously suspended transaction.
    pub async fn resume(&self, transaction: &Arc<Transaction>) -> Result<()> {
        transaction.resume().await
    }

    /// Number of transactions currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight map poisoned").len()
    }

    /// Snapshot of the in-flight set handed to the recovery engine.
    pub fn in_flight_snapshot(&self) -> InFlightSnapshot {
        let in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        let gtrids = in_flight.keys().cloned().collect();
        let oldest = in_flight
            .values()
            .map(|entry| entry.transaction.start_millis())
            .min();
        InFlightSnapshot::new(gtrids, oldest)
    }

    /// Runs a full recovery pass against the current in-flight snapshot.
    pub async fn run_recovery(&self) -> RecoveryResult {
        self.recoverer.run(&self.in_flight_snapshot()).await
    }

    /// Runs incremental recovery for one resource, as the pool's init and
    /// healing path.
    pub async fn recover_resource(&self, producer: &Arc<dyn ResourceProducer>) -> Result<()> {
        self.recoverer
            .recover_resource(producer, &self.in_flight_snapshot())
            .await
    }

    /// Waits for in-flight transactions to drain (bounded by the graceful
    /// shutdown interval), then stops the task scheduler and closes the
    /// journal.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let grace = self.services.config().graceful_shutdown_interval();
        let deadline = Instant::now() + grace;

        while self.in_flight_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.in_flight_count();
        if remaining > 0 {
            tracing::warn!(remaining, "shutting down with in-flight transactions");
        }

        self.services.task_scheduler().shutdown(grace).await;
        self.services.journal().close()?;
        tracing::info!("transaction manager shut down");
        Ok(())
    }

    fn forget(&self, transaction: &Arc<Transaction>) {
        let entry = self
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(transaction.gtrid());
        if let Some(entry) = entry {
            self.services.task_scheduler().cancel(entry.timeout_task);
        }
    }

    fn schedule_background_recovery(&self, reference: Instant) {
        let minutes = self.services.config().background_recovery_interval_minutes();
        if minutes == 0 {
            return;
        }
        let interval = Duration::from_secs(minutes * 60);
        self.services.task_scheduler().schedule(
            Arc::new(BackgroundRecoveryTask {
                manager: self.self_handle.clone(),
                interval,
            }),
            reference + interval,
        );
    }
}

/// Dispatches a full recovery pass onto its own task, then re-arms itself.
struct BackgroundRecoveryTask {
    manager: Weak<TransactionManager>,
    interval: Duration,
}

#[async_trait]
impl ScheduledTask for BackgroundRecoveryTask {
    fn name(&self) -> &str {
        "background recovery"
    }

    async fn execute(&self) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        manager.services().task_scheduler().schedule(
            Arc::new(BackgroundRecoveryTask {
                manager: self.manager.clone(),
                interval: self.interval,
            }),
            Instant::now() + self.interval,
        );
        // recovery may take a while, never block the timer worker on it
        tokio::spawn(async move {
            let result = manager.run_recovery().await;
            if let Some(error) = result.completion_error() {
                tracing::warn!(%error, "background recovery pass reported an error");
            }
        });
        Ok(())
    }
}
