//! The per-transaction coordinator.
//!
//! A [`Transaction`] owns its branches and synchronizations, guards the
//! legal status transitions and drives the commit and rollback sequences:
//! end every active branch, run the two-phase engine, and bracket phase 2
//! with COMMITTING/COMMITTED (or ROLLING_BACK/ROLLEDBACK) journal records.
//! Any failure between the decision record and its terminal record leaves
//! the transaction UNKNOWN for the recovery engine to finish.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use tandem_core::scheduler::{PositionalScheduler, DEFAULT_POSITION};
use tandem_core::xa::{TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSUCCESS, TMSUSPEND};
use tandem_core::{Result, TransactionError, Uid, XaResource};

use crate::branch::BranchState;
use crate::manager::ServiceContext;
use crate::resource::ResourceBean;
use crate::status::TxStatus;
use crate::twopc;

/// Position at which interposed synchronizations run: strictly after
/// user-registered ones at the default position.
pub const INTERPOSED_SYNCHRONIZATION_POSITION: i32 = DEFAULT_POSITION + 1;

/// Completion callbacks invoked around the two-phase protocol.
pub trait Synchronization: Send + Sync {
    /// Invoked before branches are ended, while the transaction is still
    /// active.
    fn before_completion(&self);

    /// Invoked once the transaction reached a terminal status.
    fn after_completion(&self, status: TxStatus);
}

/// One distributed transaction.
pub struct Transaction {
    gtrid: Uid,
    services: Arc<ServiceContext>,
    status: Mutex<TxStatus>,
    branches: Mutex<PositionalScheduler<Arc<BranchState>>>,
    synchronizations: Mutex<PositionalScheduler<Arc<dyn Synchronization>>>,
    start_millis: i64,
    deadline: Mutex<Instant>,
}

impl Transaction {
    pub(crate) fn new(services: Arc<ServiceContext>) -> Self {
        let gtrid = services.uid_generator().generate_uid();
        let timeout = services.config().default_transaction_timeout();
        tracing::debug!(%gtrid, ?timeout, "creating new transaction");
        // the gtrid's embedded timestamp is the authoritative start time
        // recovery compares dangling records against
        let start_millis = gtrid.extract_timestamp().unwrap_or_else(now_millis);
        Self {
            gtrid,
            services,
            status: Mutex::new(TxStatus::Active),
            branches: Mutex::new(PositionalScheduler::new()),
            synchronizations: Mutex::new(PositionalScheduler::new()),
            start_millis,
            deadline: Mutex::new(Instant::now() + timeout),
        }
    }

    /// The global transaction id.
    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    /// The current status.
    pub fn status(&self) -> TxStatus {
        *self.status.lock().expect("transaction status poisoned")
    }

    /// Milliseconds since epoch at which this transaction began.
    pub fn start_millis(&self) -> i64 {
        self.start_millis
    }

    /// The absolute deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().expect("transaction deadline poisoned")
    }

    /// Returns `true` once the deadline has passed.
    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Replaces the timeout; only legal while the transaction is active.
    pub fn set_transaction_timeout(&self, timeout: Duration) -> Result<()> {
        if self.status() != TxStatus::Active {
            return Err(TransactionError::Protocol(format!(
                "cannot change the timeout of {self}"
            )));
        }
        *self.deadline.lock().expect("transaction deadline poisoned") =
            Instant::now() + timeout;
        Ok(())
    }

    /// Marks the transaction so the only possible outcome is rollback.
    pub fn set_rollback_only(&self) -> Result<()> {
        match self.status() {
            TxStatus::MarkedRollback => Ok(()),
            TxStatus::Active => self.set_status(TxStatus::MarkedRollback),
            status => Err(TransactionError::Protocol(format!(
                "cannot mark transaction rollback-only in status {status}"
            ))),
        }
    }

    pub(crate) fn set_status(&self, next: TxStatus) -> Result<()> {
        let mut status = self.status.lock().expect("transaction status poisoned");
        if !status.can_transition_to(next) {
            return Err(TransactionError::Protocol(format!(
                "cannot switch transaction {} from status {} to {}",
                self.gtrid, *status, next
            )));
        }
        tracing::debug!(gtrid = %self.gtrid, from = %*status, to = %next, "changing transaction status");
        *status = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // branch enlistment
    // ------------------------------------------------------------------

    /// Enlists a resource, starting a branch on it.
    ///
    /// A fresh Xid is assigned unless the resource's bean allows TMJOIN and
    /// a branch on the same resource manager already exists, in which case
    /// that branch's Xid is shared and the association joins it.
    pub async fn enlist(
        &self,
        resource: Arc<dyn XaResource>,
        bean: Arc<ResourceBean>,
    ) -> Result<Arc<BranchState>> {
        match self.status() {
            TxStatus::Active => {}
            TxStatus::MarkedRollback => {
                return Err(TransactionError::Rollback(
                    "transaction has been marked rollback-only".to_string(),
                ))
            }
            status => {
                return Err(TransactionError::Protocol(format!(
                    "cannot enlist a resource on a transaction in status {status}"
                )))
            }
        }

        if resource.emulates_xa() {
            let already_emulating = self
                .branches
                .lock()
                .expect("transaction branches poisoned")
                .iter()
                .any(|branch| branch.emulates_xa());
            if already_emulating {
                return Err(TransactionError::System(
                    "cannot enlist more than one non-XA resource in the same transaction"
                        .to_string(),
                ));
            }
        }

        let join_target = if bean.use_tm_join() {
            self.branches
                .lock()
                .expect("transaction branches poisoned")
                .iter()
                .find(|branch| branch.xa_resource().is_same_rm(resource.as_ref()))
                .cloned()
        } else {
            None
        };

        let (flags, xid) = match join_target {
            Some(existing) => (TMJOIN, existing.xid()?.clone()),
            None => (
                TMNOFLAGS,
                self.services.uid_generator().generate_xid(&self.gtrid),
            ),
        };

        let branch = Arc::new(BranchState::new(resource, Arc::clone(&bean)));
        branch.set_xid(xid)?;

        if bean.apply_transaction_timeout() {
            let remaining = self
                .deadline()
                .saturating_duration_since(Instant::now())
                .as_secs()
                .max(1) as u32;
            branch.xa_resource().set_transaction_timeout(remaining).await?;
        }

        branch.start(flags).await?;
        self.branches
            .lock()
            .expect("transaction branches poisoned")
            .add(Arc::clone(&branch), bean.two_pc_ordering_position());
        tracing::debug!(branch = %branch, gtrid = %self.gtrid, "enlisted branch");
        Ok(branch)
    }

    /// Ends one branch's association, with TMSUCCESS, TMFAIL or TMSUSPEND.
    pub async fn delist(&self, branch: &Arc<BranchState>, flags: i32) -> Result<()> {
        if !matches!(
            self.status(),
            TxStatus::Active | TxStatus::MarkedRollback
        ) {
            return Err(TransactionError::Protocol(format!(
                "cannot delist a resource on {self}"
            )));
        }
        branch.end(flags).await
    }

    /// Suspends every active branch; the transaction may later be resumed
    /// on any task.
    pub async fn suspend(&self) -> Result<()> {
        for branch in self.branch_snapshot() {
            if branch.is_started() && !branch.is_suspended() {
                branch.end(TMSUSPEND).await?;
            }
        }
        tracing::debug!(gtrid = %self.gtrid, "suspended transaction");
        Ok(())
    }

    /// Resumes every suspended branch.
    pub async fn resume(&self) -> Result<()> {
        for branch in self.branch_snapshot() {
            if branch.is_suspended() {
                branch.start(TMRESUME).await?;
            }
        }
        tracing::debug!(gtrid = %self.gtrid, "resumed transaction");
        Ok(())
    }

    /// Number of enlisted branches.
    pub fn branch_count(&self) -> usize {
        self.branches
            .lock()
            .expect("transaction branches poisoned")
            .len()
    }

    /// Branch batches grouped by two-phase position: ascending positions
    /// when `natural` is true (prepare, commit), descending otherwise
    /// (rollback).
    pub(crate) fn branch_batches(&self, natural: bool) -> Vec<Vec<Arc<BranchState>>> {
        let branches = self.branches.lock().expect("transaction branches poisoned");
        let positions = if natural {
            branches.natural_order_positions()
        } else {
            branches.reverse_order_positions()
        };
        positions
            .into_iter()
            .map(|position| {
                let mut values: Vec<_> = branches.values_at(position).to_vec();
                if !natural {
                    values.reverse();
                }
                values
            })
            .collect()
    }

    fn branch_snapshot(&self) -> Vec<Arc<BranchState>> {
        self.branches
            .lock()
            .expect("transaction branches poisoned")
            .iter()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // synchronizations
    // ------------------------------------------------------------------

    /// Registers a completion synchronization at the given position.
    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
        position: i32,
    ) -> Result<()> {
        match self.status() {
            TxStatus::Active => {}
            TxStatus::MarkedRollback => {
                return Err(TransactionError::Rollback(
                    "transaction has been marked rollback-only".to_string(),
                ))
            }
            status => {
                return Err(TransactionError::Protocol(format!(
                    "cannot register a synchronization on a transaction in status {status}"
                )))
            }
        }
        self.synchronizations
            .lock()
            .expect("transaction synchronizations poisoned")
            .add(synchronization, position);
        Ok(())
    }

    /// Registers a synchronization that runs strictly after user-registered
    /// ones at the default position.
    pub fn register_interposed_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        self.register_synchronization(synchronization, INTERPOSED_SYNCHRONIZATION_POSITION)
    }

    fn fire_before_completion(&self) {
        let synchronizations: Vec<_> = self
            .synchronizations
            .lock()
            .expect("transaction synchronizations poisoned")
            .iter()
            .cloned()
            .collect();
        for synchronization in synchronizations {
            synchronization.before_completion();
        }
    }

    fn fire_after_completion(&self, status: TxStatus) {
        let synchronizations: Vec<_> = self
            .synchronizations
            .lock()
            .expect("transaction synchronizations poisoned")
            .iter()
            .cloned()
            .collect();
        for synchronization in synchronizations {
            synchronization.after_completion(status);
        }
    }

    // ------------------------------------------------------------------
    // completion
    // ------------------------------------------------------------------

    /// Commits the transaction.
    ///
    /// A transaction marked rollback-only or past its deadline is rolled
    /// back instead and the corresponding error surfaced.
    pub async fn commit(&self) -> Result<()> {
        let status = self.status();
        if !matches!(status, TxStatus::Active | TxStatus::MarkedRollback) {
            return Err(TransactionError::Protocol(format!(
                "cannot commit transaction in status {status}"
            )));
        }

        if status == TxStatus::Active && !self.timed_out() {
            self.fire_before_completion();
        }

        if self.timed_out() {
            self.end_branches_quietly(TMFAIL).await;
            let _ = self.rollback_internal().await;
            return Err(TransactionError::Timeout(format!(
                "transaction timed out: {self}"
            )));
        }

        if self.status() == TxStatus::MarkedRollback {
            self.end_branches_quietly(TMFAIL).await;
            let _ = self.rollback_internal().await;
            return Err(TransactionError::Rollback(
                "transaction was marked rollback-only".to_string(),
            ));
        }

        if let Err(error) = self.end_branches(TMSUCCESS).await {
            self.end_branches_quietly(TMFAIL).await;
            let _ = self.rollback_internal().await;
            return Err(TransactionError::Rollback(format!(
                "a resource failed to end its branch: {error}"
            )));
        }

        let executor = self.services.executor();
        let warn_zero = self
            .services
            .config()
            .warn_about_zero_resource_transaction();
        let participants = match twopc::prepare(self, executor, warn_zero).await {
            Ok(participants) => participants,
            Err(error @ (TransactionError::Rollback(_) | TransactionError::Timeout(_))) => {
                let _ = self.rollback_internal().await;
                return Err(error);
            }
            Err(error) => {
                let _ = self.set_status(TxStatus::Unknown);
                self.fire_after_completion(TxStatus::Unknown);
                return Err(error);
            }
        };

        // one-phase optimization: the decision rests with the sole resource,
        // no decision record is needed
        let one_phase = self.branch_count() == 1;
        let journal = self.services.journal();

        if participants.is_empty() {
            self.set_status(TxStatus::Committing)?;
            self.set_status(TxStatus::Committed)?;
            tracing::debug!(gtrid = %self.gtrid, "phase 2 commit succeeded with no interested resource");
            self.fire_after_completion(TxStatus::Committed);
            return Ok(());
        }

        self.set_status(TxStatus::Committing)?;
        let names = participant_names(&participants);
        if !one_phase {
            if let Err(error) = journal.log(TxStatus::Committing, &self.gtrid, &names) {
                let _ = self.set_status(TxStatus::Unknown);
                self.fire_after_completion(TxStatus::Unknown);
                return Err(error);
            }
        }

        match twopc::commit_phase(self, executor, &participants, one_phase).await {
            Ok(failures) if failures.is_empty() => {
                if !one_phase {
                    if let Err(error) = journal.log(TxStatus::Committed, &self.gtrid, &names) {
                        let _ = self.set_status(TxStatus::Unknown);
                        self.fire_after_completion(TxStatus::Unknown);
                        return Err(error);
                    }
                }
                self.set_status(TxStatus::Committed)?;
                tracing::debug!(gtrid = %self.gtrid, "committed transaction");
                self.fire_after_completion(TxStatus::Committed);
                Ok(())
            }
            Ok(failures) => {
                // the commit decision stands; reconciliation stops at the
                // terminal record even though some branch diverged
                if !one_phase {
                    if let Err(error) = journal.log(TxStatus::Committed, &self.gtrid, &names) {
                        tracing::warn!(gtrid = %self.gtrid, %error, "cannot journal terminal status");
                    }
                }
                let _ = self.set_status(TxStatus::Unknown);
                let error = twopc::classify_commit_failures(
                    &format!("transaction failed during commit of {self}"),
                    &failures,
                    participants.len(),
                );
                self.fire_after_completion(TxStatus::Unknown);
                Err(error)
            }
            Err(error) => {
                let _ = self.set_status(TxStatus::Unknown);
                self.fire_after_completion(TxStatus::Unknown);
                Err(error)
            }
        }
    }

    /// Rolls the transaction back.
    pub async fn rollback(&self) -> Result<()> {
        let status = self.status();
        if !matches!(status, TxStatus::Active | TxStatus::MarkedRollback) {
            return Err(TransactionError::Protocol(format!(
                "cannot rollback transaction in status {status}"
            )));
        }
        self.end_branches_quietly(TMFAIL).await;
        self.rollback_internal().await
    }

    async fn rollback_internal(&self) -> Result<()> {
        let participating: Vec<_> = self
            .branch_snapshot()
            .into_iter()
            .filter(|branch| branch.is_started() || branch.is_ended())
            .collect();
        let names = participant_names(&participating);
        let journal = self.services.journal();

        self.set_status(TxStatus::RollingBack)?;
        if !participating.is_empty() {
            if let Err(error) = journal.log(TxStatus::RollingBack, &self.gtrid, &names) {
                let _ = self.set_status(TxStatus::Unknown);
                self.fire_after_completion(TxStatus::Unknown);
                return Err(error);
            }
        }

        match twopc::rollback_phase(self, self.services.executor()).await {
            Ok(failures) if failures.is_empty() => {
                if !participating.is_empty() {
                    if let Err(error) = journal.log(TxStatus::Rolledback, &self.gtrid, &names) {
                        let _ = self.set_status(TxStatus::Unknown);
                        self.fire_after_completion(TxStatus::Unknown);
                        return Err(error);
                    }
                }
                self.set_status(TxStatus::Rolledback)?;
                tracing::debug!(gtrid = %self.gtrid, "rolled back transaction");
                self.fire_after_completion(TxStatus::Rolledback);
                Ok(())
            }
            Ok(failures) => {
                if !participating.is_empty() {
                    if let Err(error) = journal.log(TxStatus::Rolledback, &self.gtrid, &names) {
                        tracing::warn!(gtrid = %self.gtrid, %error, "cannot journal terminal status");
                    }
                }
                let _ = self.set_status(TxStatus::Unknown);
                let error = twopc::classify_rollback_failures(
                    &format!("transaction failed during rollback of {self}"),
                    &failures,
                );
                self.fire_after_completion(TxStatus::Unknown);
                Err(error)
            }
            Err(error) => {
                let _ = self.set_status(TxStatus::Unknown);
                self.fire_after_completion(TxStatus::Unknown);
                Err(error)
            }
        }
    }

    async fn end_branches(&self, flags: i32) -> Result<()> {
        let mut failures = Vec::new();
        for branch in self.branch_snapshot() {
            if branch.is_started() {
                if let Err(error) = branch.end(flags).await {
                    tracing::error!(branch = %branch, %error, "error ending branch");
                    failures.push((branch.unique_name().to_string(), error.to_string()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::multi_system(
                "error ending branches",
                &failures,
            ))
        }
    }

    async fn end_branches_quietly(&self, flags: i32) {
        let _ = self.end_branches(flags).await;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a transaction with GTRID [{}], status={}, {} resource(s) enlisted",
            self.gtrid,
            self.status(),
            self.branch_count()
        )
    }
}

fn participant_names(participants: &[Arc<BranchState>]) -> BTreeSet<String> {
    participants
        .iter()
        .map(|branch| branch.unique_name().to_string())
        .collect()
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
