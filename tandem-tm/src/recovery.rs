//! Crash recovery.
//!
//! Recovery reconciles the in-doubt branches each resource reports against
//! the journal's dangling records: a branch whose gtrid has a COMMITTING
//! record naming the resource is committed forward, everything else is
//! presumed aborted and rolled back. Branches of transactions still in
//! flight in this process are left alone. Full recovery walks every
//! registered resource; incremental recovery, run when a pool (re)opens a
//! single resource, walks just that one and manages its failed flag.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tandem_core::xa::{TMENDRSCAN, TMNOFLAGS, TMSTARTRSCAN};
use tandem_core::{
    Result, TransactionError, Uid, UidGenerator, XaErrorCode, XaResource, Xid,
};

use crate::config::Configuration;
use crate::journal::{DanglingRecord, DiskJournal};
use crate::resource::{ResourceProducer, ResourceRegistry};
use crate::status::TxStatus;

/// Counters exposed after a recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    committed_count: usize,
    rolledback_count: usize,
    completion_error: Option<TransactionError>,
}

impl RecoveryResult {
    /// Number of in-doubt branches committed forward.
    pub fn committed_count(&self) -> usize {
        self.committed_count
    }

    /// Number of in-doubt branches presumed aborted and rolled back.
    pub fn rolledback_count(&self) -> usize {
        self.rolledback_count
    }

    /// First non-ignorable per-resource failure of the pass, if any.
    pub fn completion_error(&self) -> Option<&TransactionError> {
        self.completion_error.as_ref()
    }
}

/// What the transaction manager knows about live transactions at scan time.
#[derive(Debug, Clone, Default)]
pub struct InFlightSnapshot {
    gtrids: HashSet<Uid>,
    oldest_start_millis: Option<i64>,
}

impl InFlightSnapshot {
    /// Snapshot with no in-flight transaction.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the given gtrids and the start time of the oldest one.
    pub fn new(gtrids: HashSet<Uid>, oldest_start_millis: Option<i64>) -> Self {
        Self {
            gtrids,
            oldest_start_millis,
        }
    }
}

#[derive(Default)]
struct ReconcileState {
    committed: usize,
    rolledback: usize,
    commit_outcomes: HashMap<Uid, bool>,
    rollback_outcomes: HashMap<Uid, bool>,
    skipped: HashSet<Uid>,
    scanned_ok: HashSet<String>,
}

/// The recovery engine.
pub struct Recoverer {
    registry: Arc<ResourceRegistry>,
    journal: Arc<DiskJournal>,
    server_id: Vec<u8>,
    current_node_only: bool,
    running: AtomicBool,
    recovering_resources: Mutex<HashSet<String>>,
    last_result: Mutex<RecoveryResult>,
}

impl Recoverer {
    /// Creates the engine over the given registry and journal.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        journal: Arc<DiskJournal>,
        config: &Configuration,
    ) -> Self {
        Self {
            registry,
            journal,
            server_id: UidGenerator::new(config.server_id()).server_id().to_vec(),
            current_node_only: config.current_node_only_recovery(),
            running: AtomicBool::new(false),
            recovering_resources: Mutex::new(HashSet::new()),
            last_result: Mutex::new(RecoveryResult::default()),
        }
    }

    /// Counters of the most recent full pass.
    pub fn last_result(&self) -> RecoveryResult {
        self.last_result
            .lock()
            .expect("recovery result poisoned")
            .clone()
    }

    /// Runs a full recovery pass over every registered resource.
    ///
    /// Only one full pass runs at a time; a concurrent call returns an empty
    /// result immediately.
    pub async fn run(&self, in_flight: &InFlightSnapshot) -> RecoveryResult {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("recovery is already running, skipping this pass");
            return RecoveryResult::default();
        }
        let result = self.run_pass(in_flight).await;
        *self.last_result.lock().expect("recovery result poisoned") = result.clone();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Recovers a single resource, typically when its pool is (re)opened.
    ///
    /// On failure the producer is marked failed and stays registered; the
    /// pool retries through this path until it succeeds.
    pub async fn recover_resource(
        &self,
        producer: &Arc<dyn ResourceProducer>,
        in_flight: &InFlightSnapshot,
    ) -> Result<()> {
        let unique_name = producer.bean().unique_name().to_string();
        let dangling = self.journal.collect_dangling_records()?;
        let scan_start = now_millis();
        let mut state = ReconcileState::default();

        match self
            .reconcile_resource(producer, &dangling, in_flight, scan_start, &mut state)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    %unique_name,
                    committed = state.committed,
                    rolledback = state.rolledback,
                    "incremental recovery complete"
                );
                producer.set_failed(false);
                Ok(())
            }
            Err(error) => {
                tracing::error!(%unique_name, %error, "incremental recovery failed, marking resource as failed");
                producer.set_failed(true);
                Err(TransactionError::Recovery(format!(
                    "error recovering resource {unique_name}: {error}"
                )))
            }
        }
    }

    async fn run_pass(&self, in_flight: &InFlightSnapshot) -> RecoveryResult {
        let scan_start = now_millis();
        tracing::debug!("starting recovery pass");

        let dangling = match self.journal.collect_dangling_records() {
            Ok(dangling) => dangling,
            Err(error) => {
                tracing::error!(%error, "cannot collect dangling journal records");
                return RecoveryResult {
                    completion_error: Some(error),
                    ..RecoveryResult::default()
                };
            }
        };

        let mut state = ReconcileState::default();
        let mut completion_error = None;

        for producer in self.registry.snapshot() {
            let unique_name = producer.bean().unique_name().to_string();
            match self
                .reconcile_resource(&producer, &dangling, in_flight, scan_start, &mut state)
                .await
            {
                Ok(()) => {
                    if producer.is_failed() {
                        producer.set_failed(false);
                    }
                }
                Err(error) => {
                    tracing::error!(%unique_name, %error, "recovery failed on resource");
                    producer.set_failed(true);
                    if !producer.bean().ignore_recovery_failures() && completion_error.is_none()
                    {
                        completion_error = Some(TransactionError::Recovery(format!(
                            "error recovering resource {unique_name}: {error}"
                        )));
                    }
                }
            }
        }

        self.write_terminal_records(&dangling, in_flight, &state);

        let result = RecoveryResult {
            committed_count: state.committed,
            rolledback_count: state.rolledback,
            completion_error,
        };
        tracing::info!(
            committed = result.committed_count,
            rolledback = result.rolledback_count,
            "recovery pass complete"
        );
        result
    }

    async fn reconcile_resource(
        &self,
        producer: &Arc<dyn ResourceProducer>,
        dangling: &HashMap<Uid, DanglingRecord>,
        in_flight: &InFlightSnapshot,
        scan_start: i64,
        state: &mut ReconcileState,
    ) -> Result<()> {
        let unique_name = producer.bean().unique_name().to_string();
        if !self.begin_resource(&unique_name) {
            tracing::debug!(%unique_name, "resource is already being recovered");
            return Ok(());
        }

        let outcome = self
            .reconcile_resource_guarded(producer, &unique_name, dangling, in_flight, scan_start, state)
            .await;
        self.end_resource(&unique_name);
        outcome
    }

    async fn reconcile_resource_guarded(
        &self,
        producer: &Arc<dyn ResourceProducer>,
        unique_name: &str,
        dangling: &HashMap<Uid, DanglingRecord>,
        in_flight: &InFlightSnapshot,
        scan_start: i64,
        state: &mut ReconcileState,
    ) -> Result<()> {
        let resource = producer.start_recovery().await?;
        let scan = self.scan(&resource, unique_name).await;
        let outcome = match scan {
            Ok(xids) => {
                tracing::debug!(unique_name, count = xids.len(), "recovered in-doubt xid(s)");
                for xid in xids {
                    self.reconcile_branch(
                        &resource,
                        unique_name,
                        &xid,
                        dangling,
                        in_flight,
                        scan_start,
                        state,
                    )
                    .await;
                }
                state.scanned_ok.insert(unique_name.to_string());
                Ok(())
            }
            Err(error) => Err(error),
        };
        if let Err(error) = producer.end_recovery().await {
            tracing::warn!(unique_name, %error, "error ending recovery session");
        }
        outcome
    }

    /// Drives a full TMSTARTRSCAN / TMNOFLAGS* / TMENDRSCAN scan, filtering
    /// out foreign Xids.
    async fn scan(&self, resource: &Arc<dyn XaResource>, unique_name: &str) -> Result<Vec<Xid>> {
        let mut collected = Vec::new();
        let mut seen = HashSet::new();

        let mut count = self
            .scan_step(resource, unique_name, TMSTARTRSCAN, &mut collected, &mut seen)
            .await?;

        while count > 0 {
            match self
                .scan_step(resource, unique_name, TMNOFLAGS, &mut collected, &mut seen)
                .await
            {
                Ok(fresh) => count = fresh,
                Err(error) => {
                    tracing::debug!(unique_name, %error, "NOFLAGS recovery call failed");
                    break;
                }
            }
        }

        if let Err(error) = self
            .scan_step(resource, unique_name, TMENDRSCAN, &mut collected, &mut seen)
            .await
        {
            tracing::debug!(unique_name, %error, "ENDRSCAN recovery call failed");
        }

        Ok(collected)
    }

    async fn scan_step(
        &self,
        resource: &Arc<dyn XaResource>,
        unique_name: &str,
        flags: i32,
        collected: &mut Vec<Xid>,
        seen: &mut HashSet<Xid>,
    ) -> Result<usize> {
        let xids = resource.recover(flags).await.map_err(|error| {
            TransactionError::Recovery(format!(
                "cannot scan resource {unique_name} for in-doubt branches: {error}"
            ))
        })?;

        let mut fresh = 0;
        for xid in xids {
            if xid.format_id() != Xid::FORMAT_ID {
                tracing::debug!(unique_name, %xid, format_id = xid.format_id(), "skipping foreign XID");
                continue;
            }
            let Some(server_id) = xid.gtrid().extract_server_id() else {
                tracing::warn!(unique_name, %xid, "skipping XID with no embedded serverId, the journal may be corrupted");
                continue;
            };
            if self.current_node_only && server_id != self.server_id {
                tracing::info!(
                    unique_name,
                    %xid,
                    server_id = %String::from_utf8_lossy(server_id),
                    "skipping XID owned by another node"
                );
                continue;
            }
            if !seen.insert(xid.clone()) {
                tracing::debug!(unique_name, %xid, "already recovered XID, skipping it");
                continue;
            }
            collected.push(xid);
            fresh += 1;
        }
        Ok(fresh)
    }

    async fn reconcile_branch(
        &self,
        resource: &Arc<dyn XaResource>,
        unique_name: &str,
        xid: &Xid,
        dangling: &HashMap<Uid, DanglingRecord>,
        in_flight: &InFlightSnapshot,
        scan_start: i64,
        state: &mut ReconcileState,
    ) {
        let gtrid = xid.gtrid();

        // a branch of a transaction this process is still driving may be
        // finishing right now, leave it alone
        if in_flight.gtrids.contains(gtrid) {
            let timestamp = dangling
                .get(gtrid)
                .map(DanglingRecord::timestamp_ms)
                .or_else(|| gtrid.extract_timestamp())
                .unwrap_or(0);
            let newer_than_oldest = in_flight
                .oldest_start_millis
                .map(|oldest| timestamp >= oldest)
                .unwrap_or(false);
            if newer_than_oldest && timestamp < scan_start {
                tracing::debug!(unique_name, %xid, "skipping in-flight branch");
                state.skipped.insert(gtrid.clone());
                return;
            }
        }

        match dangling.get(gtrid) {
            Some(entry)
                if entry.status() == TxStatus::Committing
                    && entry.unique_names().contains(unique_name) =>
            {
                let success = commit_branch(resource, unique_name, xid).await;
                if success {
                    state.committed += 1;
                }
                state
                    .commit_outcomes
                    .entry(gtrid.clone())
                    .and_modify(|all_ok| *all_ok &= success)
                    .or_insert(success);
            }
            _ => {
                let success = rollback_branch(resource, unique_name, xid).await;
                if success {
                    state.rolledback += 1;
                }
                state
                    .rollback_outcomes
                    .entry(gtrid.clone())
                    .and_modify(|all_ok| *all_ok &= success)
                    .or_insert(success);
            }
        }
    }

    /// Writes terminal records for dangling transactions that finished:
    /// either every reported branch resolved, or no resource reported one
    /// and every resource named in the record was scanned.
    fn write_terminal_records(
        &self,
        dangling: &HashMap<Uid, DanglingRecord>,
        in_flight: &InFlightSnapshot,
        state: &ReconcileState,
    ) {
        for (gtrid, entry) in dangling.iter() {
            if state.skipped.contains(gtrid) || in_flight.gtrids.contains(gtrid) {
                continue;
            }
            if !entry
                .unique_names()
                .iter()
                .all(|name| state.scanned_ok.contains(name))
            {
                continue;
            }

            let (outcomes, terminal) = match entry.status() {
                TxStatus::Committing => (&state.commit_outcomes, TxStatus::Committed),
                TxStatus::RollingBack => (&state.rollback_outcomes, TxStatus::Rolledback),
                _ => continue,
            };
            if outcomes.get(gtrid).copied().unwrap_or(true) {
                if let Err(error) =
                    self.journal.log(terminal, gtrid, entry.unique_names())
                {
                    tracing::error!(%gtrid, %error, "cannot journal recovered transaction status");
                }
            }
        }
    }

    fn begin_resource(&self, unique_name: &str) -> bool {
        self.recovering_resources
            .lock()
            .expect("recovering set poisoned")
            .insert(unique_name.to_string())
    }

    fn end_resource(&self, unique_name: &str) {
        self.recovering_resources
            .lock()
            .expect("recovering set poisoned")
            .remove(unique_name);
    }
}

/// Commits one dangling branch; returns `true` when the branch is settled.
async fn commit_branch(resource: &Arc<dyn XaResource>, unique_name: &str, xid: &Xid) -> bool {
    let error = match resource.commit(xid, false).await {
        Ok(()) => return true,
        Err(error) => error,
    };
    match error.code() {
        XaErrorCode::NotA => {
            tracing::error!(
                unique_name, %xid, %error,
                "unable to commit in-doubt branch, error=XAER_NOTA. Forgotten heuristic?"
            );
            true
        }
        XaErrorCode::HeuristicCommit => {
            tracing::info!(
                unique_name, %xid,
                "heuristic decision compatible with the global state of this transaction"
            );
            forget_branch(resource, unique_name, xid).await;
            true
        }
        code if code.is_heuristic() => {
            tracing::error!(
                unique_name, %xid, %code,
                "heuristic decision incompatible with the global state of this transaction"
            );
            forget_branch(resource, unique_name, xid).await;
            false
        }
        code => {
            tracing::error!(unique_name, %xid, %code, "unable to commit in-doubt branch");
            false
        }
    }
}

/// Rolls one branch back under presumed abort; returns `true` when settled.
async fn rollback_branch(resource: &Arc<dyn XaResource>, unique_name: &str, xid: &Xid) -> bool {
    let error = match resource.rollback(xid).await {
        Ok(()) => return true,
        Err(error) => error,
    };
    match error.code() {
        XaErrorCode::NotA => {
            tracing::error!(
                unique_name, %xid, %error,
                "unable to rollback aborted in-doubt branch, error=XAER_NOTA. Forgotten heuristic?"
            );
            true
        }
        XaErrorCode::HeuristicRollback => {
            tracing::info!(
                unique_name, %xid,
                "heuristic decision compatible with the global state of this transaction"
            );
            forget_branch(resource, unique_name, xid).await;
            true
        }
        code if code.is_heuristic() => {
            tracing::error!(
                unique_name, %xid, %code,
                "heuristic decision incompatible with the global state of this transaction"
            );
            forget_branch(resource, unique_name, xid).await;
            false
        }
        code => {
            tracing::error!(unique_name, %xid, %code, "unable to rollback aborted in-doubt branch");
            false
        }
    }
}

async fn forget_branch(resource: &Arc<dyn XaResource>, unique_name: &str, xid: &Xid) {
    tracing::debug!(unique_name, %xid, "forgetting branch");
    if let Err(error) = resource.forget(xid).await {
        tracing::error!(unique_name, %xid, %error, "unable to forget branch");
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
