//! Shared mock resources for coordinator integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use tandem_tm::{
    Configuration, ConfigurationBuilder, PrepareVote, ResourceBean, ResourceProducer,
    TransactionError, XaError, XaErrorCode, XaResource, Xid,
};

use tandem_core::xa::TMSTARTRSCAN;

/// Ordered record of every XA call across all mock resources of a test.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Index of the first event equal to `needle`; panics when absent.
pub fn event_index(log: &EventLog, needle: &str) -> usize {
    events(log)
        .iter()
        .position(|event| event == needle)
        .unwrap_or_else(|| panic!("event {needle:?} not found in {:?}", events(log)))
}

#[derive(Clone, Copy)]
enum PrepareOutcome {
    Vote(PrepareVote),
    Fail(XaErrorCode),
}

/// Scriptable in-memory XA resource.
pub struct MockXaResource {
    name: String,
    log: EventLog,
    in_doubt: Mutex<Vec<Xid>>,
    started: Mutex<Vec<(Xid, i32)>>,
    ended: Mutex<Vec<(Xid, i32)>>,
    prepared: Mutex<Vec<Xid>>,
    committed: Mutex<Vec<(Xid, bool)>>,
    rolled_back: Mutex<Vec<Xid>>,
    forgotten: Mutex<Vec<Xid>>,
    prepare_outcome: Mutex<PrepareOutcome>,
    commit_error: Mutex<Option<XaErrorCode>>,
    rollback_error: Mutex<Option<XaErrorCode>>,
    recover_failure: AtomicBool,
    hanging_commits: AtomicUsize,
    same_rm: AtomicBool,
    emulating: AtomicBool,
}

impl MockXaResource {
    pub fn new(name: &str, log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            in_doubt: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
            prepare_outcome: Mutex::new(PrepareOutcome::Vote(PrepareVote::Ok)),
            commit_error: Mutex::new(None),
            rollback_error: Mutex::new(None),
            recover_failure: AtomicBool::new(false),
            hanging_commits: AtomicUsize::new(0),
            same_rm: AtomicBool::new(false),
            emulating: AtomicBool::new(false),
        })
    }

    fn record(&self, operation: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{operation}:{}", self.name));
    }

    pub fn vote_read_only(&self) {
        *self.prepare_outcome.lock().unwrap() = PrepareOutcome::Vote(PrepareVote::ReadOnly);
    }

    pub fn fail_prepare(&self, code: XaErrorCode) {
        *self.prepare_outcome.lock().unwrap() = PrepareOutcome::Fail(code);
    }

    pub fn fail_commit(&self, code: XaErrorCode) {
        *self.commit_error.lock().unwrap() = Some(code);
    }

    pub fn fail_rollback(&self, code: XaErrorCode) {
        *self.rollback_error.lock().unwrap() = Some(code);
    }

    pub fn fail_recover(&self, fail: bool) {
        self.recover_failure.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` commit calls hang for a very long time.
    pub fn hang_commits(&self, count: usize) {
        self.hanging_commits.store(count, Ordering::SeqCst);
    }

    pub fn set_same_rm(&self, same: bool) {
        self.same_rm.store(same, Ordering::SeqCst);
    }

    pub fn set_emulating(&self, emulating: bool) {
        self.emulating.store(emulating, Ordering::SeqCst);
    }

    /// Seeds an in-doubt branch, as a crashed resource would report it.
    pub fn add_in_doubt_xid(&self, xid: Xid) {
        self.in_doubt.lock().unwrap().push(xid);
    }

    pub fn in_doubt_count(&self) -> usize {
        self.in_doubt.lock().unwrap().len()
    }

    pub fn started(&self) -> Vec<(Xid, i32)> {
        self.started.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<(Xid, i32)> {
        self.ended.lock().unwrap().clone()
    }

    pub fn prepared(&self) -> Vec<Xid> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<(Xid, bool)> {
        self.committed.lock().unwrap().clone()
    }

    pub fn rolled_back(&self) -> Vec<Xid> {
        self.rolled_back.lock().unwrap().clone()
    }

    pub fn forgotten(&self) -> Vec<Xid> {
        self.forgotten.lock().unwrap().clone()
    }

    fn settle(&self, xid: &Xid) {
        self.in_doubt.lock().unwrap().retain(|known| known != xid);
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.record("start");
        self.started.lock().unwrap().push((xid.clone(), flags));
        Ok(())
    }

    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.record("end");
        self.ended.lock().unwrap().push((xid.clone(), flags));
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<PrepareVote, XaError> {
        self.record("prepare");
        match *self.prepare_outcome.lock().unwrap() {
            PrepareOutcome::Vote(vote) => {
                if vote == PrepareVote::Ok {
                    self.prepared.lock().unwrap().push(xid.clone());
                    self.in_doubt.lock().unwrap().push(xid.clone());
                }
                Ok(vote)
            }
            PrepareOutcome::Fail(code) => Err(XaError::new(code, "scripted prepare failure")),
        }
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        if self.hanging_commits.load(Ordering::SeqCst) > 0 {
            self.hanging_commits.fetch_sub(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.record("commit");
        if let Some(code) = *self.commit_error.lock().unwrap() {
            return Err(XaError::new(code, "scripted commit failure"));
        }
        self.committed.lock().unwrap().push((xid.clone(), one_phase));
        self.settle(xid);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.record("rollback");
        if let Some(code) = *self.rollback_error.lock().unwrap() {
            return Err(XaError::new(code, "scripted rollback failure"));
        }
        self.rolled_back.lock().unwrap().push(xid.clone());
        self.settle(xid);
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.record("forget");
        self.forgotten.lock().unwrap().push(xid.clone());
        self.settle(xid);
        Ok(())
    }

    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError> {
        if self.recover_failure.load(Ordering::SeqCst) {
            return Err(XaError::new(XaErrorCode::RmFailure, "scripted recover failure"));
        }
        if flags & TMSTARTRSCAN != 0 {
            Ok(self.in_doubt.lock().unwrap().clone())
        } else {
            Ok(Vec::new())
        }
    }

    fn is_same_rm(&self, _other: &dyn XaResource) -> bool {
        self.same_rm.load(Ordering::SeqCst)
    }

    fn emulates_xa(&self) -> bool {
        self.emulating.load(Ordering::SeqCst)
    }
}

/// Producer handing its single mock resource to recovery scans.
pub struct MockProducer {
    bean: ResourceBean,
    resource: Arc<MockXaResource>,
    failed: AtomicBool,
    refuse_recovery: AtomicBool,
}

impl MockProducer {
    pub fn new(name: &str, resource: Arc<MockXaResource>) -> Arc<Self> {
        Self::with_bean(ResourceBean::new(name, "mock.XADataSource"), resource)
    }

    pub fn with_bean(bean: ResourceBean, resource: Arc<MockXaResource>) -> Arc<Self> {
        Arc::new(Self {
            bean,
            resource,
            failed: AtomicBool::new(false),
            refuse_recovery: AtomicBool::new(false),
        })
    }

    /// Simulates a pool that cannot hand out a recovery connection.
    pub fn refuse_recovery(&self, refuse: bool) {
        self.refuse_recovery.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceProducer for MockProducer {
    fn bean(&self) -> &ResourceBean {
        &self.bean
    }

    async fn start_recovery(&self) -> tandem_core::Result<Arc<dyn XaResource>> {
        if self.refuse_recovery.load(Ordering::SeqCst) {
            return Err(TransactionError::Recovery(
                "no connection available".to_string(),
            ));
        }
        Ok(Arc::clone(&self.resource) as Arc<dyn XaResource>)
    }

    async fn end_recovery(&self) -> tandem_core::Result<()> {
        Ok(())
    }

    fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Configuration builder preset for an isolated on-disk journal.
pub fn test_config(dir: &TempDir) -> ConfigurationBuilder {
    Configuration::builder()
        .server_id("test-node")
        .journal_files(
            dir.path().join("part1.tlog").display().to_string(),
            dir.path().join("part2.tlog").display().to_string(),
        )
        .max_log_size_mb(1)
        .background_recovery_interval_minutes(0)
}
