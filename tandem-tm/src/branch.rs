//! Per-(resource, transaction) branch state.
//!
//! A [`BranchState`] tracks one resource's participation in one transaction:
//! the assigned Xid and the started/ended/suspended association flags. Every
//! transition is state-checked; an illegal one fails with a protocol error
//! before any XA call is made.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tandem_core::xa::{TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSUCCESS, TMSUSPEND};
use tandem_core::{Result, TransactionError, XaResource, Xid};

use crate::resource::ResourceBean;

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    started: bool,
    ended: bool,
    suspended: bool,
}

/// State container binding an XA resource handle to a transaction branch.
pub struct BranchState {
    resource: Arc<dyn XaResource>,
    bean: Arc<ResourceBean>,
    xid: OnceLock<Xid>,
    flags: Mutex<Flags>,
}

impl BranchState {
    /// Creates a fresh, unassociated branch.
    pub fn new(resource: Arc<dyn XaResource>, bean: Arc<ResourceBean>) -> Self {
        Self {
            resource,
            bean,
            xid: OnceLock::new(),
            flags: Mutex::new(Flags::default()),
        }
    }

    /// Assigns the branch Xid. A branch is assigned exactly once.
    pub fn set_xid(&self, xid: Xid) -> Result<()> {
        tracing::debug!(xid = %xid, branch = %self, "assigning xid");
        self.xid
            .set(xid)
            .map_err(|_| TransactionError::Protocol(format!("an Xid has already been assigned to {self}")))
    }

    /// Returns the assigned Xid, or a protocol error when none was assigned
    /// yet.
    pub fn xid(&self) -> Result<&Xid> {
        self.xid
            .get()
            .ok_or_else(|| TransactionError::Protocol(format!("no Xid has been assigned to {self}")))
    }

    /// The underlying XA resource handle.
    pub fn xa_resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    /// The resource descriptor.
    pub fn bean(&self) -> &ResourceBean {
        &self.bean
    }

    /// The unique name stored in journal records for this branch.
    pub fn unique_name(&self) -> &str {
        self.bean.unique_name()
    }

    /// The position this branch prepares and commits at.
    pub fn two_pc_ordering_position(&self) -> i32 {
        self.bean.two_pc_ordering_position()
    }

    /// Whether the resource only emulates XA (last-resource commit).
    pub fn emulates_xa(&self) -> bool {
        self.resource.emulates_xa()
    }

    /// Returns `true` while the branch is associated with work.
    pub fn is_started(&self) -> bool {
        self.flags.lock().expect("branch flags poisoned").started
    }

    /// Returns `true` once the association ended.
    pub fn is_ended(&self) -> bool {
        self.flags.lock().expect("branch flags poisoned").ended
    }

    /// Returns `true` while the association is suspended.
    pub fn is_suspended(&self) -> bool {
        self.flags.lock().expect("branch flags poisoned").suspended
    }

    /// Associates the resource with the branch.
    ///
    /// `flags` is TMNOFLAGS or TMJOIN for a fresh association, TMRESUME to
    /// lift a suspension.
    pub async fn start(&self, flags: i32) -> Result<()> {
        let snapshot = *self.flags.lock().expect("branch flags poisoned");

        if snapshot.ended && flags == TMRESUME {
            tracing::debug!(branch = %self, "branch already ended, changing state to resumed");
            self.flags.lock().expect("branch flags poisoned").suspended = false;
            return Ok(());
        }

        if flags == TMRESUME {
            if !snapshot.suspended {
                return Err(TransactionError::Protocol(format!(
                    "resource hasn't been suspended, cannot resume it: {self}"
                )));
            }
            if !snapshot.started {
                return Err(TransactionError::Protocol(format!(
                    "resource hasn't been started, cannot resume it: {self}"
                )));
            }

            tracing::debug!(branch = %self, "resuming");
            self.resource.start(self.xid()?, TMRESUME).await?;
            self.flags.lock().expect("branch flags poisoned").suspended = false;
            return Ok(());
        }

        debug_assert!(flags == TMNOFLAGS || flags == TMJOIN);
        if snapshot.started {
            return Err(TransactionError::Protocol(format!(
                "resource already started: {self}"
            )));
        }

        tracing::debug!(branch = %self, flags, "starting");
        self.resource.start(self.xid()?, flags).await?;
        let mut state = self.flags.lock().expect("branch flags poisoned");
        state.started = true;
        state.ended = false;
        Ok(())
    }

    /// Dissociates the resource from the branch.
    ///
    /// `flags` is TMSUCCESS or TMFAIL for a terminal end, TMSUSPEND to
    /// suspend without ending.
    pub async fn end(&self, flags: i32) -> Result<()> {
        let snapshot = *self.flags.lock().expect("branch flags poisoned");

        if snapshot.ended && flags == TMSUSPEND {
            tracing::debug!(branch = %self, "branch already ended, changing state to suspended");
            self.flags.lock().expect("branch flags poisoned").suspended = true;
            return Ok(());
        }

        if snapshot.ended {
            return Err(TransactionError::Protocol(format!(
                "resource already ended: {self}"
            )));
        }

        if flags == TMSUSPEND {
            if !snapshot.started {
                return Err(TransactionError::Protocol(format!(
                    "resource hasn't been started, cannot suspend it: {self}"
                )));
            }
            if snapshot.suspended {
                return Err(TransactionError::Protocol(format!(
                    "resource already suspended: {self}"
                )));
            }

            tracing::debug!(branch = %self, "suspending");
            self.resource.end(self.xid()?, TMSUSPEND).await?;
            self.flags.lock().expect("branch flags poisoned").suspended = true;
            return Ok(());
        }

        debug_assert!(flags == TMSUCCESS || flags == TMFAIL);
        tracing::debug!(branch = %self, flags, "ending");
        self.resource.end(self.xid()?, flags).await?;
        let mut state = self.flags.lock().expect("branch flags poisoned");
        state.ended = true;
        state.started = false;
        state.suspended = false;
        Ok(())
    }
}

impl PartialEq for BranchState {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for BranchState {}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.flags.lock().expect("branch flags poisoned");
        write!(f, "a branch on {}", self.bean.unique_name())?;
        if state.started {
            write!(f, " (started)")?;
        }
        if state.ended {
            write!(f, " (ended)")?;
        }
        if state.suspended {
            write!(f, " (suspended)")?;
        }
        match self.xid.get() {
            Some(xid) => write!(f, " with XID {xid}"),
            None => write!(f, " with no XID"),
        }
    }
}

impl fmt::Debug for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_core::xa::PrepareVote;
    use tandem_core::{Uid, UidGenerator, XaError};

    #[derive(Default)]
    struct NullXaResource {
        starts: AtomicUsize,
        ends: AtomicUsize,
    }

    #[async_trait]
    impl XaResource for NullXaResource {
        async fn start(&self, _xid: &Xid, _flags: i32) -> std::result::Result<(), XaError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn end(&self, _xid: &Xid, _flags: i32) -> std::result::Result<(), XaError> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn prepare(&self, _xid: &Xid) -> std::result::Result<PrepareVote, XaError> {
            Ok(PrepareVote::Ok)
        }

        async fn commit(&self, _xid: &Xid, _one_phase: bool) -> std::result::Result<(), XaError> {
            Ok(())
        }

        async fn rollback(&self, _xid: &Xid) -> std::result::Result<(), XaError> {
            Ok(())
        }

        async fn forget(&self, _xid: &Xid) -> std::result::Result<(), XaError> {
            Ok(())
        }

        async fn recover(&self, _flags: i32) -> std::result::Result<Vec<Xid>, XaError> {
            Ok(Vec::new())
        }

        fn is_same_rm(&self, _other: &dyn XaResource) -> bool {
            false
        }
    }

    fn branch() -> BranchState {
        let branch = BranchState::new(
            Arc::new(NullXaResource::default()),
            Arc::new(ResourceBean::new("test-rm", "test.Driver")),
        );
        let generator = UidGenerator::new("test");
        let gtrid = generator.generate_uid();
        branch.set_xid(generator.generate_xid(&gtrid)).unwrap();
        branch
    }

    #[test]
    fn test_xid_assigned_exactly_once() {
        let branch = branch();
        let generator = UidGenerator::new("test");
        let other = generator.generate_xid(&Uid::new(vec![1; 16]));
        let err = branch.set_xid(other).unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_start_end_lifecycle() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        assert!(branch.is_started());
        assert!(!branch.is_ended());

        branch.end(TMSUCCESS).await.unwrap();
        assert!(!branch.is_started());
        assert!(branch.is_ended());
    }

    #[tokio::test]
    async fn test_double_start_is_protocol_error() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        let err = branch.start(TMNOFLAGS).await.unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_double_end_is_protocol_error() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        branch.end(TMFAIL).await.unwrap();
        let err = branch.end(TMFAIL).await.unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_suspend_resume() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();

        branch.end(TMSUSPEND).await.unwrap();
        assert!(branch.is_suspended());
        assert!(branch.is_started());

        branch.start(TMRESUME).await.unwrap();
        assert!(!branch.is_suspended());
        assert!(branch.is_started());

        branch.end(TMSUCCESS).await.unwrap();
        assert!(branch.is_ended());
    }

    #[tokio::test]
    async fn test_suspend_before_start_is_protocol_error() {
        let branch = branch();
        let err = branch.end(TMSUSPEND).await.unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_resume_without_suspension_is_protocol_error() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        let err = branch.start(TMRESUME).await.unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_double_suspend_is_protocol_error() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        branch.end(TMSUSPEND).await.unwrap();
        let err = branch.end(TMSUSPEND).await.unwrap_err();
        assert!(matches!(err, TransactionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_suspend_after_end_only_flips_flag() {
        let resource = Arc::new(NullXaResource::default());
        let branch = BranchState::new(
            Arc::clone(&resource) as Arc<dyn XaResource>,
            Arc::new(ResourceBean::new("test-rm", "test.Driver")),
        );
        let generator = UidGenerator::new("test");
        let gtrid = generator.generate_uid();
        branch.set_xid(generator.generate_xid(&gtrid)).unwrap();

        branch.start(TMNOFLAGS).await.unwrap();
        branch.end(TMSUCCESS).await.unwrap();

        // no further xa.end call is issued
        branch.end(TMSUSPEND).await.unwrap();
        assert!(branch.is_suspended());
        assert!(branch.is_ended());
        assert_eq!(resource.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_after_end_only_flips_flag() {
        let branch = branch();
        branch.start(TMNOFLAGS).await.unwrap();
        branch.end(TMSUCCESS).await.unwrap();
        branch.end(TMSUSPEND).await.unwrap();

        branch.start(TMRESUME).await.unwrap();
        assert!(!branch.is_suspended());
        assert!(branch.is_ended());
    }
}
