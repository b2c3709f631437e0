//! XA branch protocol surface: flags, return codes and the resource
//! capability interface.
//!
//! The coordinator drives third-party resource managers exclusively through
//! the [`XaResource`] trait defined here. Error reporting follows the X/Open
//! XA error-code enumeration so the two-phase engine can classify outcomes
//! without downcasting driver-specific exceptions.

use std::fmt;

use async_trait::async_trait;

use crate::uid::Xid;

// ============================================================================
// XA Flags (from X/Open XA specification)
// ============================================================================

/// No flags set.
pub const TMNOFLAGS: i32 = 0x0000_0000;

/// Caller is joining an existing transaction branch.
pub const TMJOIN: i32 = 0x0020_0000;

/// Caller is resuming association with a suspended transaction branch.
pub const TMRESUME: i32 = 0x0800_0000;

/// Dissociate caller from the transaction branch - successful.
pub const TMSUCCESS: i32 = 0x0400_0000;

/// Dissociate caller from the transaction branch - failed.
pub const TMFAIL: i32 = 0x2000_0000;

/// Caller is suspending (not ending) its association with the branch.
pub const TMSUSPEND: i32 = 0x0200_0000;

/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;

/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;

/// Use the one-phase commit optimization.
pub const TMONEPHASE: i32 = 0x4000_0000;

// ============================================================================
// XA Error Codes
// ============================================================================

/// Error and heuristic codes reported by a resource manager.
///
/// These are the standard X/Open XA `errorCode` values. They enable the
/// two-phase engine and the recovery engine to react to specific branch
/// outcomes (heuristics, rollbacks, protocol violations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum XaErrorCode {
    /// The transaction branch may have been heuristically completed.
    HeuristicMixed = 5,
    /// The transaction branch was heuristically rolled back.
    HeuristicRollback = 6,
    /// The transaction branch was heuristically committed.
    HeuristicCommit = 7,
    /// The branch may have been committed or rolled back (hazard).
    HeuristicHazard = 8,
    /// Routine returned with no effect and may be reissued.
    Retry = 4,
    /// Rollback was caused by an unspecified reason.
    RollbackUnspecified = 100,
    /// Rollback was caused by a communication failure.
    RollbackCommunication = 101,
    /// A deadlock was detected.
    RollbackDeadlock = 102,
    /// A condition violating resource integrity was detected.
    RollbackIntegrity = 103,
    /// The resource manager rolled back for a reason not listed.
    RollbackOther = 104,
    /// A protocol error occurred in the resource manager.
    RollbackProtocol = 105,
    /// The transaction branch took too long.
    RollbackTimeout = 106,
    /// The transaction branch may be retried.
    RollbackTransient = 107,
    /// Asynchronous operation already outstanding.
    Async = -2,
    /// A resource manager error occurred.
    RmError = -3,
    /// The XID is not valid.
    NotA = -4,
    /// Invalid arguments were given.
    Invalid = -5,
    /// Routine invoked in an improper context.
    Protocol = -6,
    /// Resource manager unavailable.
    RmFailure = -7,
    /// The XID already exists.
    DuplicateId = -8,
    /// Resource manager doing work outside the global transaction.
    Outside = -9,
}

impl XaErrorCode {
    /// Creates an `XaErrorCode` from its numeric XA value.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            5 => Some(Self::HeuristicMixed),
            6 => Some(Self::HeuristicRollback),
            7 => Some(Self::HeuristicCommit),
            8 => Some(Self::HeuristicHazard),
            4 => Some(Self::Retry),
            100 => Some(Self::RollbackUnspecified),
            101 => Some(Self::RollbackCommunication),
            102 => Some(Self::RollbackDeadlock),
            103 => Some(Self::RollbackIntegrity),
            104 => Some(Self::RollbackOther),
            105 => Some(Self::RollbackProtocol),
            106 => Some(Self::RollbackTimeout),
            107 => Some(Self::RollbackTransient),
            -2 => Some(Self::Async),
            -3 => Some(Self::RmError),
            -4 => Some(Self::NotA),
            -5 => Some(Self::Invalid),
            -6 => Some(Self::Protocol),
            -7 => Some(Self::RmFailure),
            -8 => Some(Self::DuplicateId),
            -9 => Some(Self::Outside),
            _ => None,
        }
    }

    /// Returns the numeric XA value.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Returns `true` for the four heuristic-outcome codes.
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }

    /// Returns `true` for the `XA_RB*` family of rollback codes.
    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.value())
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HeuristicMixed => "XA_HEURMIX",
            Self::HeuristicRollback => "XA_HEURRB",
            Self::HeuristicCommit => "XA_HEURCOM",
            Self::HeuristicHazard => "XA_HEURHAZ",
            Self::Retry => "XA_RETRY",
            Self::RollbackUnspecified => "XA_RBROLLBACK",
            Self::RollbackCommunication => "XA_RBCOMMFAIL",
            Self::RollbackDeadlock => "XA_RBDEADLOCK",
            Self::RollbackIntegrity => "XA_RBINTEGRITY",
            Self::RollbackOther => "XA_RBOTHER",
            Self::RollbackProtocol => "XA_RBPROTO",
            Self::RollbackTimeout => "XA_RBTIMEOUT",
            Self::RollbackTransient => "XA_RBTRANSIENT",
            Self::Async => "XAER_ASYNC",
            Self::RmError => "XAER_RMERR",
            Self::NotA => "XAER_NOTA",
            Self::Invalid => "XAER_INVAL",
            Self::Protocol => "XAER_PROTO",
            Self::RmFailure => "XAER_RMFAIL",
            Self::DuplicateId => "XAER_DUPID",
            Self::Outside => "XAER_OUTSIDE",
        };
        f.write_str(name)
    }
}

/// An error reported by a resource manager during a branch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaError {
    code: XaErrorCode,
    message: String,
}

impl XaError {
    /// Creates a new XA error with the given code and context message.
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns the XA error code.
    pub fn code(&self) -> XaErrorCode {
        self.code
    }

    /// Returns the context message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for XaError {}

// ============================================================================
// XA Resource Interface
// ============================================================================

/// The vote a resource casts during phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The branch is prepared and can be committed (`XA_OK`).
    Ok,
    /// The branch was read-only and has already been completed
    /// (`XA_RDONLY`); it takes no part in phase 2.
    ReadOnly,
}

/// Capability interface of an XA-compliant resource manager branch.
///
/// Third-party resources implement this trait; the coordinator depends only
/// on it. All branch operations report failures as [`XaError`] carrying the
/// standard XA error code, which the two-phase engine classifies.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Starts work on behalf of a transaction branch.
    ///
    /// `flags` is one of [`TMNOFLAGS`], [`TMJOIN`] or [`TMRESUME`].
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// Ends work on behalf of a transaction branch.
    ///
    /// `flags` is one of [`TMSUCCESS`], [`TMFAIL`] or [`TMSUSPEND`].
    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// Prepares the branch for commit, returning its vote.
    async fn prepare(&self, xid: &Xid) -> Result<PrepareVote, XaError>;

    /// Commits the branch, optionally with the one-phase optimization.
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Rolls back the branch.
    async fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Forgets a heuristically completed branch.
    async fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// Obtains in-doubt branch identifiers.
    ///
    /// `flags` is any combination of [`TMSTARTRSCAN`], [`TMENDRSCAN`] and
    /// [`TMNOFLAGS`]. An empty vector ends a `TMNOFLAGS` scan loop.
    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError>;

    /// Sets the branch transaction timeout in seconds.
    async fn set_transaction_timeout(&self, seconds: u32) -> Result<(), XaError> {
        let _ = seconds;
        Ok(())
    }

    /// Determines whether this resource manager is the same as another.
    ///
    /// Used to decide whether a second branch on the same transaction may be
    /// started with [`TMJOIN`] instead of a fresh branch qualifier.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    /// Returns `true` when this resource only emulates XA (last-resource
    /// commit): its prepare is deferred until every true XA branch voted.
    fn emulates_xa(&self) -> bool {
        false
    }
}
