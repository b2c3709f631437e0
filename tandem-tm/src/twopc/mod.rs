//! Two-phase commit engine.
//!
//! The engine walks a transaction's branches position by position (natural
//! order for prepare and commit, reverse order for rollback), dispatches one
//! job per branch through the [`Executor`] and defers every branch failure
//! until the phase completes. Classification of the collected failures into
//! a heuristic-rollback or heuristic-mixed outcome is a pure function over
//! the XA error codes.

mod committer;
mod executor;
mod preparer;
mod rollbacker;

pub use executor::Executor;

pub(crate) use committer::commit_phase;
pub(crate) use preparer::prepare;
pub(crate) use rollbacker::rollback_phase;

use std::sync::Arc;

use tokio::time::Instant;

use tandem_core::{Result, TransactionError, XaError, XaErrorCode};

use crate::branch::BranchState;
use executor::{Job, JobReport};

/// One branch that diverged from the phase decision.
pub(crate) struct PhaseFailure {
    pub branch: Arc<BranchState>,
    pub error: XaError,
}

/// Runs `make_job` over every branch, one position batch at a time.
///
/// Returning `Ok(None)` from `make_job` skips the branch. Batches at a lower
/// position fully complete before any job of a higher position starts.
pub(crate) async fn run_phase<F>(
    executor: Executor,
    deadline: Instant,
    phase: &str,
    batches: Vec<Vec<Arc<BranchState>>>,
    mut make_job: F,
) -> Result<Vec<JobReport>>
where
    F: FnMut(&Arc<BranchState>) -> Result<Option<Job>>,
{
    let mut reports = Vec::new();
    for batch in batches {
        let mut jobs = Vec::new();
        for branch in batch.iter() {
            if let Some(job) = make_job(branch)? {
                jobs.push(job);
            }
        }
        if jobs.is_empty() {
            continue;
        }
        reports.extend(executor.execute_batch(deadline, phase, jobs).await?);
    }
    Ok(reports)
}

/// Classifies commit-phase failures per the vote/error aggregation rule:
/// every participant heuristically rolled back with no hazard observed is a
/// heuristic rollback, anything else is heuristic mixed.
pub(crate) fn classify_commit_failures(
    context: &str,
    failures: &[PhaseFailure],
    total_participants: usize,
) -> TransactionError {
    let hazard = failures
        .iter()
        .any(|failure| failure.error.code() == XaErrorCode::HeuristicHazard);
    let all_rolled_back = !failures.is_empty()
        && failures
            .iter()
            .all(|failure| failure.error.code() == XaErrorCode::HeuristicRollback);

    if !hazard && all_rolled_back && failures.len() == total_participants {
        TransactionError::HeuristicRollback(format!(
            "{context}: all resource(s) [{}] improperly unilaterally rolled back",
            failed_names(failures)
        ))
    } else {
        TransactionError::HeuristicMixed(format!(
            "{context}: resource(s) [{}] reported inconsistent or hazardous outcomes",
            failed_names_with_codes(failures)
        ))
    }
}

/// Classifies rollback-phase failures; any surviving failure means some
/// branch diverged from the rollback decision.
pub(crate) fn classify_rollback_failures(
    context: &str,
    failures: &[PhaseFailure],
) -> TransactionError {
    TransactionError::HeuristicMixed(format!(
        "{context}: resource(s) [{}] unilaterally diverged from the rollback decision",
        failed_names_with_codes(failures)
    ))
}

fn failed_names(failures: &[PhaseFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.branch.unique_name().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn failed_names_with_codes(failures: &[PhaseFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}({})", failure.branch.unique_name(), failure.error.code()))
        .collect::<Vec<_>>()
        .join(", ")
}
