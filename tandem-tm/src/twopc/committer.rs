//! Phase 2 commit logic.

use std::sync::Arc;

use tandem_core::{Result, XaError, XaErrorCode, XaResource, Xid};

use crate::branch::BranchState;
use crate::transaction::Transaction;

use super::executor::{Executor, Job, JobResult};
use super::{run_phase, PhaseFailure};

/// Commits every participant in ascending two-phase order and returns the
/// branches that diverged from the commit decision.
///
/// A heuristic commit matches the global decision: the branch is forgotten
/// and treated as success. Any other XA error is recorded; non-heuristic
/// errors are recorded as hazards since previously committed branches are
/// already durable.
pub(crate) async fn commit_phase(
    tx: &Transaction,
    executor: Executor,
    participants: &[Arc<BranchState>],
    one_phase: bool,
) -> Result<Vec<PhaseFailure>> {
    let batches = tx.branch_batches(true);
    let reports = run_phase(executor, tx.deadline(), "commit", batches, |branch| {
        if !participants
            .iter()
            .any(|participant| Arc::ptr_eq(participant, branch))
        {
            return Ok(None);
        }
        let resource = Arc::clone(branch.xa_resource());
        let xid = branch.xid()?.clone();
        let unique_name = branch.unique_name().to_string();
        Ok(Some(Job::new(Arc::clone(branch), async move {
            commit_branch(resource, xid, one_phase, unique_name).await
        })))
    })
    .await?;

    Ok(reports
        .into_iter()
        .filter_map(|report| match report.result {
            Ok(_) => None,
            Err(error) => Some(PhaseFailure {
                branch: report.branch,
                error,
            }),
        })
        .collect())
}

async fn commit_branch(
    resource: Arc<dyn XaResource>,
    xid: Xid,
    one_phase: bool,
    unique_name: String,
) -> JobResult {
    tracing::debug!(%xid, one_phase, resource = %unique_name, "committing branch");
    match resource.commit(&xid, one_phase).await {
        Ok(()) => Ok(None),
        Err(error) => match error.code() {
            XaErrorCode::HeuristicCommit => {
                // heuristic decision compatible with the global commit decision
                tracing::debug!(resource = %unique_name, "handling heuristic commit");
                if let Err(forget_error) = resource.forget(&xid).await {
                    tracing::error!(
                        resource = %unique_name,
                        error = %forget_error,
                        "cannot forget heuristically committed branch"
                    );
                }
                Ok(None)
            }
            code if code.is_heuristic() => {
                tracing::error!(
                    resource = %unique_name,
                    %code,
                    "heuristic outcome incompatible with the global state of this transaction"
                );
                Err(error)
            }
            code => Err(XaError::new(
                XaErrorCode::HeuristicHazard,
                format!("resource {unique_name} reported {code} when asked to commit its transaction branch"),
            )),
        },
    }
}
