//! Phase 2 rollback logic.

use std::sync::Arc;

use tandem_core::{Result, XaErrorCode, XaResource, Xid};

use crate::transaction::Transaction;

use super::executor::{Executor, Job, JobResult};
use super::{run_phase, PhaseFailure};

/// Rolls every branch back in descending two-phase order and returns the
/// branches that diverged from the rollback decision.
///
/// Branches that were never started are skipped silently. A heuristic
/// rollback matches the global decision: the branch is forgotten and treated
/// as success.
pub(crate) async fn rollback_phase(
    tx: &Transaction,
    executor: Executor,
) -> Result<Vec<PhaseFailure>> {
    let batches = tx.branch_batches(false);
    let reports = run_phase(executor, tx.deadline(), "rollback", batches, |branch| {
        if !branch.is_started() && !branch.is_ended() {
            tracing::debug!(branch = %branch, "skipping branch that never started");
            return Ok(None);
        }
        let resource = Arc::clone(branch.xa_resource());
        let xid = branch.xid()?.clone();
        let unique_name = branch.unique_name().to_string();
        Ok(Some(Job::new(Arc::clone(branch), async move {
            rollback_branch(resource, xid, unique_name).await
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

async fn rollback_branch(
    resource: Arc<dyn XaResource>,
    xid: Xid,
    unique_name: String,
) -> JobResult {
    tracing::debug!(%xid, resource = %unique_name, "rolling back branch");
    match resource.rollback(&xid).await {
        Ok(()) => Ok(None),
        Err(error) => match error.code() {
            XaErrorCode::HeuristicRollback => {
                // heuristic decision compatible with the global rollback decision
                tracing::debug!(resource = %unique_name, "handling heuristic rollback");
                if let Err(forget_error) = resource.forget(&xid).await {
                    tracing::error!(
                        resource = %unique_name,
                        error = %forget_error,
                        "cannot forget heuristically rolled back branch"
                    );
                }
                Ok(None)
            }
            code => {
                tracing::error!(
                    resource = %unique_name,
                    %code,
                    "branch diverged from the rollback decision"
                );
                Err(error)
            }
        },
    }
}
