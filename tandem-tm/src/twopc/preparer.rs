//! Phase 1 prepare logic.

use std::sync::Arc;

use tandem_core::xa::PrepareVote;
use tandem_core::{Result, TransactionError, XaError, XaErrorCode};

use crate::branch::BranchState;
use crate::status::TxStatus;
use crate::transaction::Transaction;

use super::executor::{Executor, Job};
use super::run_phase;

/// Executes phase 1 and returns the branches participating in phase 2.
///
/// A single enlisted branch short-circuits prepare entirely (the one-phase
/// optimization) and is returned as the sole participant; the committer is
/// expected to drive it with `commit(xid, one_phase = true)`. Branches
/// voting read-only are dropped from the participant set. A branch that only
/// emulates XA is prepared last, on the calling task, once every true XA
/// branch has voted.
pub(crate) async fn prepare(
    tx: &Transaction,
    executor: Executor,
    warn_about_zero_resource: bool,
) -> Result<Vec<Arc<BranchState>>> {
    if tx.timed_out() {
        return Err(TransactionError::Timeout(
            "transaction timed out before two-phase commit execution".to_string(),
        ));
    }
    tx.set_status(TxStatus::Preparing)?;

    let batches = tx.branch_batches(true);
    let total: usize = batches.iter().map(Vec::len).sum();

    if total == 0 {
        if warn_about_zero_resource {
            tracing::warn!(gtrid = %tx.gtrid(), "executing transaction with 0 enlisted resource");
        } else {
            tracing::debug!(gtrid = %tx.gtrid(), "0 resource enlisted, no prepare needed");
        }
        tx.set_status(TxStatus::Prepared)?;
        return Ok(Vec::new());
    }

    if total == 1 {
        let sole = batches
            .into_iter()
            .flatten()
            .next()
            .expect("one branch present");
        tracing::debug!(branch = %sole, "1 resource enlisted, no prepare needed (1PC)");
        tx.set_status(TxStatus::Prepared)?;
        return Ok(vec![sole]);
    }

    tracing::debug!(count = total, "resource(s) enlisted, preparing");
    let mut emulating: Option<Arc<BranchState>> = None;
    let reports = run_phase(executor, tx.deadline(), "prepare", batches, |branch| {
        if branch.emulates_xa() {
            tracing::debug!(branch = %branch, "keeping emulating resource for later");
            emulating = Some(Arc::clone(branch));
            return Ok(None);
        }
        let resource = Arc::clone(branch.xa_resource());
        let xid = branch.xid()?.clone();
        Ok(Some(Job::new(Arc::clone(branch), async move {
            resource.prepare(&xid).await.map(Some)
        })))
    })
    .await?;

    let mut participants = Vec::new();
    for report in reports {
        match report.result {
            Ok(Some(PrepareVote::Ok)) | Ok(None) => participants.push(report.branch),
            Ok(Some(PrepareVote::ReadOnly)) => {
                tracing::debug!(branch = %report.branch, "read-only branch takes no part in phase 2");
            }
            Err(error) => return Err(prepare_failure(&report.branch, &error)),
        }
    }

    // last-resource commit: the emulating branch casts the deciding vote
    // once every true XA branch has voted
    if let Some(branch) = emulating {
        tracing::debug!(branch = %branch, "preparing emulating resource");
        match branch.xa_resource().prepare(branch.xid()?).await {
            Ok(PrepareVote::Ok) => participants.push(branch),
            Ok(PrepareVote::ReadOnly) => {
                tracing::debug!(branch = %branch, "emulating resource voted read-only");
            }
            Err(error) => return Err(prepare_failure(&branch, &error)),
        }
    }

    tx.set_status(TxStatus::Prepared)?;
    tracing::debug!(count = participants.len(), "successfully prepared resource(s)");
    Ok(participants)
}

fn prepare_failure(branch: &BranchState, error: &XaError) -> TransactionError {
    match error.code() {
        XaErrorCode::NotA => TransactionError::HeuristicMixed(format!(
            "resource {} unilaterally finished its transaction branch when asked to prepare, \
             global state of this transaction is now unknown",
            branch.unique_name()
        )),
        code => TransactionError::Rollback(format!(
            "transaction failed during prepare of {branch}, error={code}"
        )),
    }
}
