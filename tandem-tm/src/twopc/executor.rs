//! Job dispatch for the two-phase engine.
//!
//! Jobs of one batch are independent per branch. The parallel backend spawns
//! all but one job and runs the last on the calling task, so a single-branch
//! batch never leaves the caller. Completion is polled with a short tick so
//! the transaction timeout is honored even when an underlying XA call hangs;
//! jobs still outstanding at the deadline are abandoned, not cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tandem_core::xa::PrepareVote;
use tandem_core::{Result, TransactionError, XaError};

use crate::branch::BranchState;
use crate::config::Configuration;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one branch job: an optional prepare vote on success, the XA
/// error otherwise.
pub(crate) type JobResult = std::result::Result<Option<PrepareVote>, XaError>;

type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

/// One unit of work against one branch.
pub(crate) struct Job {
    pub branch: Arc<BranchState>,
    pub work: JobFuture,
}

impl Job {
    pub(crate) fn new(
        branch: Arc<BranchState>,
        work: impl Future<Output = JobResult> + Send + 'static,
    ) -> Self {
        Self {
            branch,
            work: Box::pin(work),
        }
    }
}

/// Per-branch result of a batch.
#[derive(Debug)]
pub(crate) struct JobReport {
    pub branch: Arc<BranchState>,
    pub result: JobResult,
}

/// Two-phase job dispatch backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// Spawn jobs onto the runtime; used when `asynchronous_two_pc` is set.
    Parallel,
    /// Run jobs sequentially on the calling task; deterministic, used by
    /// default and in tests.
    InCaller,
}

impl Executor {
    /// Selects the backend configured by `asynchronous_two_pc`.
    pub fn from_config(config: &Configuration) -> Self {
        if config.asynchronous_two_pc() {
            Executor::Parallel
        } else {
            Executor::InCaller
        }
    }

    /// Runs one batch of jobs, returning a report per job in input order.
    ///
    /// Fails with a timeout error when `deadline` passes while jobs are
    /// still outstanding, and with a system error when the runtime refuses
    /// or loses a job.
    pub(crate) async fn execute_batch(
        self,
        deadline: Instant,
        phase: &str,
        jobs: Vec<Job>,
    ) -> Result<Vec<JobReport>> {
        match self {
            Executor::InCaller => Self::execute_in_caller(deadline, phase, jobs).await,
            Executor::Parallel => Self::execute_parallel(deadline, phase, jobs).await,
        }
    }

    async fn execute_in_caller(
        deadline: Instant,
        phase: &str,
        jobs: Vec<Job>,
    ) -> Result<Vec<JobReport>> {
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            if Instant::now() >= deadline {
                return Err(TransactionError::Timeout(format!(
                    "transaction timed out during {phase} on {}",
                    job.branch
                )));
            }
            let result = job.work.await;
            reports.push(JobReport {
                branch: job.branch,
                result,
            });
        }
        Ok(reports)
    }

    async fn execute_parallel(
        deadline: Instant,
        phase: &str,
        jobs: Vec<Job>,
    ) -> Result<Vec<JobReport>> {
        let total = jobs.len();
        let mut slots: Vec<Option<JobReport>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);

        let mut handles = Vec::new();
        let mut inline = None;
        for (index, job) in jobs.into_iter().enumerate() {
            if index + 1 == total {
                inline = Some((index, job));
            } else {
                handles.push((index, job.branch, tokio::spawn(job.work)));
            }
        }

        // one branch always executes on the calling task
        if let Some((index, job)) = inline {
            let result = job.work.await;
            slots[index] = Some(JobReport {
                branch: job.branch,
                result,
            });
        }

        for (index, branch, mut handle) in handles {
            let result = loop {
                match tokio::time::timeout(POLL_INTERVAL, &mut handle).await {
                    Ok(Ok(result)) => break result,
                    Ok(Err(join_error)) => {
                        return Err(TransactionError::System(format!(
                            "two-phase {phase} job for {branch} was lost: {join_error}"
                        )));
                    }
                    Err(_elapsed) => {
                        if Instant::now() >= deadline {
                            return Err(TransactionError::Timeout(format!(
                                "transaction timed out during {phase} on {branch}"
                            )));
                        }
                    }
                }
            };
            slots[index] = Some(JobReport { branch, result });
        }

        Ok(slots.into_iter().map(|slot| slot.expect("job slot filled")).collect())
    }
}
