//! Lease reaper.
//!
//! A worker that dies, hangs or overruns its execution timeout stops
//! renewing its lease. Once the lease runs out the reaper takes the job back:
//! re-enqueued while retries remain, failed otherwise. The lease id fence
//! makes this safe against a worker that is merely slow: whichever side
//! commits first wins and the other's transition is rejected.

use hopper_core::{Clock, Error, Job, JobState, Result};
use hopper_db::{JobStore, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::continuation::ContinuationGraph;
use crate::time::pause;

const REAP_BATCH: u32 = 500;

const LEASE_EXPIRED: &str = "lease expired before the job finished";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    continuations: ContinuationGraph,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        continuations: ContinuationGraph,
    ) -> Self {
        Self {
            store,
            clock,
            continuations,
        }
    }

    /// Reclaim every job whose lease has run out.
    pub async fn reap(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        loop {
            let now = self.clock.now();
            let expired = self.store.list_expired_leases(now, REAP_BATCH).await?;
            let batch = expired.len();

            for job in expired {
                let retry = job.can_retry();
                let cause = expiry_error(&job);
                let transition = if retry {
                    Transition::to(JobState::Enqueued, now)
                        .retry_count(job.retry_count + 1)
                        .error(cause)
                        .fenced(job.lease_id)
                } else {
                    Transition::to(JobState::Failed, now)
                        .error(cause)
                        .fenced(job.lease_id)
                };

                if !self
                    .store
                    .compare_and_transition(job.id, JobState::Leased, &transition)
                    .await?
                {
                    // The worker finished after all.
                    continue;
                }

                if retry {
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        leased_by = job.leased_by.as_deref().unwrap_or("-"),
                        retry_count = job.retry_count + 1,
                        "Lease expired, job re-enqueued"
                    );
                    report.requeued += 1;
                } else {
                    error!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = job.attempts,
                        "Lease expired with no retries left, job failed"
                    );
                    report.failed += 1;
                    if let Err(e) = self
                        .continuations
                        .on_parent_finished(job.id, JobState::Failed)
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "Failed to cancel continuations");
                    }
                }
            }

            if batch < REAP_BATCH as usize {
                return Ok(report);
            }
        }
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?interval, "Starting lease reaper");
        loop {
            if let Err(e) = self.reap().await {
                error!(error = %e, "Lease reaper pass failed");
            }
            if pause(interval, &mut shutdown).await {
                break;
            }
        }
        info!("Lease reaper stopped");
    }
}

/// A timeout the worker recorded during this lease stays in the message.
fn expiry_error(job: &Job) -> String {
    match job.last_error.as_deref() {
        Some(recorded) if Error::is_timeout_message(recorded) => {
            format!("{LEASE_EXPIRED}: {recorded}")
        }
        _ => LEASE_EXPIRED.to_string(),
    }
}
