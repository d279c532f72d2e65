//! Retention sweep for finished jobs.
//!
//! Succeeded and Deleted jobs are purged once they are older than their
//! retention window. Failed jobs are kept until someone looks at them.

use hopper_core::{Clock, JobState, Result};
use hopper_db::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::time::{pause, to_chrono};

#[derive(Debug, Clone)]
pub struct RetentionOptions {
    pub succeeded: Duration,
    pub deleted: Duration,
    pub interval: Duration,
    pub batch_size: u32,
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            succeeded: Duration::from_secs(24 * 3600),
            deleted: Duration::from_secs(24 * 3600),
            interval: Duration::from_secs(300),
            batch_size: 1000,
        }
    }
}

pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    options: RetentionOptions,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, options: RetentionOptions) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    /// Purge expired jobs. Returns how many were removed.
    pub async fn sweep(&self) -> Result<u64> {
        let batch = self.options.batch_size.max(1);
        let now = self.clock.now();
        let mut purged = 0;

        for (state, keep) in [
            (JobState::Succeeded, self.options.succeeded),
            (JobState::Deleted, self.options.deleted),
        ] {
            let cutoff = now - to_chrono(keep);
            loop {
                let n = self.store.purge_finished(state, cutoff, batch).await?;
                purged += n;
                if n < u64::from(batch) {
                    break;
                }
            }
        }
        Ok(purged)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.options.interval, "Starting retention sweeper");
        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged finished jobs"),
                Err(e) => error!(error = %e, "Retention sweep failed"),
            }
            if pause(self.options.interval, &mut shutdown).await {
                break;
            }
        }
        info!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hopper_core::{Job, ManualClock, NewJob, Payload};
    use hopper_db::MemoryJobStore;

    fn finished(state: JobState, age_hours: i64) -> Job {
        let now = Utc::now();
        let mut job = Job::enqueued(NewJob::new(Payload::bare("x")), 0, now);
        job.state = state;
        job.finished_at = Some(now - chrono::Duration::hours(age_hours));
        job
    }

    #[tokio::test]
    async fn test_sweep_purges_only_expired_success_and_deleted() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keep = [
            finished(JobState::Succeeded, 1),
            finished(JobState::Failed, 100),
            finished(JobState::Deleted, 1),
        ];
        let drop = [
            finished(JobState::Succeeded, 30),
            finished(JobState::Succeeded, 48),
            finished(JobState::Deleted, 30),
        ];
        for job in keep.iter().chain(drop.iter()) {
            store.create(job).await.unwrap();
        }

        let sweeper = RetentionSweeper::new(
            store.clone(),
            clock,
            RetentionOptions {
                batch_size: 1,
                ..Default::default()
            },
        );
        assert_eq!(sweeper.sweep().await.unwrap(), 3);
        for job in &keep {
            assert!(store.get(job.id).await.is_ok());
        }
        for job in &drop {
            assert!(store.get(job.id).await.is_err());
        }
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }
}
