//! Tick-driven scheduler.
//!
//! Each tick promotes Scheduled jobs whose time has come and fires due
//! recurring definitions. A failed tick is logged and the next one starts
//! from whatever the store still holds, so nothing due is ever dropped.

use hopper_core::{Clock, OverlapPolicy, RecurringDefinition, Result};
use hopper_db::{JobStore, RecurringFire};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::time::pause;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    /// Rows promoted per store round trip. Also bounds recurring
    /// definitions fired per tick.
    pub batch_size: u32,
    /// `max_retries` for recurring instances whose definition sets none.
    pub default_max_retries: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 500,
            default_max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: u64,
    pub fired: u64,
    /// Recurring fires skipped because an earlier instance is still active.
    pub skipped: u64,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, options: SchedulerOptions) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport {
            promoted: self.promote().await?,
            ..Default::default()
        };

        let now = self.clock.now();
        let due = self
            .store
            .due_recurring(now, self.options.batch_size.max(1))
            .await?;
        for definition in due {
            match self.fire(&definition).await? {
                Fired::Enqueued => report.fired += 1,
                Fired::Skipped => report.skipped += 1,
                Fired::Raced => {}
            }
        }

        Ok(report)
    }

    async fn promote(&self) -> Result<u64> {
        let batch = self.options.batch_size.max(1);
        let mut promoted = 0;
        loop {
            let n = self.store.promote_due(self.clock.now(), batch).await?;
            promoted += n;
            if n < u64::from(batch) {
                break;
            }
        }
        if promoted > 0 {
            debug!(promoted, "Promoted scheduled jobs");
        }
        Ok(promoted)
    }

    async fn fire(&self, definition: &RecurringDefinition) -> Result<Fired> {
        let now = self.clock.now();

        // One fire per tick; the next one is computed from now so an outage
        // does not leave a backlog of missed fires.
        let next_fire_at = match definition.following_fire(now) {
            Ok(at) => at,
            Err(e) => {
                error!(recurring = %definition.name, error = %e, "Cannot compute next fire time");
                return Ok(Fired::Raced);
            }
        };

        let skip = definition.overlap == OverlapPolicy::Skip
            && self.store.has_active_instance(&definition.name).await?;
        let job = (!skip).then(|| definition.spawn(self.options.default_max_retries, now));
        let job_id = job.as_ref().map(|job| job.id);

        let fire = RecurringFire {
            name: definition.name.clone(),
            expected_next_fire_at: definition.next_fire_at,
            next_fire_at,
            fired_at: now,
            job,
        };
        if !self.store.fire_recurring(&fire).await? {
            debug!(recurring = %definition.name, "Recurring definition fired elsewhere");
            return Ok(Fired::Raced);
        }

        match job_id {
            Some(job_id) => {
                info!(
                    recurring = %definition.name,
                    job_id = %job_id,
                    next_fire_at = %next_fire_at,
                    "Fired recurring job"
                );
                Ok(Fired::Enqueued)
            }
            None => {
                info!(
                    recurring = %definition.name,
                    next_fire_at = %next_fire_at,
                    "Previous instance still active, skipping fire"
                );
                Ok(Fired::Skipped)
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.options.poll_interval, "Starting scheduler");
        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
            if pause(self.options.poll_interval, &mut shutdown).await {
                break;
            }
        }
        info!("Scheduler stopped");
    }
}

enum Fired {
    Enqueued,
    Skipped,
    /// Another scheduler got there first, or the definition is unusable.
    Raced,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hopper_core::{
        Job, JobQuery, JobState, ManualClock, NewJob, Payload, RecurringOptions,
    };
    use hopper_db::MemoryJobStore;

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap()
    }

    fn scheduler(store: Arc<MemoryJobStore>, clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::new(
            store,
            clock,
            SchedulerOptions {
                batch_size: 2,
                ..Default::default()
            },
        )
    }

    async fn recurring(store: &MemoryJobStore, overlap: OverlapPolicy) -> RecurringDefinition {
        let def = RecurringDefinition::new(
            "report",
            "* * * * *",
            Payload::bare("report"),
            RecurringOptions {
                overlap,
                ..Default::default()
            },
            t0(),
        )
        .unwrap();
        store.upsert_recurring(&def).await.unwrap();
        def
    }

    #[tokio::test]
    async fn test_promotes_due_jobs_across_batches() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        for secs in [10, 20, 30, 40, 50] {
            let job = Job::scheduled(
                NewJob::new(Payload::bare("later")),
                0,
                t0() + chrono::Duration::seconds(secs),
                t0(),
            );
            store.create(&job).await.unwrap();
        }

        clock.advance(chrono::Duration::seconds(45));
        let report = scheduler(store.clone(), clock).tick().await.unwrap();
        assert_eq!(report.promoted, 4);

        let page = store
            .query(&JobQuery::new().in_state(JobState::Scheduled))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_fires_once_per_due_tick() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(store.clone(), clock.clone());
        recurring(&store, OverlapPolicy::Allow).await;

        assert_eq!(scheduler.tick().await.unwrap(), TickReport::default());

        clock.advance(chrono::Duration::seconds(31));
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.fired, 1);

        let def = store.get_recurring("report").await.unwrap().unwrap();
        assert!(def.next_fire_at > clock.now());
        assert_eq!(def.last_fired_at, Some(clock.now()));
        let job = store.get(def.last_job_id.unwrap()).await.unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.recurring_name.as_deref(), Some("report"));

        // Same instant: nothing is due any more.
        assert_eq!(scheduler.tick().await.unwrap().fired, 0);
    }

    #[tokio::test]
    async fn test_outage_fires_once_and_moves_on() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(store.clone(), clock.clone());
        recurring(&store, OverlapPolicy::Allow).await;

        clock.advance(chrono::Duration::hours(5));
        assert_eq!(scheduler.tick().await.unwrap().fired, 1);
        assert_eq!(scheduler.tick().await.unwrap().fired, 0);
        assert_eq!(store.len().await, 1);

        let def = store.get_recurring("report").await.unwrap().unwrap();
        assert!(def.next_fire_at > clock.now());
        assert!(def.next_fire_at <= clock.now() + chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_skip_overlap_while_instance_active() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(store.clone(), clock.clone());
        recurring(&store, OverlapPolicy::Skip).await;

        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(scheduler.tick().await.unwrap().fired, 1);

        // First instance never ran; the second fire is skipped but the
        // schedule still advances.
        clock.advance(chrono::Duration::minutes(1));
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.fired, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.len().await, 1);
        let def = store.get_recurring("report").await.unwrap().unwrap();
        assert!(def.next_fire_at > clock.now());
    }

    #[tokio::test]
    async fn test_allow_overlap_fires_regardless() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = scheduler(store.clone(), clock.clone());
        recurring(&store, OverlapPolicy::Allow).await;

        for _ in 0..3 {
            clock.advance(chrono::Duration::minutes(1));
            assert_eq!(scheduler.tick().await.unwrap().fired, 1);
        }
        assert_eq!(store.len().await, 3);
    }
}
