//! Write API for callers: enqueue, schedule, continue, recurring, cancel.
//!
//! Transient store failures are retried here and never reach the caller.
//! Every job is created with its id already assigned, so a retried create
//! that finds its own row counts as success.

use chrono::{DateTime, Utc};
use hopper_core::{
    Clock, Error, Job, JobId, JobState, NewJob, Payload, RecurringDefinition, RecurringOptions,
    Result, RetryPolicy,
};
use hopper_db::{JobStore, Transition};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::continuation::ContinuationGraph;
use crate::time::to_chrono;

const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    continuations: ContinuationGraph,
    retry: RetryPolicy,
}

impl Producer {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        let continuations = ContinuationGraph::new(store.clone(), clock.clone(), retry.max_retries);
        Self {
            store,
            clock,
            continuations,
            retry,
        }
    }

    pub async fn enqueue(&self, queue: &str, payload: Payload) -> Result<JobId> {
        self.enqueue_job(NewJob::new(payload).on_queue(queue)).await
    }

    pub async fn enqueue_job(&self, new: NewJob) -> Result<JobId> {
        let job = Job::enqueued(new, self.retry.max_retries, self.clock.now());
        let id = self.create(&job).await?;
        info!(job_id = %id, queue = %job.queue, handler = %job.payload.handler, "Enqueued job");
        Ok(id)
    }

    /// Enqueue once `delay` has passed.
    pub async fn schedule(&self, queue: &str, payload: Payload, delay: Duration) -> Result<JobId> {
        self.schedule_job(NewJob::new(payload).on_queue(queue), delay)
            .await
    }

    pub async fn schedule_job(&self, new: NewJob, delay: Duration) -> Result<JobId> {
        let at = self.clock.now() + to_chrono(delay);
        self.schedule_at(new, at).await
    }

    pub async fn schedule_at(&self, new: NewJob, at: DateTime<Utc>) -> Result<JobId> {
        let now = self.clock.now();
        if at <= now {
            return self.enqueue_job(new).await;
        }
        let job = Job::scheduled(new, self.retry.max_retries, at, now);
        let id = self.create(&job).await?;
        info!(job_id = %id, queue = %job.queue, enqueue_at = %at, "Scheduled job");
        Ok(id)
    }

    /// Run `payload` on the default queue once `parent` succeeds.
    pub async fn continue_with(&self, parent: JobId, payload: Payload) -> Result<JobId> {
        self.continue_with_job(parent, NewJob::new(payload)).await
    }

    pub async fn continue_with_job(&self, parent: JobId, new: NewJob) -> Result<JobId> {
        let mut attempt = 0;
        let id = self
            .with_retries(|| {
                attempt += 1;
                let retried = attempt > 1;
                let new = new.clone();
                async move {
                    match self.continuations.add_continuation(parent, new).await {
                        Err(Error::DuplicateId(id)) if retried => Ok(id),
                        result => result,
                    }
                }
            })
            .await?;
        info!(job_id = %id, parent_id = %parent, "Added continuation");
        Ok(id)
    }

    /// Create the definition, or replace it keeping its fire history.
    pub async fn add_or_update_recurring(
        &self,
        name: &str,
        cron_expression: &str,
        payload_template: Payload,
    ) -> Result<()> {
        self.add_or_update_recurring_with(
            name,
            cron_expression,
            payload_template,
            RecurringOptions::default(),
        )
        .await
    }

    pub async fn add_or_update_recurring_with(
        &self,
        name: &str,
        cron_expression: &str,
        payload_template: Payload,
        options: RecurringOptions,
    ) -> Result<()> {
        let mut definition = RecurringDefinition::new(
            name,
            cron_expression,
            payload_template,
            options,
            self.clock.now(),
        )?;
        if let Some(existing) = self
            .with_retries(|| async { Ok(self.store.get_recurring(name).await?) })
            .await?
        {
            definition = definition.merge_existing(&existing);
        }

        self.with_retries(|| async { Ok(self.store.upsert_recurring(&definition).await?) })
            .await?;
        info!(
            recurring = %name,
            cron = %definition.cron_expression,
            next_fire_at = %definition.next_fire_at,
            "Registered recurring job"
        );
        Ok(())
    }

    /// Returns whether a definition was removed. Jobs it already spawned
    /// are left alone.
    pub async fn remove_recurring(&self, name: &str) -> Result<bool> {
        let removed = self
            .with_retries(|| async { Ok(self.store.remove_recurring(name).await?) })
            .await?;
        if removed {
            info!(recurring = %name, "Removed recurring job");
        }
        Ok(removed)
    }

    pub async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>> {
        self.with_retries(|| async { Ok(self.store.list_recurring().await?) })
            .await
    }

    /// Enqueue one instance now without moving the schedule.
    pub async fn trigger_recurring(&self, name: &str) -> Result<JobId> {
        let definition = self
            .with_retries(|| async { Ok(self.store.get_recurring(name).await?) })
            .await?
            .ok_or_else(|| Error::NotFound(format!("recurring job {name}")))?;

        let job = definition.spawn(self.retry.max_retries, self.clock.now());
        let id = self.create(&job).await?;
        info!(recurring = %name, job_id = %id, "Triggered recurring job");
        Ok(id)
    }

    /// Move a job that has not started yet to Deleted. Awaiting
    /// continuations of the job are deleted with it.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let job = self
            .with_retries(|| async { Ok(self.store.get(id).await?) })
            .await?;

        if job.state == JobState::Leased {
            return Err(Error::LostRace(id));
        }
        if !job.state.is_cancellable() {
            return Err(Error::InvalidInput(format!(
                "job {id} is already {}",
                job.state
            )));
        }

        let transition = Transition::to(JobState::Deleted, self.clock.now());
        let cancelled = self
            .with_retries(|| async {
                Ok(self
                    .store
                    .compare_and_transition(id, job.state, &transition)
                    .await?)
            })
            .await?;
        if !cancelled {
            return Err(Error::LostRace(id));
        }

        info!(job_id = %id, from = %job.state, "Cancelled job");
        if let Err(e) = self
            .continuations
            .on_parent_finished(id, JobState::Deleted)
            .await
        {
            // Left for the continuation sweep.
            warn!(job_id = %id, error = %e, "Failed to cancel continuations");
        }
        Ok(())
    }

    async fn create(&self, job: &Job) -> Result<JobId> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.create(job).await.map_err(Error::from) {
                Ok(id) => return Ok(id),
                // Our earlier attempt landed before the error came back.
                Err(Error::DuplicateId(id)) if attempt > 1 && id == job.id => return Ok(id),
                Err(e) if e.is_transient() && attempt < STORE_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "Store unavailable, retrying create");
                    tokio::time::sleep(STORE_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if e.is_transient() && attempt < STORE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Store unavailable, retrying");
                    tokio::time::sleep(STORE_BACKOFF * attempt).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_core::{ManualClock, OverlapPolicy};
    use hopper_db::MemoryJobStore;

    fn producer() -> (Arc<MemoryJobStore>, Arc<ManualClock>, Producer) {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let producer = Producer::new(store.clone(), clock.clone(), RetryPolicy::with_retries(2));
        (store, clock, producer)
    }

    #[tokio::test]
    async fn test_enqueue_uses_default_retries() {
        let (store, clock, producer) = producer();
        let id = producer
            .enqueue("emails", Payload::bare("send"))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.queue, "emails");
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.enqueue_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_schedule_sets_enqueue_at() {
        let (store, clock, producer) = producer();
        let id = producer
            .schedule("default", Payload::bare("later"), Duration::from_secs(90))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(
            job.enqueue_at,
            Some(clock.now() + chrono::Duration::seconds(90))
        );
    }

    #[tokio::test]
    async fn test_schedule_in_the_past_enqueues() {
        let (store, clock, producer) = producer();
        let id = producer
            .schedule_at(
                NewJob::new(Payload::bare("now")),
                clock.now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (_, _, producer) = producer();
        let new = NewJob::new(Payload::bare("once"));
        producer.enqueue_job(new.clone()).await.unwrap();
        let err = producer.enqueue_job(new).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_continue_with_missing_parent() {
        let (_, _, producer) = producer();
        let err = producer
            .continue_with(JobId::new(), Payload::bare("child"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recurring_update_keeps_history() {
        let (store, clock, producer) = producer();
        producer
            .add_or_update_recurring("report", "0 * * * *", Payload::bare("report"))
            .await
            .unwrap();
        let first = producer.trigger_recurring("report").await.unwrap();

        let mut stored = store.get_recurring("report").await.unwrap().unwrap();
        stored.last_job_id = Some(first);
        store.upsert_recurring(&stored).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        producer
            .add_or_update_recurring_with(
                "report",
                "*/5 * * * *",
                Payload::bare("report"),
                RecurringOptions {
                    overlap: OverlapPolicy::Allow,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store.get_recurring("report").await.unwrap().unwrap();
        assert_eq!(updated.cron_expression, "0 */5 * * * *");
        assert_eq!(updated.overlap, OverlapPolicy::Allow);
        assert_eq!(updated.created_at, stored.created_at);
        assert_eq!(updated.last_job_id, Some(first));
        assert_eq!(producer.list_recurring().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_rejects_bad_cron() {
        let (_, _, producer) = producer();
        let err = producer
            .add_or_update_recurring("bad", "every tuesday", Payload::bare("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn test_trigger_does_not_move_schedule() {
        let (store, _, producer) = producer();
        producer
            .add_or_update_recurring("report", "0 0 * * *", Payload::bare("report"))
            .await
            .unwrap();
        let before = store.get_recurring("report").await.unwrap().unwrap();

        let id = producer.trigger_recurring("report").await.unwrap();
        let job = store.get(id).await.unwrap();
        assert_eq!(job.recurring_name.as_deref(), Some("report"));

        let after = store.get_recurring("report").await.unwrap().unwrap();
        assert_eq!(after.next_fire_at, before.next_fire_at);

        assert!(matches!(
            producer.trigger_recurring("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(producer.remove_recurring("report").await.unwrap());
        assert!(!producer.remove_recurring("report").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let (store, clock, producer) = producer();
        let id = producer
            .schedule("default", Payload::bare("later"), Duration::from_secs(60))
            .await
            .unwrap();
        let child = producer
            .continue_with(id, Payload::bare("child"))
            .await
            .unwrap();

        producer.cancel(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().state, JobState::Deleted);
        assert_eq!(store.get(child).await.unwrap().state, JobState::Deleted);
        assert!(matches!(
            producer.cancel(id).await,
            Err(Error::InvalidInput(_))
        ));

        let running = producer.enqueue("default", Payload::bare("now")).await.unwrap();
        store
            .acquire_lease("default", "w1", chrono::Duration::seconds(30), clock.now())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            producer.cancel(running).await,
            Err(Error::LostRace(_))
        ));
    }
}
