//! The job store contract.
//!
//! The store is the single mutation authority: workers, the scheduler and
//! the sweepers never talk to each other, only to the store. Every method is
//! atomic, and a successful return means the change is durable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hopper_core::{
    Job, JobId, JobQuery, JobState, Page, RecurringDefinition, StateCount,
};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Field changes applied together with a state change.
///
/// Leaving `Leased` always clears the lease columns; entering a terminal
/// state stamps `finished_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub enqueue_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
    /// Only apply while the job still carries this lease.
    pub lease_id: Option<Uuid>,
}

impl Transition {
    pub fn to(state: JobState, at: DateTime<Utc>) -> Self {
        Self {
            to: state,
            at,
            enqueue_at: None,
            retry_count: None,
            last_error: None,
            lease_id: None,
        }
    }

    pub fn enqueue_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueue_at = Some(at);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    /// Fence the transition on the lease held by the caller.
    pub fn fenced(mut self, lease_id: Option<Uuid>) -> Self {
        self.lease_id = lease_id;
        self
    }

    pub fn check_edge(&self, from: JobState) -> DbResult<()> {
        if from.can_transition_to(self.to) {
            Ok(())
        } else {
            Err(DbError::InvalidTransition { from, to: self.to })
        }
    }

    /// Whether `job` satisfies the expected state and the lease fence.
    pub fn guard_holds(&self, job: &Job, expected: JobState) -> bool {
        job.state == expected && self.lease_id.is_none_or(|lease| job.lease_id == Some(lease))
    }

    /// Apply to an in-memory record.
    pub fn apply(&self, job: &mut Job) {
        job.state = self.to;
        job.updated_at = self.at;
        if let Some(at) = self.enqueue_at {
            job.enqueue_at = Some(at);
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(message) = &self.last_error {
            job.last_error = Some(message.clone());
        }
        if self.to != JobState::Leased {
            job.lease_expires_at = None;
            job.leased_by = None;
            job.lease_id = None;
        }
        if self.to.is_terminal() {
            job.finished_at = Some(self.at);
        }
    }
}

/// One fire of a recurring definition, committed atomically.
#[derive(Debug, Clone)]
pub struct RecurringFire {
    pub name: String,
    /// Compare-and-set guard: the fire only applies if the stored
    /// `next_fire_at` still equals this value.
    pub expected_next_fire_at: DateTime<Utc>,
    pub next_fire_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    /// `None` when the fire was skipped by the overlap policy.
    pub job: Option<Job>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` if the id exists.
    async fn create(&self, job: &Job) -> DbResult<JobId>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Atomically move `id` from `expected` to `transition.to`.
    /// Returns `false` when the guard does not hold (lost race).
    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: &Transition,
    ) -> DbResult<bool>;

    /// Lease the first Enqueued job of `queue`, ordered by `enqueue_at`
    /// then `id`. Mints a fresh lease id and bumps `attempts`.
    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>>;

    /// Push out the expiry of a lease still held under `lease_id`.
    async fn extend_lease(
        &self,
        id: JobId,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Set `last_error` on a job still leased under `lease_id`, without
    /// changing its state.
    async fn record_error(
        &self,
        id: JobId,
        lease_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Leased jobs whose lease ran out before `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<Job>>;

    /// Move up to `batch_size` due Scheduled jobs to Enqueued.
    async fn promote_due(&self, now: DateTime<Utc>, batch_size: u32) -> DbResult<u64>;

    /// Enqueue every Awaiting child of `parent`.
    async fn release_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<u64>;

    /// Delete every Awaiting child of `parent`, returning their ids.
    async fn cancel_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<Vec<JobId>>;

    /// Terminal jobs that still have Awaiting children.
    async fn parents_with_awaiting_children(&self, limit: u32) -> DbResult<Vec<Job>>;

    async fn query(&self, query: &JobQuery) -> DbResult<Page<Job>>;

    async fn counts(&self) -> DbResult<Vec<StateCount>>;

    /// Remove up to `limit` jobs in terminal `state` finished before `cutoff`.
    async fn purge_finished(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<u64>;

    /// Insert or replace a definition, keeping its fire history.
    async fn upsert_recurring(&self, definition: &RecurringDefinition) -> DbResult<()>;

    async fn get_recurring(&self, name: &str) -> DbResult<Option<RecurringDefinition>>;

    async fn list_recurring(&self) -> DbResult<Vec<RecurringDefinition>>;

    async fn remove_recurring(&self, name: &str) -> DbResult<bool>;

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<RecurringDefinition>>;

    /// Whether a non-terminal instance spawned by `name` exists.
    async fn has_active_instance(&self, name: &str) -> DbResult<bool>;

    /// Persist the instance (if any) and the new schedule together.
    /// Returns `false` if another scheduler fired this tick first.
    async fn fire_recurring(&self, fire: &RecurringFire) -> DbResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_core::{NewJob, Payload};

    fn leased_job(now: DateTime<Utc>) -> Job {
        let mut job = Job::enqueued(NewJob::new(Payload::bare("x")), 3, now);
        job.state = JobState::Leased;
        job.lease_id = Some(Uuid::new_v4());
        job.leased_by = Some("w1".to_string());
        job.lease_expires_at = Some(now + Duration::seconds(30));
        job
    }

    #[test]
    fn test_apply_clears_lease_and_stamps_finish() {
        let now = Utc::now();
        let mut job = leased_job(now);
        let later = now + Duration::seconds(5);

        Transition::to(JobState::Succeeded, later).apply(&mut job);

        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.lease_id, None);
        assert_eq!(job.leased_by, None);
        assert_eq!(job.lease_expires_at, None);
        assert_eq!(job.finished_at, Some(later));
        assert_eq!(job.updated_at, later);
    }

    #[test]
    fn test_apply_retry_fields() {
        let now = Utc::now();
        let mut job = leased_job(now);
        let retry_at = now + Duration::seconds(60);

        Transition::to(JobState::Scheduled, now)
            .enqueue_at(retry_at)
            .retry_count(1)
            .error("boom")
            .apply(&mut job);

        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.enqueue_at, Some(retry_at));
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.finished_at, None);
    }

    #[test]
    fn test_guard_checks_state_and_fence() {
        let now = Utc::now();
        let job = leased_job(now);
        let t = Transition::to(JobState::Succeeded, now);

        assert!(t.guard_holds(&job, JobState::Leased));
        assert!(!t.guard_holds(&job, JobState::Enqueued));
        assert!(t.clone().fenced(job.lease_id).guard_holds(&job, JobState::Leased));
        assert!(
            !t.fenced(Some(Uuid::new_v4()))
                .guard_holds(&job, JobState::Leased)
        );
    }

    #[test]
    fn test_check_edge() {
        let now = Utc::now();
        assert!(Transition::to(JobState::Enqueued, now)
            .check_edge(JobState::Scheduled)
            .is_ok());
        assert!(matches!(
            Transition::to(JobState::Enqueued, now).check_edge(JobState::Succeeded),
            Err(DbError::InvalidTransition { .. })
        ));
    }
}
