//! In-memory job store.
//!
//! Everything lives behind one mutex, so each trait method is trivially
//! atomic. Suitable for single-process deployments and tests; nothing
//! survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hopper_core::{
    Job, JobId, JobQuery, JobState, Page, RecurringDefinition, StateCount,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{JobStore, RecurringFire, Transition};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    recurring: BTreeMap<String, RecurringDefinition>,
}

/// [`JobStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job records held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn has_active_instance(inner: &Inner, name: &str) -> bool {
    inner
        .jobs
        .values()
        .any(|job| job.recurring_name.as_deref() == Some(name) && !job.state.is_terminal())
}

fn move_children(
    inner: &mut Inner,
    parent: JobId,
    to: JobState,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    let transition = match to {
        JobState::Enqueued => Transition::to(to, now).enqueue_at(now),
        _ => Transition::to(to, now),
    };

    let mut moved = Vec::new();
    for job in inner.jobs.values_mut() {
        if job.parent_id == Some(parent) && job.state == JobState::Awaiting {
            transition.apply(job);
            moved.push(job.id);
        }
    }
    moved.sort();
    moved
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> DbResult<JobId> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(DbError::DuplicateJob(job.id));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: &Transition,
    ) -> DbResult<bool> {
        transition.check_edge(expected)?;

        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        if !transition.guard_holds(job, expected) {
            return Ok(false);
        }
        transition.apply(job);
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Enqueued && job.queue == queue)
            .min_by_key(|job| (job.enqueue_at, job.id))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.state = JobState::Leased;
        job.leased_by = Some(worker_id.to_string());
        job.lease_id = Some(Uuid::new_v4());
        job.lease_expires_at = Some(now + lease);
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        id: JobId,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Leased && job.lease_id == Some(lease_id) => {
                job.lease_expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_error(
        &self,
        id: JobId,
        lease_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Leased && job.lease_id == Some(lease_id) => {
                job.last_error = Some(message.to_string());
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| (job.lease_expires_at, job.id));
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn promote_due(&self, now: DateTime<Utc>, batch_size: u32) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<(Option<DateTime<Utc>>, JobId)> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Scheduled && job.enqueue_at.is_some_and(|at| at <= now)
            })
            .map(|job| (job.enqueue_at, job.id))
            .collect();
        due.sort();
        due.truncate(batch_size as usize);

        // enqueue_at keeps the due time so FIFO order follows the schedule.
        let transition = Transition::to(JobState::Enqueued, now);
        let mut promoted = 0;
        for (_, id) in due {
            if let Some(job) = inner.jobs.get_mut(&id) {
                transition.apply(job);
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn release_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<u64> {
        let mut inner = self.inner.lock().await;
        Ok(move_children(&mut inner, parent, JobState::Enqueued, now).len() as u64)
    }

    async fn cancel_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<Vec<JobId>> {
        let mut inner = self.inner.lock().await;
        Ok(move_children(&mut inner, parent, JobState::Deleted, now))
    }

    async fn parents_with_awaiting_children(&self, limit: u32) -> DbResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut parents: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Awaiting)
            .filter_map(|child| child.parent_id)
            .filter_map(|parent| inner.jobs.get(&parent))
            .filter(|parent| parent.state.is_terminal())
            .cloned()
            .collect();
        parents.sort_by_key(|job| job.id);
        parents.dedup_by_key(|job| job.id);
        parents.truncate(limit as usize);
        Ok(parents)
    }

    async fn query(&self, query: &JobQuery) -> DbResult<Page<Job>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        items.sort_by_key(|job| job.id);

        let window = query.effective_limit() as usize + 1;
        if query.before.is_some() && query.after.is_none() {
            let skip = items.len().saturating_sub(window);
            items.drain(..skip);
        } else {
            items.truncate(window);
        }
        Ok(Page::from_window(items, query))
    }

    async fn counts(&self) -> DbResult<Vec<StateCount>> {
        let inner = self.inner.lock().await;
        let mut buckets: BTreeMap<(String, &'static str), (JobState, u64)> = BTreeMap::new();
        for job in inner.jobs.values() {
            buckets
                .entry((job.queue.clone(), job.state.as_str()))
                .or_insert((job.state, 0))
                .1 += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|((queue, _), (state, count))| StateCount {
                queue,
                state,
                count,
            })
            .collect())
    }

    async fn purge_finished(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<u64> {
        if !state.is_terminal() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        // Parents with unresolved children stay until the sweep releases them.
        let pinned: HashSet<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Awaiting)
            .filter_map(|job| job.parent_id)
            .collect();
        let mut victims: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.state == state && job.finished_at.is_some_and(|at| at < cutoff))
            .filter(|job| !pinned.contains(&job.id))
            .map(|job| job.id)
            .collect();
        victims.sort();
        victims.truncate(limit as usize);

        let purged = victims.len() as u64;
        for id in victims {
            inner.jobs.remove(&id);
        }
        Ok(purged)
    }

    async fn upsert_recurring(&self, definition: &RecurringDefinition) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .recurring
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn get_recurring(&self, name: &str) -> DbResult<Option<RecurringDefinition>> {
        Ok(self.inner.lock().await.recurring.get(name).cloned())
    }

    async fn list_recurring(&self) -> DbResult<Vec<RecurringDefinition>> {
        Ok(self.inner.lock().await.recurring.values().cloned().collect())
    }

    async fn remove_recurring(&self, name: &str) -> DbResult<bool> {
        Ok(self.inner.lock().await.recurring.remove(name).is_some())
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<RecurringDefinition>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<RecurringDefinition> = inner
            .recurring
            .values()
            .filter(|def| def.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_fire_at
                .cmp(&b.next_fire_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn has_active_instance(&self, name: &str) -> DbResult<bool> {
        Ok(has_active_instance(&*self.inner.lock().await, name))
    }

    async fn fire_recurring(&self, fire: &RecurringFire) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;

        match inner.recurring.get(&fire.name) {
            Some(def) if def.next_fire_at == fire.expected_next_fire_at => {}
            _ => return Ok(false),
        }
        if let Some(job) = &fire.job {
            if inner.jobs.contains_key(&job.id) {
                return Err(DbError::DuplicateJob(job.id));
            }
            inner.jobs.insert(job.id, job.clone());
        }

        if let Some(def) = inner.recurring.get_mut(&fire.name) {
            def.next_fire_at = fire.next_fire_at;
            def.last_fired_at = Some(fire.fired_at);
            def.updated_at = fire.fired_at;
            if let Some(job) = &fire.job {
                def.last_job_id = Some(job.id);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_core::{NewJob, Payload, RecurringOptions};

    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn enqueued(queue: &str, at: DateTime<Utc>) -> Job {
        Job::enqueued(NewJob::new(Payload::bare("noop")).on_queue(queue), 3, at)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemoryJobStore::new();
        let job = enqueued("default", now());
        store.create(&job).await.unwrap();

        let err = store.create(&job).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateJob(id) if id == job.id));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.get(JobId::new()).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_lease_is_fifo_per_queue() {
        let store = MemoryJobStore::new();
        let t = now();
        let second = enqueued("default", t + Duration::seconds(1));
        let first = enqueued("default", t);
        let other = enqueued("emails", t - Duration::seconds(10));
        for job in [&second, &first, &other] {
            store.create(job).await.unwrap();
        }

        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, first.id);
        assert_eq!(leased.state, JobState::Leased);
        assert_eq!(leased.leased_by.as_deref(), Some("w1"));
        assert_eq!(leased.attempts, 1);
        assert!(leased.lease_id.is_some());
        assert_eq!(leased.lease_expires_at, Some(t + Duration::seconds(30)));

        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, second.id);

        assert!(
            store
                .acquire_lease("default", "w1", Duration::seconds(30), t)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_acquire_lease_breaks_ties_by_id() {
        let store = MemoryJobStore::new();
        let t = now();
        let mut low = enqueued("default", t);
        low.id = JobId::from_uuid(Uuid::from_u128(1));
        let mut high = enqueued("default", t);
        high.id = JobId::from_uuid(Uuid::from_u128(2));
        store.create(&high).await.unwrap();
        store.create(&low).await.unwrap();

        let first = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, low.id);
        assert_eq!(second.id, high.id);
    }

    #[tokio::test]
    async fn test_concurrent_leases_never_duplicate() {
        let store = Arc::new(MemoryJobStore::new());
        let t = now();
        for _ in 0..200 {
            store.create(&enqueued("default", t)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                let worker = format!("w{}", w);
                while let Some(job) = store
                    .acquire_lease("default", &worker, Duration::seconds(30), t)
                    .await
                    .unwrap()
                {
                    mine.push(job.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {} leased twice", id);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_compare_and_transition_guards() {
        let store = MemoryJobStore::new();
        let t = now();
        let job = enqueued("default", t);
        store.create(&job).await.unwrap();
        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();

        // Wrong expected state.
        let ok = store
            .compare_and_transition(
                job.id,
                JobState::Enqueued,
                &Transition::to(JobState::Deleted, t),
            )
            .await
            .unwrap();
        assert!(!ok);

        // Stale lease.
        let ok = store
            .compare_and_transition(
                job.id,
                JobState::Leased,
                &Transition::to(JobState::Succeeded, t).fenced(Some(Uuid::new_v4())),
            )
            .await
            .unwrap();
        assert!(!ok);

        let ok = store
            .compare_and_transition(
                job.id,
                JobState::Leased,
                &Transition::to(JobState::Succeeded, t).fenced(leased.lease_id),
            )
            .await
            .unwrap();
        assert!(ok);

        let done = store.get(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.finished_at, Some(t));
        assert_eq!(done.lease_id, None);

        // Not an edge of the lifecycle at all.
        let err = store
            .compare_and_transition(
                job.id,
                JobState::Succeeded,
                &Transition::to(JobState::Enqueued, t),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_extend_and_expire_lease() {
        let store = MemoryJobStore::new();
        let t = now();
        store.create(&enqueued("default", t)).await.unwrap();
        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        let lease_id = leased.lease_id.unwrap();

        assert!(
            store
                .list_expired_leases(t + Duration::seconds(31), 10)
                .await
                .unwrap()
                .len()
                == 1
        );
        assert!(
            store
                .extend_lease(leased.id, lease_id, t + Duration::seconds(90))
                .await
                .unwrap()
        );
        assert!(
            store
                .list_expired_leases(t + Duration::seconds(31), 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            !store
                .extend_lease(leased.id, Uuid::new_v4(), t + Duration::seconds(300))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_record_error_keeps_state_and_needs_lease() {
        let store = MemoryJobStore::new();
        let t = now();
        store.create(&enqueued("default", t)).await.unwrap();
        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        let lease_id = leased.lease_id.unwrap();

        assert!(
            !store
                .record_error(leased.id, Uuid::new_v4(), "stale", t)
                .await
                .unwrap()
        );
        assert!(
            store
                .record_error(leased.id, lease_id, "timed out", t + Duration::seconds(5))
                .await
                .unwrap()
        );

        let job = store.get(leased.id).await.unwrap();
        assert_eq!(job.state, JobState::Leased);
        assert_eq!(job.lease_id, Some(lease_id));
        assert_eq!(job.last_error.as_deref(), Some("timed out"));
        assert_eq!(job.updated_at, t + Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_promote_due_respects_time_and_batch() {
        let store = MemoryJobStore::new();
        let t = now();
        for offset in [-30, -20, -10, 60] {
            let job = Job::scheduled(
                NewJob::new(Payload::bare("later")),
                3,
                t + Duration::seconds(offset),
                t - Duration::seconds(60),
            );
            store.create(&job).await.unwrap();
        }

        assert_eq!(store.promote_due(t, 2).await.unwrap(), 2);
        assert_eq!(store.promote_due(t, 2).await.unwrap(), 1);
        assert_eq!(store.promote_due(t, 2).await.unwrap(), 0);

        let counts = store.counts().await.unwrap();
        let enqueued = counts
            .iter()
            .find(|c| c.state == JobState::Enqueued)
            .map(|c| c.count);
        let scheduled = counts
            .iter()
            .find(|c| c.state == JobState::Scheduled)
            .map(|c| c.count);
        assert_eq!(enqueued, Some(3));
        assert_eq!(scheduled, Some(1));
    }

    #[tokio::test]
    async fn test_children_release_and_cancel() {
        let store = MemoryJobStore::new();
        let t = now();
        let parent = enqueued("default", t);
        store.create(&parent).await.unwrap();
        for _ in 0..2 {
            let child = Job::awaiting(NewJob::new(Payload::bare("child")), 3, parent.id, t);
            store.create(&child).await.unwrap();
        }

        assert!(
            store
                .parents_with_awaiting_children(10)
                .await
                .unwrap()
                .is_empty()
        );

        let leased = store
            .acquire_lease("default", "w1", Duration::seconds(30), t)
            .await
            .unwrap()
            .unwrap();
        store
            .compare_and_transition(
                parent.id,
                JobState::Leased,
                &Transition::to(JobState::Succeeded, t).fenced(leased.lease_id),
            )
            .await
            .unwrap();

        let parents = store.parents_with_awaiting_children(10).await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].id, parent.id);

        assert_eq!(store.release_children(parent.id, t).await.unwrap(), 2);
        assert_eq!(store.release_children(parent.id, t).await.unwrap(), 0);
        assert!(store.cancel_children(parent.id, t).await.unwrap().is_empty());
        assert!(
            store
                .parents_with_awaiting_children(10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_and_failed() {
        let store = MemoryJobStore::new();
        let t = now();
        let mut old = enqueued("default", t);
        old.state = JobState::Succeeded;
        old.finished_at = Some(t - Duration::hours(48));
        let mut fresh = enqueued("default", t);
        fresh.state = JobState::Succeeded;
        fresh.finished_at = Some(t);
        let mut failed = enqueued("default", t);
        failed.state = JobState::Failed;
        failed.finished_at = Some(t - Duration::hours(48));
        for job in [&old, &fresh, &failed] {
            store.create(job).await.unwrap();
        }

        let cutoff = t - Duration::hours(24);
        assert_eq!(
            store
                .purge_finished(JobState::Succeeded, cutoff, 100)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .purge_finished(JobState::Enqueued, cutoff, 100)
                .await
                .unwrap(),
            0
        );
        assert!(store.get(old.id).await.is_err());
        assert!(store.get(fresh.id).await.is_ok());
        assert!(store.get(failed.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_pages_forward() {
        let store = MemoryJobStore::new();
        let t = now();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = enqueued("default", t);
            ids.push(job.id);
            store.create(&job).await.unwrap();
        }
        ids.sort();

        let page = store.query(&JobQuery::new().limit(2)).await.unwrap();
        assert_eq!(
            page.items.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );

        let cursor = page.next_cursor.unwrap();
        let page = store
            .query(&JobQuery::new().after(cursor).limit(2))
            .await
            .unwrap();
        assert_eq!(
            page.items.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[2..4].to_vec()
        );

        let back = store
            .query(&JobQuery::new().before(page.prev_cursor.unwrap()).limit(2))
            .await
            .unwrap();
        assert_eq!(
            back.items.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
    }

    #[tokio::test]
    async fn test_fire_recurring_is_compare_and_set() {
        let store = MemoryJobStore::new();
        let t = now();
        let def = RecurringDefinition::new(
            "report",
            "* * * * *",
            Payload::bare("report"),
            RecurringOptions::default(),
            t,
        )
        .unwrap();
        store.upsert_recurring(&def).await.unwrap();

        let fire_at = def.next_fire_at;
        let fire = RecurringFire {
            name: def.name.clone(),
            expected_next_fire_at: def.next_fire_at,
            next_fire_at: fire_at + Duration::minutes(1),
            fired_at: fire_at,
            job: Some(def.spawn(3, fire_at)),
        };

        assert!(store.fire_recurring(&fire).await.unwrap());
        assert!(store.has_active_instance("report").await.unwrap());

        // A second scheduler racing on the same tick loses.
        let mut racer = fire.clone();
        racer.job = Some(def.spawn(3, fire_at));
        assert!(!store.fire_recurring(&racer).await.unwrap());
        assert_eq!(store.len().await, 1);

        let stored = store.get_recurring("report").await.unwrap().unwrap();
        assert_eq!(stored.next_fire_at, fire.next_fire_at);
        assert_eq!(stored.last_fired_at, Some(fire_at));
        assert_eq!(stored.last_job_id, fire.job.as_ref().map(|j| j.id));

        assert!(store.remove_recurring("report").await.unwrap());
        assert!(!store.remove_recurring("report").await.unwrap());
    }
}
