//! Continuation graph.
//!
//! A continuation is parked in `Awaiting` until its parent finishes. A
//! parent that succeeds releases its children to `Enqueued`; a parent that
//! fails or is deleted takes its children (and their children) down with it.
//!
//! Workers notify the graph directly when they finish a job. The periodic
//! sweep catches whatever a crashed worker or a racing producer left behind.

use hopper_core::{Clock, Job, JobId, JobState, NewJob, Result};
use hopper_db::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::time::pause;

/// Parents resolved per sweep round trip.
const SWEEP_BATCH: u32 = 500;

#[derive(Clone)]
pub struct ContinuationGraph {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl ContinuationGraph {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, default_max_retries: u32) -> Self {
        Self {
            store,
            clock,
            default_max_retries,
        }
    }

    /// Persist `child` behind `parent`.
    ///
    /// Fails with `NotFound` if the parent does not exist. If the parent has
    /// already finished, the child is resolved on the spot.
    pub async fn add_continuation(&self, parent: JobId, child: NewJob) -> Result<JobId> {
        let parent_job = self.store.get(parent).await?;

        let job = Job::awaiting(child, self.default_max_retries, parent, self.clock.now());
        let id = self.store.create(&job).await?;
        debug!(job_id = %id, parent_id = %parent, "Continuation added");

        // The parent may have finished between the read above and the insert.
        let parent_job = if parent_job.state.is_terminal() {
            parent_job
        } else {
            self.store.get(parent).await?
        };
        if parent_job.state.is_terminal() {
            self.resolve(&parent_job).await?;
        }
        Ok(id)
    }

    /// React to `parent` reaching `state`. Returns how many children moved.
    pub async fn on_parent_finished(&self, parent: JobId, state: JobState) -> Result<u64> {
        match state {
            JobState::Succeeded => {
                let released = self.store.release_children(parent, self.clock.now()).await?;
                if released > 0 {
                    info!(parent_id = %parent, released, "Released continuations");
                }
                Ok(released)
            }
            JobState::Failed | JobState::Deleted => self.cancel_descendants(parent).await,
            _ => Ok(0),
        }
    }

    pub async fn resolve(&self, parent: &Job) -> Result<u64> {
        self.on_parent_finished(parent.id, parent.state).await
    }

    async fn cancel_descendants(&self, root: JobId) -> Result<u64> {
        let mut pending = vec![root];
        let mut cancelled = 0;
        while let Some(parent) = pending.pop() {
            let children = self.store.cancel_children(parent, self.clock.now()).await?;
            cancelled += children.len() as u64;
            pending.extend(children);
        }
        if cancelled > 0 {
            info!(parent_id = %root, cancelled, "Cancelled continuations of unsuccessful parent");
        }
        Ok(cancelled)
    }

    /// Resolve every finished parent that still has waiting children.
    pub async fn sweep(&self) -> Result<u64> {
        let mut moved = 0;
        loop {
            let parents = self.store.parents_with_awaiting_children(SWEEP_BATCH).await?;
            let batch = parents.len();
            for parent in &parents {
                moved += self.resolve(parent).await?;
            }
            if batch < SWEEP_BATCH as usize {
                return Ok(moved);
            }
        }
    }

    /// Run the sweep every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?interval, "Starting continuation sweeper");
        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(moved) => debug!(moved, "Continuation sweep resolved children"),
                Err(e) => error!(error = %e, "Continuation sweep failed"),
            }
            if pause(interval, &mut shutdown).await {
                break;
            }
        }
        info!("Continuation sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hopper_core::{Error, ManualClock, Payload};
    use hopper_db::{MemoryJobStore, Transition};

    struct Fixture {
        store: Arc<MemoryJobStore>,
        graph: ContinuationGraph,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let graph = ContinuationGraph::new(store.clone(), clock, 3);
        Fixture { store, graph }
    }

    async fn parent(store: &MemoryJobStore) -> Job {
        let job = Job::enqueued(NewJob::new(Payload::bare("parent")), 3, Utc::now());
        store.create(&job).await.unwrap();
        job
    }

    /// Force `id` into a terminal state without notifying the graph.
    async fn finish(store: &MemoryJobStore, id: JobId, state: JobState) {
        let leased = store
            .acquire_lease("default", "w", chrono::Duration::seconds(30), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, id);
        let ok = store
            .compare_and_transition(
                id,
                JobState::Leased,
                &Transition::to(state, Utc::now()).fenced(leased.lease_id),
            )
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_child_waits_for_parent() {
        let f = fixture();
        let parent = parent(&f.store).await;
        let child = f
            .graph
            .add_continuation(parent.id, NewJob::new(Payload::bare("child")))
            .await
            .unwrap();

        let stored = f.store.get(child).await.unwrap();
        assert_eq!(stored.state, JobState::Awaiting);
        assert_eq!(stored.parent_id, Some(parent.id));

        finish(&f.store, parent.id, JobState::Succeeded).await;
        assert_eq!(
            f.graph
                .on_parent_finished(parent.id, JobState::Succeeded)
                .await
                .unwrap(),
            1
        );
        assert_eq!(f.store.get(child).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let f = fixture();
        let err = f
            .graph
            .add_continuation(JobId::new(), NewJob::new(Payload::bare("child")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_continuation_of_finished_parent_resolves_immediately() {
        let f = fixture();
        let parent = parent(&f.store).await;
        finish(&f.store, parent.id, JobState::Succeeded).await;

        let child = f
            .graph
            .add_continuation(parent.id, NewJob::new(Payload::bare("child")))
            .await
            .unwrap();
        assert_eq!(f.store.get(child).await.unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_failure_cascades_to_grandchildren() {
        let f = fixture();
        let parent = parent(&f.store).await;
        let child = f
            .graph
            .add_continuation(parent.id, NewJob::new(Payload::bare("child")))
            .await
            .unwrap();
        let grandchild = f
            .graph
            .add_continuation(child, NewJob::new(Payload::bare("grandchild")))
            .await
            .unwrap();

        finish(&f.store, parent.id, JobState::Failed).await;
        assert_eq!(
            f.graph
                .on_parent_finished(parent.id, JobState::Failed)
                .await
                .unwrap(),
            2
        );
        assert_eq!(f.store.get(child).await.unwrap().state, JobState::Deleted);
        assert_eq!(
            f.store.get(grandchild).await.unwrap().state,
            JobState::Deleted
        );
    }

    #[tokio::test]
    async fn test_sweep_is_the_backstop() {
        let f = fixture();
        let parent = parent(&f.store).await;
        let child = f
            .graph
            .add_continuation(parent.id, NewJob::new(Payload::bare("child")))
            .await
            .unwrap();

        // Parent finished but nobody told the graph.
        finish(&f.store, parent.id, JobState::Succeeded).await;
        assert_eq!(f.store.get(child).await.unwrap().state, JobState::Awaiting);

        assert_eq!(f.graph.sweep().await.unwrap(), 1);
        assert_eq!(f.store.get(child).await.unwrap().state, JobState::Enqueued);
        assert_eq!(f.graph.sweep().await.unwrap(), 0);
    }
}
