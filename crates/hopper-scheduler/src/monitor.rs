//! Read-only view over job state for dashboards and the CLI.

use hopper_core::{Job, JobId, JobQuery, JobState, Page, Result, StateCount};
use hopper_db::JobStore;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Monitor {
    store: Arc<dyn JobStore>,
}

impl Monitor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn query(&self, query: &JobQuery) -> Result<Page<Job>> {
        Ok(self.store.query(query).await?)
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        Ok(self.store.get(id).await?)
    }

    /// Job counts per (queue, state).
    pub async fn counts(&self) -> Result<Vec<StateCount>> {
        Ok(self.store.counts().await?)
    }

    /// Job counts per state across all queues.
    pub async fn state_totals(&self) -> Result<BTreeMap<JobState, u64>> {
        let mut totals = BTreeMap::new();
        for count in self.counts().await? {
            *totals.entry(count.state).or_insert(0) += count.count;
        }
        Ok(totals)
    }
}
