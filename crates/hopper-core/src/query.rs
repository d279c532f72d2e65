//! Introspection queries over the job store.

use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobState};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Filter plus keyset cursor. Results are ordered by id ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub queue: Option<String>,
    /// Only ids strictly greater than this.
    pub after: Option<JobId>,
    /// Only ids strictly smaller than this; the page closest to the cursor is returned.
    pub before: Option<JobId>,
    pub limit: Option<u32>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn after(mut self, cursor: JobId) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn before(mut self, cursor: JobId) -> Self {
        self.before = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|state| job.state == state)
            && self.queue.as_ref().is_none_or(|queue| &job.queue == queue)
            && self.after.is_none_or(|after| job.id > after)
            && self.before.is_none_or(|before| job.id < before)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass as `after` to fetch the next page; `None` on the last page.
    pub next_cursor: Option<JobId>,
    /// Pass as `before` to fetch the previous page.
    pub prev_cursor: Option<JobId>,
}

impl Page<Job> {
    /// Build a page from jobs already filtered and sorted by id ascending,
    /// holding at most `limit + 1` entries on the side away from the cursor.
    pub fn from_window(mut items: Vec<Job>, query: &JobQuery) -> Self {
        let limit = query.effective_limit() as usize;
        let has_more = items.len() > limit;

        if query.before.is_some() && query.after.is_none() {
            if has_more {
                items.drain(..items.len() - limit);
            }
            let next_cursor = query.before.and(items.last().map(|job| job.id));
            let prev_cursor = if has_more { items.first().map(|job| job.id) } else { None };
            return Self {
                items,
                next_cursor,
                prev_cursor,
            };
        }

        items.truncate(limit);
        let next_cursor = if has_more { items.last().map(|job| job.id) } else { None };
        let prev_cursor = query.after.and(items.first().map(|job| job.id));
        Self {
            items,
            next_cursor,
            prev_cursor,
        }
    }
}

/// Number of jobs in one (queue, state) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCount {
    pub queue: String,
    pub state: JobState,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewJob, Payload};
    use chrono::Utc;

    fn jobs(n: usize) -> Vec<Job> {
        let now = Utc::now();
        (0..n)
            .map(|_| Job::enqueued(NewJob::new(Payload::bare("x")), 0, now))
            .collect()
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(JobQuery::new().effective_limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(JobQuery::new().limit(0).effective_limit(), 1);
        assert_eq!(JobQuery::new().limit(10_000).effective_limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_matches_filters() {
        let all = jobs(3);
        let query = JobQuery::new()
            .in_state(JobState::Enqueued)
            .on_queue("default")
            .after(all[0].id);
        assert!(!query.matches(&all[0]));
        assert!(query.matches(&all[1]));
        assert!(!JobQuery::new().on_queue("other").matches(&all[1]));
        assert!(!JobQuery::new().in_state(JobState::Failed).matches(&all[1]));
        assert!(!JobQuery::new().before(all[1].id).matches(&all[2]));
    }

    #[test]
    fn test_forward_window() {
        let all = jobs(5);
        let query = JobQuery::new().limit(2);
        let page = Page::from_window(all[..3].to_vec(), &query);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, Some(all[1].id));
        assert_eq!(page.prev_cursor, None);

        let last = Page::from_window(all[4..].to_vec(), &JobQuery::new().after(all[3].id).limit(2));
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);
        assert_eq!(last.prev_cursor, Some(all[4].id));
    }

    #[test]
    fn test_backward_window_keeps_closest_items() {
        let all = jobs(5);
        let query = JobQuery::new().before(all[4].id).limit(2);
        let page = Page::from_window(all[..4].to_vec(), &query);
        let ids: Vec<JobId> = page.items.iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![all[2].id, all[3].id]);
        assert_eq!(page.prev_cursor, Some(all[2].id));
        assert_eq!(page.next_cursor, Some(all[3].id));
    }
}
