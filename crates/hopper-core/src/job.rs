//! The Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, JobId, Result};

/// Queue used when a producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle state of a job.
///
/// `Awaiting` is the parked state of a continuation whose parent has not
/// finished yet. It is invisible to both the scheduler and the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Awaiting,
    Scheduled,
    Enqueued,
    Leased,
    Succeeded,
    Failed,
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Awaiting,
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Leased,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Awaiting => "awaiting",
            JobState::Scheduled => "scheduled",
            JobState::Enqueued => "enqueued",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Deleted
        )
    }

    /// States a cooperating caller may still cancel.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobState::Awaiting | JobState::Scheduled | JobState::Enqueued
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// The only backwards edges are out of `Leased`, taken on retry or lease
    /// expiry.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Awaiting, Enqueued)
                | (Awaiting, Deleted)
                | (Scheduled, Enqueued)
                | (Scheduled, Deleted)
                | (Enqueued, Leased)
                | (Enqueued, Deleted)
                | (Leased, Succeeded)
                | (Leased, Failed)
                | (Leased, Enqueued)
                | (Leased, Scheduled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job state: {}", s)))
    }
}

/// Serialized invocation descriptor.
///
/// The scheduler never looks inside `args`; `handler` is only used by the
/// worker to pick the registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Payload {
    pub fn new(handler: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            args,
        }
    }

    /// A payload with no arguments.
    pub fn bare(handler: impl Into<String>) -> Self {
        Self::new(handler, serde_json::Value::Null)
    }

    pub fn from_args<T: Serialize>(handler: impl Into<String>, args: &T) -> Result<Self> {
        let args = serde_json::to_value(args)
            .map_err(|e| Error::InvalidInput(format!("unserializable job arguments: {}", e)))?;
        Ok(Self::new(handler, args))
    }
}

/// A job to be created by a producer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub payload: Payload,
    /// Falls back to the producer's retry policy when unset.
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: JobId::new(),
            queue: DEFAULT_QUEUE.to_string(),
            payload,
            max_retries: None,
        }
    }

    /// Pin the id, for producers that retry a create idempotently.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A job record, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: Payload,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Due time for Scheduled jobs; FIFO key once Enqueued.
    pub enqueue_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    /// Fencing token minted on every lease acquisition.
    pub lease_id: Option<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of leases granted so far.
    pub attempts: u32,
    pub parent_id: Option<JobId>,
    /// Name of the recurring definition that spawned this job, if any.
    pub recurring_name: Option<String>,
    pub cron_expression: Option<String>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn build(new: NewJob, state: JobState, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            queue: new.queue,
            payload: new.payload,
            state,
            created_at: now,
            updated_at: now,
            enqueue_at: None,
            lease_expires_at: None,
            leased_by: None,
            lease_id: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            attempts: 0,
            parent_id: None,
            recurring_name: None,
            cron_expression: None,
            last_error: None,
            finished_at: None,
        }
    }

    /// A job that is immediately eligible for dispatch.
    pub fn enqueued(new: NewJob, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        let mut job = Self::build(new, JobState::Enqueued, default_max_retries, now);
        job.enqueue_at = Some(now);
        job
    }

    /// A job that becomes eligible once `at` has passed.
    pub fn scheduled(
        new: NewJob,
        default_max_retries: u32,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::build(new, JobState::Scheduled, default_max_retries, now);
        job.enqueue_at = Some(at);
        job
    }

    /// A continuation parked until `parent` succeeds.
    pub fn awaiting(
        new: NewJob,
        default_max_retries: u32,
        parent: JobId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::build(new, JobState::Awaiting, default_max_retries, now);
        job.parent_id = Some(parent);
        job
    }

    /// Whether the job's lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Leased && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
