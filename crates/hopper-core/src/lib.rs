//! Core domain types and traits for the hopper background job scheduler.
//!
//! This crate contains:
//! - Job identifiers, the Job record and its state machine
//! - Recurring definitions and cron evaluation
//! - Retry policy and backoff
//! - The clock abstraction used everywhere `now` is needed
//! - The job handler trait and registry
//! - Query and pagination types for introspection

pub mod clock;
pub mod cron;
pub mod error;
pub mod handler;
pub mod id;
pub mod job;
pub mod query;
pub mod recurring;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use handler::{HandlerRegistry, JobContext, JobError, JobHandler, JobResult};
pub use id::JobId;
pub use job::{DEFAULT_QUEUE, Job, JobState, NewJob, Payload};
pub use query::{JobQuery, Page, StateCount};
pub use recurring::{OverlapPolicy, RecurringDefinition, RecurringOptions};
pub use retry::RetryPolicy;
