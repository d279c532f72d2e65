//! Job scheduling, dispatch and execution for hopper.
//!
//! Every component here is a poller over a shared [`JobStore`]: none of them
//! talk to each other directly, so any number of processes can run them
//! against the same database.
//!
//! - [`Scheduler`] promotes due jobs and fires recurring definitions
//! - [`Dispatcher`] leases enqueued jobs to idle workers
//! - [`Worker`] runs handlers, heartbeats leases, records outcomes
//! - [`LeaseReaper`] recovers jobs whose lease ran out
//! - [`ContinuationGraph`] releases or cancels children of finished parents
//! - [`RetentionSweeper`] purges old finished jobs
//! - [`Producer`] and [`Monitor`] are the write and read APIs for callers
//! - [`BackgroundServer`] wires all of the above together
//!
//! [`JobStore`]: hopper_db::JobStore

pub mod continuation;
pub mod dispatcher;
pub mod monitor;
pub mod producer;
pub mod reaper;
pub mod retention;
pub mod scheduler;
pub mod server;
pub mod worker;

mod time;

pub use continuation::ContinuationGraph;
pub use dispatcher::{Dispatch, Dispatcher, DispatcherOptions};
pub use monitor::Monitor;
pub use producer::Producer;
pub use reaper::{LeaseReaper, ReapReport};
pub use retention::{RetentionOptions, RetentionSweeper};
pub use scheduler::{Scheduler, SchedulerOptions, TickReport};
pub use server::{BackgroundServer, ServerHandle, ServerOptions};
pub use worker::{Outcome, Processed, Worker, WorkerOptions, WorkerStats};
