//! Worker that leases jobs and runs their handlers.
//!
//! Each job runs in its own task so a panicking handler is contained at the
//! job boundary. While the handler runs the worker renews the lease every
//! `heartbeat`; once the execution timeout passes it stops renewing and lets
//! the lease reaper recover the job.

use chrono::{DateTime, Utc};
use hopper_core::{
    Clock, Error, HandlerRegistry, Job, JobContext, JobError, JobId, JobResult, JobState, Result,
    RetryPolicy,
};
use hopper_db::{JobStore, Transition};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::continuation::ContinuationGraph;
use crate::dispatcher::{Dispatch, Dispatcher, DispatcherOptions};
use crate::time::{pause, to_chrono};

/// Heartbeats are never sent more often than this.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Pause after the dispatcher reports a non-transient error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queues to lease from, in priority order.
    pub queues: Vec<String>,
    pub dispatcher: DispatcherOptions,
    pub heartbeat: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: vec![hopper_core::DEFAULT_QUEUE.to_string()],
            dispatcher: DispatcherOptions::default(),
            heartbeat: Duration::from_secs(60),
            timeout: Duration::from_secs(1800),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters shared between a worker pool and whoever reports on it.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    processed: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
    retried: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    abandoned: Arc<AtomicU64>,
}

impl WorkerStats {
    fn record(&self, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Retrying { .. } => &self.retried,
            Outcome::Failed { .. } => &self.failed,
            Outcome::TimedOut | Outcome::LeaseLost => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs left to the lease reaper (timed out or lease lost).
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// How a single execution ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Rescheduled for another attempt at `at`.
    Retrying { at: DateTime<Utc> },
    Failed { error: String },
    /// Execution timeout elapsed; the lease is left to expire.
    TimedOut,
    /// The lease was taken away while the handler ran, or the final
    /// transition was rejected.
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub job_id: JobId,
    pub outcome: Outcome,
}

pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    continuations: ContinuationGraph,
    options: WorkerOptions,
    shutdown: Arc<AtomicBool>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Self {
        let dispatcher = Dispatcher::new(store.clone(), clock.clone(), options.dispatcher.clone());
        let continuations =
            ContinuationGraph::new(store.clone(), clock.clone(), options.retry.max_retries);
        Self {
            id: id.into(),
            store,
            clock,
            registry,
            dispatcher,
            continuations,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: WorkerStats::default(),
        }
    }

    /// Share the flag handlers see through `JobContext::is_shutting_down`.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn with_stats(mut self, stats: WorkerStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Lease and run jobs until shutdown. A job already running when
    /// shutdown is requested is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, queues = ?self.options.queues, "Starting worker");

        while !*shutdown.borrow() {
            match self
                .dispatcher
                .next_from(&self.options.queues, &self.id, &mut shutdown)
                .await
            {
                Ok(Dispatch::Leased(job)) => {
                    if let Err(e) = self.execute(*job).await {
                        warn!(worker_id = %self.id, error = %e, "Failed to record job outcome");
                    }
                }
                Ok(Dispatch::Timeout) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to lease job");
                    if pause(ERROR_BACKOFF, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Lease one job, if any is ready, and run it to completion.
    pub async fn process_next(&self) -> Result<Option<Processed>> {
        match self.dispatcher.try_lease(&self.options.queues, &self.id).await? {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a job this worker has leased and record the outcome.
    pub async fn execute(&self, job: Job) -> Result<Processed> {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            queue = %job.queue,
            handler = %job.payload.handler,
            attempt = job.attempts,
            "Executing job"
        );

        let handler = match self.registry.get(&job.payload.handler) {
            Ok(handler) => handler,
            Err(e) => return self.fail(&job, false, e).await,
        };

        let ctx = JobContext::new(
            job.id,
            job.queue.clone(),
            job.attempts,
            job.retry_count,
            self.id.clone(),
            self.shutdown.clone(),
        );
        let args = job.payload.args.clone();
        let mut task = tokio::spawn(async move { handler.handle(&ctx, &args).await });

        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);
        let every = self.options.heartbeat.max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result: JobResult = loop {
            tokio::select! {
                joined = &mut task => break joined.unwrap_or_else(|e| Err(join_failure(e))),
                _ = &mut deadline => {
                    task.abort();
                    let cause = Error::HandlerTimeout(self.options.timeout);
                    self.record_timeout(&job, &cause).await;
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %cause,
                        "Leaving lease to expire"
                    );
                    return Ok(self.finish(job.id, Outcome::TimedOut));
                }
                _ = heartbeat.tick() => {
                    if !self.heartbeat(&job).await {
                        task.abort();
                        warn!(worker_id = %self.id, job_id = %job.id, "Lease lost while job was running");
                        return Ok(self.finish(job.id, Outcome::LeaseLost));
                    }
                }
            }
        };

        match result {
            Ok(()) => self.succeed(&job).await,
            Err(e) => {
                self.fail(&job, e.retryable, Error::HandlerError(e.message))
                    .await
            }
        }
    }

    /// Extend the lease. Returns false only when the lease is definitely gone.
    async fn heartbeat(&self, job: &Job) -> bool {
        let Some(lease_id) = job.lease_id else {
            return false;
        };
        let expires_at = self.clock.now() + to_chrono(self.dispatcher.options().lease_duration);
        match self.store.extend_lease(job.id, lease_id, expires_at).await {
            Ok(held) => {
                debug!(job_id = %job.id, held, "Lease heartbeat");
                held
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Lease heartbeat failed");
                true
            }
        }
    }

    /// Store the timeout on the job so the reaper can keep it.
    async fn record_timeout(&self, job: &Job, cause: &Error) {
        let Some(lease_id) = job.lease_id else {
            return;
        };
        let message = cause.to_string();
        match self
            .store
            .record_error(job.id, lease_id, &message, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job.id, "Lease gone before timeout was recorded"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to record timeout"),
        }
    }

    async fn succeed(&self, job: &Job) -> Result<Processed> {
        let transition = Transition::to(JobState::Succeeded, self.clock.now()).fenced(job.lease_id);
        if !self
            .store
            .compare_and_transition(job.id, JobState::Leased, &transition)
            .await?
        {
            warn!(job_id = %job.id, "Lease lost before success was recorded");
            return Ok(self.finish(job.id, Outcome::LeaseLost));
        }

        info!(worker_id = %self.id, job_id = %job.id, "Job succeeded");
        self.notify_children(job.id, JobState::Succeeded).await;
        Ok(self.finish(job.id, Outcome::Succeeded))
    }

    async fn fail(&self, job: &Job, retryable: bool, cause: Error) -> Result<Processed> {
        let now = self.clock.now();
        let message = cause.to_string();

        if retryable && job.can_retry() {
            let at = now + to_chrono(self.options.retry.backoff_for(job.retry_count));
            let transition = Transition::to(JobState::Scheduled, now)
                .enqueue_at(at)
                .retry_count(job.retry_count + 1)
                .error(message)
                .fenced(job.lease_id);
            if !self
                .store
                .compare_and_transition(job.id, JobState::Leased, &transition)
                .await?
            {
                warn!(job_id = %job.id, "Lease lost before retry was recorded");
                return Ok(self.finish(job.id, Outcome::LeaseLost));
            }

            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %cause,
                retry_count = job.retry_count + 1,
                max_retries = job.max_retries,
                retry_at = %at,
                "Job failed, retry scheduled"
            );
            return Ok(self.finish(job.id, Outcome::Retrying { at }));
        }

        let transition = Transition::to(JobState::Failed, now)
            .error(message.clone())
            .fenced(job.lease_id);
        if !self
            .store
            .compare_and_transition(job.id, JobState::Leased, &transition)
            .await?
        {
            warn!(job_id = %job.id, "Lease lost before failure was recorded");
            return Ok(self.finish(job.id, Outcome::LeaseLost));
        }

        if retryable {
            error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %cause,
                reason = %Error::RetriesExhausted(job.attempts),
                "Job failed permanently"
            );
        } else {
            error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %cause,
                attempts = job.attempts,
                "Job failed permanently, error is not retryable"
            );
        }
        self.notify_children(job.id, JobState::Failed).await;
        Ok(self.finish(
            job.id,
            Outcome::Failed { error: message },
        ))
    }

    async fn notify_children(&self, id: JobId, state: JobState) {
        // The continuation sweep picks up anything missed here.
        if let Err(e) = self.continuations.on_parent_finished(id, state).await {
            warn!(job_id = %id, error = %e, "Failed to resolve continuations");
        }
    }

    fn finish(&self, job_id: JobId, outcome: Outcome) -> Processed {
        self.stats.record(&outcome);
        Processed { job_id, outcome }
    }
}

fn join_failure(e: JoinError) -> JobError {
    if e.is_panic() {
        let payload = e.into_panic();
        JobError::retryable(format!("handler panicked: {}", panic_message(&*payload)))
    } else {
        JobError::retryable("handler task was cancelled")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
