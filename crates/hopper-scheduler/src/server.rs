//! Background server: a worker pool plus the periodic loops, in one process.

use futures::future::join_all;
use hopper_core::{Clock, HandlerRegistry, SystemClock};
use hopper_db::JobStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::continuation::ContinuationGraph;
use crate::producer::Producer;
use crate::reaper::LeaseReaper;
use crate::retention::{RetentionOptions, RetentionSweeper};
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::worker::{Worker, WorkerOptions, WorkerStats};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Prefix for worker ids.
    pub name: String,
    /// Number of workers, i.e. jobs run at the same time.
    pub concurrency: usize,
    pub scheduler: SchedulerOptions,
    pub worker: WorkerOptions,
    pub reaper_interval: Duration,
    pub continuation_interval: Duration,
    pub retention: RetentionOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "hopper".to_string(),
            concurrency: 4,
            scheduler: SchedulerOptions::default(),
            worker: WorkerOptions::default(),
            reaper_interval: Duration::from_secs(5),
            continuation_interval: Duration::from_secs(5),
            retention: RetentionOptions::default(),
        }
    }
}

pub struct BackgroundServer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    options: ServerOptions,
}

impl BackgroundServer {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, options: ServerOptions) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            registry: Arc::new(registry),
            options,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A producer over the same store, clock and retry policy.
    pub fn producer(&self) -> Producer {
        Producer::new(
            self.store.clone(),
            self.clock.clone(),
            self.options.worker.retry.clone(),
        )
    }

    pub fn start(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        let stats = WorkerStats::default();
        let mut tasks = Vec::new();

        info!(
            name = %self.options.name,
            concurrency = self.options.concurrency,
            queues = ?self.options.worker.queues,
            handlers = ?self.registry.names(),
            "Starting background server"
        );

        let pid = std::process::id();
        for n in 0..self.options.concurrency.max(1) {
            let worker = Worker::new(
                format!("{}:{pid}:{n}", self.options.name),
                self.store.clone(),
                self.clock.clone(),
                self.registry.clone(),
                self.options.worker.clone(),
            )
            .with_shutdown_flag(stopping.clone())
            .with_stats(stats.clone());
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.clock.clone(),
            self.options.scheduler.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(rx).await }));

        let continuations = ContinuationGraph::new(
            self.store.clone(),
            self.clock.clone(),
            self.options.worker.retry.max_retries,
        );

        let reaper = LeaseReaper::new(
            self.store.clone(),
            self.clock.clone(),
            continuations.clone(),
        );
        let interval = self.options.reaper_interval;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { reaper.run(interval, rx).await }));

        let interval = self.options.continuation_interval;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { continuations.run(interval, rx).await }));

        let retention = RetentionSweeper::new(
            self.store.clone(),
            self.clock.clone(),
            self.options.retention.clone(),
        );
        tasks.push(tokio::spawn(async move { retention.run(shutdown_rx).await }));

        ServerHandle {
            shutdown: shutdown_tx,
            stopping,
            stats,
            tasks,
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    stopping: Arc<AtomicBool>,
    stats: WorkerStats,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stop leasing and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        info!("Shutting down background server");
        self.stopping.store(true, Ordering::Relaxed);
        let _ = self.shutdown.send(true);

        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        info!(
            processed = self.stats.processed(),
            succeeded = self.stats.succeeded(),
            failed = self.stats.failed(),
            "Background server stopped"
        );
    }
}
