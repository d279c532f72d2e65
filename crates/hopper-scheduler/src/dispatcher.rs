//! Queue dispatcher.
//!
//! Bridges idle workers to leasable jobs. Polls the store with a jittered
//! interval so a fleet of idle workers does not hit the database in lockstep.

use hopper_core::{Clock, Job, Result};
use hopper_db::JobStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::time::{pause, to_chrono};

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub poll_interval: Duration,
    /// How long `next` keeps polling before giving up with `Timeout`.
    pub max_wait: Duration,
    /// Random extra delay added to each poll, up to this much.
    pub jitter: Duration,
    /// Visibility timeout granted with each lease.
    pub lease_duration: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
            lease_duration: Duration::from_secs(300),
        }
    }
}

/// Result of waiting for work.
#[derive(Debug)]
pub enum Dispatch {
    Leased(Box<Job>),
    Timeout,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, options: DispatcherOptions) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// One leasing attempt over `queues`, in order.
    pub async fn try_lease(&self, queues: &[String], worker_id: &str) -> Result<Option<Job>> {
        let lease = to_chrono(self.options.lease_duration);
        for queue in queues {
            if let Some(job) = self
                .store
                .acquire_lease(queue, worker_id, lease, self.clock.now())
                .await?
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Wait up to `max_wait` for a job on `queue`.
    pub async fn next(&self, queue: &str, worker_id: &str) -> Result<Dispatch> {
        self.poll(&[queue.to_string()], worker_id, None).await
    }

    /// Wait up to `max_wait` for a job on any of `queues`, returning early
    /// with `Timeout` if shutdown is requested.
    pub async fn next_from(
        &self,
        queues: &[String],
        worker_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Dispatch> {
        self.poll(queues, worker_id, Some(shutdown)).await
    }

    async fn poll(
        &self,
        queues: &[String],
        worker_id: &str,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Dispatch> {
        let deadline = Instant::now() + self.options.max_wait;

        loop {
            match self.try_lease(queues, worker_id).await {
                Ok(Some(job)) => return Ok(Dispatch::Leased(Box::new(job))),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(worker_id = %worker_id, error = %e, "Store unavailable while leasing");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Dispatch::Timeout);
            }
            let delay = self.poll_delay().min(deadline - now);
            match shutdown.as_deref_mut() {
                Some(rx) => {
                    if pause(delay, rx).await {
                        return Ok(Dispatch::Timeout);
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn poll_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.options.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.options.poll_interval;
        }
        let extra = rand::rng().random_range(0..=jitter_ms);
        self.options.poll_interval + Duration::from_millis(extra)
    }
}
