//! `hopper serve`: run the background server until Ctrl-C.

use anyhow::{Context as _, Result};
use hopper_config::SystemConfig;
use hopper_core::{Payload, RecurringOptions};
use hopper_scheduler::{
    BackgroundServer, DispatcherOptions, RetentionOptions, SchedulerOptions, ServerOptions,
    WorkerOptions,
};
use tracing::info;

use super::Context;
use crate::handlers;

pub async fn run(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config).await?;

    let server = BackgroundServer::new(store, handlers::registry(), server_options(&config));

    let producer = server.producer();
    for recurring in &config.recurring {
        producer
            .add_or_update_recurring_with(
                &recurring.name,
                &recurring.cron,
                Payload::new(recurring.handler.clone(), recurring.args.clone()),
                RecurringOptions {
                    queue: recurring.queue.clone(),
                    overlap: recurring.overlap,
                    max_retries: recurring.max_retries,
                },
            )
            .await
            .with_context(|| format!("Failed to register recurring job '{}'", recurring.name))?;
    }

    let handle = server.start();
    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    handle.shutdown().await;
    Ok(())
}

pub fn server_options(config: &SystemConfig) -> ServerOptions {
    ServerOptions {
        name: config.server.name.clone(),
        concurrency: config.server.concurrency,
        scheduler: SchedulerOptions {
            poll_interval: config.scheduler.poll_interval,
            batch_size: config.scheduler.batch_size,
            default_max_retries: config.retry.max_retries,
        },
        worker: WorkerOptions {
            queues: config.queues.clone(),
            dispatcher: DispatcherOptions {
                poll_interval: config.dispatcher.poll_interval,
                max_wait: config.dispatcher.max_wait,
                jitter: config.dispatcher.jitter,
                lease_duration: config.lease.duration,
            },
            heartbeat: config.lease.heartbeat,
            timeout: config.execution.timeout,
            retry: config.retry.clone(),
        },
        reaper_interval: config.reaper.interval,
        continuation_interval: config.continuations.interval,
        retention: RetentionOptions {
            succeeded: config.retention.succeeded,
            deleted: config.retention.deleted,
            interval: config.retention.interval,
            ..Default::default()
        },
    }
}
