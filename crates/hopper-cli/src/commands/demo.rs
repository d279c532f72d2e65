//! Enqueue the sample jobs handled by the built-in handlers.

use anyhow::Result;
use hopper_core::cron::Cron;
use hopper_core::{DEFAULT_QUEUE, Payload};
use std::time::Duration;

use super::Context;
use crate::DemoKind;
use crate::handlers::{CONTINUATION, DELAYED, FIRE_AND_FORGET, RECURRING};

/// Name the sample recurring job is registered under.
const RECURRING_NAME: &str = "sample-recurring";

const DELAY: Duration = Duration::from_secs(60);

pub async fn run(ctx: &Context, kind: DemoKind) -> Result<()> {
    let producer = ctx.producer().await?;

    match kind {
        DemoKind::FireAndForget => {
            let id = producer
                .enqueue(DEFAULT_QUEUE, Payload::bare(FIRE_AND_FORGET))
                .await?;
            println!("Enqueued fire-and-forget job {}", id);
        }
        DemoKind::Delayed => {
            let id = producer
                .schedule(DEFAULT_QUEUE, Payload::bare(DELAYED), DELAY)
                .await?;
            println!("Scheduled delayed job {} in {:?}", id, DELAY);
        }
        DemoKind::Recurring => {
            producer
                .add_or_update_recurring(RECURRING_NAME, &Cron::minutely(), Payload::bare(RECURRING))
                .await?;
            println!("Registered recurring job '{}' (every minute)", RECURRING_NAME);
        }
        DemoKind::Continuation => {
            let parent = producer
                .enqueue(DEFAULT_QUEUE, Payload::bare(FIRE_AND_FORGET))
                .await?;
            let child = producer
                .continue_with(parent, Payload::bare(CONTINUATION))
                .await?;
            println!("Enqueued job {} with continuation {}", parent, child);
        }
    }
    Ok(())
}
