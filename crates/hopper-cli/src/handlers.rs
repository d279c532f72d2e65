//! Built-in sample handlers, one per kind of background job.

use hopper_core::{HandlerRegistry, JobContext, JobResult};
use serde_json::Value;
use tracing::info;

pub const FIRE_AND_FORGET: &str = "fire_and_forget";
pub const DELAYED: &str = "delayed";
pub const RECURRING: &str = "recurring";
pub const CONTINUATION: &str = "continuation";

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(FIRE_AND_FORGET, fire_and_forget)
        .register_fn(DELAYED, delayed)
        .register_fn(RECURRING, recurring)
        .register_fn(CONTINUATION, continuation);
    registry
}

async fn fire_and_forget(ctx: JobContext, args: Value) -> JobResult {
    info!(job_id = %ctx.job_id, args = %args, "Fire-and-forget job executed");
    Ok(())
}

async fn delayed(ctx: JobContext, args: Value) -> JobResult {
    info!(job_id = %ctx.job_id, args = %args, "Delayed job executed");
    Ok(())
}

async fn recurring(ctx: JobContext, args: Value) -> JobResult {
    info!(job_id = %ctx.job_id, args = %args, "Recurring job executed");
    Ok(())
}

async fn continuation(ctx: JobContext, args: Value) -> JobResult {
    info!(job_id = %ctx.job_id, args = %args, "Continuation job executed");
    Ok(())
}
