//! Job commands.

use anyhow::Result;
use hopper_core::{Job, JobQuery, JobState, NewJob, Page};
use std::time::Duration;

use super::{Context, parse_id, payload};

pub async fn enqueue(
    ctx: &Context,
    handler: &str,
    args: &str,
    queue: &str,
    max_retries: Option<u32>,
) -> Result<()> {
    let mut new = NewJob::new(payload(handler, args)?).on_queue(queue);
    new.max_retries = max_retries;
    let id = ctx.producer().await?.enqueue_job(new).await?;
    println!("{}", id);
    Ok(())
}

pub async fn schedule(
    ctx: &Context,
    handler: &str,
    args: &str,
    queue: &str,
    delay_secs: u64,
) -> Result<()> {
    let id = ctx
        .producer()
        .await?
        .schedule(queue, payload(handler, args)?, Duration::from_secs(delay_secs))
        .await?;
    println!("{}", id);
    Ok(())
}

pub async fn continue_with(
    ctx: &Context,
    parent: &str,
    handler: &str,
    args: &str,
    queue: &str,
) -> Result<()> {
    let parent = parse_id(parent)?;
    let new = NewJob::new(payload(handler, args)?).on_queue(queue);
    let id = ctx.producer().await?.continue_with_job(parent, new).await?;
    println!("{}", id);
    Ok(())
}

pub async fn cancel(ctx: &Context, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    ctx.producer().await?.cancel(id).await?;
    println!("Cancelled {}", id);
    Ok(())
}

pub async fn list(
    ctx: &Context,
    state: Option<String>,
    queue: Option<String>,
    after: Option<String>,
    before: Option<String>,
    limit: u32,
) -> Result<()> {
    let mut query = JobQuery::new().limit(limit);
    if let Some(state) = state {
        query = query.in_state(state.parse::<JobState>()?);
    }
    if let Some(queue) = queue {
        query = query.on_queue(queue);
    }
    if let Some(after) = after {
        query = query.after(parse_id(&after)?);
    }
    if let Some(before) = before {
        query = query.before(parse_id(&before)?);
    }

    let page = ctx.monitor().await?.query(&query).await?;
    if page.items.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<12}  {:<20}  {:>5}  CREATED",
        "ID", "STATE", "QUEUE", "HANDLER", "TRIES"
    );
    for job in &page.items {
        println!("{}", row(job));
    }
    let hints = paging_hints(&page);
    if !hints.is_empty() {
        println!();
    }
    for hint in hints {
        println!("{}", hint);
    }
    Ok(())
}

/// Pages run oldest first, so `--after` moves towards newer jobs.
fn paging_hints(page: &Page<Job>) -> Vec<String> {
    let mut hints = Vec::new();
    if let Some(cursor) = page.next_cursor {
        hints.push(format!("Newer: --after {}", cursor));
    }
    if let Some(cursor) = page.prev_cursor {
        hints.push(format!("Older: --before {}", cursor));
    }
    hints
}

pub async fn show(ctx: &Context, id: &str) -> Result<()> {
    let job = ctx.monitor().await?.job(parse_id(id)?).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn stats(ctx: &Context) -> Result<()> {
    let monitor = ctx.monitor().await?;
    let counts = monitor.counts().await?;
    if counts.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    println!("{:<20}  {:<10}  {:>8}", "QUEUE", "STATE", "COUNT");
    for count in &counts {
        println!("{:<20}  {:<10}  {:>8}", count.queue, count.state, count.count);
    }
    println!();
    for (state, total) in monitor.state_totals().await? {
        println!("{:<10}  {:>8}", state, total);
    }
    Ok(())
}

fn row(job: &Job) -> String {
    format!(
        "{:<36}  {:<10}  {:<12}  {:<20}  {:>5}  {}",
        job.id,
        job.state,
        job.queue,
        job.payload.handler,
        job.attempts,
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    )
}
