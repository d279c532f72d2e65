//! Recurring job commands.

use anyhow::Result;
use hopper_core::{OverlapPolicy, RecurringOptions};

use super::{Context, payload};

pub async fn add(
    ctx: &Context,
    name: &str,
    cron: &str,
    handler: &str,
    args: &str,
    queue: &str,
    overlap: &str,
) -> Result<()> {
    let options = RecurringOptions {
        queue: queue.to_string(),
        overlap: overlap.parse::<OverlapPolicy>()?,
        max_retries: None,
    };
    ctx.producer()
        .await?
        .add_or_update_recurring_with(name, cron, payload(handler, args)?, options)
        .await?;
    println!("Recurring job '{}' registered", name);
    Ok(())
}

pub async fn remove(ctx: &Context, name: &str) -> Result<()> {
    if ctx.producer().await?.remove_recurring(name).await? {
        println!("Recurring job '{}' removed", name);
    } else {
        println!("No recurring job named '{}'", name);
    }
    Ok(())
}

pub async fn list(ctx: &Context) -> Result<()> {
    let definitions = ctx.producer().await?.list_recurring().await?;
    if definitions.is_empty() {
        println!("No recurring jobs");
        return Ok(());
    }

    println!(
        "{:<20}  {:<20}  {:<20}  {:<6}  {:<20}  LAST FIRED",
        "NAME", "CRON", "HANDLER", "OVERLAP", "NEXT FIRE"
    );
    for def in &definitions {
        println!(
            "{:<20}  {:<20}  {:<20}  {:<6}  {:<20}  {}",
            def.name,
            def.cron_expression,
            def.payload_template.handler,
            def.overlap.as_str(),
            def.next_fire_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            def.last_fired_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

pub async fn trigger(ctx: &Context, name: &str) -> Result<()> {
    let id = ctx.producer().await?.trigger_recurring(name).await?;
    println!("{}", id);
    Ok(())
}
