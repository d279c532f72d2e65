//! hopper CLI and background server.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;

#[derive(Parser)]
#[command(name = "hopper")]
#[command(about = "Durable background job scheduler", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, global = true)]
    config: Option<String>,

    /// Database URL, overrides the config file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers, the scheduler and the sweepers until interrupted
    Serve,
    /// Enqueue a job for immediate execution
    Enqueue {
        /// Handler name
        handler: String,
        /// Handler arguments as JSON
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = hopper_core::DEFAULT_QUEUE)]
        queue: String,
        /// Override the configured retry count
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Enqueue a job after a delay
    Schedule {
        handler: String,
        /// Delay in seconds
        #[arg(long)]
        delay_secs: u64,
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = hopper_core::DEFAULT_QUEUE)]
        queue: String,
    },
    /// Run a job once its parent succeeds
    Continue {
        /// Parent job ID
        parent: String,
        handler: String,
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = hopper_core::DEFAULT_QUEUE)]
        queue: String,
    },
    /// Cancel a job that has not started yet
    Cancel {
        /// Job ID
        id: String,
    },
    /// Manage recurring jobs
    Recurring {
        #[command(subcommand)]
        command: RecurringCommands,
    },
    /// Inspect jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Show job counts per queue and state
    Stats,
    /// Enqueue one of the sample jobs
    Demo {
        #[arg(value_enum)]
        kind: DemoKind,
    },
    /// Validate the configuration and print it
    Validate,
}

#[derive(Subcommand)]
enum RecurringCommands {
    /// Create or replace a recurring job
    Add {
        name: String,
        /// Cron expression (5, 6 or 7 fields)
        cron: String,
        handler: String,
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = hopper_core::DEFAULT_QUEUE)]
        queue: String,
        /// skip or allow
        #[arg(long, default_value = "skip")]
        overlap: String,
    },
    /// Remove a recurring job
    Remove { name: String },
    /// List recurring jobs
    List,
    /// Enqueue one instance now
    Trigger { name: String },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs, oldest first
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        /// Show jobs created after this job ID (newer)
        #[arg(long)]
        after: Option<String>,
        /// Show jobs created before this job ID (older)
        #[arg(long)]
        before: Option<String>,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show a single job
    Show { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DemoKind {
    FireAndForget,
    Delayed,
    Recurring,
    Continuation,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let ctx = commands::Context::new(cli.config, cli.database_url);

    match cli.command {
        Commands::Serve => commands::serve::run(&ctx).await?,
        Commands::Enqueue {
            handler,
            args,
            queue,
            max_retries,
        } => commands::jobs::enqueue(&ctx, &handler, &args, &queue, max_retries).await?,
        Commands::Schedule {
            handler,
            delay_secs,
            args,
            queue,
        } => commands::jobs::schedule(&ctx, &handler, &args, &queue, delay_secs).await?,
        Commands::Continue {
            parent,
            handler,
            args,
            queue,
        } => commands::jobs::continue_with(&ctx, &parent, &handler, &args, &queue).await?,
        Commands::Cancel { id } => commands::jobs::cancel(&ctx, &id).await?,
        Commands::Recurring { command } => match command {
            RecurringCommands::Add {
                name,
                cron,
                handler,
                args,
                queue,
                overlap,
            } => {
                commands::recurring::add(&ctx, &name, &cron, &handler, &args, &queue, &overlap)
                    .await?
            }
            RecurringCommands::Remove { name } => commands::recurring::remove(&ctx, &name).await?,
            RecurringCommands::List => commands::recurring::list(&ctx).await?,
            RecurringCommands::Trigger { name } => {
                commands::recurring::trigger(&ctx, &name).await?
            }
        },
        Commands::Jobs { command } => match command {
            JobCommands::List {
                state,
                queue,
                after,
                before,
                limit,
            } => commands::jobs::list(&ctx, state, queue, after, before, limit).await?,
            JobCommands::Show { id } => commands::jobs::show(&ctx, &id).await?,
        },
        Commands::Stats => commands::jobs::stats(&ctx).await?,
        Commands::Demo { kind } => commands::demo::run(&ctx, kind).await?,
        Commands::Validate => commands::validate(&ctx)?,
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
