//! CLI command implementations.

pub mod demo;
pub mod jobs;
pub mod recurring;
pub mod serve;

use anyhow::{Context as _, Result};
use hopper_config::{StoreBackend, SystemConfig, VariableContext, load_system_config};
use hopper_core::{JobId, Payload, SystemClock};
use hopper_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use hopper_scheduler::{Monitor, Producer};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "hopper.kdl";

/// Global options shared by every command.
pub struct Context {
    config_path: Option<String>,
    database_url: Option<String>,
}

impl Context {
    pub fn new(config_path: Option<String>, database_url: Option<String>) -> Self {
        Self {
            config_path,
            database_url,
        }
    }

    /// Load and validate the configuration, applying command-line overrides.
    pub fn config(&self) -> Result<SystemConfig> {
        let mut config = match &self.config_path {
            Some(path) => load_system_config(path)
                .with_context(|| format!("Failed to load config file: {}", path))?,
            None if Path::new(DEFAULT_CONFIG).exists() => load_system_config(DEFAULT_CONFIG)
                .with_context(|| format!("Failed to load config file: {}", DEFAULT_CONFIG))?,
            None => SystemConfig::default(),
        };

        if let Some(url) = &self.database_url {
            config.database.url = Some(url.clone());
        }

        config
            .validate(&VariableContext::from_process_env())
            .context("Invalid configuration")?;
        Ok(config)
    }

    pub async fn store(&self, config: &SystemConfig) -> Result<Arc<dyn JobStore>> {
        match config.database.backend {
            StoreBackend::Postgres => {
                let url = config
                    .database
                    .url
                    .as_deref()
                    .context("No database URL configured")?;
                info!("Connecting to database...");
                let pool = create_pool(url, config.database.max_connections)
                    .await
                    .context("Failed to connect to database")?;
                run_migrations(&pool)
                    .await
                    .context("Failed to run migrations")?;
                info!("Database connected");
                Ok(Arc::new(PgJobStore::new(pool)))
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; jobs are lost when this process exits");
                Ok(Arc::new(MemoryJobStore::new()))
            }
        }
    }

    /// Producer for one-shot commands. Needs a store that outlives the process.
    pub async fn producer(&self) -> Result<Producer> {
        let config = self.config()?;
        require_durable(&config)?;
        let store = self.store(&config).await?;
        Ok(Producer::new(store, Arc::new(SystemClock), config.retry))
    }

    pub async fn monitor(&self) -> Result<Monitor> {
        let config = self.config()?;
        require_durable(&config)?;
        Ok(Monitor::new(self.store(&config).await?))
    }
}

/// Only `serve` can use the in-memory store: anything a one-shot command
/// writes there is gone when it exits.
fn require_durable(config: &SystemConfig) -> Result<()> {
    if config.database.backend == StoreBackend::Memory {
        anyhow::bail!(
            "The in-memory store only lives inside `hopper serve`; configure a postgres database for this command"
        );
    }
    Ok(())
}

pub fn parse_id(id: &str) -> Result<JobId> {
    id.parse()
        .with_context(|| format!("Invalid job ID: {}", id))
}

pub fn payload(handler: &str, args: &str) -> Result<Payload> {
    let args = serde_json::from_str(args)
        .with_context(|| format!("Handler arguments are not valid JSON: {}", args))?;
    Ok(Payload::new(handler, args))
}

pub fn validate(ctx: &Context) -> Result<()> {
    match ctx.config() {
        Ok(config) => {
            println!("Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
