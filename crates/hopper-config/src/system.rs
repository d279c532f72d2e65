//! Server configuration parsing.
//!
//! Every node is optional; anything left out takes the default shown in
//! [`SystemConfig::default`]. String values go through `${...}` interpolation
//! before they are interpreted.

use crate::{ConfigError, ConfigResult, VariableContext};
use hopper_core::cron::CronSchedule;
use hopper_core::{DEFAULT_QUEUE, OverlapPolicy, RetryPolicy};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Where jobs are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    /// Process-local; jobs do not survive a restart.
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::invalid(
                "database.backend",
                format!("unknown backend '{}', expected postgres or memory", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Prefix for worker ids.
    pub name: String,
    /// Number of worker loops.
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Scheduled jobs promoted per store round trip.
    pub batch_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub jitter: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub duration: Duration,
    pub heartbeat: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub succeeded: Duration,
    pub deleted: Duration,
    pub interval: Duration,
}

/// A `recurring` node, registered when the server starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringConfig {
    pub name: String,
    pub cron: String,
    pub handler: String,
    pub queue: String,
    pub overlap: OverlapPolicy,
    pub args: serde_json::Value,
    pub max_retries: Option<u32>,
}

/// Everything read from hopper.kdl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    /// Queues in the order workers poll them.
    pub queues: Vec<String>,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub lease: LeaseConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryPolicy,
    pub reaper: SweepConfig,
    pub continuations: SweepConfig,
    pub retention: RetentionConfig,
    pub recurring: Vec<RecurringConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                backend: StoreBackend::Postgres,
                url: None,
                max_connections: 10,
            },
            server: ServerConfig {
                name: "hopper".to_string(),
                concurrency: 4,
            },
            queues: vec![DEFAULT_QUEUE.to_string()],
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(1000),
                batch_size: 500,
            },
            dispatcher: DispatcherConfig {
                poll_interval: Duration::from_millis(500),
                max_wait: Duration::from_millis(5000),
                jitter: Duration::from_millis(100),
            },
            lease: LeaseConfig {
                duration: Duration::from_secs(300),
                heartbeat: Duration::from_secs(60),
            },
            execution: ExecutionConfig {
                timeout: Duration::from_secs(1800),
            },
            retry: RetryPolicy::default(),
            reaper: SweepConfig {
                interval: Duration::from_millis(5000),
            },
            continuations: SweepConfig {
                interval: Duration::from_millis(5000),
            },
            retention: RetentionConfig {
                succeeded: Duration::from_secs(24 * 3600),
                deleted: Duration::from_secs(24 * 3600),
                interval: Duration::from_secs(300),
            },
            recurring: Vec::new(),
        }
    }
}

impl SystemConfig {
    /// Cross-field checks. Run after command-line overrides are applied.
    pub fn validate(&self, vars: &VariableContext) -> ConfigResult<()> {
        if self.database.backend == StoreBackend::Postgres {
            let url = self
                .database
                .url
                .as_deref()
                .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
            let unresolved = vars.unresolved(url);
            if !unresolved.is_empty() {
                return Err(ConfigError::invalid(
                    "database.url",
                    format!("unresolved variables: {}", unresolved.join(", ")),
                ));
            }
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid(
                "database.max-connections",
                "must be at least 1",
            ));
        }
        if self.server.concurrency == 0 {
            return Err(ConfigError::invalid("server.concurrency", "must be at least 1"));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::MissingField("queues".to_string()));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::invalid("scheduler.batch-size", "must be at least 1"));
        }
        if self.lease.heartbeat >= self.lease.duration {
            return Err(ConfigError::invalid(
                "lease.heartbeat-secs",
                "must be shorter than lease duration",
            ));
        }
        if self.retry.max_backoff < self.retry.base_backoff {
            return Err(ConfigError::invalid(
                "retry.max-backoff-secs",
                "must not be shorter than base backoff",
            ));
        }
        Ok(())
    }
}

/// Read and parse a config file, interpolating from the process environment.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    parse_system_config_with(kdl, &VariableContext::from_process_env())
}

/// Parse system configuration from KDL text with an explicit variable context.
pub fn parse_system_config_with(kdl: &str, vars: &VariableContext) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut recurring_names = HashSet::new();

    for node in doc.nodes() {
        let p = Props { node, vars };
        match node.name().value() {
            "database" => {
                if let Some(backend) = p.string("backend") {
                    config.database.backend = backend.parse()?;
                }
                if let Some(url) = p.string("url") {
                    config.database.url = Some(url);
                }
                if let Some(n) = p.uint("max-connections")? {
                    config.database.max_connections = p.narrow("max-connections", n)?;
                }
            }
            "server" => {
                if let Some(name) = p.string("name") {
                    config.server.name = name;
                }
                if let Some(n) = p.uint("concurrency")? {
                    config.server.concurrency = p.narrow("concurrency", n)?;
                }
            }
            "queues" => {
                config.queues = p.args();
                if config.queues.is_empty() {
                    return Err(ConfigError::MissingField("queues".to_string()));
                }
            }
            "scheduler" => {
                if let Some(ms) = p.uint("poll-interval-ms")? {
                    config.scheduler.poll_interval = Duration::from_millis(ms);
                }
                if let Some(n) = p.uint("batch-size")? {
                    config.scheduler.batch_size = p.narrow("batch-size", n)?;
                }
            }
            "dispatcher" => {
                if let Some(ms) = p.uint("poll-interval-ms")? {
                    config.dispatcher.poll_interval = Duration::from_millis(ms);
                }
                if let Some(ms) = p.uint("max-wait-ms")? {
                    config.dispatcher.max_wait = Duration::from_millis(ms);
                }
                if let Some(ms) = p.uint("jitter-ms")? {
                    config.dispatcher.jitter = Duration::from_millis(ms);
                }
            }
            "lease" => {
                if let Some(secs) = p.uint("duration-secs")? {
                    config.lease.duration = Duration::from_secs(secs);
                }
                if let Some(secs) = p.uint("heartbeat-secs")? {
                    config.lease.heartbeat = Duration::from_secs(secs);
                }
            }
            "execution" => {
                if let Some(secs) = p.uint("timeout-secs")? {
                    config.execution.timeout = Duration::from_secs(secs);
                }
            }
            "retry" => {
                if let Some(n) = p.uint("max-retries")? {
                    config.retry.max_retries = p.narrow("max-retries", n)?;
                }
                if let Some(secs) = p.uint("base-backoff-secs")? {
                    config.retry.base_backoff = Duration::from_secs(secs);
                }
                if let Some(secs) = p.uint("max-backoff-secs")? {
                    config.retry.max_backoff = Duration::from_secs(secs);
                }
            }
            "reaper" => {
                if let Some(ms) = p.uint("interval-ms")? {
                    config.reaper.interval = Duration::from_millis(ms);
                }
            }
            "continuations" => {
                if let Some(ms) = p.uint("sweep-interval-ms")? {
                    config.continuations.interval = Duration::from_millis(ms);
                }
            }
            "retention" => {
                if let Some(retention) = p.hours("succeeded-hours")? {
                    config.retention.succeeded = retention;
                }
                if let Some(retention) = p.hours("deleted-hours")? {
                    config.retention.deleted = retention;
                }
                if let Some(secs) = p.uint("interval-secs")? {
                    config.retention.interval = Duration::from_secs(secs);
                }
            }
            "recurring" => {
                let recurring = parse_recurring(&p)?;
                if !recurring_names.insert(recurring.name.clone()) {
                    return Err(ConfigError::Duplicate(format!(
                        "recurring '{}'",
                        recurring.name
                    )));
                }
                config.recurring.push(recurring);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_recurring(p: &Props<'_>) -> ConfigResult<RecurringConfig> {
    let name = p
        .first_arg()
        .ok_or_else(|| ConfigError::MissingField("recurring name".to_string()))?;
    let field = |prop: &str| format!("recurring '{}' {}", name, prop);

    let cron = p
        .string("cron")
        .ok_or_else(|| ConfigError::MissingField(field("cron")))?;
    CronSchedule::parse(&cron).map_err(|e| ConfigError::invalid(field("cron"), e.to_string()))?;

    let handler = p
        .string("handler")
        .ok_or_else(|| ConfigError::MissingField(field("handler")))?;

    let overlap = match p.string("overlap") {
        Some(value) => value
            .parse::<OverlapPolicy>()
            .map_err(|e| ConfigError::invalid(field("overlap"), e.to_string()))?,
        None => OverlapPolicy::default(),
    };

    let args = match p.string("args") {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| ConfigError::invalid(field("args"), e.to_string()))?,
        None => serde_json::Value::Null,
    };

    let max_retries = match p.uint("max-retries")? {
        Some(n) => Some(p.narrow("max-retries", n)?),
        None => None,
    };

    Ok(RecurringConfig {
        cron,
        handler,
        queue: p.string("queue").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
        overlap,
        args,
        max_retries,
        name,
    })
}

// Helpers for extracting interpolated values from KDL nodes

struct Props<'a> {
    node: &'a KdlNode,
    vars: &'a VariableContext,
}

impl Props<'_> {
    fn field(&self, name: &str) -> String {
        format!("{}.{}", self.node.name().value(), name)
    }

    fn first_arg(&self) -> Option<String> {
        self.node
            .entries()
            .iter()
            .find(|e| e.name().is_none())
            .and_then(|e| e.value().as_string())
            .map(|s| self.vars.interpolate(s))
    }

    fn args(&self) -> Vec<String> {
        self.node
            .entries()
            .iter()
            .filter(|e| e.name().is_none())
            .filter_map(|e| e.value().as_string())
            .map(|s| self.vars.interpolate(s))
            .collect()
    }

    fn string(&self, name: &str) -> Option<String> {
        self.node
            .get(name)
            .and_then(|v| v.as_string())
            .map(|s| self.vars.interpolate(s))
    }

    /// A non-negative integer, written either as a number or as a string
    /// (so it can come from `${env.X}`).
    fn uint(&self, name: &str) -> ConfigResult<Option<u64>> {
        let Some(value) = self.node.get(name) else {
            return Ok(None);
        };
        let parsed = match value {
            KdlValue::Integer(n) => u64::try_from(*n).ok(),
            KdlValue::String(s) => self.vars.interpolate(s).trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| {
            ConfigError::invalid(
                self.field(name),
                format!("expected a non-negative integer, got {}", value),
            )
        })
    }

    fn hours(&self, name: &str) -> ConfigResult<Option<Duration>> {
        let Some(hours) = self.uint(name)? else {
            return Ok(None);
        };
        hours
            .checked_mul(3600)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| ConfigError::invalid(self.field(name), "value out of range"))
    }

    fn narrow<T: TryFrom<u64>>(&self, name: &str, n: u64) -> ConfigResult<T> {
        T::try_from(n).map_err(|_| ConfigError::invalid(self.field(name), "value out of range"))
    }
}
