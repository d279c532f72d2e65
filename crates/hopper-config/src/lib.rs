//! KDL configuration parsing for hopper.
//!
//! This crate handles parsing of:
//! - Server configuration (hopper.kdl)
//! - Recurring job definitions registered at startup
//! - Variable interpolation

pub mod error;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, DispatcherConfig, ExecutionConfig, LeaseConfig, RecurringConfig,
    RetentionConfig, SchedulerConfig, ServerConfig, StoreBackend, SweepConfig, SystemConfig,
    load_system_config, parse_system_config, parse_system_config_with,
};
pub use variables::VariableContext;
