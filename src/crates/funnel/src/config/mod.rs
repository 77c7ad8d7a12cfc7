//! Worker configuration: TOML schema and loader

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    BulkConfig, DatabaseConfig, FunnelConfig, InterpreterConfig, LoggingConfig, ReconcilerConfig,
    SchedulerConfig, TenantConfig, WorkerConfig,
};
