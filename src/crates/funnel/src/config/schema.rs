//! Configuration schema for the funnel worker

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main funnel configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunnelConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Due-record poller configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Queue consumer configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Campaign interpreter configuration
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Bulk send configuration
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Delivery callback configuration
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel settings per tenant id
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://funnel.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between claim attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum records claimed per tick
    #[serde(default = "default_claim_batch_size")]
    pub batch_size: i64,

    /// A processing record untouched for this long is re-claimed
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_claim_batch_size() -> i64 {
    50
}

fn default_stale_after_secs() -> u64 {
    600
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_claim_batch_size(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity written to `claimed_by`; a random suffix is appended per run
    #[serde(default = "default_worker_id")]
    pub id: String,

    /// Jobs processed concurrently per queue
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_worker_id() -> String {
    "funnel-worker".to_string()
}

fn default_prefetch() -> usize {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
            prefetch: default_prefetch(),
        }
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Delays up to this length are slept in-process
    #[serde(default = "default_short_delay_threshold_secs")]
    pub short_delay_threshold_secs: u64,

    /// Node id used when no node carries the start flag
    #[serde(default = "default_fallback_start_node")]
    pub fallback_start_node: String,

    /// Node visits allowed per run before the record fails
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,

    /// A freshly claimed record may be taken over for this long
    #[serde(default = "default_handoff_window_secs")]
    pub handoff_window_secs: u64,

    /// A processing record older than this is recovered
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_short_delay_threshold_secs() -> u64 {
    60
}

fn default_fallback_start_node() -> String {
    "start".to_string()
}

fn default_max_node_visits() -> usize {
    500
}

fn default_handoff_window_secs() -> u64 {
    30
}

impl InterpreterConfig {
    pub fn short_delay_threshold(&self) -> Duration {
        Duration::from_secs(self.short_delay_threshold_secs)
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            short_delay_threshold_secs: default_short_delay_threshold_secs(),
            fallback_start_node: default_fallback_start_node(),
            max_node_visits: default_max_node_visits(),
            handoff_window_secs: default_handoff_window_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Bulk send configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// How often a paused bulk send re-checks its status
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,

    /// Upper bound applied to a job's concurrency limit
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How often a running bulk send refreshes `updated_at` while it waits.
    /// Must stay well below the stale threshold.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_pause_poll_ms() -> u64 {
    1_000
}

fn default_max_concurrency() -> usize {
    50
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl BulkConfig {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: default_pause_poll_ms(),
            max_concurrency: default_max_concurrency(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interaction texts that add the sender to the block list
    #[serde(default = "default_opt_out_phrases")]
    pub opt_out_phrases: Vec<String>,

    /// Launch campaigns whose trigger phrase matches an interaction
    #[serde(default = "default_true")]
    pub launch_on_trigger: bool,
}

fn default_opt_out_phrases() -> Vec<String> {
    vec!["stop".to_string(), "unsubscribe".to_string(), "sair".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            opt_out_phrases: default_opt_out_phrases(),
            launch_on_trigger: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "compact", "pretty", "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Channel settings of one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Channel API base URL
    pub base_url: String,

    /// API token (supports `${ENV_VAR:default}`)
    #[serde(default)]
    pub api_token: Option<String>,

    /// Channel account the messages are sent from
    #[serde(default)]
    pub account_id: Option<String>,

    /// Offset of the tenant's local calendar from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Length of the free-form reply window
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,

    /// Amount charged per template message
    #[serde(default)]
    pub template_cost: f64,

    /// HTTP request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_window_hours() -> i64 {
    24
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl TenantConfig {
    /// Tenant settings for a channel reachable at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            account_id: None,
            utc_offset_minutes: 0,
            window_hours: default_window_hours(),
            template_cost: 0.0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
