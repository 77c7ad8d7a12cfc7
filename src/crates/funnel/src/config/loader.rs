//! TOML configuration loader with environment variable support
//!
//! Values are resolved in order:
//! 1. Built-in defaults
//! 2. The TOML file passed on the command line (or `FUNNEL_CONFIG`)
//!
//! String values may reference `${ENV_VAR:default}`.

use crate::config::schema::FunnelConfig;
use crate::error::{FunnelError, Result};
use regex::Regex;
use std::env;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Loads [`FunnelConfig`] from TOML
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the config file at `path`, or defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<FunnelConfig> {
        let config = match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    FunnelError::Config(format!("Failed to read config {}: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), "Loaded config file");
                Self::from_toml(&content)?
            }
            None => {
                debug!("No config file given, using defaults");
                FunnelConfig::default()
            }
        };

        config.validate()?;
        info!(tenants = config.tenants.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Parse TOML text, expanding environment references in string values
    pub fn from_toml(content: &str) -> Result<FunnelConfig> {
        let mut value: toml::Value = toml::from_str(content)
            .map_err(|e| FunnelError::Config(format!("Failed to parse config: {}", e)))?;

        expand_variables(&mut value);

        value
            .try_into()
            .map_err(|e| FunnelError::Config(format!("Invalid config: {}", e)))
    }
}

impl FunnelConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_interval_ms == 0 {
            return Err(FunnelError::Config("scheduler.poll_interval_ms must be positive".into()));
        }
        if self.scheduler.batch_size <= 0 {
            return Err(FunnelError::Config("scheduler.batch_size must be positive".into()));
        }
        if self.worker.prefetch == 0 {
            return Err(FunnelError::Config("worker.prefetch must be positive".into()));
        }
        if self.interpreter.max_node_visits == 0 {
            return Err(FunnelError::Config("interpreter.max_node_visits must be positive".into()));
        }
        if self.bulk.max_concurrency == 0 {
            return Err(FunnelError::Config("bulk.max_concurrency must be positive".into()));
        }
        for (id, tenant) in &self.tenants {
            if tenant.base_url.trim().is_empty() {
                return Err(FunnelError::Config(format!("tenants.{}.base_url is empty", id)));
            }
            if tenant.window_hours <= 0 {
                return Err(FunnelError::Config(format!("tenants.{}.window_hours must be positive", id)));
            }
        }
        Ok(())
    }
}

fn env_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").ok())
        .as_ref()
}

/// Expand `${ENV_VAR:default}` in every string of a TOML tree
fn expand_variables(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if let Some(expanded) = expand_env_in_string(s) {
                *s = expanded;
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                expand_variables(v);
            }
        }
        toml::Value::Array(items) => {
            for item in items.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

fn expand_env_in_string(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }

    let expanded = env_pattern()?.replace_all(s, |caps: &regex::Captures<'_>| {
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
    });

    Some(expanded.into_owned())
}
