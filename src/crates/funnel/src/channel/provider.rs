//! Tenant-bound channel resolution
//!
//! Components never hold a global client. They ask a [`ChannelProvider`] for
//! the tenant of the record at hand and receive a [`TenantBinding`].

use super::{HttpChannelClient, MessagingChannelClient};
use crate::config::TenantConfig;
use crate::error::{FunnelError, Result};
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// A channel client plus the tenant settings that go with it
#[derive(Clone)]
pub struct TenantBinding {
    pub tenant_id: String,
    pub client: Arc<dyn MessagingChannelClient>,
    /// Offset of the tenant's local calendar, used by weekday and range conditions
    pub utc_offset: FixedOffset,
    /// Free-form reply window
    pub activity_window: chrono::Duration,
    /// Amount charged per template message
    pub template_cost: f64,
}

impl TenantBinding {
    /// Binding with UTC calendar, 24h window and free templates
    pub fn new(tenant_id: impl Into<String>, client: Arc<dyn MessagingChannelClient>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client,
            utc_offset: Utc.fix(),
            activity_window: chrono::Duration::hours(24),
            template_cost: 0.0,
        }
    }

    /// Binding built from a tenant's config section
    pub fn from_config(
        tenant_id: impl Into<String>,
        client: Arc<dyn MessagingChannelClient>,
        config: &TenantConfig,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        let utc_offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            FunnelError::Configuration(format!(
                "tenant {} has an invalid utc_offset_minutes {}",
                tenant_id, config.utc_offset_minutes
            ))
        })?;

        Ok(Self {
            tenant_id,
            client,
            utc_offset,
            activity_window: chrono::Duration::hours(config.window_hours),
            template_cost: config.template_cost,
        })
    }
}

impl std::fmt::Debug for TenantBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantBinding")
            .field("tenant_id", &self.tenant_id)
            .field("utc_offset", &self.utc_offset)
            .field("activity_window", &self.activity_window)
            .field("template_cost", &self.template_cost)
            .finish()
    }
}

/// Resolves the channel binding of a tenant at call time
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Unknown tenants are configuration errors
    async fn resolve(&self, tenant_id: &str) -> Result<TenantBinding>;
}

/// Provider over the `[tenants.<id>]` sections of the config file
pub struct ConfiguredChannelProvider {
    bindings: HashMap<String, TenantBinding>,
}

impl ConfiguredChannelProvider {
    /// Build one HTTP client per configured tenant
    pub fn from_config(tenants: &HashMap<String, TenantConfig>) -> Result<Self> {
        let mut bindings = HashMap::with_capacity(tenants.len());
        for (tenant_id, config) in tenants {
            let client = HttpChannelClient::new(config)
                .map_err(|e| FunnelError::Configuration(format!("tenant {}: {}", tenant_id, e)))?;
            let binding = TenantBinding::from_config(tenant_id.clone(), Arc::new(client), config)?;
            bindings.insert(tenant_id.clone(), binding);
        }
        Ok(Self { bindings })
    }

    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

#[async_trait]
impl ChannelProvider for ConfiguredChannelProvider {
    async fn resolve(&self, tenant_id: &str) -> Result<TenantBinding> {
        self.bindings
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| FunnelError::Configuration(format!("no channel configured for tenant {}", tenant_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_tenant_is_configuration_error() {
        let mut tenants = HashMap::new();
        let mut config = TenantConfig::new("http://localhost:9");
        config.utc_offset_minutes = -180;
        config.window_hours = 12;
        tenants.insert("acme".to_string(), config);

        let provider = ConfiguredChannelProvider::from_config(&tenants).unwrap();
        let binding = provider.resolve("acme").await.unwrap();
        assert_eq!(binding.utc_offset.local_minus_utc(), -180 * 60);
        assert_eq!(binding.activity_window, chrono::Duration::hours(12));

        let err = provider.resolve("other").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let mut config = TenantConfig::new("http://localhost:9");
        config.utc_offset_minutes = 24 * 60;
        let client = Arc::new(HttpChannelClient::new(&config).unwrap());
        assert!(TenantBinding::from_config("acme", client, &config).is_err());
    }
}
