//! Campaign model for database persistence

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An authored campaign ("funnel")
///
/// `definition` holds either a node/edge graph or a legacy ordered step list,
/// see [`crate::graph::CampaignDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    /// Unique campaign identifier (UUID string)
    pub id: String,

    /// Owning tenant
    pub tenant_id: String,

    /// Display name
    pub name: String,

    /// Graph definition as JSON text
    pub definition: String,

    /// Interaction text that launches this campaign, if any
    pub trigger_phrase: Option<String>,

    /// Creation timestamp (RFC 3339)
    pub created_at: String,

    /// Last update timestamp (RFC 3339)
    pub updated_at: String,
}

impl Campaign {
    /// Create a new campaign with a fresh id
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, definition: impl Into<String>) -> Self {
        let now = crate::db::timestamp(chrono::Utc::now());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            definition: definition.into(),
            trigger_phrase: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Builder method to set the trigger phrase
    pub fn with_trigger_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.trigger_phrase = Some(phrase.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_creation() {
        let campaign = Campaign::new("tenant-1", "Welcome", "[]").with_trigger_phrase("hello");

        assert_eq!(campaign.tenant_id, "tenant-1");
        assert_eq!(campaign.name, "Welcome");
        assert_eq!(campaign.trigger_phrase.as_deref(), Some("hello"));
        assert!(uuid::Uuid::parse_str(&campaign.id).is_ok());
    }
}
