//! Campaign repository

use crate::db::connection::DatabasePool;
use crate::db::models::Campaign;
use crate::db::{DatabaseError, DbResult};
use crate::text;

/// Campaign repository
pub struct CampaignRepository;

impl CampaignRepository {
    /// Insert a campaign
    pub async fn create(pool: &DatabasePool, campaign: &Campaign) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO campaigns (id, tenant_id, name, definition, trigger_phrase, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&campaign.id)
        .bind(&campaign.tenant_id)
        .bind(&campaign.name)
        .bind(&campaign.definition)
        .bind(&campaign.trigger_phrase)
        .bind(&campaign.created_at)
        .bind(&campaign.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get a campaign by ID
    pub async fn get_by_id(pool: &DatabasePool, id: &str) -> DbResult<Option<Campaign>> {
        let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(campaign)
    }

    /// Get a campaign by ID, failing with NotFound when missing
    pub async fn require(pool: &DatabasePool, id: &str) -> DbResult<Campaign> {
        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| DatabaseError::not_found(format!("campaign {}", id)))
    }

    /// Campaigns of a tenant, oldest first
    pub async fn list_by_tenant(pool: &DatabasePool, tenant_id: &str) -> DbResult<Vec<Campaign>> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE tenant_id = ? ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;

        Ok(campaigns)
    }

    /// First campaign of the tenant whose trigger phrase equals `input` after folding
    pub async fn find_by_trigger(pool: &DatabasePool, tenant_id: &str, input: &str) -> DbResult<Option<Campaign>> {
        let folded = text::fold(input);
        if folded.is_empty() {
            return Ok(None);
        }

        let candidates = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE tenant_id = ? AND trigger_phrase IS NOT NULL ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;

        Ok(candidates.into_iter().find(|campaign| {
            campaign
                .trigger_phrase
                .as_deref()
                .map(|phrase| text::fold(phrase) == folded)
                .unwrap_or(false)
        }))
    }
}
