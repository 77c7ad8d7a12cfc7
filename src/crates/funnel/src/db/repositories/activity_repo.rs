//! Recent-activity cache repository

use crate::db::connection::DatabasePool;
use crate::db::models::block_list::normalize_address;
use crate::db::models::RecentActivity;
use crate::db::{timestamp, DbResult};
use chrono::{DateTime, Utc};

/// Recent-activity repository
pub struct ActivityRepository;

impl ActivityRepository {
    /// Cached activity for a recipient
    pub async fn get(pool: &DatabasePool, tenant_id: &str, address: &str) -> DbResult<Option<RecentActivity>> {
        let activity = sqlx::query_as::<_, RecentActivity>(
            "SELECT * FROM recent_activity WHERE tenant_id = ? AND address = ?",
        )
        .bind(tenant_id)
        .bind(normalize_address(address))
        .fetch_optional(pool)
        .await?;

        Ok(activity)
    }

    /// Remember the conversation resolved for a recipient
    pub async fn upsert_conversation(
        pool: &DatabasePool,
        tenant_id: &str,
        address: &str,
        conversation_ref: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO recent_activity (tenant_id, address, last_inbound_at, conversation_ref, updated_at)
             VALUES (?, ?, NULL, ?, ?)
             ON CONFLICT(tenant_id, address)
             DO UPDATE SET conversation_ref = excluded.conversation_ref, updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(normalize_address(address))
        .bind(conversation_ref)
        .bind(timestamp(now))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Record an inbound message from the recipient at `at`
    pub async fn record_inbound(
        pool: &DatabasePool,
        tenant_id: &str,
        address: &str,
        conversation_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO recent_activity (tenant_id, address, last_inbound_at, conversation_ref, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, address)
             DO UPDATE SET last_inbound_at = excluded.last_inbound_at,
                           conversation_ref = COALESCE(excluded.conversation_ref, recent_activity.conversation_ref),
                           updated_at = excluded.updated_at",
        )
        .bind(tenant_id)
        .bind(normalize_address(address))
        .bind(timestamp(at))
        .bind(conversation_ref)
        .bind(timestamp(at))
        .execute(pool)
        .await?;

        Ok(())
    }
}
