//! Block-list repository

use crate::db::connection::DatabasePool;
use crate::db::models::block_list::{addresses_match, normalize_address};
use crate::db::models::BlockListEntry;
use crate::db::{timestamp, DbResult};
use chrono::{DateTime, Utc};

/// Block-list repository
pub struct BlockListRepository;

impl BlockListRepository {
    /// Block an address. Adding an address twice keeps the first reason.
    pub async fn add(
        pool: &DatabasePool,
        tenant_id: &str,
        address: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO block_list (tenant_id, address, reason, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(normalize_address(address))
        .bind(reason)
        .bind(timestamp(now))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Every blocked address of a tenant
    pub async fn list(pool: &DatabasePool, tenant_id: &str) -> DbResult<Vec<BlockListEntry>> {
        let entries = sqlx::query_as::<_, BlockListEntry>(
            "SELECT * FROM block_list WHERE tenant_id = ? ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;

        Ok(entries)
    }

    /// Whether `address` suffix-matches any blocked address of the tenant
    pub async fn is_blocked(pool: &DatabasePool, tenant_id: &str, address: &str) -> DbResult<bool> {
        let entries = Self::list(pool, tenant_id).await?;
        Ok(entries.iter().any(|entry| addresses_match(&entry.address, address)))
    }

    /// Unblock an address
    pub async fn remove(pool: &DatabasePool, tenant_id: &str, address: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM block_list WHERE tenant_id = ? AND address = ?")
            .bind(tenant_id)
            .bind(normalize_address(address))
            .execute(pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
