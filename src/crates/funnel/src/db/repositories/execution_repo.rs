//! Execution repository for database operations
//!
//! Every counter update is an in-place `col = col + ?` so the orchestrator and
//! the reconciler never overwrite each other's increments.

use crate::db::connection::DatabasePool;
use crate::db::models::{ExecutionRecord, ExecutionStatus};
use crate::db::{timestamp, DatabaseError, DbResult};
use chrono::{DateTime, Utc};

/// Signed adjustments applied to an execution's counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterDelta {
    pub sent: i64,
    pub failed: i64,
    pub delivered: i64,
    pub read: i64,
    pub interactions: i64,
    pub blocked: i64,
    pub cost: f64,
}

impl CounterDelta {
    /// One successful send charged at `cost`
    pub fn sent(cost: f64) -> Self {
        Self {
            sent: 1,
            cost,
            ..Default::default()
        }
    }

    /// One failed send
    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Default::default()
        }
    }

    /// One block-listed recipient
    pub fn blocked() -> Self {
        Self {
            blocked: 1,
            ..Default::default()
        }
    }

    /// One first-time interaction
    pub fn interaction() -> Self {
        Self {
            interactions: 1,
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::Add for CounterDelta {
    type Output = CounterDelta;

    fn add(self, other: CounterDelta) -> CounterDelta {
        CounterDelta {
            sent: self.sent + other.sent,
            failed: self.failed + other.failed,
            delivered: self.delivered + other.delivered,
            read: self.read + other.read,
            interactions: self.interactions + other.interactions,
            blocked: self.blocked + other.blocked,
            cost: self.cost + other.cost,
        }
    }
}

/// Execution repository for managing execution record database operations
pub struct ExecutionRepository;

impl ExecutionRepository {
    /// Insert a new execution record
    pub async fn create(pool: &DatabasePool, record: &ExecutionRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO executions (
                id, tenant_id, kind, campaign_id, parent_id, recipient_address, conversation_ref,
                status, current_node_id, current_step_index, scheduled_at, contacts_list,
                processed_contacts, pending_contacts, sent, failed, delivered, read_count,
                interactions, blocked, cost, bulk_options, failure_reason, claimed_by,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.kind)
        .bind(&record.campaign_id)
        .bind(&record.parent_id)
        .bind(&record.recipient_address)
        .bind(&record.conversation_ref)
        .bind(&record.status)
        .bind(&record.current_node_id)
        .bind(record.current_step_index)
        .bind(&record.scheduled_at)
        .bind(&record.contacts_list)
        .bind(&record.processed_contacts)
        .bind(&record.pending_contacts)
        .bind(record.sent)
        .bind(record.failed)
        .bind(record.delivered)
        .bind(record.read_count)
        .bind(record.interactions)
        .bind(record.blocked)
        .bind(record.cost)
        .bind(&record.bulk_options)
        .bind(&record.failure_reason)
        .bind(&record.claimed_by)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get an execution by ID
    pub async fn get_by_id(pool: &DatabasePool, id: &str) -> DbResult<Option<ExecutionRecord>> {
        let record = sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(record)
    }

    /// Get an execution by ID, failing with NotFound when missing
    pub async fn require(pool: &DatabasePool, id: &str) -> DbResult<ExecutionRecord> {
        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| DatabaseError::not_found(format!("execution {}", id)))
    }

    /// List records rolled up into a bulk send or aggregator
    pub async fn list_children(pool: &DatabasePool, parent_id: &str) -> DbResult<Vec<ExecutionRecord>> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions WHERE parent_id = ? ORDER BY created_at",
        )
        .bind(parent_id)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Find the aggregator record of a campaign
    pub async fn find_aggregator(
        pool: &DatabasePool,
        tenant_id: &str,
        campaign_id: &str,
    ) -> DbResult<Option<ExecutionRecord>> {
        let record = sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions
             WHERE kind = 'aggregator' AND tenant_id = ? AND campaign_id = ?
             ORDER BY created_at LIMIT 1",
        )
        .bind(tenant_id)
        .bind(campaign_id)
        .fetch_optional(pool)
        .await?;

        Ok(record)
    }

    /// Claim up to `limit` eligible records and flip them to `processing`.
    ///
    /// Eligible means `queued` with `scheduled_at <= now`, or `processing`
    /// without an update since `stale_before` (crashed worker). The select and
    /// the update run as one statement; SQLite serializes writers, so a row
    /// claimed by one scheduler is no longer eligible for another. This is the
    /// SQLite equivalent of `FOR UPDATE SKIP LOCKED`.
    ///
    /// `claimed_by` is cleared: the record now waits for a worker handoff.
    pub async fn claim_due(
        pool: &DatabasePool,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<ExecutionRecord>> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            "UPDATE executions
             SET status = 'processing', claimed_by = NULL, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM executions
                 WHERE kind != 'aggregator'
                   AND ((status = 'queued' AND scheduled_at <= ?1)
                     OR (status = 'processing' AND updated_at <= ?2))
                 ORDER BY scheduled_at
                 LIMIT ?3
             )
             RETURNING *",
        )
        .bind(timestamp(now))
        .bind(timestamp(stale_before))
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Take ownership of a record with compare-and-set on its last update.
    ///
    /// Returns false when another worker changed the record since it was read.
    pub async fn take_ownership(
        pool: &DatabasePool,
        record: &ExecutionRecord,
        owner: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE executions
             SET status = 'processing', claimed_by = ?, updated_at = ?
             WHERE id = ? AND status = ? AND updated_at = ? AND COALESCE(claimed_by, '') = ?",
        )
        .bind(owner)
        .bind(timestamp(now))
        .bind(&record.id)
        .bind(&record.status)
        .bind(&record.updated_at)
        .bind(record.claimed_by.as_deref().unwrap_or(""))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist the graph cursor after a node transition
    pub async fn advance_node(
        pool: &DatabasePool,
        id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE executions SET current_node_id = ?, updated_at = ? WHERE id = ?")
            .bind(node_id)
            .bind(timestamp(now))
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Persist the legacy step cursor after a step completes
    pub async fn advance_step(
        pool: &DatabasePool,
        id: &str,
        step_index: i64,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE executions SET current_step_index = ?, updated_at = ? WHERE id = ?")
            .bind(step_index)
            .bind(timestamp(now))
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Park a record until `resume_at`; the scheduler picks it up from there.
    ///
    /// Exactly one of `node_id` / `step_index` is expected to be set.
    pub async fn suspend(
        pool: &DatabasePool,
        id: &str,
        node_id: Option<&str>,
        step_index: Option<i64>,
        resume_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions
             SET status = 'queued', claimed_by = NULL, current_node_id = ?, current_step_index = ?,
                 scheduled_at = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('cancelling', 'cancelled')",
        )
        .bind(node_id)
        .bind(step_index)
        .bind(timestamp(resume_at))
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Remember the conversation resolved for the recipient
    pub async fn set_conversation_ref(pool: &DatabasePool, id: &str, conversation_ref: &str) -> DbResult<()> {
        sqlx::query("UPDATE executions SET conversation_ref = ? WHERE id = ?")
            .bind(conversation_ref)
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Refresh `updated_at` of a record `owner` still holds.
    ///
    /// Returns false once ownership moved to another worker.
    pub async fn heartbeat(pool: &DatabasePool, id: &str, owner: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query("UPDATE executions SET updated_at = ? WHERE id = ? AND claimed_by = ?")
            .bind(timestamp(now))
            .bind(id)
            .bind(owner)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finish cancellations nobody is left to observe.
    ///
    /// A `cancelling` record untouched since `stale_before` has no live worker
    /// (running ones heartbeat), so it is moved to `cancelled`. Returns the ids.
    pub async fn finalize_stale_cancelling(
        pool: &DatabasePool,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "UPDATE executions
             SET status = 'cancelled', claimed_by = NULL, updated_at = ?
             WHERE status = 'cancelling' AND updated_at <= ?
             RETURNING id",
        )
        .bind(timestamp(now))
        .bind(timestamp(stale_before))
        .fetch_all(pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Move to `to` only if the current status is one of `from`
    pub async fn transition_status(
        pool: &DatabasePool,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE executions SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(timestamp(now)).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark execution as completed unless a cancellation was requested
    pub async fn mark_completed(pool: &DatabasePool, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions SET status = 'completed', claimed_by = NULL, updated_at = ?
             WHERE id = ? AND status NOT IN ('cancelling', 'cancelled')",
        )
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark execution as failed with a stored reason unless a cancellation was requested
    pub async fn mark_failed(pool: &DatabasePool, id: &str, reason: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions
             SET status = 'failed', failure_reason = ?, claimed_by = NULL, updated_at = ?
             WHERE id = ? AND status NOT IN ('cancelling', 'cancelled')",
        )
        .bind(reason)
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark execution as cancelled
    pub async fn mark_cancelled(pool: &DatabasePool, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions SET status = 'cancelled', claimed_by = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Apply counter deltas against the persisted values
    pub async fn apply_counters(
        pool: &DatabasePool,
        id: &str,
        delta: &CounterDelta,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        if delta.is_zero() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE executions
             SET sent = sent + ?, failed = failed + ?, delivered = delivered + ?,
                 read_count = read_count + ?, interactions = interactions + ?,
                 blocked = blocked + ?, cost = cost + ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(delta.sent)
        .bind(delta.failed)
        .bind(delta.delivered)
        .bind(delta.read)
        .bind(delta.interactions)
        .bind(delta.blocked)
        .bind(delta.cost)
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Initialise the contact lists of a bulk record
    pub async fn init_contacts(
        pool: &DatabasePool,
        id: &str,
        contacts: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let encoded = serde_json::to_string(contacts)?;
        sqlx::query(
            "UPDATE executions
             SET contacts_list = ?, pending_contacts = ?, processed_contacts = '[]', updated_at = ?
             WHERE id = ?",
        )
        .bind(&encoded)
        .bind(&encoded)
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Persist processed/pending lists at a batch boundary
    pub async fn save_contact_progress(
        pool: &DatabasePool,
        id: &str,
        processed: &[String],
        pending: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions SET processed_contacts = ?, pending_contacts = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(processed)?)
        .bind(serde_json::to_string(pending)?)
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Reset a single run to its start and queue it
    pub async fn requeue_from_start(pool: &DatabasePool, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE executions
             SET status = 'queued', current_node_id = NULL, current_step_index = NULL,
                 failure_reason = NULL, claimed_by = NULL, scheduled_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Queue a bulk record again over `contacts` only, dropping their old failures
    pub async fn requeue_bulk(
        pool: &DatabasePool,
        id: &str,
        contacts: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let encoded = serde_json::to_string(contacts)?;
        sqlx::query(
            "UPDATE executions
             SET status = 'queued', contacts_list = ?, pending_contacts = ?, processed_contacts = '[]',
                 failed = MAX(failed - ?, 0), failure_reason = NULL, claimed_by = NULL,
                 scheduled_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&encoded)
        .bind(&encoded)
        .bind(contacts.len() as i64)
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_delta_addition() {
        let total = CounterDelta::sent(0.05) + CounterDelta::failed() + CounterDelta::blocked();
        assert_eq!(total.sent, 1);
        assert_eq!(total.failed, 1);
        assert_eq!(total.blocked, 1);
        assert!((total.cost - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counter_delta_zero() {
        assert!(CounterDelta::default().is_zero());
        assert!(!CounterDelta::interaction().is_zero());
    }
}
