//! Delivery record repository
//!
//! Status, note and interaction updates are compare-and-set on the stored
//! value so duplicate callbacks race harmlessly.

use crate::db::connection::DatabasePool;
use crate::db::models::{DeliveryRecord, DeliveryStatus, RecipientFailure};
use crate::db::{timestamp, DbResult};
use chrono::{DateTime, Utc};

/// Delivery repository for message and failure rows
pub struct DeliveryRepository;

impl DeliveryRepository {
    /// Insert a delivery record for an accepted send
    pub async fn create(pool: &DatabasePool, record: &DeliveryRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO delivery_records (
                id, execution_id, channel_message_id, recipient_address, conversation_ref,
                message_kind, cost, status, is_interaction, pending_note, note_sent,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.execution_id)
        .bind(&record.channel_message_id)
        .bind(&record.recipient_address)
        .bind(&record.conversation_ref)
        .bind(&record.message_kind)
        .bind(record.cost)
        .bind(&record.status)
        .bind(record.is_interaction)
        .bind(&record.pending_note)
        .bind(record.note_sent)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Look up a record by the channel-assigned message id
    pub async fn get_by_channel_message_id(
        pool: &DatabasePool,
        channel_message_id: &str,
    ) -> DbResult<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE channel_message_id = ?",
        )
        .bind(channel_message_id)
        .fetch_optional(pool)
        .await?;

        Ok(record)
    }

    /// All messages sent by one execution, oldest first
    pub async fn list_by_execution(pool: &DatabasePool, execution_id: &str) -> DbResult<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivery_records WHERE execution_id = ? ORDER BY created_at",
        )
        .bind(execution_id)
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Move a record from `expected` to `next`. Returns false if the stored
    /// status was changed by a concurrent callback.
    pub async fn update_status_if(
        pool: &DatabasePool,
        id: &str,
        expected: DeliveryStatus,
        next: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE delivery_records SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(timestamp(now))
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip `note_sent` once; only the caller that wins posts the note
    pub async fn mark_note_sent(pool: &DatabasePool, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE delivery_records SET note_sent = 1, updated_at = ?
             WHERE id = ? AND note_sent = 0 AND pending_note IS NOT NULL",
        )
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip `is_interaction` once; true only for the first interaction
    pub async fn mark_interaction(pool: &DatabasePool, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE delivery_records SET is_interaction = 1, updated_at = ?
             WHERE id = ? AND is_interaction = 0",
        )
        .bind(timestamp(now))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Store why a recipient was not reached
    pub async fn record_failure(
        pool: &DatabasePool,
        execution_id: &str,
        recipient_address: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO recipient_failures (execution_id, recipient_address, reason, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(execution_id)
        .bind(recipient_address)
        .bind(reason)
        .bind(timestamp(now))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Failure reasons of an execution, in insertion order
    pub async fn list_failures(pool: &DatabasePool, execution_id: &str) -> DbResult<Vec<RecipientFailure>> {
        let failures = sqlx::query_as::<_, RecipientFailure>(
            "SELECT * FROM recipient_failures WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(pool)
        .await?;

        Ok(failures)
    }

    /// Drop the stored failures of an execution (before a retry)
    pub async fn clear_failures(pool: &DatabasePool, execution_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM recipient_failures WHERE execution_id = ?")
            .bind(execution_id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected())
    }
}
