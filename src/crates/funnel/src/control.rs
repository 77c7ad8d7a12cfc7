//! Operator controls over execution records
//!
//! Pause, resume and cancel only flip the stored status; the orchestrator
//! observes the change at its next batch boundary. Retry puts a terminal
//! record back in the queue.

use crate::clock::Clock;
use crate::db::models::{ExecutionKind, ExecutionRecord, ExecutionStatus};
use crate::db::repositories::{DeliveryRepository, ExecutionRepository};
use crate::db::DatabasePool;
use crate::error::{FunnelError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// One recipient that was not reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub recipient_address: String,
    pub reason: String,
    pub failed_at: String,
}

/// Exportable outcome of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub execution_id: String,
    pub status: String,
    pub sent: i64,
    pub failed: i64,
    pub blocked: i64,
    pub processed_contacts: Vec<String>,
    pub pending_contacts: Vec<String>,
    pub failures: Vec<FailureEntry>,
}

/// Pause, resume, cancel, retry and export
pub struct ExecutionControl {
    pool: DatabasePool,
    clock: Arc<dyn Clock>,
}

impl ExecutionControl {
    pub fn new(pool: DatabasePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Hold a bulk send at its next batch boundary
    pub async fn pause(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let record = ExecutionRepository::require(&self.pool, execution_id).await?;
        if record.kind()? != ExecutionKind::Bulk {
            return Err(invalid(&record, ExecutionStatus::Paused));
        }

        self.transition(
            &record,
            &[ExecutionStatus::Queued, ExecutionStatus::Processing],
            ExecutionStatus::Paused,
        )
        .await
    }

    /// Let a paused bulk send continue.
    ///
    /// A send still owned by a worker goes back to `processing` and that
    /// worker carries on; an unowned one is queued for the scheduler.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let record = ExecutionRepository::require(&self.pool, execution_id).await?;
        let next = if record.claimed_by.is_some() {
            ExecutionStatus::Processing
        } else {
            ExecutionStatus::Queued
        };

        self.transition(&record, &[ExecutionStatus::Paused], next).await
    }

    /// Cancel an execution.
    ///
    /// Queued records, single runs and bulk sends no worker owns are cancelled
    /// at once. A bulk send a worker is running (or holding paused) is marked
    /// `cancelling` and finalized by that worker at the next batch boundary;
    /// if the worker died the scheduler finalizes it once the record goes
    /// stale. Queued child runs of a bulk send are cancelled with it.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let record = ExecutionRepository::require(&self.pool, execution_id).await?;
        let status = record.status()?;
        let kind = record.kind()?;

        let next = match (kind, status) {
            (_, ExecutionStatus::Queued) => ExecutionStatus::Cancelled,
            (ExecutionKind::Bulk, ExecutionStatus::Processing | ExecutionStatus::Paused) => {
                if record.claimed_by.is_some() {
                    ExecutionStatus::Cancelling
                } else {
                    ExecutionStatus::Cancelled
                }
            }
            (ExecutionKind::Single, ExecutionStatus::Processing) => ExecutionStatus::Cancelled,
            _ => return Err(invalid(&record, ExecutionStatus::Cancelled)),
        };
        let applied = self
            .transition(
                &record,
                &[ExecutionStatus::Queued, ExecutionStatus::Processing, ExecutionStatus::Paused],
                next,
            )
            .await?;

        if kind == ExecutionKind::Bulk {
            let now = self.clock.now();
            for child in ExecutionRepository::list_children(&self.pool, execution_id).await? {
                ExecutionRepository::transition_status(
                    &self.pool,
                    &child.id,
                    &[ExecutionStatus::Queued],
                    ExecutionStatus::Cancelled,
                    now,
                )
                .await?;
            }
        }

        Ok(applied)
    }

    /// Queue a terminal execution again.
    ///
    /// A single run restarts from its start node. A bulk send is re-run over
    /// the recipients that failed only. Returns how many recipients were
    /// queued.
    pub async fn retry(&self, execution_id: &str) -> Result<usize> {
        let record = ExecutionRepository::require(&self.pool, execution_id).await?;
        let status = record.status()?;
        let now = self.clock.now();

        match record.kind()? {
            ExecutionKind::Single => {
                if !matches!(status, ExecutionStatus::Failed | ExecutionStatus::Cancelled) {
                    return Err(invalid(&record, ExecutionStatus::Queued));
                }
                ExecutionRepository::requeue_from_start(&self.pool, execution_id, now).await?;
                info!(execution_id, "Execution queued for retry");
                Ok(1)
            }
            ExecutionKind::Bulk => {
                if !status.is_terminal() {
                    return Err(invalid(&record, ExecutionStatus::Queued));
                }

                let mut contacts: Vec<String> = Vec::new();
                for failure in DeliveryRepository::list_failures(&self.pool, execution_id).await? {
                    if !contacts.contains(&failure.recipient_address) {
                        contacts.push(failure.recipient_address);
                    }
                }
                if contacts.is_empty() {
                    return Ok(0);
                }

                DeliveryRepository::clear_failures(&self.pool, execution_id).await?;
                ExecutionRepository::requeue_bulk(&self.pool, execution_id, &contacts, now).await?;
                info!(execution_id, recipients = contacts.len(), "Failed recipients queued for retry");
                Ok(contacts.len())
            }
            ExecutionKind::Aggregator => Err(invalid(&record, ExecutionStatus::Queued)),
        }
    }

    /// Counters, contact sets and failure reasons of an execution
    pub async fn export_failures(&self, execution_id: &str) -> Result<FailureReport> {
        let record = ExecutionRepository::require(&self.pool, execution_id).await?;
        let failures = DeliveryRepository::list_failures(&self.pool, execution_id)
            .await?
            .into_iter()
            .map(|failure| FailureEntry {
                recipient_address: failure.recipient_address,
                reason: failure.reason,
                failed_at: failure.created_at,
            })
            .collect();

        Ok(FailureReport {
            execution_id: record.id.clone(),
            status: record.status.clone(),
            sent: record.sent,
            failed: record.failed,
            blocked: record.blocked,
            processed_contacts: record.processed()?,
            pending_contacts: record.pending()?,
            failures,
        })
    }

    async fn transition(
        &self,
        record: &ExecutionRecord,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<ExecutionStatus> {
        let moved = ExecutionRepository::transition_status(&self.pool, &record.id, from, to, self.clock.now()).await?;
        if !moved {
            // Re-read so the error names the status that blocked the change
            let current = ExecutionRepository::require(&self.pool, &record.id).await?;
            return Err(invalid(&current, to));
        }

        info!(execution_id = %record.id, status = %to, "Execution status changed");
        Ok(to)
    }
}

fn invalid(record: &ExecutionRecord, to: ExecutionStatus) -> FunnelError {
    FunnelError::InvalidStateTransition {
        from: record.status.clone(),
        to: to.as_str().to_string(),
    }
}
