//! Bulk dispatch orchestrator
//!
//! Sends to a contact list in sequential batches. Within a batch, recipients
//! run concurrently up to the job's concurrency limit; between batches the
//! orchestrator sleeps `delay_seconds`. Status is re-read at every batch
//! boundary, which is where pause and cancel take effect.
//!
//! Contact progress is persisted after each batch, so a re-delivered job
//! resumes from the stored pending list. While waiting between batches or
//! while paused the run heartbeats `updated_at` so the scheduler never sees
//! it as stale; a run that finds another owner on the record stops.

use crate::broker::{Broker, BulkJob, ProgressEvent};
use crate::channel::{ChannelProvider, TemplateMessage, TenantBinding};
use crate::clock::Clock;
use crate::config::BulkConfig;
use crate::db::models::{BulkMode, BulkOptions, DeliveryRecord, ExecutionRecord, ExecutionStatus};
use crate::db::repositories::{BlockListRepository, CounterDelta, DeliveryRepository, ExecutionRepository};
use crate::db::DatabasePool;
use crate::error::{FunnelError, Result};
use crate::interpreter::{guard, Interpreter, RunOutcome};
use crate::smart_send;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How one recipient of a batch ended
#[derive(Debug, Clone, PartialEq)]
pub enum RecipientOutcome {
    /// Accepted by the channel (or the recipient's campaign run did not fail)
    Sent { cost: f64 },
    /// Not reached; the reason is stored for export and retry
    Failed { reason: String },
    /// Block-listed, no network call made
    Blocked,
}

impl RecipientOutcome {
    fn counters(&self) -> CounterDelta {
        match self {
            RecipientOutcome::Sent { cost } => CounterDelta::sent(*cost),
            RecipientOutcome::Failed { .. } => CounterDelta::failed(),
            RecipientOutcome::Blocked => CounterDelta::blocked(),
        }
    }
}

/// What a bulk send sends to each recipient
enum Delivery {
    Template {
        template: TemplateMessage,
        fallback_text: Option<String>,
    },
    Campaign {
        campaign_id: String,
    },
}

/// Runs bulk sends delivered on the `bulk_sends` queue
pub struct BulkOrchestrator {
    pool: DatabasePool,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn ChannelProvider>,
    interpreter: Arc<Interpreter>,
    clock: Arc<dyn Clock>,
    config: BulkConfig,
    worker_id: String,
}

impl BulkOrchestrator {
    pub fn new(
        pool: DatabasePool,
        broker: Arc<dyn Broker>,
        provider: Arc<dyn ChannelProvider>,
        interpreter: Arc<Interpreter>,
        config: BulkConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        let clock = interpreter.clock().clone();
        Self {
            pool,
            broker,
            provider,
            interpreter,
            clock,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Run a bulk job to completion, cancellation or failure.
    ///
    /// Returns the final status, or `None` when the record is not this
    /// worker's to run.
    pub async fn run(&self, job: &BulkJob) -> Result<Option<ExecutionStatus>> {
        let Some(record) = ExecutionRepository::get_by_id(&self.pool, &job.execution_id).await? else {
            warn!(execution_id = %job.execution_id, "Bulk execution not found, dropping job");
            return Ok(None);
        };

        let now = self.clock.now();
        let config = &self.interpreter.config;
        let decision = guard::evaluate(
            &record,
            now,
            chrono::Duration::seconds(config.handoff_window_secs as i64),
            chrono::Duration::seconds(config.stale_after_secs as i64),
        )?;
        if !decision.may_run() {
            decision.log_skipped(&record.id);
            return Ok(None);
        }

        let owner = format!("{}:{}", self.worker_id, uuid::Uuid::new_v4());
        if !ExecutionRepository::take_ownership(&self.pool, &record, &owner, now).await? {
            debug!(execution_id = %record.id, "Lost ownership race");
            return Ok(None);
        }

        match self.prepare(&record, job).await {
            Ok((binding, delivery)) => self.dispatch(&record, job, &binding, &delivery, &owner).await,
            Err(e) if e.is_configuration() => {
                let reason = e.to_string();
                warn!(execution_id = %record.id, reason = %reason, "Bulk send misconfigured");
                ExecutionRepository::mark_failed(&self.pool, &record.id, &reason, self.clock.now()).await?;
                self.publish_progress(&record.id).await;
                Ok(Some(ExecutionStatus::Failed))
            }
            Err(e) => Err(e),
        }
    }

    async fn prepare(&self, record: &ExecutionRecord, job: &BulkJob) -> Result<(TenantBinding, Delivery)> {
        let binding = self.provider.resolve(&record.tenant_id).await?;
        let options = record.bulk_options()?.unwrap_or_else(|| job.options());

        let delivery = match options.mode {
            BulkMode::Template => {
                let name = options
                    .template_name
                    .clone()
                    .or_else(|| job.template_name.clone())
                    .ok_or_else(|| FunnelError::Configuration("template bulk send has no template".to_string()))?;
                Delivery::Template {
                    template: template_of(name, &options),
                    fallback_text: options.fallback_text.clone(),
                }
            }
            BulkMode::Campaign => {
                let campaign_id = record
                    .campaign_id
                    .clone()
                    .or_else(|| job.campaign_id.clone())
                    .ok_or_else(|| FunnelError::Configuration("campaign bulk send has no campaign".to_string()))?;
                Delivery::Campaign { campaign_id }
            }
        };

        Ok((binding, delivery))
    }

    async fn dispatch(
        &self,
        record: &ExecutionRecord,
        job: &BulkJob,
        binding: &TenantBinding,
        delivery: &Delivery,
        owner: &str,
    ) -> Result<Option<ExecutionStatus>> {
        let mut pending = record.pending()?;
        let mut processed = record.processed()?;
        if pending.is_empty() && processed.is_empty() && !job.contacts.is_empty() {
            ExecutionRepository::init_contacts(&self.pool, &record.id, &job.contacts, self.clock.now()).await?;
            pending = job.contacts.clone();
        }

        let concurrency = job.concurrency_limit.clamp(1, self.config.max_concurrency.max(1));
        let pause = Duration::from_secs(job.delay_seconds);
        info!(
            execution_id = %record.id,
            pending = pending.len(),
            processed = processed.len(),
            concurrency,
            delay_seconds = job.delay_seconds,
            "Bulk send started"
        );

        loop {
            let current = ExecutionRepository::require(&self.pool, &record.id).await?;
            let status = current.status()?;
            if current.claimed_by.as_deref() != Some(owner) {
                warn!(
                    execution_id = %record.id,
                    status = %status,
                    claimed_by = ?current.claimed_by,
                    "Bulk send no longer owned by this run, stopping"
                );
                return Ok(None);
            }
            match status {
                status if status.is_cancel_requested() => return self.finish_cancelled(&record.id).await.map(Some),
                ExecutionStatus::Paused => {
                    debug!(execution_id = %record.id, "Bulk send paused");
                    if !self.wait(&record.id, owner, self.config.pause_poll()).await? {
                        return Ok(None);
                    }
                    continue;
                }
                ExecutionStatus::Completed | ExecutionStatus::Failed => {
                    warn!(execution_id = %record.id, "Bulk send finalized elsewhere, stopping");
                    return Ok(Some(status));
                }
                _ => {}
            }

            if pending.is_empty() {
                break;
            }

            let batch: Vec<String> = pending.iter().take(concurrency).cloned().collect();
            let outcomes: Vec<(String, RecipientOutcome)> = stream::iter(batch.iter().cloned())
                .map(|address| async move {
                    let outcome = self.deliver(record, binding, delivery, &address, owner).await;
                    (address, outcome)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let now = self.clock.now();
            let mut delta = CounterDelta::default();
            for (address, outcome) in &outcomes {
                if let RecipientOutcome::Failed { reason } = outcome {
                    DeliveryRepository::record_failure(&self.pool, &record.id, address, reason, now).await?;
                }
                delta = delta + outcome.counters();
            }

            pending = pending.split_off(batch.len());
            processed.extend(batch);
            ExecutionRepository::apply_counters(&self.pool, &record.id, &delta, now).await?;
            ExecutionRepository::save_contact_progress(&self.pool, &record.id, &processed, &pending, now).await?;
            self.publish_progress(&record.id).await;
            debug!(
                execution_id = %record.id,
                sent = delta.sent,
                failed = delta.failed,
                blocked = delta.blocked,
                remaining = pending.len(),
                "Bulk batch done"
            );

            if !pending.is_empty() && !self.wait(&record.id, owner, pause).await? {
                return Ok(None);
            }
        }

        self.finish(&record.id).await.map(Some)
    }

    /// Sleep for `duration`, heartbeating the record between chunks.
    ///
    /// Returns false when another worker took the record over meanwhile.
    async fn wait(&self, execution_id: &str, owner: &str, duration: Duration) -> Result<bool> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let chunk = remaining.min(self.config.heartbeat());
            self.clock.sleep(chunk).await;
            remaining -= chunk;

            if !ExecutionRepository::heartbeat(&self.pool, execution_id, owner, self.clock.now()).await? {
                warn!(execution_id, "Bulk send taken over while waiting, stopping");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Deliver to one recipient. Never fails: errors become a failed outcome.
    async fn deliver(
        &self,
        record: &ExecutionRecord,
        binding: &TenantBinding,
        delivery: &Delivery,
        address: &str,
        owner: &str,
    ) -> RecipientOutcome {
        match self.try_deliver(record, binding, delivery, address, owner).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = %record.id, recipient = address, error = %e, "Recipient delivery errored");
                RecipientOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    async fn try_deliver(
        &self,
        record: &ExecutionRecord,
        binding: &TenantBinding,
        delivery: &Delivery,
        address: &str,
        owner: &str,
    ) -> Result<RecipientOutcome> {
        if BlockListRepository::is_blocked(&self.pool, &record.tenant_id, address).await? {
            debug!(execution_id = %record.id, recipient = address, "Recipient is block-listed");
            return Ok(RecipientOutcome::Blocked);
        }

        match delivery {
            Delivery::Template {
                template,
                fallback_text,
            } => {
                let outcome = smart_send::send(
                    &self.pool,
                    binding,
                    address,
                    template,
                    fallback_text.as_deref(),
                    fallback_text.is_some(),
                    self.clock.now(),
                )
                .await;
                if !outcome.result.success {
                    return Ok(RecipientOutcome::Failed {
                        reason: outcome.result.failure_reason(),
                    });
                }

                let channel_message_id = outcome
                    .result
                    .channel_message_id
                    .clone()
                    .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));
                let sent = DeliveryRecord::new(&record.id, channel_message_id, address, outcome.kind, outcome.cost);
                match DeliveryRepository::create(&self.pool, &sent).await {
                    Ok(()) => {}
                    Err(e) if e.is_constraint_violation() => {
                        warn!(channel_message_id = %sent.channel_message_id, "Delivery record already exists");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(RecipientOutcome::Sent { cost: outcome.cost })
            }
            Delivery::Campaign { campaign_id } => {
                let mut child = ExecutionRecord::single(&record.tenant_id, campaign_id, address)
                    .with_parent(&record.id)
                    .scheduled_for(self.clock.now())
                    .with_status(ExecutionStatus::Processing);
                child.claimed_by = Some(owner.to_string());
                ExecutionRepository::create(&self.pool, &child).await?;

                match self.interpreter.run(&child, binding).await? {
                    RunOutcome::Failed { reason } => Ok(RecipientOutcome::Failed { reason }),
                    RunOutcome::Finished | RunOutcome::Suspended { .. } => {
                        let cost = ExecutionRepository::get_by_id(&self.pool, &child.id)
                            .await?
                            .map(|child| child.cost)
                            .unwrap_or_default();
                        Ok(RecipientOutcome::Sent { cost })
                    }
                }
            }
        }
    }

    async fn finish(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let now = self.clock.now();
        let completed = ExecutionRepository::transition_status(
            &self.pool,
            execution_id,
            &[ExecutionStatus::Processing, ExecutionStatus::Queued],
            ExecutionStatus::Completed,
            now,
        )
        .await?;

        if !completed {
            let current = ExecutionRepository::require(&self.pool, execution_id).await?;
            let status = current.status()?;
            if status.is_cancel_requested() {
                return self.finish_cancelled(execution_id).await;
            }
            if status == ExecutionStatus::Paused {
                // Paused after the last batch: nothing left to hold back
                ExecutionRepository::mark_completed(&self.pool, execution_id, now).await?;
            } else {
                self.publish_progress(execution_id).await;
                return Ok(status);
            }
        }

        info!(execution_id, "Bulk send completed");
        self.publish_progress(execution_id).await;
        Ok(ExecutionStatus::Completed)
    }

    async fn finish_cancelled(&self, execution_id: &str) -> Result<ExecutionStatus> {
        ExecutionRepository::mark_cancelled(&self.pool, execution_id, self.clock.now()).await?;
        info!(execution_id, "Bulk send cancelled");
        self.publish_progress(execution_id).await;
        Ok(ExecutionStatus::Cancelled)
    }

    /// Publish a progress event from a fresh read; failures are logged
    async fn publish_progress(&self, execution_id: &str) {
        let event = match ExecutionRepository::get_by_id(&self.pool, execution_id).await {
            Ok(Some(record)) => match ProgressEvent::from_record(&record) {
                Ok(event) => event,
                Err(e) => {
                    warn!(execution_id, error = %e, "Unreadable progress snapshot");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!(execution_id, error = %e, "Progress read failed");
                return;
            }
        };
        if let Err(e) = self.broker.publish_progress(event).await {
            warn!(execution_id, error = %e, "Progress publish failed");
        }
    }
}

fn template_of(name: String, options: &BulkOptions) -> TemplateMessage {
    TemplateMessage {
        name,
        language: options.language.clone(),
        components: options.components.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        assert_eq!(RecipientOutcome::Sent { cost: 0.5 }.counters(), CounterDelta::sent(0.5));
        assert_eq!(
            RecipientOutcome::Failed {
                reason: "x".to_string()
            }
            .counters(),
            CounterDelta::failed()
        );
        assert_eq!(RecipientOutcome::Blocked.counters(), CounterDelta::blocked());
    }

    #[test]
    fn test_template_of_carries_options() {
        let options = BulkOptions::template("promo", 1, 2).with_language("pt_BR");
        let template = template_of("promo".to_string(), &options);
        assert_eq!(template.name, "promo");
        assert_eq!(template.language.as_deref(), Some("pt_BR"));
    }
}
