//! Delivery status reconciler
//!
//! Consumes the channel's asynchronous callbacks. Status callbacks are keyed
//! by channel message id and may arrive duplicated or out of order; every
//! accepted change is a compare-and-set on the stored status, so concurrent
//! callbacks for the same message apply their counters at most once.

pub mod status;

pub use status::{transition, Transition};

use crate::broker::{Broker, NoteJob, ProgressEvent};
use crate::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::db::models::{DeliveryRecord, DeliveryStatus, ExecutionKind, ExecutionRecord};
use crate::db::repositories::{
    ActivityRepository, BlockListRepository, CampaignRepository, CounterDelta, DeliveryRepository,
    ExecutionRepository,
};
use crate::db::DatabasePool;
use crate::error::Result;
use crate::text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// No delivery record carries the message id
    Unknown,
    /// Duplicate or out-of-order callback
    Ignored,
    /// Status moved forward (or to failed)
    Applied { from: DeliveryStatus, to: DeliveryStatus },
}

/// A recipient replied to or clicked on a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub tenant_id: String,
    pub sender_address: String,
    /// Message the interaction answers, when the channel reports it
    pub channel_message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub conversation_ref: Option<String>,
}

/// Callback relayed from the channel's webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Callback {
    #[serde(rename_all = "camelCase")]
    Status {
        channel_message_id: String,
        status: DeliveryStatus,
    },
    Interaction(Interaction),
    #[serde(rename_all = "camelCase")]
    Inbound {
        tenant_id: String,
        address: String,
        #[serde(default)]
        conversation_ref: Option<String>,
        /// Defaults to the time the callback is handled
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

/// What an interaction callback caused
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionOutcome {
    /// First interaction with the answered message
    pub counted: bool,
    /// Sender was added to the block list
    pub opted_out: bool,
    /// Execution launched by a trigger phrase
    pub launched: Option<String>,
}

/// Applies channel callbacks to delivery and execution records
pub struct Reconciler {
    pool: DatabasePool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(pool: DatabasePool, broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, config: ReconcilerConfig) -> Self {
        Self {
            pool,
            broker,
            clock,
            config,
        }
    }

    /// Apply any callback
    pub async fn handle(&self, callback: &Callback) -> Result<()> {
        match callback {
            Callback::Status {
                channel_message_id,
                status,
            } => {
                self.handle_status(channel_message_id, *status).await?;
            }
            Callback::Interaction(interaction) => {
                self.handle_interaction(interaction).await?;
            }
            Callback::Inbound {
                tenant_id,
                address,
                conversation_ref,
                at,
            } => {
                let at = at.unwrap_or_else(|| self.clock.now());
                self.handle_inbound(tenant_id, address, conversation_ref.as_deref(), at)
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply a delivery status callback
    pub async fn handle_status(&self, channel_message_id: &str, incoming: DeliveryStatus) -> Result<StatusUpdate> {
        loop {
            let Some(delivery) =
                DeliveryRepository::get_by_channel_message_id(&self.pool, channel_message_id).await?
            else {
                debug!(channel_message_id, "Status callback for unknown message");
                return Ok(StatusUpdate::Unknown);
            };

            let current = delivery.status()?;
            let Some(change) = transition(current, incoming, delivery.cost) else {
                debug!(channel_message_id, current = %current, incoming = %incoming, "Status callback ignored");
                return Ok(StatusUpdate::Ignored);
            };

            let now = self.clock.now();
            if !DeliveryRepository::update_status_if(&self.pool, &delivery.id, current, change.next, now).await? {
                // A concurrent callback moved the record; decide again from its new status
                continue;
            }

            self.apply_to_execution(&delivery.execution_id, &change.delta).await?;
            if change.post_note {
                self.release_note(&delivery).await?;
            }

            info!(
                channel_message_id,
                execution_id = %delivery.execution_id,
                from = %current,
                to = %change.next,
                "Delivery status updated"
            );
            return Ok(StatusUpdate::Applied {
                from: current,
                to: change.next,
            });
        }
    }

    /// Apply an interaction callback: count it, honour opt-outs, launch triggered campaigns
    pub async fn handle_interaction(&self, interaction: &Interaction) -> Result<InteractionOutcome> {
        let now = self.clock.now();
        let mut outcome = InteractionOutcome::default();

        ActivityRepository::record_inbound(
            &self.pool,
            &interaction.tenant_id,
            &interaction.sender_address,
            interaction.conversation_ref.as_deref(),
            now,
        )
        .await?;

        if let Some(channel_message_id) = &interaction.channel_message_id {
            if let Some(delivery) = DeliveryRepository::get_by_channel_message_id(&self.pool, channel_message_id).await? {
                if DeliveryRepository::mark_interaction(&self.pool, &delivery.id, now).await? {
                    self.apply_to_execution(&delivery.execution_id, &CounterDelta::interaction())
                        .await?;
                    outcome.counted = true;
                }
            }
        }

        let Some(input) = interaction.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(outcome);
        };

        if self.is_opt_out(input) {
            BlockListRepository::add(&self.pool, &interaction.tenant_id, &interaction.sender_address, "opt-out", now)
                .await?;
            info!(tenant_id = %interaction.tenant_id, sender = %interaction.sender_address, "Sender opted out");
            outcome.opted_out = true;
            return Ok(outcome);
        }

        if self.config.launch_on_trigger {
            outcome.launched = self.launch_triggered(interaction, input, now).await?;
        }
        Ok(outcome)
    }

    /// Refresh the recent-activity cache for an inbound message
    pub async fn handle_inbound(
        &self,
        tenant_id: &str,
        address: &str,
        conversation_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        ActivityRepository::record_inbound(&self.pool, tenant_id, address, conversation_ref, at).await?;
        Ok(())
    }

    fn is_opt_out(&self, input: &str) -> bool {
        self.config
            .opt_out_phrases
            .iter()
            .any(|phrase| text::folded_eq(phrase, input))
    }

    async fn launch_triggered(
        &self,
        interaction: &Interaction,
        input: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let Some(campaign) = CampaignRepository::find_by_trigger(&self.pool, &interaction.tenant_id, input).await?
        else {
            return Ok(None);
        };

        let aggregator =
            match ExecutionRepository::find_aggregator(&self.pool, &interaction.tenant_id, &campaign.id).await? {
                Some(aggregator) => aggregator,
                None => {
                    let aggregator = ExecutionRecord::aggregator(&interaction.tenant_id, &campaign.id);
                    ExecutionRepository::create(&self.pool, &aggregator).await?;
                    aggregator
                }
            };

        let mut child = ExecutionRecord::single(&interaction.tenant_id, &campaign.id, &interaction.sender_address)
            .with_parent(&aggregator.id)
            .scheduled_for(now);
        child.conversation_ref = interaction.conversation_ref.clone();
        ExecutionRepository::create(&self.pool, &child).await?;

        info!(
            campaign_id = %campaign.id,
            execution_id = %child.id,
            sender = %interaction.sender_address,
            "Trigger phrase launched campaign"
        );
        Ok(Some(child.id))
    }

    /// Apply a delta to an execution and its rolled-up parent, then publish progress.
    ///
    /// Only bulk and aggregator parents count their children's sends; the
    /// single run that linked a child keeps its own counters.
    async fn apply_to_execution(&self, execution_id: &str, delta: &CounterDelta) -> Result<()> {
        let now = self.clock.now();
        ExecutionRepository::apply_counters(&self.pool, execution_id, delta, now).await?;

        let parent_id = match ExecutionRepository::get_by_id(&self.pool, execution_id)
            .await?
            .and_then(|record| record.parent_id)
        {
            Some(parent_id) => ExecutionRepository::get_by_id(&self.pool, &parent_id)
                .await?
                .filter(|parent| matches!(parent.kind(), Ok(ExecutionKind::Bulk | ExecutionKind::Aggregator)))
                .map(|parent| parent.id),
            None => None,
        };
        if let Some(parent_id) = &parent_id {
            ExecutionRepository::apply_counters(&self.pool, parent_id, delta, now).await?;
        }

        self.publish_progress(parent_id.as_deref().unwrap_or(execution_id)).await;
        Ok(())
    }

    /// Queue the deferred internal note once per delivery record
    async fn release_note(&self, delivery: &DeliveryRecord) -> Result<()> {
        let Some(note) = delivery.pending_note.clone() else {
            return Ok(());
        };
        if !DeliveryRepository::mark_note_sent(&self.pool, &delivery.id, self.clock.now()).await? {
            return Ok(());
        }

        let tenant_id = ExecutionRepository::require(&self.pool, &delivery.execution_id)
            .await?
            .tenant_id;
        self.broker
            .enqueue_note(NoteJob {
                execution_id: delivery.execution_id.clone(),
                tenant_id,
                conversation_ref: delivery.conversation_ref.clone(),
                recipient_address: delivery.recipient_address.clone(),
                note,
            })
            .await?;
        debug!(delivery_id = %delivery.id, "Internal note queued");
        Ok(())
    }

    async fn publish_progress(&self, execution_id: &str) {
        let snapshot = match ExecutionRepository::get_by_id(&self.pool, execution_id).await {
            Ok(Some(record)) => ProgressEvent::from_record(&record),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        match snapshot {
            Ok(event) => {
                if let Err(e) = self.broker.publish_progress(event).await {
                    warn!(execution_id, error = %e, "Progress publish failed");
                }
            }
            Err(e) => warn!(execution_id, error = %e, "Progress snapshot failed"),
        }
    }
}
