//! Node side effects
//!
//! Every handler returns a [`Step`] telling the loop where to go. Send
//! failures of message and media nodes are recorded against the recipient and
//! the path continues; a failed template send ends the run.

use super::condition::{self, Branch};
use super::{Interpreter, RunContext, Step};
use crate::channel::{SendResult, TemplateMessage};
use crate::db::models::{DeliveryRecord, ExecutionRecord, MessageKind};
use crate::db::repositories::{ActivityRepository, CounterDelta, DeliveryRepository, ExecutionRepository};
use crate::error::Result;
use crate::graph::{
    Condition, LabelParams, LinkCampaignParams, MediaParams, MessageParams, NodeKind, TemplateParams, HANDLE_A,
    HANDLE_B,
};
use crate::smart_send;
use rand::Rng;
use tracing::{debug, info, warn};

/// Randomizer handle for a roll in `[1, 100]`
pub(crate) fn roll_branch(percent_a: u8, roll: u32) -> &'static str {
    if roll <= u32::from(percent_a) {
        HANDLE_A
    } else {
        HANDLE_B
    }
}

impl Interpreter {
    pub(crate) async fn execute(&self, ctx: &mut RunContext, kind: &NodeKind) -> Result<Step> {
        match kind {
            NodeKind::Start => Ok(Step::Continue(None)),
            NodeKind::Message(params) => {
                self.send_message(ctx, params).await?;
                Ok(Step::Continue(None))
            }
            NodeKind::Media(params) => {
                self.send_media(ctx, params).await?;
                Ok(Step::Continue(None))
            }
            NodeKind::Delay(params) => Ok(Step::Delay(params.duration())),
            NodeKind::Condition(condition) => self.evaluate_condition(ctx, condition).await,
            NodeKind::Randomizer(params) => {
                let roll = rand::thread_rng().gen_range(1..=100);
                Ok(Step::Continue(Some(roll_branch(params.percent_a, roll))))
            }
            NodeKind::LinkCampaign(params) => {
                self.link_campaign(ctx, params).await?;
                Ok(Step::Continue(None))
            }
            NodeKind::Template(params) => self.send_template(ctx, params).await,
            NodeKind::Label(params) => {
                self.apply_labels(ctx, params).await?;
                Ok(Step::Continue(None))
            }
        }
    }

    async fn send_message(&self, ctx: &RunContext, params: &MessageParams) -> Result<()> {
        let client = &ctx.binding.client;
        let (result, kind) = if params.buttons.is_empty() {
            (client.send_text(&ctx.recipient, &params.text).await, MessageKind::Text)
        } else {
            let result = client
                .send_interactive(&ctx.recipient, &params.text, &params.buttons)
                .await;
            (result, MessageKind::Interactive)
        };
        self.record_send(ctx, &result, kind, 0.0, params.note.clone()).await
    }

    async fn send_media(&self, ctx: &RunContext, params: &MediaParams) -> Result<()> {
        let result = ctx.binding.client.send_media(&ctx.recipient, params).await;
        self.record_send(ctx, &result, MessageKind::Media, 0.0, None).await
    }

    async fn send_template(&self, ctx: &RunContext, params: &TemplateParams) -> Result<Step> {
        let template = TemplateMessage {
            name: params.template_name.clone(),
            language: params.language.clone(),
            components: params.components.clone(),
        };
        let outcome = smart_send::send(
            &self.pool,
            &ctx.binding,
            &ctx.recipient,
            &template,
            params.fallback_text.as_deref(),
            params.check_window,
            self.clock.now(),
        )
        .await;

        self.record_send(ctx, &outcome.result, outcome.kind, outcome.cost, params.note.clone())
            .await?;
        if outcome.result.success {
            Ok(Step::Continue(None))
        } else {
            Ok(Step::Fail(format!("template send failed: {}", outcome.result.failure_reason())))
        }
    }

    /// Persist the outcome of one send and count it
    async fn record_send(
        &self,
        ctx: &RunContext,
        result: &SendResult,
        kind: MessageKind,
        cost: f64,
        note: Option<String>,
    ) -> Result<()> {
        let now = self.clock.now();
        if !result.success {
            let reason = result.failure_reason();
            warn!(execution_id = %ctx.record_id, recipient = %ctx.recipient, reason = %reason, "Send failed");
            DeliveryRepository::record_failure(&self.pool, &ctx.record_id, &ctx.recipient, &reason, now).await?;
            return self.count(ctx, CounterDelta::failed()).await;
        }

        let channel_message_id = result
            .channel_message_id
            .clone()
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));
        let delivery = DeliveryRecord::new(&ctx.record_id, channel_message_id, &ctx.recipient, kind, cost)
            .with_conversation_ref(ctx.conversation_ref.clone())
            .with_pending_note(note);

        match DeliveryRepository::create(&self.pool, &delivery).await {
            Ok(()) => {}
            Err(e) if e.is_constraint_violation() => {
                warn!(
                    execution_id = %ctx.record_id,
                    channel_message_id = %delivery.channel_message_id,
                    "Delivery record already exists"
                );
            }
            Err(e) => return Err(e.into()),
        }
        debug!(execution_id = %ctx.record_id, kind = kind.as_str(), "Message sent");
        self.count(ctx, CounterDelta::sent(cost)).await
    }

    async fn evaluate_condition(&self, ctx: &mut RunContext, condition: &Condition) -> Result<Step> {
        let now = self.clock.now();
        let branch = match condition {
            Condition::Tag { tag } => {
                let labels = self.labels_of(ctx).await?;
                condition::evaluate_tag(tag, &labels)
            }
            Condition::Weekday { days } => condition::evaluate_weekday(days, now, ctx.binding.utc_offset),
            Condition::DatetimeRange {
                start,
                end,
                before,
                between,
                after,
            } => condition::evaluate_range(*start, *end, (*before, *between, *after), now, ctx.binding.utc_offset),
        };

        Ok(match branch {
            Branch::Follow(handle) => Step::Continue(Some(handle)),
            Branch::Stop => Step::Stop,
            Branch::WaitUntil(at) => Step::WaitUntil(at),
        })
    }

    /// Labels of the recipient's conversation; lookup failures read as none
    async fn labels_of(&self, ctx: &mut RunContext) -> Result<Vec<String>> {
        let Some(conversation_ref) = self.ensure_conversation(ctx).await? else {
            return Ok(Vec::new());
        };
        match ctx.binding.client.conversation_labels(&conversation_ref).await {
            Ok(labels) => Ok(labels),
            Err(e) => {
                warn!(execution_id = %ctx.record_id, error = %e, "Label lookup failed, condition is false");
                Ok(Vec::new())
            }
        }
    }

    async fn apply_labels(&self, ctx: &mut RunContext, params: &LabelParams) -> Result<()> {
        let Some(conversation_ref) = self.ensure_conversation(ctx).await? else {
            warn!(execution_id = %ctx.record_id, recipient = %ctx.recipient, "No conversation, labels skipped");
            return Ok(());
        };
        if let Err(e) = ctx.binding.client.add_labels(&conversation_ref, &params.labels).await {
            warn!(execution_id = %ctx.record_id, error = %e, "Failed to apply labels");
        }
        Ok(())
    }

    /// Conversation of the recipient: the record, the activity cache, then the channel
    async fn ensure_conversation(&self, ctx: &mut RunContext) -> Result<Option<String>> {
        if !ctx.needs_conversation_lookup() {
            return Ok(ctx.conversation_ref.clone());
        }

        let now = self.clock.now();
        let cached = ActivityRepository::get(&self.pool, &ctx.tenant_id, &ctx.recipient)
            .await?
            .and_then(|activity| activity.conversation_ref);
        let resolved = match cached {
            Some(conversation_ref) => Some(conversation_ref),
            None => match ctx.binding.client.resolve_conversation(&ctx.recipient).await {
                Ok(Some(conversation_ref)) => {
                    ActivityRepository::upsert_conversation(
                        &self.pool,
                        &ctx.tenant_id,
                        &ctx.recipient,
                        &conversation_ref,
                        now,
                    )
                    .await?;
                    Some(conversation_ref)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(execution_id = %ctx.record_id, error = %e, "Conversation lookup failed");
                    None
                }
            },
        };

        if let Some(conversation_ref) = &resolved {
            ExecutionRepository::set_conversation_ref(&self.pool, &ctx.record_id, conversation_ref).await?;
        }
        ctx.set_conversation(resolved.clone());
        Ok(resolved)
    }

    async fn link_campaign(&self, ctx: &RunContext, params: &LinkCampaignParams) -> Result<()> {
        let mut child = ExecutionRecord::single(&ctx.tenant_id, &params.campaign_id, &ctx.recipient)
            .with_parent(&ctx.record_id)
            .scheduled_for(self.clock.now());
        child.conversation_ref = ctx.conversation_ref.clone();
        ExecutionRepository::create(&self.pool, &child).await?;

        info!(
            execution_id = %ctx.record_id,
            child_id = %child.id,
            campaign_id = %params.campaign_id,
            "Linked campaign queued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_roll_branch_edges() {
        assert_eq!(roll_branch(50, 1), HANDLE_A);
        assert_eq!(roll_branch(50, 50), HANDLE_A);
        assert_eq!(roll_branch(50, 51), HANDLE_B);
        assert_eq!(roll_branch(0, 1), HANDLE_B);
        assert_eq!(roll_branch(100, 100), HANDLE_A);
    }

    #[test]
    fn test_randomizer_even_split() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 10_000;
        let a = (0..trials)
            .filter(|_| roll_branch(50, rng.gen_range(1..=100)) == HANDLE_A)
            .count();
        let share = a as f64 / trials as f64;
        assert!((0.47..=0.53).contains(&share), "share of a was {}", share);
    }
}
