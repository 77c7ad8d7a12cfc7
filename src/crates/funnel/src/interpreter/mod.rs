//! Campaign workflow interpreter
//!
//! Executes one execution record a node at a time until it suspends, finishes
//! or fails. The cursor is persisted after every transition so a crashed
//! worker loses at most the node it was executing.
//!
//! Long delays do not hold a task: the record is parked as `queued` with a
//! future `scheduled_at` and the scheduler hands it back when it is due.

pub mod condition;
pub mod guard;
mod legacy;
mod steps;

pub use guard::GuardDecision;

use crate::channel::{ChannelProvider, TenantBinding};
use crate::clock::Clock;
use crate::config::InterpreterConfig;
use crate::db::models::{ExecutionKind, ExecutionRecord};
use crate::db::repositories::{CampaignRepository, CounterDelta, ExecutionRepository};
use crate::db::DatabasePool;
use crate::error::{FunnelError, Result};
use crate::graph::{CampaignDefinition, CampaignGraph};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a suspended record resumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Graph node id
    Node(String),
    /// Legacy step index
    Step(usize),
}

/// Result of one interpreter run
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Parked until `resume_at`
    Suspended { resume: Cursor, resume_at: DateTime<Utc> },
    /// Path ended
    Finished,
    /// Record failed with a stored reason
    Failed { reason: String },
}

impl RunOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        RunOutcome::Failed { reason: reason.into() }
    }
}

/// What the loop does after a node ran
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    /// Follow an edge, optionally restricted to a handle
    Continue(Option<&'static str>),
    /// Wait this long, then move to the next node
    Delay(Duration),
    /// Re-evaluate the same node at this instant
    WaitUntil(DateTime<Utc>),
    /// End the path
    Stop,
    /// Fail the record
    Fail(String),
}

/// Per-run state shared by the node handlers
pub(crate) struct RunContext {
    pub record_id: String,
    pub tenant_id: String,
    pub recipient: String,
    pub conversation_ref: Option<String>,
    conversation_looked_up: bool,
    pub binding: TenantBinding,
    /// Aggregator whose counters include this run's sends
    pub rollup_parent: Option<String>,
    pub visits: usize,
}

/// Runs campaign executions
pub struct Interpreter {
    pub(crate) pool: DatabasePool,
    provider: Arc<dyn ChannelProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: InterpreterConfig,
    worker_id: String,
}

impl Interpreter {
    pub fn new(
        pool: DatabasePool,
        provider: Arc<dyn ChannelProvider>,
        clock: Arc<dyn Clock>,
        config: InterpreterConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            provider,
            clock,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run a record delivered through the queue.
    ///
    /// Returns `None` when the guard or the ownership compare-and-set decides
    /// another worker has it.
    pub async fn resume(&self, execution_id: &str) -> Result<Option<RunOutcome>> {
        let Some(record) = ExecutionRepository::get_by_id(&self.pool, execution_id).await? else {
            warn!(execution_id, "Execution not found, dropping job");
            return Ok(None);
        };

        let now = self.clock.now();
        let decision = guard::evaluate(
            &record,
            now,
            Duration::seconds(self.config.handoff_window_secs as i64),
            Duration::seconds(self.config.stale_after_secs as i64),
        )?;
        if !decision.may_run() {
            decision.log_skipped(execution_id);
            return Ok(None);
        }

        let owner = format!("{}:{}", self.worker_id, uuid::Uuid::new_v4());
        if !ExecutionRepository::take_ownership(&self.pool, &record, &owner, now).await? {
            debug!(execution_id, "Lost ownership race");
            return Ok(None);
        }
        if decision == GuardDecision::Recover {
            info!(execution_id, "Recovering stale execution");
        }

        let binding = match self.provider.resolve(&record.tenant_id).await {
            Ok(binding) => binding,
            Err(e) if e.is_configuration() => return self.fail(&record.id, &e.to_string()).await.map(Some),
            Err(e) => return Err(e),
        };

        self.run(&record, &binding).await.map(Some)
    }

    /// Run a record the caller already owns and persist the final state
    pub async fn run(&self, record: &ExecutionRecord, binding: &TenantBinding) -> Result<RunOutcome> {
        match self.run_inner(record, binding).await {
            Ok(RunOutcome::Finished) => {
                ExecutionRepository::mark_completed(&self.pool, &record.id, self.clock.now()).await?;
                info!(execution_id = %record.id, "Execution finished");
                Ok(RunOutcome::Finished)
            }
            Ok(RunOutcome::Failed { reason }) => self.fail(&record.id, &reason).await,
            Ok(suspended) => Ok(suspended),
            Err(e) if e.is_configuration() => self.fail(&record.id, &e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, execution_id: &str, reason: &str) -> Result<RunOutcome> {
        warn!(execution_id, reason, "Execution failed");
        ExecutionRepository::mark_failed(&self.pool, execution_id, reason, self.clock.now()).await?;
        Ok(RunOutcome::failed(reason))
    }

    async fn run_inner(&self, record: &ExecutionRecord, binding: &TenantBinding) -> Result<RunOutcome> {
        let campaign_id = record
            .campaign_id
            .as_deref()
            .ok_or_else(|| FunnelError::Configuration(format!("execution {} has no campaign", record.id)))?;
        let campaign = CampaignRepository::get_by_id(&self.pool, campaign_id)
            .await?
            .ok_or_else(|| FunnelError::Configuration(format!("campaign {} not found", campaign_id)))?;
        let recipient = record
            .recipient_address
            .clone()
            .ok_or_else(|| FunnelError::Configuration(format!("execution {} has no recipient", record.id)))?;

        let rollup_parent = match &record.parent_id {
            Some(parent_id) => ExecutionRepository::get_by_id(&self.pool, parent_id)
                .await?
                .filter(|parent| matches!(parent.kind(), Ok(ExecutionKind::Aggregator)))
                .map(|parent| parent.id),
            None => None,
        };

        let mut ctx = RunContext {
            record_id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            recipient,
            conversation_ref: record.conversation_ref.clone(),
            conversation_looked_up: record.conversation_ref.is_some(),
            binding: binding.clone(),
            rollup_parent,
            visits: 0,
        };

        debug!(execution_id = %record.id, campaign_id, "Running execution");
        match CampaignDefinition::parse(&campaign.definition)? {
            CampaignDefinition::Graph(graph) => self.run_graph(&mut ctx, &graph, record).await,
            CampaignDefinition::Linear(steps) => self.run_linear(&mut ctx, &steps, record).await,
        }
    }

    async fn run_graph(
        &self,
        ctx: &mut RunContext,
        graph: &CampaignGraph,
        record: &ExecutionRecord,
    ) -> Result<RunOutcome> {
        let mut current = match &record.current_node_id {
            Some(id) => id.clone(),
            None => match graph.start_node(&self.config.fallback_start_node) {
                Some(node) => node.id.clone(),
                None => return Ok(RunOutcome::failed("campaign has no start node")),
            },
        };

        loop {
            if let Some(outcome) = self.check_budget(ctx) {
                return Ok(outcome);
            }
            let Some(node) = graph.node(&current) else {
                return Ok(RunOutcome::failed(format!("node {} not found", current)));
            };
            debug!(execution_id = %ctx.record_id, node_id = %node.id, kind = node.kind.name(), "Executing node");

            let next = match self.execute(ctx, &node.kind).await? {
                Step::Continue(handle) => graph.next_node(&node.id, handle),
                Step::Delay(delay) => {
                    let Some(next) = graph.next_node(&node.id, None) else {
                        return Ok(RunOutcome::Finished);
                    };
                    if let Some(outcome) = self.delay(ctx, delay, Some(next), None).await? {
                        return Ok(outcome);
                    }
                    Some(next)
                }
                Step::WaitUntil(at) => {
                    let now = self.clock.now();
                    ExecutionRepository::suspend(&self.pool, &ctx.record_id, Some(&node.id), None, at, now).await?;
                    return Ok(RunOutcome::Suspended {
                        resume: Cursor::Node(node.id.clone()),
                        resume_at: at,
                    });
                }
                Step::Stop => return Ok(RunOutcome::Finished),
                Step::Fail(reason) => return Ok(RunOutcome::Failed { reason }),
            };

            match next {
                Some(next) => {
                    current = next.to_string();
                    ExecutionRepository::advance_node(&self.pool, &ctx.record_id, &current, self.clock.now())
                        .await?;
                }
                None => return Ok(RunOutcome::Finished),
            }
        }
    }

    fn check_budget(&self, ctx: &mut RunContext) -> Option<RunOutcome> {
        ctx.visits += 1;
        if ctx.visits > self.config.max_node_visits {
            return Some(RunOutcome::failed(format!(
                "node visit budget of {} exceeded",
                self.config.max_node_visits
            )));
        }
        None
    }

    /// Sleep through a short delay, or park the record at the given cursor.
    ///
    /// Returns the suspension outcome when the record was parked.
    async fn delay(
        &self,
        ctx: &RunContext,
        delay: Duration,
        next_node: Option<&str>,
        next_step: Option<usize>,
    ) -> Result<Option<RunOutcome>> {
        let threshold = Duration::seconds(self.config.short_delay_threshold_secs as i64);
        if delay <= threshold {
            if let Ok(pause) = delay.to_std() {
                self.clock.sleep(pause).await;
            }
            return Ok(None);
        }

        let now = self.clock.now();
        let resume_at = now + delay;
        ExecutionRepository::suspend(
            &self.pool,
            &ctx.record_id,
            next_node,
            next_step.map(|s| s as i64),
            resume_at,
            now,
        )
        .await?;
        debug!(execution_id = %ctx.record_id, resume_at = %resume_at, "Execution suspended");

        let resume = match (next_node, next_step) {
            (Some(node), _) => Cursor::Node(node.to_string()),
            (None, Some(step)) => Cursor::Step(step),
            (None, None) => Cursor::Step(0),
        };
        Ok(Some(RunOutcome::Suspended { resume, resume_at }))
    }

    /// Apply counters to the run and to its aggregator, if any
    pub(crate) async fn count(&self, ctx: &RunContext, delta: CounterDelta) -> Result<()> {
        let now = self.clock.now();
        ExecutionRepository::apply_counters(&self.pool, &ctx.record_id, &delta, now).await?;
        if let Some(parent) = &ctx.rollup_parent {
            ExecutionRepository::apply_counters(&self.pool, parent, &delta, now).await?;
        }
        Ok(())
    }
}

impl RunContext {
    pub(crate) fn needs_conversation_lookup(&self) -> bool {
        self.conversation_ref.is_none() && !self.conversation_looked_up
    }

    pub(crate) fn set_conversation(&mut self, conversation_ref: Option<String>) {
        self.conversation_looked_up = true;
        if conversation_ref.is_some() {
            self.conversation_ref = conversation_ref;
        }
    }
}
