//! Execution record model for database persistence
//!
//! An execution record is the durable cursor of one campaign run: which node
//! comes next, when it is due, and the counters reported to the UI. Bulk sends
//! use the same table with the contact lists filled in.

use crate::db::{parse_timestamp, timestamp, DatabaseError, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for `scheduled_at` to pass
    Queued,
    /// Claimed by a scheduler or owned by a worker
    Processing,
    /// Bulk send held at a batch boundary
    Paused,
    /// Cancellation requested, observed at the next batch boundary
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Column value for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Terminal states are only left through an explicit retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether a cancellation has been requested or applied
    pub fn is_cancel_requested(&self) -> bool {
        matches!(self, ExecutionStatus::Cancelling | ExecutionStatus::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" | "pending" => Ok(ExecutionStatus::Queued),
            "processing" => Ok(ExecutionStatus::Processing),
            "paused" => Ok(ExecutionStatus::Paused),
            "cancelling" => Ok(ExecutionStatus::Cancelling),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(DatabaseError::type_error(format!("unknown execution status '{}'", other))),
        }
    }
}

/// What an execution record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// One recipient walking one campaign
    Single,
    /// One bulk send over a contact list
    Bulk,
    /// Reporting parent for interaction-triggered runs; never claimed
    Aggregator,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Single => "single",
            ExecutionKind::Bulk => "bulk",
            ExecutionKind::Aggregator => "aggregator",
        }
    }
}

impl FromStr for ExecutionKind {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ExecutionKind::Single),
            "bulk" => Ok(ExecutionKind::Bulk),
            "aggregator" => Ok(ExecutionKind::Aggregator),
            other => Err(DatabaseError::type_error(format!("unknown execution kind '{}'", other))),
        }
    }
}

/// How a bulk send delivers to each recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    /// Direct template send (smart send when a fallback is configured)
    Template,
    /// Run a campaign per recipient
    Campaign,
}

/// Parameters of a bulk send, persisted with the record so the scheduler can
/// rebuild the broker job after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOptions {
    pub mode: BulkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<serde_json::Value>,
    /// Free-form text preferred over the template when the window is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_text: Option<String>,
    /// Pause between batches
    pub delay_seconds: u64,
    /// Maximum in-flight sends per batch
    pub concurrency_limit: usize,
}

impl BulkOptions {
    /// Template blast with the given pacing
    pub fn template(name: impl Into<String>, delay_seconds: u64, concurrency_limit: usize) -> Self {
        Self {
            mode: BulkMode::Template,
            template_name: Some(name.into()),
            language: None,
            components: None,
            fallback_text: None,
            delay_seconds,
            concurrency_limit,
        }
    }

    /// Campaign-driven bulk with the given pacing
    pub fn campaign(delay_seconds: u64, concurrency_limit: usize) -> Self {
        Self {
            mode: BulkMode::Campaign,
            template_name: None,
            language: None,
            components: None,
            fallback_text: None,
            delay_seconds,
            concurrency_limit,
        }
    }

    /// Builder method to set the free-form fallback text
    pub fn with_fallback_text(mut self, text: impl Into<String>) -> Self {
        self.fallback_text = Some(text.into());
        self
    }

    /// Builder method to set the template language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Represents an execution record ("trigger") in the database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    /// Unique identifier (UUID string)
    pub id: String,

    /// Tenant whose channel credentials are used
    pub tenant_id: String,

    /// single, bulk or aggregator
    pub kind: String,

    /// Campaign being executed (graph mode and campaign bulk)
    pub campaign_id: Option<String>,

    /// Bulk send or aggregator this run rolls up into
    pub parent_id: Option<String>,

    /// Recipient of a single run
    pub recipient_address: Option<String>,

    /// Conversation handle resolved through the channel
    pub conversation_ref: Option<String>,

    /// Current status, see [`ExecutionStatus`]
    pub status: String,

    /// Next graph node to execute
    pub current_node_id: Option<String>,

    /// Next step of a legacy linear campaign
    pub current_step_index: Option<i64>,

    /// Due time of the next action (RFC 3339)
    pub scheduled_at: String,

    /// JSON array of every contact of a bulk send
    pub contacts_list: String,

    /// JSON array of contacts already handled
    pub processed_contacts: String,

    /// JSON array of contacts not yet handled
    pub pending_contacts: String,

    pub sent: i64,
    pub failed: i64,
    pub delivered: i64,
    pub read_count: i64,
    pub interactions: i64,
    pub blocked: i64,
    pub cost: f64,

    /// JSON-encoded [`BulkOptions`] for bulk records
    pub bulk_options: Option<String>,

    /// Reason stored when the record failed
    pub failure_reason: Option<String>,

    /// Worker that owns a processing record; NULL right after a scheduler claim
    pub claimed_by: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}

impl ExecutionRecord {
    fn blank(tenant_id: String, kind: ExecutionKind) -> Self {
        let now = timestamp(Utc::now());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            kind: kind.as_str().to_string(),
            campaign_id: None,
            parent_id: None,
            recipient_address: None,
            conversation_ref: None,
            status: ExecutionStatus::Queued.as_str().to_string(),
            current_node_id: None,
            current_step_index: None,
            scheduled_at: now.clone(),
            contacts_list: "[]".to_string(),
            processed_contacts: "[]".to_string(),
            pending_contacts: "[]".to_string(),
            sent: 0,
            failed: 0,
            delivered: 0,
            read_count: 0,
            interactions: 0,
            blocked: 0,
            cost: 0.0,
            bulk_options: None,
            failure_reason: None,
            claimed_by: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// A queued single-recipient run of a campaign, due immediately
    pub fn single(
        tenant_id: impl Into<String>,
        campaign_id: impl Into<String>,
        recipient_address: impl Into<String>,
    ) -> Self {
        let mut record = Self::blank(tenant_id.into(), ExecutionKind::Single);
        record.campaign_id = Some(campaign_id.into());
        record.recipient_address = Some(recipient_address.into());
        record
    }

    /// A queued bulk send over `contacts`, due immediately
    pub fn bulk(tenant_id: impl Into<String>, options: &BulkOptions, contacts: Vec<String>) -> DbResult<Self> {
        let mut record = Self::blank(tenant_id.into(), ExecutionKind::Bulk);
        record.bulk_options = Some(serde_json::to_string(options)?);
        record.contacts_list = serde_json::to_string(&contacts)?;
        record.pending_contacts = record.contacts_list.clone();
        Ok(record)
    }

    /// A synthetic reporting parent; created terminal so it is never claimed
    pub fn aggregator(tenant_id: impl Into<String>, campaign_id: impl Into<String>) -> Self {
        let mut record = Self::blank(tenant_id.into(), ExecutionKind::Aggregator);
        record.campaign_id = Some(campaign_id.into());
        record.status = ExecutionStatus::Completed.as_str().to_string();
        record
    }

    /// Builder method to link the record to a parent
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Builder method to set the campaign (campaign-driven bulk)
    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    /// Builder method to set the conversation handle
    pub fn with_conversation_ref(mut self, conversation_ref: impl Into<String>) -> Self {
        self.conversation_ref = Some(conversation_ref.into());
        self
    }

    /// Builder method to set the due time
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = timestamp(at);
        self
    }

    /// Builder method to set the initial status
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status.as_str().to_string();
        self
    }

    pub fn status(&self) -> DbResult<ExecutionStatus> {
        self.status.parse()
    }

    pub fn kind(&self) -> DbResult<ExecutionKind> {
        self.kind.parse()
    }

    pub fn scheduled_at(&self) -> DbResult<DateTime<Utc>> {
        parse_timestamp(&self.scheduled_at)
    }

    pub fn updated_at(&self) -> DbResult<DateTime<Utc>> {
        parse_timestamp(&self.updated_at)
    }

    pub fn contacts(&self) -> DbResult<Vec<String>> {
        Ok(serde_json::from_str(&self.contacts_list)?)
    }

    pub fn processed(&self) -> DbResult<Vec<String>> {
        Ok(serde_json::from_str(&self.processed_contacts)?)
    }

    pub fn pending(&self) -> DbResult<Vec<String>> {
        Ok(serde_json::from_str(&self.pending_contacts)?)
    }

    pub fn bulk_options(&self) -> DbResult<Option<BulkOptions>> {
        match &self.bulk_options {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}
