//! Message broker abstraction
//!
//! Three point-to-point queues carry work between the scheduler, the
//! reconciler and workers; one fan-out channel carries progress events to
//! whoever is watching a bulk send.

pub mod memory;

pub use memory::MemoryBroker;

use crate::db::models::{BulkMode, BulkOptions, ExecutionRecord};
use crate::db::DbResult;
use crate::error::{FunnelError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Queue of single-recipient campaign runs
pub const FUNNEL_EXECUTIONS: &str = "funnel_executions";
/// Queue of bulk sends
pub const BULK_SENDS: &str = "bulk_sends";
/// Queue of deferred internal notes
pub const INTERNAL_NOTES: &str = "internal_notes";

/// Point-to-point queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    FunnelExecutions,
    BulkSends,
    InternalNotes,
}

impl Queue {
    pub fn name(&self) -> &'static str {
        match self {
            Queue::FunnelExecutions => FUNNEL_EXECUTIONS,
            Queue::BulkSends => BULK_SENDS,
            Queue::InternalNotes => INTERNAL_NOTES,
        }
    }
}

/// Payload of `funnel_executions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub execution_id: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub conversation_ref: Option<String>,
    #[serde(default)]
    pub recipient_address: Option<String>,
}

impl ExecutionJob {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id.clone(),
            campaign_id: record.campaign_id.clone(),
            conversation_ref: record.conversation_ref.clone(),
            recipient_address: record.recipient_address.clone(),
        }
    }
}

/// Payload of `bulk_sends`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJob {
    pub execution_id: String,
    pub mode: BulkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    pub contacts: Vec<String>,
    pub delay_seconds: u64,
    pub concurrency_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_text: Option<String>,
}

impl BulkJob {
    /// Rebuild the job from a persisted bulk record
    pub fn from_record(record: &ExecutionRecord) -> DbResult<Self> {
        let options = record.bulk_options()?.ok_or_else(|| {
            crate::db::DatabaseError::type_error(format!("bulk record {} has no options", record.id))
        })?;

        Ok(Self {
            execution_id: record.id.clone(),
            mode: options.mode,
            campaign_id: record.campaign_id.clone(),
            template_name: options.template_name,
            contacts: record.contacts()?,
            delay_seconds: options.delay_seconds,
            concurrency_limit: options.concurrency_limit,
            language: options.language,
            components: options.components,
            fallback_text: options.fallback_text,
        })
    }

    /// Options carried by the job
    pub fn options(&self) -> BulkOptions {
        BulkOptions {
            mode: self.mode,
            template_name: self.template_name.clone(),
            language: self.language.clone(),
            components: self.components.clone(),
            fallback_text: self.fallback_text.clone(),
            delay_seconds: self.delay_seconds,
            concurrency_limit: self.concurrency_limit,
        }
    }
}

/// Payload of `internal_notes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteJob {
    pub execution_id: String,
    pub tenant_id: String,
    pub conversation_ref: Option<String>,
    pub recipient_address: String,
    pub note: String,
}

/// Any queued unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Execution(ExecutionJob),
    Bulk(BulkJob),
    Note(NoteJob),
}

impl Job {
    pub fn queue(&self) -> Queue {
        match self {
            Job::Execution(_) => Queue::FunnelExecutions,
            Job::Bulk(_) => Queue::BulkSends,
            Job::Note(_) => Queue::InternalNotes,
        }
    }

    /// JSON body as written to the queue
    pub fn to_payload(&self) -> Result<String> {
        let payload = match self {
            Job::Execution(job) => serde_json::to_string(job)?,
            Job::Bulk(job) => serde_json::to_string(job)?,
            Job::Note(job) => serde_json::to_string(job)?,
        };
        Ok(payload)
    }

    /// Decode a JSON body read from `queue`
    pub fn from_payload(queue: Queue, payload: &str) -> Result<Self> {
        let job = match queue {
            Queue::FunnelExecutions => Job::Execution(serde_json::from_str(payload)?),
            Queue::BulkSends => Job::Bulk(serde_json::from_str(payload)?),
            Queue::InternalNotes => Job::Note(serde_json::from_str(payload)?),
        };
        Ok(job)
    }
}

/// Progress snapshot of an execution, published on the fan-out channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Always `"progress"`
    pub event: String,
    pub execution_id: String,
    pub status: String,
    pub sent: i64,
    pub failed: i64,
    pub delivered: i64,
    pub read: i64,
    pub interactions: i64,
    pub blocked: i64,
    pub cost: f64,
    pub processed_contacts: Vec<String>,
    pub pending_contacts: Vec<String>,
}

impl ProgressEvent {
    /// Snapshot of a freshly read record
    pub fn from_record(record: &ExecutionRecord) -> DbResult<Self> {
        Ok(Self {
            event: "progress".to_string(),
            execution_id: record.id.clone(),
            status: record.status.clone(),
            sent: record.sent,
            failed: record.failed,
            delivered: record.delivered,
            read: record.read_count,
            interactions: record.interactions,
            blocked: record.blocked,
            cost: record.cost,
            processed_contacts: record.processed()?,
            pending_contacts: record.pending()?,
        })
    }
}

/// Durable queues plus a progress fan-out
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job on its queue
    async fn publish(&self, job: Job) -> Result<()>;

    /// Wait for the next job of `queue`; `None` once the broker is closed
    async fn consume(&self, queue: Queue) -> Result<Option<Job>>;

    /// Broadcast a progress event to current subscribers
    async fn publish_progress(&self, event: ProgressEvent) -> Result<()>;

    /// Subscribe to progress events published from now on
    fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent>;

    async fn enqueue_execution(&self, job: ExecutionJob) -> Result<()> {
        self.publish(Job::Execution(job)).await
    }

    async fn enqueue_bulk(&self, job: BulkJob) -> Result<()> {
        self.publish(Job::Bulk(job)).await
    }

    async fn enqueue_note(&self, job: NoteJob) -> Result<()> {
        self.publish(Job::Note(job)).await
    }
}

pub(crate) fn broker_error(queue: Queue, detail: impl std::fmt::Display) -> FunnelError {
    FunnelError::Broker(format!("{}: {}", queue.name(), detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_job_wire_names() {
        let job = BulkJob {
            execution_id: "e1".to_string(),
            mode: BulkMode::Template,
            campaign_id: None,
            template_name: Some("promo".to_string()),
            contacts: vec!["1".to_string()],
            delay_seconds: 2,
            concurrency_limit: 3,
            language: Some("pt_BR".to_string()),
            components: None,
            fallback_text: None,
        };
        let json: serde_json::Value = serde_json::from_str(&Job::Bulk(job.clone()).to_payload().unwrap()).unwrap();
        assert_eq!(json["executionId"], "e1");
        assert_eq!(json["templateName"], "promo");
        assert_eq!(json["delaySeconds"], 2);
        assert_eq!(json["concurrencyLimit"], 3);
        assert!(json.get("campaignId").is_none());

        let decoded = Job::from_payload(Queue::BulkSends, &json.to_string()).unwrap();
        assert_eq!(decoded, Job::Bulk(job));
    }

    #[test]
    fn test_bulk_job_from_record() {
        let options = BulkOptions::template("promo", 1, 2).with_fallback_text("hey");
        let record = ExecutionRecord::bulk("t1", &options, vec!["a".into(), "b".into()]).unwrap();

        let job = BulkJob::from_record(&record).unwrap();
        assert_eq!(job.execution_id, record.id);
        assert_eq!(job.contacts, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(job.options(), options);
    }

    #[test]
    fn test_progress_event_wire_names() {
        let record = ExecutionRecord::bulk("t1", &BulkOptions::campaign(0, 1), vec!["a".into()]).unwrap();
        let event = ProgressEvent::from_record(&record).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["executionId"], record.id.as_str());
        assert_eq!(json["pendingContacts"][0], "a");
        assert_eq!(json["read"], 0);
    }

    #[test]
    fn test_execution_job_payload() {
        let job = ExecutionJob {
            execution_id: "e1".into(),
            campaign_id: Some("c1".into()),
            conversation_ref: None,
            recipient_address: Some("+1".into()),
        };
        let payload = Job::Execution(job).to_payload().unwrap();
        assert!(payload.contains("\"recipientAddress\":\"+1\""));
        assert_eq!(Job::from_payload(Queue::FunnelExecutions, &payload).unwrap().queue(), Queue::FunnelExecutions);
    }
}
