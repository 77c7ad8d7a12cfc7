//! Delivery record and recipient failure models

use crate::db::{timestamp, DatabaseError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Channel-reported status of one sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Progress order of the non-failure statuses
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
            DeliveryStatus::Failed => 3,
        }
    }

    /// Delivered or read
    pub fn reached_recipient(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Read)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" | "undelivered" => Ok(DeliveryStatus::Failed),
            other => Err(DatabaseError::type_error(format!("unknown delivery status '{}'", other))),
        }
    }
}

/// What kind of message produced a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Media,
    Interactive,
    Template,
    /// Free-form text sent in place of a template while the window was open
    Fallback,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Media => "media",
            MessageKind::Interactive => "interactive",
            MessageKind::Template => "template",
            MessageKind::Fallback => "fallback",
        }
    }
}

/// One message accepted by the messaging channel
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub id: String,
    pub execution_id: String,

    /// Identifier assigned by the channel; delivery callbacks are keyed by it
    pub channel_message_id: String,

    pub recipient_address: String,
    pub conversation_ref: Option<String>,
    pub message_kind: String,

    /// Amount charged for this message, refunded if it later fails
    pub cost: f64,

    pub status: String,
    pub is_interaction: bool,

    /// Internal note to post once the message is confirmed delivered
    pub pending_note: Option<String>,
    pub note_sent: bool,

    pub created_at: String,
    pub updated_at: String,
}

impl DeliveryRecord {
    /// A freshly sent message
    pub fn new(
        execution_id: impl Into<String>,
        channel_message_id: impl Into<String>,
        recipient_address: impl Into<String>,
        kind: MessageKind,
        cost: f64,
    ) -> Self {
        let now = timestamp(chrono::Utc::now());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            channel_message_id: channel_message_id.into(),
            recipient_address: recipient_address.into(),
            conversation_ref: None,
            message_kind: kind.as_str().to_string(),
            cost,
            status: DeliveryStatus::Sent.as_str().to_string(),
            is_interaction: false,
            pending_note: None,
            note_sent: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Builder method to attach the conversation handle
    pub fn with_conversation_ref(mut self, conversation_ref: Option<String>) -> Self {
        self.conversation_ref = conversation_ref;
        self
    }

    /// Builder method to defer an internal note until delivery
    pub fn with_pending_note(mut self, note: Option<String>) -> Self {
        self.pending_note = note;
        self
    }

    pub fn status(&self) -> DbResult<DeliveryStatus> {
        self.status.parse()
    }
}

/// Why one recipient of an execution was not reached
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipientFailure {
    pub id: i64,
    pub execution_id: String,
    pub recipient_address: String,
    pub reason: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status_parse() {
        assert_eq!("DELIVERED".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Delivered);
        assert_eq!("undelivered".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Failed);
        assert!("queued".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_rank_order() {
        assert!(DeliveryStatus::Sent.rank() < DeliveryStatus::Delivered.rank());
        assert!(DeliveryStatus::Delivered.rank() < DeliveryStatus::Read.rank());
    }

    #[test]
    fn test_new_delivery_record() {
        let record = DeliveryRecord::new("exec-1", "wamid.1", "+1555", MessageKind::Template, 0.05)
            .with_pending_note(Some("sent promo".to_string()));

        assert_eq!(record.status().unwrap(), DeliveryStatus::Sent);
        assert_eq!(record.message_kind, "template");
        assert_eq!(record.pending_note.as_deref(), Some("sent promo"));
        assert!(!record.note_sent);
    }
}
