//! Messaging channel client abstraction
//!
//! Sends never fail with an error: transport and API failures are folded into
//! a [`SendResult`] so a bulk batch can classify them per recipient. Lookups
//! (window check, conversation resolution, labels, notes) return
//! [`ChannelResult`].

pub mod http;
pub mod provider;

pub use http::HttpChannelClient;
pub use provider::{ChannelProvider, ConfiguredChannelProvider, TenantBinding};

use crate::graph::{Button, MediaParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by channel lookups
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The channel answered with a non-success status
    #[error("Channel API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The channel answered with a body we cannot read
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Client could not be built from tenant settings
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for channel lookups
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Normalized outcome of one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl SendResult {
    /// Message accepted under `channel_message_id`
    pub fn accepted(channel_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            channel_message_id: Some(channel_message_id.into()),
            error_detail: None,
        }
    }

    /// Message rejected
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            channel_message_id: None,
            error_detail: Some(detail.into()),
        }
    }

    /// Reason to store for a failed send
    pub fn failure_reason(&self) -> String {
        self.error_detail
            .clone()
            .unwrap_or_else(|| "channel rejected the message".to_string())
    }
}

/// Approved template reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<serde_json::Value>,
}

impl TemplateMessage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
            components: None,
        }
    }
}

/// Client for one tenant's messaging channel
#[async_trait]
pub trait MessagingChannelClient: Send + Sync {
    /// Send free-form text
    async fn send_text(&self, address: &str, text: &str) -> SendResult;

    /// Send an image, video, audio or document by URL
    async fn send_media(&self, address: &str, media: &MediaParams) -> SendResult;

    /// Send an approved template (chargeable)
    async fn send_template(&self, address: &str, template: &TemplateMessage) -> SendResult;

    /// Send text with reply buttons
    async fn send_interactive(&self, address: &str, text: &str, buttons: &[Button]) -> SendResult;

    /// Whether the recipient wrote within `window`, so free-form text is allowed
    async fn is_recent_activity_window_open(&self, address: &str, window: chrono::Duration)
        -> ChannelResult<bool>;

    /// Conversation handle of a recipient, if one exists
    async fn resolve_conversation(&self, address: &str) -> ChannelResult<Option<String>>;

    /// Attach labels to a conversation
    async fn add_labels(&self, conversation_ref: &str, labels: &[String]) -> ChannelResult<()>;

    /// Labels currently attached to a conversation
    async fn conversation_labels(&self, conversation_ref: &str) -> ChannelResult<Vec<String>>;

    /// Post a note visible to agents only
    async fn post_internal_note(&self, conversation_ref: &str, note: &str) -> ChannelResult<()>;
}
