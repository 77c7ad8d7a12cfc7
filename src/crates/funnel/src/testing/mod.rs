//! Test infrastructure and helpers for the funnel crate
//!
//! This module provides:
//! - A migrated SQLite database in a temporary directory
//! - A recording channel client with configurable latency and failures
//! - A static tenant provider
//! - A manually driven clock

use crate::channel::{
    ChannelError, ChannelProvider, ChannelResult, MessagingChannelClient, SendResult, TemplateMessage,
    TenantBinding,
};
use crate::clock::Clock;
use crate::db::{DatabaseConnection, DatabasePool};
use crate::error::{FunnelError, Result};
use crate::graph::{Button, MediaParams};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test database that is deleted with its directory on drop
pub struct TestDatabase {
    _temp_dir: TempDir,

    /// Migrated connection
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Create and migrate a database in a temporary directory
    ///
    /// # Example
    /// ```no_run
    /// use funnel::testing::TestDatabase;
    ///
    /// #[tokio::test]
    /// async fn test_something() {
    ///     let db = TestDatabase::new().await.unwrap();
    ///     // use db.pool()
    /// }
    /// ```
    pub async fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()
            .map_err(|e| FunnelError::Config(format!("Failed to create temp dir: {}", e)))?;
        let url = format!("sqlite:{}", temp_dir.path().join("funnel-test.db").display());

        let connection = DatabaseConnection::new(&url).await?;
        connection
            .run_migrations()
            .await
            .map_err(crate::db::DatabaseError::from)?;

        Ok(Self {
            _temp_dir: temp_dir,
            connection,
        })
    }

    pub fn pool(&self) -> &DatabasePool {
        self.connection.pool()
    }

    pub fn path(&self) -> PathBuf {
        self._temp_dir.path().to_path_buf()
    }
}

/// One call observed by [`RecordingChannel`]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCall {
    Text { address: String, text: String },
    Media { address: String, url: String },
    Template { address: String, name: String },
    Interactive { address: String, text: String, buttons: usize },
    WindowCheck { address: String },
    ResolveConversation { address: String },
    AddLabels { conversation_ref: String, labels: Vec<String> },
    ConversationLabels { conversation_ref: String },
    Note { conversation_ref: String, note: String },
}

impl ChannelCall {
    /// Whether the call delivers a message to a recipient
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            ChannelCall::Text { .. }
                | ChannelCall::Media { .. }
                | ChannelCall::Template { .. }
                | ChannelCall::Interactive { .. }
        )
    }

    /// Recipient of a send
    pub fn address(&self) -> Option<&str> {
        match self {
            ChannelCall::Text { address, .. }
            | ChannelCall::Media { address, .. }
            | ChannelCall::Template { address, .. }
            | ChannelCall::Interactive { address, .. }
            | ChannelCall::WindowCheck { address }
            | ChannelCall::ResolveConversation { address } => Some(address),
            _ => None,
        }
    }
}

/// A call plus when it started
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub started_at: Instant,
    pub call: ChannelCall,
}

/// Fake channel client that records every call.
///
/// Sends succeed with ids `msg-1`, `msg-2`, ... unless the address was marked
/// failing. Each send sleeps for the configured latency while counted as in
/// flight, so tests can assert the concurrency bound.
#[derive(Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
    failing: HashSet<String>,
    failing_templates: bool,
    open_windows: HashSet<String>,
    conversations: HashMap<String, String>,
    labels: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to delay every send
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Builder method to reject sends to `address`
    pub fn failing_for(mut self, address: impl Into<String>) -> Self {
        self.failing.insert(address.into());
        self
    }

    /// Builder method to reject every template send
    pub fn failing_templates(mut self) -> Self {
        self.failing_templates = true;
        self
    }

    /// Builder method to report an open activity window for `address`
    pub fn with_open_window(mut self, address: impl Into<String>) -> Self {
        self.open_windows.insert(address.into());
        self
    }

    /// Builder method to resolve `address` to a conversation
    pub fn with_conversation(mut self, address: impl Into<String>, conversation_ref: impl Into<String>) -> Self {
        self.conversations.insert(address.into(), conversation_ref.into());
        self
    }

    /// Builder method to preset the labels of a conversation
    pub fn with_labels(self, conversation_ref: impl Into<String>, labels: &[&str]) -> Self {
        self.labels.lock().insert(
            conversation_ref.into(),
            labels.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Message sends only, in call order
    pub fn sends(&self) -> Vec<ChannelCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.call.is_send())
            .map(|c| c.call.clone())
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.sends().len()
    }

    /// Sends addressed to `address`
    pub fn sends_to(&self, address: &str) -> Vec<ChannelCall> {
        self.sends()
            .into_iter()
            .filter(|c| c.address() == Some(address))
            .collect()
    }

    /// Highest number of sends observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Internal notes posted so far
    pub fn notes(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.call {
                ChannelCall::Note { conversation_ref, note } => Some((conversation_ref.clone(), note.clone())),
                _ => None,
            })
            .collect()
    }

    /// Current labels of a conversation
    pub fn labels_of(&self, conversation_ref: &str) -> Vec<String> {
        self.labels.lock().get(conversation_ref).cloned().unwrap_or_default()
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().push(RecordedCall {
            started_at: Instant::now(),
            call,
        });
    }

    async fn deliver(&self, call: ChannelCall, rejected: bool) -> SendResult {
        let address = call.address().unwrap_or_default().to_string();
        self.record(call);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if rejected || self.failing.contains(&address) {
            return SendResult::rejected(format!("recipient {} unreachable", address));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        SendResult::accepted(format!("msg-{}", id))
    }
}

#[async_trait]
impl MessagingChannelClient for RecordingChannel {
    async fn send_text(&self, address: &str, text: &str) -> SendResult {
        let call = ChannelCall::Text {
            address: address.to_string(),
            text: text.to_string(),
        };
        self.deliver(call, false).await
    }

    async fn send_media(&self, address: &str, media: &MediaParams) -> SendResult {
        let call = ChannelCall::Media {
            address: address.to_string(),
            url: media.url.clone(),
        };
        self.deliver(call, false).await
    }

    async fn send_template(&self, address: &str, template: &TemplateMessage) -> SendResult {
        let call = ChannelCall::Template {
            address: address.to_string(),
            name: template.name.clone(),
        };
        self.deliver(call, self.failing_templates).await
    }

    async fn send_interactive(&self, address: &str, text: &str, buttons: &[Button]) -> SendResult {
        let call = ChannelCall::Interactive {
            address: address.to_string(),
            text: text.to_string(),
            buttons: buttons.len(),
        };
        self.deliver(call, false).await
    }

    async fn is_recent_activity_window_open(&self, address: &str, _window: chrono::Duration) -> ChannelResult<bool> {
        self.record(ChannelCall::WindowCheck {
            address: address.to_string(),
        });
        Ok(self.open_windows.contains(address))
    }

    async fn resolve_conversation(&self, address: &str) -> ChannelResult<Option<String>> {
        self.record(ChannelCall::ResolveConversation {
            address: address.to_string(),
        });
        Ok(self.conversations.get(address).cloned())
    }

    async fn add_labels(&self, conversation_ref: &str, labels: &[String]) -> ChannelResult<()> {
        self.record(ChannelCall::AddLabels {
            conversation_ref: conversation_ref.to_string(),
            labels: labels.to_vec(),
        });
        let mut all = self.labels.lock();
        let existing = all.entry(conversation_ref.to_string()).or_default();
        for label in labels {
            if !existing.contains(label) {
                existing.push(label.clone());
            }
        }
        Ok(())
    }

    async fn conversation_labels(&self, conversation_ref: &str) -> ChannelResult<Vec<String>> {
        self.record(ChannelCall::ConversationLabels {
            conversation_ref: conversation_ref.to_string(),
        });
        Ok(self.labels_of(conversation_ref))
    }

    async fn post_internal_note(&self, conversation_ref: &str, note: &str) -> ChannelResult<()> {
        if conversation_ref.is_empty() {
            return Err(ChannelError::InvalidResponse("empty conversation".to_string()));
        }
        self.record(ChannelCall::Note {
            conversation_ref: conversation_ref.to_string(),
            note: note.to_string(),
        });
        Ok(())
    }
}

/// Provider over a fixed set of bindings
#[derive(Default)]
pub struct StaticChannelProvider {
    bindings: HashMap<String, TenantBinding>,
}

impl StaticChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider for one tenant backed by `client`
    pub fn single(tenant_id: &str, client: Arc<dyn MessagingChannelClient>) -> Self {
        Self::new().with_binding(TenantBinding::new(tenant_id, client))
    }

    /// Builder method to add a binding
    pub fn with_binding(mut self, binding: TenantBinding) -> Self {
        self.bindings.insert(binding.tenant_id.clone(), binding);
        self
    }
}

#[async_trait]
impl ChannelProvider for StaticChannelProvider {
    async fn resolve(&self, tenant_id: &str) -> Result<TenantBinding> {
        self.bindings
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| FunnelError::Configuration(format!("no channel configured for tenant {}", tenant_id)))
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// Every duration passed to `sleep`
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        if let Ok(by) = chrono::Duration::from_std(duration) {
            self.advance(by);
        }
        tokio::task::yield_now().await;
    }
}
