//! HTTP implementation of the messaging channel client
//!
//! Speaks a small JSON REST surface:
//!
//! - `POST {base}/messages` with `{"to", "type", ...}` → `{"messageId"}`
//! - `GET {base}/contacts/{address}/activity` → `{"lastInboundAt"}`
//! - `GET {base}/conversations?address=` → `{"conversations": [{"id"}]}`
//! - `GET|POST {base}/conversations/{id}/labels`
//! - `POST {base}/conversations/{id}/notes`

use super::{ChannelError, ChannelResult, MessagingChannelClient, SendResult, TemplateMessage};
use crate::config::TenantConfig;
use crate::graph::{Button, MediaParams};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Channel client backed by reqwest
#[derive(Clone)]
pub struct HttpChannelClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityResponse {
    last_inbound_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ConversationList {
    #[serde(default)]
    conversations: Vec<ConversationRef>,
}

#[derive(Debug, Deserialize)]
struct ConversationRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<String>,
}

impl HttpChannelClient {
    /// Create a client for one tenant
    pub fn new(config: &TenantConfig) -> ChannelResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChannelError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let mut base_url = config.base_url.trim_end_matches('/').to_string();
        if let Some(account) = &config.account_id {
            base_url = format!("{}/accounts/{}", base_url, account);
        }

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> ChannelResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ChannelError::Api {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }

    async fn send(&self, address: &str, payload: Value) -> SendResult {
        let url = format!("{}/messages", self.base_url);
        let outcome: ChannelResult<String> = async {
            let response = self.authorize(self.client.post(&url).json(&payload)).send().await?;
            let response = Self::check(response).await?;
            let body: SendResponse = response
                .json()
                .await
                .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
            body.message_id
                .ok_or_else(|| ChannelError::InvalidResponse("missing messageId".to_string()))
        }
        .await;

        match outcome {
            Ok(message_id) => {
                debug!(address, message_id = %message_id, "Message accepted");
                SendResult::accepted(message_id)
            }
            Err(e) => {
                warn!(address, error = %e, "Message send failed");
                SendResult::rejected(e.to_string())
            }
        }
    }
}

/// Pull a readable message out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl MessagingChannelClient for HttpChannelClient {
    async fn send_text(&self, address: &str, text: &str) -> SendResult {
        self.send(address, json!({"to": address, "type": "text", "text": {"body": text}}))
            .await
    }

    async fn send_media(&self, address: &str, media: &MediaParams) -> SendResult {
        self.send(
            address,
            json!({
                "to": address,
                "type": "media",
                "media": {
                    "url": media.url,
                    "mediaType": media.media_type.as_str(),
                    "caption": media.caption,
                }
            }),
        )
        .await
    }

    async fn send_template(&self, address: &str, template: &TemplateMessage) -> SendResult {
        self.send(address, json!({"to": address, "type": "template", "template": template}))
            .await
    }

    async fn send_interactive(&self, address: &str, text: &str, buttons: &[Button]) -> SendResult {
        self.send(
            address,
            json!({
                "to": address,
                "type": "interactive",
                "interactive": {"body": text, "buttons": buttons}
            }),
        )
        .await
    }

    async fn is_recent_activity_window_open(
        &self,
        address: &str,
        window: chrono::Duration,
    ) -> ChannelResult<bool> {
        let url = format!("{}/contacts/{}/activity", self.base_url, address);
        let response = Self::check(self.authorize(self.client.get(&url)).send().await?).await?;
        let activity: ActivityResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;

        Ok(activity
            .last_inbound_at
            .map(|at| Utc::now() - at <= window)
            .unwrap_or(false))
    }

    async fn resolve_conversation(&self, address: &str) -> ChannelResult<Option<String>> {
        let url = format!("{}/conversations", self.base_url);
        let request = self.client.get(&url).query(&[("address", address)]);
        let response = Self::check(self.authorize(request).send().await?).await?;
        let list: ConversationList = response
            .json()
            .await
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;

        Ok(list.conversations.into_iter().next().map(|c| c.id))
    }

    async fn add_labels(&self, conversation_ref: &str, labels: &[String]) -> ChannelResult<()> {
        let url = format!("{}/conversations/{}/labels", self.base_url, conversation_ref);
        let request = self.client.post(&url).json(&json!({ "labels": labels }));
        Self::check(self.authorize(request).send().await?).await?;
        Ok(())
    }

    async fn conversation_labels(&self, conversation_ref: &str) -> ChannelResult<Vec<String>> {
        let url = format!("{}/conversations/{}/labels", self.base_url, conversation_ref);
        let response = Self::check(self.authorize(self.client.get(&url)).send().await?).await?;
        let list: LabelList = response
            .json()
            .await
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
        Ok(list.labels)
    }

    async fn post_internal_note(&self, conversation_ref: &str, note: &str) -> ChannelResult<()> {
        let url = format!("{}/conversations/{}/notes", self.base_url, conversation_ref);
        let request = self
            .client
            .post(&url)
            .json(&json!({ "content": note, "private": true }));
        Self::check(self.authorize(request).send().await?).await?;
        Ok(())
    }
}
