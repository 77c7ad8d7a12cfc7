//! Template-or-free-form send decision
//!
//! A template is chargeable and always allowed. Free-form text is free but
//! only allowed while the recipient's recent-activity window is open, so when
//! a fallback text exists the window is checked first: the local cache, then
//! the channel.

use crate::channel::{SendResult, TemplateMessage, TenantBinding};
use crate::db::models::MessageKind;
use crate::db::repositories::ActivityRepository;
use crate::db::{parse_timestamp, DatabasePool};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// What was sent and what it cost
#[derive(Debug, Clone, PartialEq)]
pub struct SmartSendOutcome {
    pub result: SendResult,
    pub kind: MessageKind,
    pub cost: f64,
}

/// Whether free-form text may be sent to `address` right now
pub async fn window_open(pool: &DatabasePool, binding: &TenantBinding, address: &str, now: DateTime<Utc>) -> bool {
    match ActivityRepository::get(pool, &binding.tenant_id, address).await {
        Ok(Some(activity)) => {
            let cached = activity
                .last_inbound_at
                .as_deref()
                .and_then(|at| parse_timestamp(at).ok())
                .map(|at| now - at <= binding.activity_window)
                .unwrap_or(false);
            if cached {
                return true;
            }
        }
        Ok(None) => {}
        Err(e) => warn!(address, error = %e, "Activity cache lookup failed"),
    }

    match binding
        .client
        .is_recent_activity_window_open(address, binding.activity_window)
        .await
    {
        Ok(open) => open,
        Err(e) => {
            warn!(address, error = %e, "Window check failed, assuming closed");
            false
        }
    }
}

/// Send `fallback_text` when allowed and `check_window` is set, else the template
pub async fn send(
    pool: &DatabasePool,
    binding: &TenantBinding,
    address: &str,
    template: &TemplateMessage,
    fallback_text: Option<&str>,
    check_window: bool,
    now: DateTime<Utc>,
) -> SmartSendOutcome {
    if let Some(text) = fallback_text.filter(|_| check_window) {
        if window_open(pool, binding, address, now).await {
            debug!(address, "Window open, sending free-form fallback");
            return SmartSendOutcome {
                result: binding.client.send_text(address, text).await,
                kind: MessageKind::Fallback,
                cost: 0.0,
            };
        }
    }

    SmartSendOutcome {
        result: binding.client.send_template(address, template).await,
        kind: MessageKind::Template,
        cost: binding.template_cost,
    }
}
