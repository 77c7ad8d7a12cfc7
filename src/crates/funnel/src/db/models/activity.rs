//! Recent-activity cache model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Cached knowledge about a recipient's conversation
///
/// `last_inbound_at` is refreshed by inbound-message callbacks and decides
/// whether a free-form message may be sent instead of a template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecentActivity {
    pub tenant_id: String,
    pub address: String,
    pub last_inbound_at: Option<String>,
    pub conversation_ref: Option<String>,
    pub updated_at: String,
}
