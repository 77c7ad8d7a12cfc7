//! Database models
//!
//! Core data models for persistent storage. All timestamp fields are stored
//! as RFC 3339 strings (TEXT in SQLite), see [`crate::db::timestamp`].
//! Contact lists are stored as JSON arrays in TEXT columns.

pub mod activity;
pub mod block_list;
pub mod campaign;
pub mod delivery;
pub mod execution;

pub use activity::RecentActivity;
pub use block_list::BlockListEntry;
pub use campaign::Campaign;
pub use delivery::{DeliveryRecord, DeliveryStatus, MessageKind, RecipientFailure};
pub use execution::{BulkMode, BulkOptions, ExecutionKind, ExecutionRecord, ExecutionStatus};
