//! Error types for the funnel engine
//!
//! Provides a unified error type for interpreter, orchestrator, scheduler and
//! reconciler operations.

use crate::db::DatabaseError;
use thiserror::Error;

/// Result type alias for funnel operations
pub type Result<T> = std::result::Result<T, FunnelError>;

/// Errors that can occur while running campaigns
#[derive(Debug, Error)]
pub enum FunnelError {
    /// Missing campaign, missing channel credentials and similar. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Campaign definition could not be parsed
    #[error("Invalid campaign graph: {0}")]
    InvalidGraph(String),

    /// Messaging channel failure that is not a per-send outcome
    #[error("Channel error: {0}")]
    Channel(String),

    /// Broker publish/consume failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Operation not allowed in the record's current status
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Config file loading or parsing failure
    #[error("Config error: {0}")]
    Config(String),

    /// Persistence failure
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FunnelError {
    /// Configuration errors fail the record immediately instead of being retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, FunnelError::Configuration(_) | FunnelError::InvalidGraph(_))
    }
}

impl From<sqlx::Error> for FunnelError {
    fn from(err: sqlx::Error) -> Self {
        FunnelError::Database(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        assert!(FunnelError::Configuration("no campaign".into()).is_configuration());
        assert!(FunnelError::InvalidGraph("bad json".into()).is_configuration());
        assert!(!FunnelError::Channel("timeout".into()).is_configuration());
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: FunnelError = sqlx::Error::RowNotFound.into();
        match err {
            FunnelError::Database(db) => assert!(db.is_not_found()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_state_transition_display() {
        let err = FunnelError::InvalidStateTransition {
            from: "completed".into(),
            to: "paused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from completed to paused"
        );
    }
}
