//! Resume guard: decides whether a delivered job may run its record
//!
//! Jobs are delivered at least once, so a record can reach two workers. The
//! guard rejects records another worker is actively running; the ownership
//! compare-and-set that follows settles races between two guards that both
//! said yes.

use crate::db::models::{ExecutionRecord, ExecutionStatus};
use crate::db::DbResult;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Queued and due
    Proceed,
    /// Freshly claimed by the scheduler and not yet owned
    Handoff,
    /// Processing but untouched for longer than the stale threshold
    Recover,
    /// Claimed by the scheduler but the job sat in the queue past the handoff
    /// window; left for stale recovery
    HandoffExpired,
    /// Leave the record alone
    Skip(String),
}

impl GuardDecision {
    pub fn may_run(&self) -> bool {
        matches!(
            self,
            GuardDecision::Proceed | GuardDecision::Handoff | GuardDecision::Recover
        )
    }

    /// Log why a job is being dropped
    pub fn log_skipped(&self, execution_id: &str) {
        match self {
            GuardDecision::HandoffExpired => info!(
                execution_id,
                "Handoff window expired before a worker took the job, waiting for stale recovery"
            ),
            GuardDecision::Skip(reason) => debug!(execution_id, reason = %reason, "Resume guard skipped execution"),
            _ => {}
        }
    }
}

pub fn evaluate(
    record: &ExecutionRecord,
    now: DateTime<Utc>,
    handoff_window: Duration,
    stale_after: Duration,
) -> DbResult<GuardDecision> {
    let status = record.status()?;
    let age = now - record.updated_at()?;

    let decision = match status {
        ExecutionStatus::Queued => {
            if record.scheduled_at()? <= now {
                GuardDecision::Proceed
            } else {
                GuardDecision::Skip("not due yet".to_string())
            }
        }
        ExecutionStatus::Processing if age > stale_after => GuardDecision::Recover,
        ExecutionStatus::Processing if record.claimed_by.is_none() && age <= handoff_window => {
            GuardDecision::Handoff
        }
        ExecutionStatus::Processing if record.claimed_by.is_none() => GuardDecision::HandoffExpired,
        ExecutionStatus::Processing => GuardDecision::Skip("owned by another worker".to_string()),
        other => GuardDecision::Skip(format!("status is {}", other)),
    };

    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::timestamp;

    fn record(status: ExecutionStatus, claimed_by: Option<&str>, updated: DateTime<Utc>) -> ExecutionRecord {
        let mut record = ExecutionRecord::single("t", "c", "1").with_status(status);
        record.claimed_by = claimed_by.map(str::to_string);
        record.updated_at = timestamp(updated);
        record.scheduled_at = timestamp(updated);
        record
    }

    fn decide(record: &ExecutionRecord, now: DateTime<Utc>) -> GuardDecision {
        evaluate(record, now, Duration::seconds(30), Duration::seconds(600)).unwrap()
    }

    #[test]
    fn test_fresh_unowned_claim_is_handed_off() {
        let now = Utc::now();
        let r = record(ExecutionStatus::Processing, None, now - Duration::seconds(5));
        assert_eq!(decide(&r, now), GuardDecision::Handoff);
    }

    #[test]
    fn test_old_unowned_claim_is_skipped() {
        let now = Utc::now();
        let r = record(ExecutionStatus::Processing, None, now - Duration::seconds(31));
        assert_eq!(decide(&r, now), GuardDecision::HandoffExpired);
        assert!(!decide(&r, now).may_run());
    }

    #[test]
    fn test_owned_record_is_skipped_until_stale() {
        let now = Utc::now();
        let busy = record(ExecutionStatus::Processing, Some("w1:abc"), now - Duration::seconds(5));
        assert!(!decide(&busy, now).may_run());

        let stale = record(ExecutionStatus::Processing, Some("w1:abc"), now - Duration::seconds(601));
        assert_eq!(decide(&stale, now), GuardDecision::Recover);
    }

    #[test]
    fn test_queued_must_be_due() {
        let now = Utc::now();
        let due = record(ExecutionStatus::Queued, None, now - Duration::seconds(1));
        assert_eq!(decide(&due, now), GuardDecision::Proceed);

        let mut future = due.clone();
        future.scheduled_at = timestamp(now + Duration::seconds(90));
        assert!(!decide(&future, now).may_run());
    }

    #[test]
    fn test_terminal_records_are_skipped() {
        let now = Utc::now();
        for status in [ExecutionStatus::Completed, ExecutionStatus::Cancelled, ExecutionStatus::Paused] {
            assert!(!decide(&record(status, None, now), now).may_run());
        }
    }
}
