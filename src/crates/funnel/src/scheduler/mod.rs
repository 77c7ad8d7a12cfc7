//! Dispatch queue poller
//!
//! Periodically claims due execution records and hands each one to a worker
//! through the broker. Claimed records are `processing` with no owner; the
//! worker's resume guard accepts them as a handoff.
//!
//! Cancellations whose worker died are finalized here too, since no batch
//! boundary will ever observe them.

use crate::broker::{Broker, BulkJob, ExecutionJob, Job};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::models::{ExecutionKind, ExecutionRecord};
use crate::db::repositories::ExecutionRepository;
use crate::db::DatabasePool;
use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Background scheduler task
pub struct Scheduler {
    pool: DatabasePool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pool: DatabasePool, broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            pool,
            broker,
            clock,
            config,
        }
    }

    /// Run the poll loop until shutdown is requested
    pub async fn run(self, shutdown: ShutdownCoordinator) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler poll failed");
                    }
                }
            }
        }
    }

    /// Claim one batch of due records and enqueue them.
    ///
    /// Returns how many jobs were published.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let stale_before = now - chrono::Duration::seconds(self.config.stale_after_secs as i64);

        for id in ExecutionRepository::finalize_stale_cancelling(&self.pool, stale_before, now).await? {
            info!(execution_id = %id, "Abandoned cancellation finalized");
        }

        let records = ExecutionRepository::claim_due(&self.pool, now, stale_before, self.config.batch_size).await?;
        if records.is_empty() {
            return Ok(0);
        }
        debug!(count = records.len(), "Claimed due executions");

        let mut published = 0;
        for record in records {
            let Some(job) = self.job_for(&record).await? else {
                continue;
            };
            self.broker.publish(job).await?;
            published += 1;
        }

        Ok(published)
    }

    async fn job_for(&self, record: &ExecutionRecord) -> Result<Option<Job>> {
        match record.kind()? {
            ExecutionKind::Bulk => match BulkJob::from_record(record) {
                Ok(job) => Ok(Some(Job::Bulk(job))),
                Err(e) => {
                    warn!(execution_id = %record.id, error = %e, "Bulk record is unreadable");
                    let reason = format!("invalid bulk options: {}", e);
                    ExecutionRepository::mark_failed(&self.pool, &record.id, &reason, self.clock.now()).await?;
                    Ok(None)
                }
            },
            ExecutionKind::Single => Ok(Some(Job::Execution(ExecutionJob::from_record(record)))),
            ExecutionKind::Aggregator => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Queue};
    use crate::db::models::{BulkOptions, ExecutionStatus};
    use crate::testing::{ManualClock, TestDatabase};
    use chrono::{Duration, Utc};

    fn scheduler(db: &TestDatabase, broker: Arc<MemoryBroker>, clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::new(db.pool().clone(), broker, clock, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_tick_routes_by_kind() {
        let db = TestDatabase::new().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let clock = Arc::new(ManualClock::new(Utc::now() + Duration::seconds(1)));

        let single = ExecutionRecord::single("t1", "c1", "5511999990001");
        let bulk = ExecutionRecord::bulk("t1", &BulkOptions::template("promo", 0, 2), vec!["1".into()]).unwrap();
        ExecutionRepository::create(db.pool(), &single).await.unwrap();
        ExecutionRepository::create(db.pool(), &bulk).await.unwrap();

        let published = scheduler(&db, broker.clone(), clock).tick().await.unwrap();
        assert_eq!(published, 2);

        let executions = broker.drain(Queue::FunnelExecutions).await;
        let bulks = broker.drain(Queue::BulkSends).await;
        assert!(matches!(&executions[..], [Job::Execution(job)] if job.execution_id == single.id));
        assert!(matches!(&bulks[..], [Job::Bulk(job)] if job.execution_id == bulk.id));

        let claimed = ExecutionRepository::require(db.pool(), &single.id).await.unwrap();
        assert_eq!(claimed.status().unwrap(), ExecutionStatus::Processing);
        assert!(claimed.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_tick_skips_records_not_yet_due() {
        let db = TestDatabase::new().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let now = Utc::now() + Duration::seconds(1);
        let clock = Arc::new(ManualClock::new(now));

        let later = ExecutionRecord::single("t1", "c1", "1").scheduled_for(now + Duration::seconds(90));
        ExecutionRepository::create(db.pool(), &later).await.unwrap();

        let scheduler = scheduler(&db, broker.clone(), clock.clone());
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        clock.advance(Duration::seconds(91));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        // Claimed once: a second tick finds nothing
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_reclaims_stale_processing() {
        let db = TestDatabase::new().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let clock = Arc::new(ManualClock::new(Utc::now() + Duration::seconds(1)));

        let record = ExecutionRecord::single("t1", "c1", "1");
        ExecutionRepository::create(db.pool(), &record).await.unwrap();
        let scheduler = scheduler(&db, broker.clone(), clock.clone());
        assert_eq!(scheduler.tick().await.unwrap(), 1);

        clock.advance(Duration::seconds(300));
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        clock.advance(Duration::seconds(301));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        assert_eq!(broker.drain(Queue::FunnelExecutions).await.len(), 2);
    }

    #[tokio::test]
    async fn test_tick_finalizes_abandoned_cancellation() {
        let db = TestDatabase::new().await.unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let clock = Arc::new(ManualClock::new(Utc::now() + Duration::seconds(1)));

        let record = ExecutionRecord::bulk("t1", &BulkOptions::template("promo", 0, 2), vec!["1".into()])
            .unwrap()
            .with_status(ExecutionStatus::Cancelling);
        ExecutionRepository::create(db.pool(), &record).await.unwrap();
        let scheduler = scheduler(&db, broker.clone(), clock.clone());

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let waiting = ExecutionRepository::require(db.pool(), &record.id).await.unwrap();
        assert_eq!(waiting.status().unwrap(), ExecutionStatus::Cancelling);

        clock.advance(Duration::seconds(601));
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let done = ExecutionRepository::require(db.pool(), &record.id).await.unwrap();
        assert_eq!(done.status().unwrap(), ExecutionStatus::Cancelled);
        assert!(broker.drain(Queue::BulkSends).await.is_empty());
    }
}
