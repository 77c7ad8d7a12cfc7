//! End-to-end tests: scheduler claims, broker hands off, worker runs

mod common;

use common::{chain, contacts, Harness, TENANT};
use funnel::broker::Queue;
use funnel::config::{BulkConfig, SchedulerConfig};
use funnel::db::models::{BulkOptions, ExecutionRecord, ExecutionStatus};
use funnel::db::repositories::ExecutionRepository;
use funnel::testing::RecordingChannel;
use funnel::worker::{NotePoster, Worker};
use funnel::{Scheduler, ShutdownCoordinator};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn worker(h: &Harness) -> Worker {
    worker_with_prefetch(h, 4)
}

fn worker_with_prefetch(h: &Harness, prefetch: usize) -> Worker {
    Worker::new(
        h.broker.clone(),
        h.interpreter.clone(),
        Arc::new(h.orchestrator(BulkConfig::default())),
        Arc::new(NotePoster::new(h.pool().clone(), h.provider.clone())),
        prefetch,
    )
}

fn scheduler(h: &Harness) -> Scheduler {
    Scheduler::new(h.pool().clone(), h.broker.clone(), h.clock.clone(), SchedulerConfig::default())
}

#[tokio::test]
async fn test_claimed_jobs_are_routed_by_queue() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "m", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let single = h.single(&campaign, "5511999990001").await;
    let bulk = ExecutionRecord::bulk(TENANT, &BulkOptions::template("promo", 0, 2), contacts(2)).unwrap();
    ExecutionRepository::create(h.pool(), &bulk).await.unwrap();

    assert_eq!(scheduler(&h).tick().await.unwrap(), 2);

    let worker = worker(&h);
    for queue in [Queue::FunnelExecutions, Queue::BulkSends] {
        let job = h.broker.try_consume(queue).await.expect("job queued");
        worker.handle(job).await.unwrap();
    }

    assert_eq!(h.reload(&single.id).await.status().unwrap(), ExecutionStatus::Completed);
    assert_eq!(h.reload(&bulk.id).await.status().unwrap(), ExecutionStatus::Completed);
    assert_eq!(h.channel.send_count(), 3);
}

#[tokio::test]
async fn test_redelivered_job_runs_once() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "m", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let record = h.single(&campaign, "5511999990001").await;

    assert_eq!(scheduler(&h).tick().await.unwrap(), 1);
    let job = h.broker.try_consume(Queue::FunnelExecutions).await.expect("job queued");

    let worker = worker(&h);
    worker.handle(job.clone()).await.unwrap();
    worker.handle(job).await.unwrap();

    assert_eq!(h.channel.send_count(), 1);
    assert_eq!(h.reload(&record.id).await.sent, 1);
}

#[tokio::test]
async fn test_worker_loop_drains_until_shutdown() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "m", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let records = [
        h.single(&campaign, "5511999990001").await,
        h.single(&campaign, "5511999990002").await,
        h.single(&campaign, "5511999990003").await,
    ];

    let shutdown = ShutdownCoordinator::new();
    let running = tokio::spawn(worker(&h).run(shutdown.clone()));
    assert_eq!(scheduler(&h).tick().await.unwrap(), 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut done = 0;
        for record in &records {
            if h.reload(&record.id).await.status().unwrap() == ExecutionStatus::Completed {
                done += 1;
            }
        }
        if done == records.len() {
            break;
        }
        assert!(Instant::now() < deadline, "only {} executions completed", done);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker stopped")
        .unwrap();
    assert_eq!(h.channel.send_count(), 3);
}

#[tokio::test]
async fn test_prefetch_of_one_serves_every_queue() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "m", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let single = h.single(&campaign, "5511999990001").await;
    let bulk = ExecutionRecord::bulk(TENANT, &BulkOptions::template("promo", 0, 2), contacts(2)).unwrap();
    ExecutionRepository::create(h.pool(), &bulk).await.unwrap();

    let shutdown = ShutdownCoordinator::new();
    let running = tokio::spawn(worker_with_prefetch(&h, 1).run(shutdown.clone()));
    assert_eq!(scheduler(&h).tick().await.unwrap(), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let single_done = h.reload(&single.id).await.status().unwrap() == ExecutionStatus::Completed;
        let bulk_done = h.reload(&bulk.id).await.status().unwrap() == ExecutionStatus::Completed;
        if single_done && bulk_done {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "single completed: {}, bulk completed: {}",
            single_done,
            bulk_done
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker stopped")
        .unwrap();
    assert_eq!(h.channel.send_count(), 3);
}
