//! Integration tests for campaign execution

mod common;

use chrono::{Duration, Utc};
use common::{chain, Harness, TENANT};
use funnel::clock::Clock;
use funnel::config::InterpreterConfig;
use funnel::db::models::{ExecutionRecord, ExecutionStatus};
use funnel::db::repositories::{ActivityRepository, DeliveryRepository, ExecutionRepository};
use funnel::interpreter::Cursor;
use funnel::testing::{ChannelCall, ManualClock, RecordingChannel};
use funnel::RunOutcome;
use serde_json::json;
use std::sync::Arc;

const RECIPIENT: &str = "5511999990001";

fn texts(channel: &RecordingChannel) -> Vec<String> {
    channel
        .sends()
        .into_iter()
        .filter_map(|call| match call {
            ChannelCall::Text { text, .. } => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_long_delay_suspends_then_resumes() {
    let (h, clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "hi", "type": "message", "start": true, "data": {"text": "Hi"}},
            {"id": "wait", "type": "delay", "data": {"amount": 90}},
            {"id": "bye", "type": "message", "data": {"text": "Bye"}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let started = clock.now();
    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    let Some(RunOutcome::Suspended { resume, resume_at }) = outcome else {
        panic!("expected a suspension, got {:?}", outcome);
    };
    assert_eq!(resume, Cursor::Node("bye".to_string()));
    assert_eq!(resume_at - started, Duration::seconds(90));
    assert_eq!(texts(&h.channel), vec!["Hi"]);

    let parked = h.reload(&record.id).await;
    assert_eq!(parked.status().unwrap(), ExecutionStatus::Queued);
    assert_eq!(parked.current_node_id.as_deref(), Some("bye"));
    assert!(parked.claimed_by.is_none());
    assert!((parked.scheduled_at().unwrap() - resume_at).num_milliseconds().abs() <= 1);

    // Not due yet: the guard leaves it alone
    assert!(h.interpreter.resume(&record.id).await.unwrap().is_none());
    assert_eq!(h.channel.send_count(), 1);

    clock.advance(Duration::seconds(91));
    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    assert_eq!(outcome, Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["Hi", "Bye"]);

    let done = h.reload(&record.id).await;
    assert_eq!(done.status().unwrap(), ExecutionStatus::Completed);
    assert_eq!(done.sent, 2);
    assert_eq!(DeliveryRepository::list_by_execution(h.pool(), &record.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_short_delay_sleeps_inline() {
    let (h, clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "a", "type": "message", "start": true, "data": {"text": "One"}},
            {"id": "d", "type": "delay", "data": {"amount": 30}},
            {"id": "b", "type": "message", "data": {"text": "Two"}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    assert_eq!(outcome, Some(RunOutcome::Finished));
    assert_eq!(clock.sleeps(), vec![std::time::Duration::from_secs(30)]);
    assert_eq!(texts(&h.channel), vec!["One", "Two"]);
}

#[tokio::test]
async fn test_trailing_delay_finishes_without_waiting() {
    let (h, clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "a", "type": "message", "start": true, "data": {"text": "Only"}},
            {"id": "d", "type": "delay", "data": {"amount": 2, "unit": "days"}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert!(clock.sleeps().is_empty());
    assert_eq!(h.reload(&record.id).await.status().unwrap(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_tag_condition_follows_true_branch() {
    let channel = RecordingChannel::new()
        .with_conversation(RECIPIENT, "conv-7")
        .with_labels("conv-7", &["Vip"]);
    let (h, _clock) = Harness::manual(channel).await;
    let campaign = h
        .campaign(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "c", "type": "condition", "data": {"conditionType": "tag", "tag": "VIP"}},
                {"id": "yes", "type": "message", "data": {"text": "VIP offer"}},
                {"id": "no", "type": "message", "data": {"text": "Regular offer"}}
            ],
            "edges": [
                {"source": "s", "target": "c"},
                {"source": "c", "target": "no", "sourceHandle": "false"},
                {"source": "c", "target": "yes", "sourceHandle": "true"}
            ]
        }))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["VIP offer"]);

    // The resolved conversation is remembered on the record and in the cache
    assert_eq!(h.reload(&record.id).await.conversation_ref.as_deref(), Some("conv-7"));
    let cached = ActivityRepository::get(h.pool(), TENANT, RECIPIENT).await.unwrap().unwrap();
    assert_eq!(cached.conversation_ref.as_deref(), Some("conv-7"));
}

#[tokio::test]
async fn test_condition_without_conversation_takes_false_branch() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(json!({
            "nodes": [
                {"id": "c", "type": "condition", "start": true, "data": {"conditionType": "tag", "tag": "vip"}},
                {"id": "yes", "type": "message", "data": {"text": "VIP offer"}},
                {"id": "no", "type": "message", "data": {"text": "Regular offer"}}
            ],
            "edges": [
                {"source": "c", "target": "yes", "sourceHandle": "true"},
                {"source": "c", "target": "no", "sourceHandle": "false"}
            ]
        }))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["Regular offer"]);
}

#[tokio::test]
async fn test_label_node_tags_conversation() {
    let channel = RecordingChannel::new().with_conversation(RECIPIENT, "conv-3");
    let (h, _clock) = Harness::manual(channel).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "l", "type": "label", "start": true, "data": {"labels": ["lead", "april"]}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(h.channel.labels_of("conv-3"), vec!["lead", "april"]);
}

#[tokio::test]
async fn test_datetime_range_waits_for_window_start() {
    let (h, clock) = Harness::manual(RecordingChannel::new()).await;
    let now = clock.now();
    let start = (now + Duration::hours(2)).naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string();
    let end = (now + Duration::hours(5)).naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string();
    let campaign = h
        .campaign(json!({
            "nodes": [
                {"id": "c", "type": "condition", "start": true, "data": {
                    "conditionType": "datetime_range", "start": start, "end": end
                }},
                {"id": "m", "type": "message", "data": {"text": "Open hours"}}
            ],
            "edges": [{"source": "c", "target": "m", "sourceHandle": "between"}]
        }))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    let Some(RunOutcome::Suspended { resume, resume_at }) = outcome else {
        panic!("expected a suspension, got {:?}", outcome);
    };
    assert_eq!(resume, Cursor::Node("c".to_string()));
    let wait = resume_at - now;
    assert!(wait > Duration::minutes(119) && wait <= Duration::hours(2), "waited {}", wait);
    assert_eq!(h.channel.send_count(), 0);

    clock.advance(Duration::hours(3));
    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["Open hours"]);
}

#[tokio::test]
async fn test_template_failure_fails_execution() {
    let (h, _clock) = Harness::manual(RecordingChannel::new().failing_templates()).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "t", "type": "template", "start": true, "data": {"templateName": "welcome"}},
            {"id": "m", "type": "message", "data": {"text": "never sent"}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    assert!(matches!(outcome, Some(RunOutcome::Failed { .. })), "got {:?}", outcome);
    assert_eq!(h.channel.send_count(), 1);

    let failed = h.reload(&record.id).await;
    assert_eq!(failed.status().unwrap(), ExecutionStatus::Failed);
    assert!(failed.failure_reason.unwrap().contains("template send failed"));
    assert_eq!(failed.failed, 1);
}

#[tokio::test]
async fn test_message_failure_is_recorded_and_path_continues() {
    let (h, _clock) = Harness::manual(RecordingChannel::new().failing_for(RECIPIENT)).await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "a", "type": "message", "start": true, "data": {"text": "One"}},
            {"id": "b", "type": "media", "data": {"url": "https://cdn.example.com/a.png"}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    let done = h.reload(&record.id).await;
    assert_eq!(done.sent, 0);
    assert_eq!(done.failed, 2);
    assert_eq!(DeliveryRepository::list_failures(h.pool(), &record.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_campaign_fails_without_sending() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let record = ExecutionRecord::single(TENANT, "no-such-campaign", RECIPIENT);
    ExecutionRepository::create(h.pool(), &record).await.unwrap();

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    assert!(matches!(outcome, Some(RunOutcome::Failed { .. })));
    assert_eq!(h.reload(&record.id).await.status().unwrap(), ExecutionStatus::Failed);
    assert_eq!(h.channel.send_count(), 0);
}

#[tokio::test]
async fn test_unknown_tenant_fails() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "a", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let record = ExecutionRecord::single("other-tenant", &campaign.id, RECIPIENT);
    ExecutionRepository::create(h.pool(), &record).await.unwrap();

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    assert!(matches!(outcome, Some(RunOutcome::Failed { .. })));
    assert_eq!(h.channel.send_count(), 0);
}

#[tokio::test]
async fn test_link_campaign_queues_child_run() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let follow_up = h
        .campaign(chain(json!([{"id": "a", "type": "message", "start": true, "data": {"text": "Follow up"}}])))
        .await;
    let campaign = h
        .campaign(chain(json!([
            {"id": "m", "type": "message", "start": true, "data": {"text": "Hi"}},
            {"id": "l", "type": "link_campaign", "data": {"campaignId": follow_up.id}}
        ])))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));

    let children = ExecutionRepository::list_children(h.pool(), &record.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].campaign_id.as_deref(), Some(follow_up.id.as_str()));
    assert_eq!(children[0].recipient_address.as_deref(), Some(RECIPIENT));
    assert_eq!(children[0].status().unwrap(), ExecutionStatus::Queued);

    // The child runs on its own when picked up
    assert_eq!(h.interpreter.resume(&children[0].id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["Hi", "Follow up"]);
}

#[tokio::test]
async fn test_visit_budget_stops_cycles() {
    let clock = Arc::new(ManualClock::new(Utc::now() + Duration::seconds(1)));
    let config = InterpreterConfig {
        max_node_visits: 5,
        ..InterpreterConfig::default()
    };
    let h = Harness::with_clock(RecordingChannel::new(), clock, config).await;
    let campaign = h
        .campaign(json!({
            "nodes": [
                {"id": "a", "type": "message", "start": true, "data": {"text": "ping"}},
                {"id": "b", "type": "message", "data": {"text": "pong"}}
            ],
            "edges": [
                {"source": "a", "target": "b"},
                {"source": "b", "target": "a"}
            ]
        }))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    let Some(RunOutcome::Failed { reason }) = outcome else {
        panic!("expected a failure, got {:?}", outcome);
    };
    assert!(reason.contains("budget"));
    assert_eq!(h.channel.send_count(), 5);
}

#[tokio::test]
async fn test_legacy_step_list_suspends_on_step_index() {
    let (h, clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(json!([
            {"type": "message", "text": "One"},
            {"type": "delay", "amount": 2, "unit": "minutes"},
            {"type": "message", "text": "Two"}
        ]))
        .await;
    let record = h.single(&campaign, RECIPIENT).await;

    let outcome = h.interpreter.resume(&record.id).await.unwrap();
    let Some(RunOutcome::Suspended { resume, .. }) = outcome else {
        panic!("expected a suspension, got {:?}", outcome);
    };
    assert_eq!(resume, Cursor::Step(2));
    assert_eq!(h.reload(&record.id).await.current_step_index, Some(2));

    clock.advance(Duration::minutes(3));
    assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    assert_eq!(texts(&h.channel), vec!["One", "Two"]);
}

#[tokio::test]
async fn test_counters_roll_up_to_aggregator() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "a", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let aggregator = ExecutionRecord::aggregator(TENANT, &campaign.id);
    ExecutionRepository::create(h.pool(), &aggregator).await.unwrap();

    for recipient in ["5511999990001", "5511999990002"] {
        let record = ExecutionRecord::single(TENANT, &campaign.id, recipient).with_parent(&aggregator.id);
        ExecutionRepository::create(h.pool(), &record).await.unwrap();
        assert_eq!(h.interpreter.resume(&record.id).await.unwrap(), Some(RunOutcome::Finished));
    }

    let totals = h.reload(&aggregator.id).await;
    assert_eq!(totals.sent, 2);
    assert_eq!(totals.status().unwrap(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_record_is_not_resumed() {
    let (h, _clock) = Harness::manual(RecordingChannel::new()).await;
    let campaign = h
        .campaign(chain(json!([{"id": "a", "type": "message", "start": true, "data": {"text": "Hi"}}])))
        .await;
    let record = ExecutionRecord::single(TENANT, &campaign.id, RECIPIENT).with_status(ExecutionStatus::Cancelled);
    ExecutionRepository::create(h.pool(), &record).await.unwrap();

    assert!(h.interpreter.resume(&record.id).await.unwrap().is_none());
    assert_eq!(h.channel.send_count(), 0);
}
