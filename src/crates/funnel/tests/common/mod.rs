//! Common test utilities and setup

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use funnel::broker::MemoryBroker;
use funnel::bulk::BulkOrchestrator;
use funnel::channel::{ChannelProvider, TenantBinding};
use funnel::clock::{Clock, SystemClock};
use funnel::config::{BulkConfig, InterpreterConfig, ReconcilerConfig};
use funnel::db::models::{Campaign, ExecutionRecord};
use funnel::db::repositories::{CampaignRepository, ExecutionRepository};
use funnel::db::DatabasePool;
use funnel::interpreter::Interpreter;
use funnel::reconciler::Reconciler;
use funnel::testing::{ManualClock, RecordingChannel, StaticChannelProvider, TestDatabase};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

pub const TENANT: &str = "acme";

/// Everything a test needs to drive one tenant end to end
pub struct Harness {
    pub db: TestDatabase,
    pub channel: Arc<RecordingChannel>,
    pub provider: Arc<dyn ChannelProvider>,
    pub broker: Arc<MemoryBroker>,
    pub clock: Arc<dyn Clock>,
    pub interpreter: Arc<Interpreter>,
}

impl Harness {
    /// Manual clock, one second ahead of the wall clock so fresh records are due
    pub async fn manual(channel: RecordingChannel) -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now() + Duration::seconds(1)));
        let harness = Self::with_clock(channel, clock.clone(), InterpreterConfig::default()).await;
        (harness, clock)
    }

    /// Real time, for tests that measure batch spacing
    pub async fn system(channel: RecordingChannel) -> Self {
        Self::with_clock(channel, Arc::new(SystemClock), InterpreterConfig::default()).await
    }

    pub async fn with_clock(channel: RecordingChannel, clock: Arc<dyn Clock>, config: InterpreterConfig) -> Self {
        let db = TestDatabase::new().await.expect("test database");
        let channel = Arc::new(channel);
        let provider: Arc<dyn ChannelProvider> = Arc::new(StaticChannelProvider::single(TENANT, channel.clone()));
        let interpreter = Arc::new(Interpreter::new(
            db.pool().clone(),
            provider.clone(),
            clock.clone(),
            config,
            "test-worker",
        ));

        Self {
            db,
            channel,
            provider,
            broker: Arc::new(MemoryBroker::new()),
            clock,
            interpreter,
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        self.db.pool()
    }

    pub fn binding(&self) -> TenantBinding {
        TenantBinding::new(TENANT, self.channel.clone())
    }

    pub fn orchestrator(&self, config: BulkConfig) -> BulkOrchestrator {
        BulkOrchestrator::new(
            self.pool().clone(),
            self.broker.clone(),
            self.provider.clone(),
            self.interpreter.clone(),
            config,
            "test-worker",
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.pool().clone(),
            self.broker.clone(),
            self.clock.clone(),
            ReconcilerConfig::default(),
        )
    }

    /// Store a campaign with the given JSON definition
    pub async fn campaign(&self, definition: Value) -> Campaign {
        let campaign = Campaign::new(TENANT, "test campaign", definition.to_string());
        CampaignRepository::create(self.pool(), &campaign)
            .await
            .expect("create campaign");
        campaign
    }

    /// Store a queued single run of `campaign` for `recipient`
    pub async fn single(&self, campaign: &Campaign, recipient: &str) -> ExecutionRecord {
        let record = ExecutionRecord::single(TENANT, &campaign.id, recipient);
        ExecutionRepository::create(self.pool(), &record)
            .await
            .expect("create execution");
        record
    }

    pub async fn reload(&self, id: &str) -> ExecutionRecord {
        ExecutionRepository::require(self.pool(), id)
            .await
            .expect("execution exists")
    }
}

type SleepHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Manual clock that runs a hook after every sleep, to act while a run waits
pub struct HookClock {
    inner: ManualClock,
    hook: Mutex<Option<SleepHook>>,
}

impl HookClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ManualClock::new(Utc::now() + Duration::seconds(1)),
            hook: Mutex::new(None),
        })
    }

    pub fn on_sleep(&self, hook: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }
}

#[async_trait]
impl Clock for HookClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn sleep(&self, duration: std::time::Duration) {
        self.inner.sleep(duration).await;
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook().await;
        }
    }
}

/// Linear graph: one node per entry, chained in order
pub fn chain(nodes: Value) -> Value {
    let nodes = nodes.as_array().cloned().unwrap_or_default();
    let edges: Vec<Value> = nodes
        .windows(2)
        .map(|pair| serde_json::json!({"source": pair[0]["id"], "target": pair[1]["id"]}))
        .collect();
    serde_json::json!({"nodes": nodes, "edges": edges})
}

pub fn contacts(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("55119999900{:02}", i)).collect()
}
