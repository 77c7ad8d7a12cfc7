//! In-process broker over tokio channels

use super::{broker_error, Broker, Job, ProgressEvent, Queue};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::debug;

const PROGRESS_CAPACITY: usize = 1024;

struct Lane {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl Lane {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

/// Broker for a single process: one unbounded mpsc lane per queue and a
/// broadcast channel for progress.
pub struct MemoryBroker {
    executions: Lane,
    bulk: Lane,
    notes: Lane,
    progress: broadcast::Sender<ProgressEvent>,
    closed: watch::Sender<bool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            executions: Lane::new(),
            bulk: Lane::new(),
            notes: Lane::new(),
            progress,
            closed: watch::channel(false).0,
        }
    }

    fn lane(&self, queue: Queue) -> &Lane {
        match queue {
            Queue::FunnelExecutions => &self.executions,
            Queue::BulkSends => &self.bulk,
            Queue::InternalNotes => &self.notes,
        }
    }

    /// Take the next job without waiting
    pub async fn try_consume(&self, queue: Queue) -> Option<Job> {
        self.lane(queue).receiver.lock().await.try_recv().ok()
    }

    /// Drain every job currently queued on `queue`
    pub async fn drain(&self, queue: Queue) -> Vec<Job> {
        let mut receiver = self.lane(queue).receiver.lock().await;
        let mut jobs = Vec::new();
        while let Ok(job) = receiver.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    /// Stop accepting jobs and wake blocked consumers
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, job: Job) -> Result<()> {
        let queue = job.queue();
        if self.is_closed() {
            return Err(broker_error(queue, "broker is closed"));
        }
        debug!(queue = queue.name(), "Job enqueued");
        self.lane(queue)
            .sender
            .send(job)
            .map_err(|e| broker_error(queue, e))
    }

    async fn consume(&self, queue: Queue) -> Result<Option<Job>> {
        let mut closed = self.closed.subscribe();
        let mut receiver = self.lane(queue).receiver.lock().await;
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        tokio::select! {
            job = receiver.recv() => Ok(job),
            _ = closed.wait_for(|closed| *closed) => Ok(None),
        }
    }

    async fn publish_progress(&self, event: ProgressEvent) -> Result<()> {
        // No subscribers is not an error
        let _ = self.progress.send(event);
        Ok(())
    }

    fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }
}
