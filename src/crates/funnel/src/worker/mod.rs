//! Queue consumer
//!
//! One consumer loop per queue, each with its own semaphore bounding how many
//! of that queue's jobs are in flight (the prefetch). A busy queue never holds
//! back another. On shutdown the loops stop taking jobs and the worker waits
//! for running ones to finish.

pub mod notes;

pub use notes::NotePoster;

use crate::broker::{Broker, Job, Queue};
use crate::bulk::BulkOrchestrator;
use crate::error::Result;
use crate::interpreter::Interpreter;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

const QUEUES: [Queue; 3] = [Queue::FunnelExecutions, Queue::BulkSends, Queue::InternalNotes];

/// Routes queued jobs to the interpreter, the orchestrator or the note poster
#[derive(Clone)]
pub struct Worker {
    broker: Arc<dyn Broker>,
    interpreter: Arc<Interpreter>,
    orchestrator: Arc<BulkOrchestrator>,
    notes: Arc<NotePoster>,
    prefetch: usize,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        interpreter: Arc<Interpreter>,
        orchestrator: Arc<BulkOrchestrator>,
        notes: Arc<NotePoster>,
        prefetch: usize,
    ) -> Self {
        Self {
            broker,
            interpreter,
            orchestrator,
            notes,
            prefetch: prefetch.max(1),
        }
    }

    /// Consume all queues until shutdown, then drain in-flight jobs
    pub async fn run(self, shutdown: ShutdownCoordinator) {
        info!(prefetch = self.prefetch, "Worker started");
        let permits: Vec<Arc<Semaphore>> = QUEUES.iter().map(|_| Arc::new(Semaphore::new(self.prefetch))).collect();

        let mut consumers = JoinSet::new();
        for (queue, permits) in QUEUES.into_iter().zip(permits.iter().cloned()) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            consumers.spawn(async move { worker.consume(queue, permits, shutdown).await });
        }
        while consumers.join_next().await.is_some() {}

        debug!("Waiting for in-flight jobs");
        for permits in &permits {
            let _ = permits.acquire_many(self.prefetch as u32).await;
        }
        info!("Worker stopped");
    }

    async fn consume(&self, queue: Queue, permits: Arc<Semaphore>, shutdown: ShutdownCoordinator) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                job = self.broker.consume(queue) => job,
            };

            match job {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker.handle(job).await {
                            error!(queue = queue.name(), error = %e, "Job failed");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    debug!(queue = queue.name(), "Queue closed");
                    break;
                }
                Err(e) => {
                    error!(queue = queue.name(), error = %e, "Consume failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run one job to completion
    pub async fn handle(&self, job: Job) -> Result<()> {
        match job {
            Job::Execution(job) => {
                let outcome = self.interpreter.resume(&job.execution_id).await?;
                debug!(execution_id = %job.execution_id, ?outcome, "Execution job done");
            }
            Job::Bulk(job) => {
                let status = self.orchestrator.run(&job).await?;
                debug!(execution_id = %job.execution_id, ?status, "Bulk job done");
            }
            Job::Note(job) => {
                self.notes.post(&job).await?;
            }
        }
        Ok(())
    }
}
