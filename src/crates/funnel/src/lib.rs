//! # Funnel - Campaign Workflow Engine
//!
//! Runs messaging campaigns for many tenants over an external messaging
//! channel. A campaign is a graph of nodes (send a message, wait, branch on
//! a label, link to another campaign...) executed once per recipient, or a
//! bulk send that dispatches one template or campaign to a contact list.
//!
//! ## Features
//!
//! - **Durable Executions** - Every run is a row in SQLite; long waits
//!   suspend the record and the scheduler picks it up again when due
//! - **Graph and Linear Campaigns** - Node graphs plus the older step lists
//! - **Bulk Dispatch** - Bounded concurrency, delay between batches, pause,
//!   resume, cancel and retry of the failed subset
//! - **Smart Send** - Free-form text inside the recipient's activity window,
//!   approved templates outside it
//! - **Status Reconciliation** - Idempotent delivery callbacks with counter
//!   roll-up to parent executions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use funnel::broker::MemoryBroker;
//! use funnel::clock::SystemClock;
//! use funnel::config::ConfigLoader;
//! use funnel::db::DatabaseConnection;
//! use funnel::Scheduler;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConfigLoader::load(None).await?;
//! let db = DatabaseConnection::new(&config.database.url).await?;
//! db.run_migrations().await?;
//!
//! let scheduler = Scheduler::new(
//!     db.pool().clone(),
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(SystemClock),
//!     config.scheduler.clone(),
//! );
//! let queued = scheduler.tick().await?;
//! println!("queued {} executions", queued);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The scheduler claims due records and publishes them to the broker.
//! Workers consume the queues: single runs go to the [`Interpreter`], bulk
//! sends to the [`BulkOrchestrator`], deferred internal notes to the
//! [`worker::NotePoster`]. Channel callbacks enter through the
//! [`Reconciler`]. Operators act on records through [`ExecutionControl`].

// Core modules
pub mod broker;
pub mod bulk;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod db;
pub mod graph;
pub mod interpreter;
pub mod reconciler;
pub mod scheduler;
pub mod shutdown;
pub mod smart_send;
pub mod text;
pub mod worker;

// Test doubles
pub mod testing;

// Error types and utilities
pub mod error;

// Re-export key types for convenience
pub use bulk::{BulkOrchestrator, RecipientOutcome};
pub use control::{ExecutionControl, FailureReport};
pub use interpreter::{Interpreter, RunOutcome};
pub use reconciler::{Callback, Reconciler, StatusUpdate};
pub use scheduler::Scheduler;
pub use shutdown::ShutdownCoordinator;
pub use worker::Worker;

// Error types
pub use error::{FunnelError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
