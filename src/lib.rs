//! # solbatch
//!
//! A bounded-concurrency batch runner that applies a fixed list of named remote
//! operations (stored procedure calls or parameterized extractions) to every
//! entity ("SOL") in a run.
//!
//! ## Overview
//!
//! Entities are processed by an [`batch::EntityDispatcher`] that keeps at most
//! `N` entities in flight. Each entity gets its own [`batch::EntityWorkerPool`]
//! with a fixed number of workers draining the operation queue. Every execution
//! produces one [`batch::Outcome`] which is streamed to the [`sink::LogSink`] and
//! folded into the [`batch::SummaryAggregator`].
//!
//! In extraction mode each (operation, entity) pair writes a spool file, and once
//! every entity has finished the [`spool::OutputConsolidator`] merges the spools
//! of each operation into one final file.
//!
//! ```no_run
//! use std::sync::Arc;
//! use solbatch::batch::{BatchRunner, RunMode};
//! use solbatch::config::{AppConfig, RunConfig};
//! use solbatch::transport::MemoryTransport;
//!
//! # async fn example(app: AppConfig, run: RunConfig) -> solbatch::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let entities = vec!["S1".to_string(), "S2".to_string()];
//!
//! let report = BatchRunner::new(app, run, RunMode::Invoke, transport)
//!     .run(entities)
//!     .await?;
//! println!("{} outcomes, {} failed", report.outcomes, report.failures);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: dispatcher, worker pools, summary aggregation and the runner
//! - [`engine`]: operation executors for invoke and extract mode
//! - [`transport`]: backend access (PostgreSQL and in-memory)
//! - [`layout`]: column layouts for extracted rows
//! - [`format`]: row rendering
//! - [`spool`]: spool files and their consolidation
//! - [`sink`]: outcome log and summary files
//! - [`config`]: application and run configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for solbatch operations
pub type Result<T> = std::result::Result<T, SolBatchError>;

/// Main error type for run-level failures.
///
/// Failures of a single operation for a single entity never surface here; they
/// are captured as a failed [`batch::Outcome`]. Only errors that stop the run
/// (setup, log persistence) are represented by this type.
#[derive(Error, Debug)]
pub enum SolBatchError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Backend connection setup failed
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// The outcome log or summary could not be persisted
    #[error("Log sink error: {0}")]
    Sink(#[from] sink::SinkError),

    /// Entity list could not be read
    #[error("Entity list error: {0}")]
    Entities(String),

    /// Dispatching entities failed
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Filesystem error outside the per-operation boundary
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Entity dispatch, worker pools, aggregation and the run orchestrator
pub mod batch;

/// Application and run configuration
pub mod config;

/// Operation executors
pub mod engine;

/// Entity list input
pub mod entities;

/// Row rendering for extracted data
pub mod format;

/// Column layouts for extraction
pub mod layout;

/// Tracing subscriber setup
pub mod observability;

/// Outcome log and summary persistence
pub mod sink;

/// Spool files and consolidation
pub mod spool;

/// Backend access
pub mod transport;
