//! # Sluice
//!
//! Batch-barrier stream processing with exactly-once state updates.
//!
//! Sluice runs a dynamically connected graph of processing units (a source,
//! a stateless tier and a stateful tier) and guarantees exactly-once state
//! mutation through a two-phase barrier/commit protocol: a coordinator
//! periodically emits barrier markers that delimit batches, a tracker
//! detects when each barrier has propagated through every fan-out path, and
//! only then is the batch committed everywhere. Stateful units keep reverse
//! and incremental logs per batch, so a failure rolls the whole graph back
//! to the last committed batch: healthy units undo in memory, replaced
//! units rebuild from their durable log.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use sluice::config::EngineConfig;
//! use sluice::engine::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::start(EngineConfig::default()).await?;
//! engine.ingest("me", 1).await?;
//! engine.start_barrier_timer().await?;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Engine configuration.
pub mod config;
/// Batch coordinator: barrier timer, commit phase, recovery initiation.
pub mod coordinator;
/// Liveness polling and unit replacement requests.
pub mod detector;
/// Bootstrap and the observable query surface.
pub mod engine;
/// Pluggable per-message processing functions.
pub mod functions;
/// Message envelope and tracking value objects.
pub mod message;
/// Stable hash partitioning from key to target unit.
pub mod partitioning;
/// Append-only durable state log.
pub mod persist;
/// Operator topology graph and per-unit settings.
pub mod topology;
/// Batch propagation tracking for barrier, commit and recovery waves.
pub mod tracker;
/// In-process transport and unit mailboxes.
pub mod transport;
/// Per-unit execution engine: source, operators, state table.
pub mod unit;
