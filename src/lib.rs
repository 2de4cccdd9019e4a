//! # Changefeed Engine
//!
//! The coordination plane of a change-data-capture and data-migration
//! platform: it keeps replication correct across capture failures,
//! ownership changes, and restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           changefeed-engine                              │
//! │                                                                          │
//! │  ┌──────────────┐   owner messages   ┌───────────────────────────────┐   │
//! │  │ RetryingKv   │───────────────────►│ Agent (scheduler)             │   │
//! │  │ Client+Watch │                    │ sync / dispatch / finish      │   │
//! │  └──────────────┘                    └──────────────┬────────────────┘   │
//! │                                                     │ drives             │
//! │  ┌──────────────┐   sorted events    ┌──────────────▼────────────────┐   │
//! │  │ SorterActor  │───────────────────►│ table executor (host-provided)│   │
//! │  │ (storage)    │                    └──────────────┬────────────────┘   │
//! │  └──────────────┘                                   │ positions          │
//! │                                      ┌──────────────▼────────────────┐   │
//! │  ┌──────────────┐                    │ RemoteCheckpoint              │   │
//! │  │ Dispatchers  │                    │ saved/flushed, snapshots,     │   │
//! │  │ (partitions) │                    │ durable flush, rollback       │   │
//! │  └──────────────┘                    └───────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Correctness Guarantees
//!
//! - **At-least-once delivery**: watch reopens never skip a revision;
//!   checkpoint flushes persist frozen snapshots FIFO.
//! - **Monotonic progress**: saved locations never regress, and the global
//!   watermark never overtakes any table's.
//! - **Single-owner safety**: owner epochs reject stale owners; an
//!   ambiguous election fails loudly.
//! - **Ordered per-table output**: operations are keyed by table and driven
//!   by one tick loop; the partition dispatchers keep a key on one
//!   partition.
//!
//! The host process supplies the outer surfaces (CLI, admin API, SQL
//! parsing, sink drivers, metrics registry); this crate only consumes their
//! contracts.

pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod kv;
pub mod location;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod sorter;

// Re-exports for convenience
pub use checkpoint::{RemoteCheckpoint, SchemaTracker, SnapshotInfo};
pub use config::EngineConfig;
pub use dispatcher::{DefaultDispatcher, PartitionDispatcher, TableDispatcher};
pub use error::{EngineError, Result};
pub use kv::{KvBackend, RetryingKvClient};
pub use location::{compare_locations, Location};
pub use pipeline::ActorNode;
pub use scheduler::{Agent, ProcessorMessenger, TableExecutor};
pub use sorter::{CompactScheduler, SorterActor, SorterMessage};
