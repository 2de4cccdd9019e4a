// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint engine: global and per-table replication watermarks.
//!
//! State lives in memory as saved/flushed pairs and is persisted to a
//! relational target through the [`CheckpointDb`] seam. See
//! [`RemoteCheckpoint`] for the operation surface and [`remote`] for the
//! flush/snapshot machinery.

mod db;
mod meta;
mod point;
mod remote;

pub use db::{BoxDbFuture, CheckpointDb, CheckpointRow, MySqlCheckpointDb, SqlParam};
pub use meta::{parse_meta_data, DumpMeta};
pub use point::{BinlogPoint, MemSchemaTracker, SchemaTracker, TablePoint};
pub use remote::{RemoteCheckpoint, SnapshotInfo};
