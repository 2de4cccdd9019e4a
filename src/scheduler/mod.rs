// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Owner/Agent table-scheduling protocol.
//!
//! The elected owner dispatches per-table replication work to agents; each
//! agent drives its local table executor and reports back. The [`Agent`]
//! here implements the worker side: it consumes owner messages, advances a
//! per-table operation state machine, and keeps the owner informed through
//! sync and checkpoint messages.
//!
//! The processor supplies the two collaborators as traits: a
//! [`TableExecutor`] that actually starts and stops table pipelines, and a
//! [`ProcessorMessenger`] that delivers messages to whoever currently holds
//! ownership.

mod agent;
mod checkpoint_sender;

pub use agent::{Agent, AgentOperation, OperationStatus, OwnerInfo};
pub use checkpoint_sender::CheckpointTsSender;

use crate::error::Result;
use crate::model::{CaptureId, TableId, Ts};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed scheduler futures.
pub type BoxSchedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The table-pipeline surface the agent drives.
///
/// `add_table`/`remove_table` are idempotent requests; `done = false` means
/// "not yet, ask again next tick". The finished checks poll completion of a
/// previously accepted request.
pub trait TableExecutor: Send + Sync {
    fn add_table(&self, table_id: TableId) -> BoxSchedFuture<'_, bool>;
    fn remove_table(&self, table_id: TableId) -> BoxSchedFuture<'_, bool>;
    fn is_add_table_finished(&self, table_id: TableId) -> bool;
    fn is_remove_table_finished(&self, table_id: TableId) -> bool;

    /// All tables being run, added, or removed. Two consecutive calls
    /// return the same result unless a mutating call interleaves.
    fn get_all_current_tables(&self) -> Vec<TableId>;

    /// Local watermarks, consistent with the most recent
    /// `get_all_current_tables`.
    fn get_checkpoint(&self) -> (Ts, Ts);
}

/// Delivery of agent messages to the current owner.
///
/// `done = false` means the send buffer is full; the agent retries on a
/// later tick. [`barrier`](ProcessorMessenger::barrier) reports whether
/// every previous message has been acknowledged.
pub trait ProcessorMessenger: Send + Sync {
    fn finish_table_operation(&self, table_id: TableId) -> BoxSchedFuture<'_, bool>;
    fn sync_task_statuses(
        &self,
        running: Vec<TableId>,
        adding: Vec<TableId>,
        removing: Vec<TableId>,
    ) -> BoxSchedFuture<'_, bool>;
    fn send_checkpoint(&self, checkpoint_ts: Ts, resolved_ts: Ts) -> BoxSchedFuture<'_, bool>;

    /// Whether there is no message still awaiting owner acknowledgement.
    fn barrier(&self) -> bool;

    /// Called when ownership moved so in-flight sends can be redirected.
    fn on_owner_changed(&self, new_owner: CaptureId);

    fn close(&self) -> Result<()>;
}
