// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The agent: worker-side implementation of the scheduling protocol.
//!
//! # Operation State Machine
//!
//! ```text
//! Received ──(executor accepts add/remove)──▶ Processed
//! Processed ──(executor confirms finished)──▶ Finished
//! Finished ──(owner acks FinishTableOperation)──▶ (removed)
//! ```
//!
//! A single tick may fall through all three states when the executor and
//! messenger complete synchronously.
//!
//! # Ownership Epochs
//!
//! Every owner message carries `(capture_id, rev)` where `rev` is the
//! election epoch. A newer rev replaces the stored owner and *drops every
//! not-yet-processed operation*: they came from the previous owner, which
//! will never follow up on them, and the new owner re-dispatches from
//! scratch. Messages from an older rev are ignored. Two different captures
//! claiming the same rev means the election itself is broken, and the agent
//! panics rather than guess which one to obey.
//!
//! # Shared State
//!
//! `tick` runs on the processor's scheduled task; the `on_owner_*` handlers
//! run on the inbound-message task. They share `owner_info` (RwLock),
//! `pending_ops` (Mutex) and the two signalling flags (atomics).
//! `table_operations` is touched only by `tick`. No lock is ever held
//! across an await.

use super::{CheckpointTsSender, ProcessorMessenger, TableExecutor};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::metrics;
use crate::model::{CaptureId, TableId, Ts};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Pending-operation batch size per drain.
const POP_OPS_BATCH: usize = 128;

/// Progress of one dispatched table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Received,
    Processed,
    Finished,
}

/// One dispatched table operation.
#[derive(Debug, Clone, Copy)]
pub struct AgentOperation {
    pub table_id: TableId,
    pub is_delete: bool,
    pub status: OperationStatus,
}

/// The owner currently believed to hold the election.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerInfo {
    pub capture_id: CaptureId,
    /// Election epoch; strictly increasing across owner changes.
    pub rev: i64,
}

/// Worker-side agent for one changefeed.
pub struct Agent<E, M> {
    executor: Arc<E>,
    messenger: Arc<M>,
    changefeed_id: String,

    /// Operations dispatched but not yet admitted into `table_operations`.
    pending_ops: Mutex<VecDeque<AgentOperation>>,

    /// In-flight operations, keyed by table. Only `tick` touches this.
    table_operations: Mutex<HashMap<TableId, AgentOperation>>,

    /// A sync must be sent to the owner as soon as possible.
    needs_sync: AtomicBool,

    owner_info: RwLock<OwnerInfo>,
    /// The owner changed and the messenger must be told before anything
    /// else is sent.
    owner_changed: AtomicBool,

    checkpoint_sender: Mutex<CheckpointTsSender>,
}

impl<E: TableExecutor, M: ProcessorMessenger> Agent<E, M> {
    pub fn new(
        changefeed_id: impl Into<String>,
        executor: Arc<E>,
        messenger: Arc<M>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            executor,
            messenger,
            changefeed_id: changefeed_id.into(),
            pending_ops: Mutex::new(VecDeque::new()),
            table_operations: Mutex::new(HashMap::new()),
            // a fresh agent always introduces itself with a sync
            needs_sync: AtomicBool::new(true),
            owner_info: RwLock::new(OwnerInfo::default()),
            owner_changed: AtomicBool::new(false),
            checkpoint_sender: Mutex::new(CheckpointTsSender::new(
                config.send_checkpoint_interval(),
            )),
        }
    }

    /// Drive the agent one step. Called on a scheduled cadence.
    pub async fn tick(&self) -> Result<()> {
        if self.owner_changed.swap(false, Ordering::SeqCst) {
            // The messenger may be waiting on acks from the old owner.
            self.messenger.on_owner_changed(self.current_owner());
        }

        if self.needs_sync.load(Ordering::SeqCst) {
            let done = self.send_sync().await?;
            if !done {
                // A sync must land before anything else makes sense.
                return Ok(());
            }
            self.needs_sync.store(false, Ordering::SeqCst);
        }

        // Checkpoints only flow after a required sync, which keeps the
        // protocol easy to reason about on the owner side.
        self.send_checkpoint().await?;

        let ops_to_apply = self.pop_pending_ops();
        {
            let mut table_ops = self.table_operations.lock().unwrap();
            for op in ops_to_apply {
                if table_ops.contains_key(&op.table_id) {
                    panic!(
                        "duplicate table operation in flight: table_id={} is_delete={}",
                        op.table_id, op.is_delete
                    );
                }
                metrics::record_operation_transition(&self.changefeed_id, "received");
                table_ops.insert(op.table_id, op);
            }
        }

        self.process_operations().await
    }

    /// The last checkpoint known to have reached the owner.
    pub fn last_sent_checkpoint_ts(&self) -> Ts {
        self.checkpoint_sender.lock().unwrap().last_sent_checkpoint_ts()
    }

    /// The owner the agent currently obeys.
    pub fn current_owner(&self) -> CaptureId {
        self.owner_info.read().unwrap().capture_id.clone()
    }

    /// Handle a task dispatch from the owner.
    pub fn on_owner_dispatched_task(
        &self,
        owner_capture_id: &str,
        owner_rev: i64,
        table_id: TableId,
        is_delete: bool,
    ) {
        if !self.update_owner_info(owner_capture_id, owner_rev) {
            metrics::record_stale_owner_message(&self.changefeed_id);
            info!(table_id, is_delete, "task from stale owner ignored");
            return;
        }

        let op = AgentOperation {
            table_id,
            is_delete,
            status: OperationStatus::Received,
        };
        self.pending_ops.lock().unwrap().push_back(op);
        debug!(
            owner_capture_id,
            owner_rev, table_id, is_delete, "owner dispatched task"
        );
    }

    /// Handle an ownership announcement.
    pub fn on_owner_announce(&self, owner_capture_id: &str, owner_rev: i64) {
        if !self.update_owner_info(owner_capture_id, owner_rev) {
            metrics::record_stale_owner_message(&self.changefeed_id);
            info!(owner_capture_id, owner_rev, "sync request from stale owner ignored");
            return;
        }

        self.needs_sync.store(true, Ordering::SeqCst);
        info!(owner_capture_id, owner_rev, "owner announce received");
    }

    /// Apply the owner-epoch rules. Returns false when the message came
    /// from a stale owner and must be ignored.
    fn update_owner_info(&self, capture_id: &str, rev: i64) -> bool {
        let mut owner = self.owner_info.write().unwrap();
        if owner.rev < rev {
            owner.rev = rev;
            owner.capture_id = capture_id.to_string();

            // Flag instead of resetting the messenger inline: this runs on
            // the message-handler task and must not block on tick state.
            self.owner_changed.store(true, Ordering::SeqCst);
            metrics::record_owner_change(&self.changefeed_id);
            info!(
                owner_capture_id = capture_id,
                owner_rev = rev,
                "owner updated"
            );

            // Operations from the previous owner that we never started are
            // dropped; the new owner re-dispatches.
            self.pending_ops.lock().unwrap().clear();
            return true;
        }
        if owner.rev > rev {
            info!(
                stale_capture_id = capture_id,
                stale_rev = rev,
                owner_rev = owner.rev,
                "message received from stale owner"
            );
            return false;
        }
        if owner.capture_id != capture_id {
            // Same rev from two captures can only happen if the election
            // is broken; obeying either would risk dual ownership.
            panic!(
                "owner capture ids do not match for rev {}: expected {}, got {}",
                rev, owner.capture_id, capture_id
            );
        }
        true
    }

    fn pop_pending_ops(&self) -> Vec<AgentOperation> {
        let mut pending = self.pending_ops.lock().unwrap();
        let mut out = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let take = pending.len().min(POP_OPS_BATCH);
            out.extend(pending.drain(..take));
        }
        out
    }

    async fn send_sync(&self) -> Result<bool> {
        let (mut running, mut adding, mut removing) = {
            let table_ops = self.table_operations.lock().unwrap();
            let mut adding = Vec::new();
            let mut removing = Vec::new();
            for op in table_ops.values() {
                if op.is_delete {
                    removing.push(op.table_id);
                } else {
                    adding.push(op.table_id);
                }
            }
            let mut running = Vec::new();
            for table_id in self.executor.get_all_current_tables() {
                // A table with a pending operation is not Running.
                if table_ops.contains_key(&table_id) {
                    continue;
                }
                running.push(table_id);
            }
            (running, adding, removing)
        };
        // Deterministic ordering, also for the owner's benefit.
        running.sort_unstable();
        adding.sort_unstable();
        removing.sort_unstable();
        self.messenger
            .sync_task_statuses(running, adding, removing)
            .await
    }

    async fn send_checkpoint(&self) -> Result<()> {
        let executor = &self.executor;
        let provider = || {
            // No meaningful checkpoint exists while no table runs here.
            if executor.get_all_current_tables().is_empty() {
                debug!("no table is running, skip sending checkpoint");
                return None;
            }
            Some(executor.get_checkpoint())
        };

        // The sender is only driven from tick, so the copy-out cannot lose
        // concurrent updates.
        let mut sender = *self.checkpoint_sender.lock().unwrap();
        let res = sender.send_checkpoint(&*self.messenger, provider).await;
        *self.checkpoint_sender.lock().unwrap() = sender;
        res
    }

    async fn process_operations(&self) -> Result<()> {
        let mut ops = std::mem::take(&mut *self.table_operations.lock().unwrap());
        let result = self.advance_operations(&mut ops).await;
        *self.table_operations.lock().unwrap() = ops;
        result
    }

    async fn advance_operations(
        &self,
        ops: &mut HashMap<TableId, AgentOperation>,
    ) -> Result<()> {
        let table_ids: Vec<TableId> = ops.keys().copied().collect();
        for table_id in table_ids {
            let op = ops.get_mut(&table_id).expect("operation present");

            if op.status == OperationStatus::Received {
                let done = if op.is_delete {
                    self.executor.remove_table(table_id).await?
                } else {
                    self.executor.add_table(table_id).await?
                };
                if !done {
                    continue;
                }
                op.status = OperationStatus::Processed;
                metrics::record_operation_transition(&self.changefeed_id, "processed");
                debug!(table_id, is_delete = op.is_delete, "operation processed");
            }

            if op.status == OperationStatus::Processed {
                let done = if op.is_delete {
                    self.executor.is_remove_table_finished(table_id)
                } else {
                    self.executor.is_add_table_finished(table_id)
                };
                if !done {
                    continue;
                }
                op.status = OperationStatus::Finished;
                metrics::record_operation_transition(&self.changefeed_id, "finished");
                debug!(table_id, is_delete = op.is_delete, "operation finished");
            }

            if op.status == OperationStatus::Finished {
                let done = self.messenger.finish_table_operation(table_id).await?;
                if done {
                    ops.remove(&table_id);
                }
            }
        }
        Ok(())
    }
}
