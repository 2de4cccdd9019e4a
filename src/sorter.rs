// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sorter storage actor.
//!
//! Each shard of the sorter owns one embedded key-value store and one
//! [`SorterActor`] task that is the *only* writer to it. The actor batches
//! incoming events into a write batch, throttles concurrently open
//! iterators through a semaphore, and offers compactions to a scheduler
//! once enough deletions have accumulated.
//!
//! # Write Batching
//!
//! Events accumulate in the batch and commit once it holds
//! `block_size × 16` bytes. An iterator request force-flushes at the end of
//! the poll cycle so the iterator always observes the writes that preceded
//! it in the same cycle.
//!
//! # Iterator Throttling
//!
//! Iterators pin storage resources, so the number open at once is capped.
//! Requests queue keyed by `(uid, table_id)`; the actor drains the queue
//! opportunistically after each flush, handing each requester an iterator
//! together with the semaphore permit that backs it. Dropping the iterator
//! releases the permit.
//!
//! # Failure
//!
//! A commit failure is unrecoverable for the shard: the actor logs it,
//! reports its quit cause, and stops. The supervisor owns restart policy.

use crate::config::SorterConfig;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::model::{ActorId, TableId, Ts};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Engine traits
// ═══════════════════════════════════════════════════════════════════════════════

/// A write batch owned by one actor.
pub trait SortBatch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
    /// Bytes currently buffered.
    fn len_bytes(&self) -> usize;
    /// Bytes of backing capacity, which only grows until reallocation.
    fn capacity_bytes(&self) -> usize;
    fn commit(&mut self) -> Result<()>;
    /// Clear contents, keeping capacity.
    fn reset(&mut self);
}

/// A snapshot iterator over a key range.
pub trait SortIterator: Send {
    /// Position on the first key in range; false if the range is empty.
    fn first(&mut self) -> bool;
    /// Advance; false when exhausted.
    fn next(&mut self) -> bool;
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// An embedded sorted key-value engine.
pub trait SortEngine: Send + Sync + 'static {
    fn batch(&self, capacity: usize) -> Box<dyn SortBatch>;
    /// Iterator over `[lower, upper)`.
    fn iterator(&self, lower: &[u8], upper: &[u8]) -> Box<dyn SortIterator>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

/// An iterator handed to a requester, valid while the permit is held.
pub struct LimitedIterator {
    pub iterator: Box<dyn SortIterator>,
    pub resolved_ts: Ts,
    _permit: OwnedSemaphorePermit,
}

/// Request for an iterator over one table's key range.
pub struct IterRequest {
    pub range: (Vec<u8>, Vec<u8>),
    pub resolved_ts: Ts,
    pub reply: oneshot::Sender<LimitedIterator>,
}

/// One unit of sorter work.
pub struct SorterTask {
    pub uid: u32,
    pub table_id: TableId,
    /// Key-value writes; an empty value deletes the key.
    pub events: Vec<(Vec<u8>, Vec<u8>)>,
    pub iter_request: Option<IterRequest>,
}

/// Messages accepted by the actor.
pub enum SorterMessage {
    Tick,
    Task(SorterTask),
    Stop,
}

/// A compaction offer emitted by an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTask {
    pub actor_id: ActorId,
}

/// Decides when a shard's deletions justify a compaction and forwards the
/// request to the compactor task.
pub struct CompactScheduler {
    deletion_threshold: usize,
    tx: mpsc::Sender<CompactTask>,
}

impl CompactScheduler {
    pub fn new(deletion_threshold: usize, tx: mpsc::Sender<CompactTask>) -> Self {
        Self {
            deletion_threshold,
            tx,
        }
    }

    /// Offer `(actor_id, delete_count)`. Returns true iff the compaction was
    /// accepted, in which case the caller resets its count.
    pub fn maybe_compact(&self, actor_id: ActorId, delete_count: usize) -> bool {
        if delete_count < self.deletion_threshold {
            return false;
        }
        match self.tx.try_send(CompactTask { actor_id }) {
            Ok(()) => {
                metrics::record_sorter_compaction(actor_id);
                true
            }
            Err(_) => {
                // Compactor busy; keep counting and offer again later.
                debug!(actor_id, delete_count, "compaction request deferred");
                false
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Iterator queue
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    uid: u32,
    table_id: TableId,
}

/// FIFO of pending iterator requests with per-key uniqueness.
struct IterQueue {
    queue: VecDeque<(TableKey, IterRequest)>,
    keys: HashSet<TableKey>,
}

impl IterQueue {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    fn push(&mut self, uid: u32, table_id: TableId, req: IterRequest) {
        let key = TableKey { uid, table_id };
        if !self.keys.insert(key) {
            panic!(
                "a table must not issue two concurrent iterator requests: \
                 uid={uid} table_id={table_id} resolved_ts={}",
                req.resolved_ts
            );
        }
        self.queue.push_back((key, req));
    }

    fn pop(&mut self) -> Option<IterRequest> {
        let (key, req) = self.queue.pop_front()?;
        self.keys.remove(&key);
        Some(req)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The actor
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-threaded storage actor for one sorter shard.
pub struct SorterActor<E: SortEngine> {
    id: ActorId,
    engine: Arc<E>,
    batch: Box<dyn SortBatch>,
    batch_size: usize,
    batch_capacity: usize,
    iter_sem: Arc<Semaphore>,
    iter_concurrency: usize,
    iter_queue: IterQueue,
    delete_count: usize,
    compact: CompactScheduler,
}

impl<E: SortEngine> SorterActor<E> {
    pub fn new(id: ActorId, engine: Arc<E>, cfg: &SorterConfig, compact: CompactScheduler) -> Self {
        let batch_size = cfg.write_batch_size();
        let batch_capacity = cfg.write_batch_capacity();
        let batch = engine.batch(batch_capacity);
        Self {
            id,
            engine,
            batch,
            batch_size,
            batch_capacity,
            iter_sem: Arc::new(Semaphore::new(cfg.iterator_concurrency)),
            iter_concurrency: cfg.iterator_concurrency,
            iter_queue: IterQueue::new(),
            delete_count: 0,
            compact,
        }
    }

    /// Run the actor until `Stop`, channel close, or a storage failure.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SorterMessage>) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        loop {
            buf.clear();
            if rx.recv_many(&mut buf, 64).await == 0 {
                info!(actor_id = self.id, "sorter actor mailbox closed, quitting");
                return Ok(());
            }
            match self.poll(std::mem::take(&mut buf)) {
                Ok(true) => {}
                Ok(false) => {
                    info!(actor_id = self.id, "sorter actor quit");
                    return Ok(());
                }
                Err(e) => {
                    error!(actor_id = self.id, error = %e, "sorter actor quit on storage error");
                    return Err(e);
                }
            }
        }
    }

    /// Process one batch of messages. Returns false to stop.
    pub fn poll(&mut self, tasks: Vec<SorterMessage>) -> Result<bool> {
        let mut require_iter = false;
        for msg in tasks {
            let task = match msg {
                SorterMessage::Tick => continue,
                SorterMessage::Task(task) => task,
                SorterMessage::Stop => return Ok(false),
            };

            for (key, value) in &task.events {
                if value.is_empty() {
                    // Empty value means delete.
                    self.batch.delete(key);
                    self.delete_count += 1;
                } else {
                    self.batch.put(key, value);
                }
                // Do not force write, batching for efficiency.
                self.maybe_write(false)?;
            }
            if let Some(req) = task.iter_request {
                self.iter_queue.push(task.uid, task.table_id, req);
                require_iter = true;
            }
        }

        // Force write only if some task in this cycle requires an iterator,
        // so the iterator observes its own writes.
        self.maybe_write(require_iter)?;
        self.acquire_iterators();
        Ok(true)
    }

    fn maybe_write(&mut self, force: bool) -> Result<()> {
        let bytes = self.batch.len_bytes();
        if bytes >= self.batch_size || (force && bytes != 0) {
            let start = std::time::Instant::now();
            self.batch.commit()?;
            metrics::record_sorter_write(self.id, bytes, start.elapsed());

            // Reset the write batch, or reclaim memory if it grew too large.
            if self.batch.capacity_bytes() <= self.batch_capacity {
                self.batch.reset();
            } else {
                self.batch = self.engine.batch(self.batch_capacity);
            }

            // Schedule a compaction when there are too many deletions.
            if self.compact.maybe_compact(self.id, self.delete_count) {
                self.delete_count = 0;
            }
        }
        Ok(())
    }

    /// Hand out iterators for queued requests while permits last.
    fn acquire_iterators(&mut self) {
        loop {
            let Ok(permit) = Arc::clone(&self.iter_sem).try_acquire_owned() else {
                break;
            };
            let Some(req) = self.iter_queue.pop() else {
                drop(permit);
                break;
            };
            let iterator = self.engine.iterator(&req.range.0, &req.range.1);
            let limited = LimitedIterator {
                iterator,
                resolved_ts: req.resolved_ts,
                _permit: permit,
            };
            if req.reply.send(limited).is_err() {
                // Requester went away; iterator and permit drop here.
                warn!(actor_id = self.id, "iterator requester gone before handoff");
            }
        }
        metrics::set_sorter_open_iterators(
            self.id,
            self.iter_concurrency
                .saturating_sub(self.iter_sem.available_permits()),
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory engine
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory [`SortEngine`] for tests and standalone use.
#[derive(Default)]
pub struct MemEngine {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
    fail_commits: Arc<std::sync::atomic::AtomicBool>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail (failure-injection for tests).
    pub fn fail_commits(&self) {
        self.fail_commits
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MemBatch {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    bytes: usize,
    capacity: usize,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl SortBatch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.bytes += key.len() + value.len();
        self.capacity = self.capacity.max(self.bytes);
        self.ops.push((key.to_vec(), Some(value.to_vec())));
    }

    fn delete(&mut self, key: &[u8]) {
        self.bytes += key.len();
        self.capacity = self.capacity.max(self.bytes);
        self.ops.push((key.to_vec(), None));
    }

    fn len_bytes(&self) -> usize {
        self.bytes
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    fn commit(&mut self) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::SorterStorage("injected commit failure".into()));
        }
        let mut data = self.data.lock().unwrap();
        for (key, value) in self.ops.drain(..) {
            match value {
                Some(v) => {
                    data.insert(key, v);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        self.bytes = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.bytes = 0;
    }
}

struct MemIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl SortIterator for MemIterator {
    fn first(&mut self) -> bool {
        if self.entries.is_empty() {
            self.pos = None;
            false
        } else {
            self.pos = Some(0);
            true
        }
    }

    fn next(&mut self) -> bool {
        match self.pos {
            Some(p) if p + 1 < self.entries.len() => {
                self.pos = Some(p + 1);
                true
            }
            _ => {
                self.pos = None;
                false
            }
        }
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not positioned")].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos.expect("iterator not positioned")].1
    }
}

impl SortEngine for MemEngine {
    fn batch(&self, capacity: usize) -> Box<dyn SortBatch> {
        Box::new(MemBatch {
            data: Arc::clone(&self.data),
            ops: Vec::new(),
            bytes: 0,
            capacity,
            fail: Arc::clone(&self.fail_commits),
        })
    }

    fn iterator(&self, lower: &[u8], upper: &[u8]) -> Box<dyn SortIterator> {
        let data = self.data.lock().unwrap();
        let entries = data
            .range::<[u8], _>((Bound::Included(lower), Bound::Excluded(upper)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemIterator { entries, pos: None })
    }
}
