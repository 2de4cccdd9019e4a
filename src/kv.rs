// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retrying client for the coordination service.
//!
//! Wraps an etcd-shaped backend ([`KvBackend`]) and adds:
//!
//! - Bounded-retry point operations with exponential backoff. `delete` is
//!   never retried: a delete is observable by other watchers, and replaying
//!   one after a partial success could double its effect.
//! - A 30 s overall deadline on transactional commits, with retryability
//!   restricted so that genuine transaction conflicts surface to the caller.
//! - Lease revocation that treats "lease already gone" as success.
//! - A supervised watch: responses are forwarded through a buffered channel,
//!   and a watch that goes silent is reopened at the last delivered revision
//!   so consumers never observe revisions moving backwards.
//!
//! # Watch Liveness
//!
//! The service only pushes progress notifications when asked. The watch task
//! requests progress every second; if nothing (not even a notification)
//! arrives for 10 s, the underlying watch is assumed wedged and is reopened.
//! Reopening at `last_revision` re-delivers at least the last seen event,
//! which is safe because consumers are idempotent per revision.

use crate::config::KvClientConfig;
use crate::error::{EngineError, KvErrorKind, Result};
use crate::metrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A backend call failure, before retry classification.
#[derive(Debug, Clone)]
pub struct KvCallError {
    pub kind: KvErrorKind,
    pub message: String,
}

impl KvCallError {
    pub fn new(kind: KvErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of one backend call.
pub type KvResult<T> = std::result::Result<T, KvCallError>;

/// Type alias for boxed backend futures.
pub type BoxKvFuture<'a, T> = Pin<Box<dyn Future<Output = KvResult<T>> + Send + 'a>>;

/// Lease identifier issued by the coordination service.
pub type LeaseId = i64;

/// Response header common to all operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// The store revision when the response was produced.
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
}

/// A comparison guarding a transaction.
#[derive(Debug, Clone)]
pub struct TxnCompare {
    pub key: Vec<u8>,
    /// Expected value; `None` asserts the key is absent.
    pub expect_value: Option<Vec<u8>>,
}

/// One mutation or read inside a transaction branch.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compares: Vec<TxnCompare>,
    pub then_ops: Vec<TxnOp>,
    pub else_ops: Vec<TxnOp>,
}

#[derive(Debug, Clone, Default)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseGrantResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseTimeToLiveResponse {
    pub id: LeaseId,
    pub ttl: i64,
    pub granted_ttl: i64,
}

/// Options for opening a watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Revision to start from; `None` starts at the current head.
    pub start_revision: Option<i64>,
    /// Watch the whole key prefix rather than the single key.
    pub prefix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// One batch of watch events, or a progress notification.
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub events: Vec<WatchEvent>,
    pub is_progress_notify: bool,
    /// Error reported in-band by the watch stream.
    pub error: Option<String>,
}

impl WatchResponse {
    fn is_clean(&self) -> bool {
        self.error.is_none() && !self.is_progress_notify
    }
}

/// The coordination-service surface the engine consumes.
///
/// Implementations wrap a real client; tests use an in-process mock. All
/// methods are point calls except `watch`, which opens a raw event stream
/// that the retrying client supervises.
pub trait KvBackend: Send + Sync + 'static {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> BoxKvFuture<'_, PutResponse>;
    fn get(&self, key: Vec<u8>, prefix: bool) -> BoxKvFuture<'_, GetResponse>;
    fn delete(&self, key: Vec<u8>, prefix: bool) -> BoxKvFuture<'_, DeleteResponse>;
    fn txn(&self, req: TxnRequest) -> BoxKvFuture<'_, TxnResponse>;
    fn grant(&self, ttl_secs: i64) -> BoxKvFuture<'_, LeaseGrantResponse>;
    fn revoke(&self, lease: LeaseId) -> BoxKvFuture<'_, ()>;
    fn time_to_live(&self, lease: LeaseId) -> BoxKvFuture<'_, LeaseTimeToLiveResponse>;
    fn request_progress(&self) -> BoxKvFuture<'_, ()>;

    /// Open a raw watch. The receiver yields until the backend drops it.
    fn watch(&self, key: Vec<u8>, opts: WatchOptions) -> mpsc::Receiver<WatchResponse>;
}

/// Retrying wrapper over a [`KvBackend`].
pub struct RetryingKvClient<B> {
    backend: Arc<B>,
    config: KvClientConfig,
    shutdown: watch::Receiver<bool>,
}

impl<B: KvBackend> RetryingKvClient<B> {
    pub fn new(backend: Arc<B>, config: KvClientConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            backend,
            config,
            shutdown,
        }
    }

    /// The wrapped backend, for operations that must bypass retry.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn retry_rpc<T, F, Fut>(
        &self,
        op: &'static str,
        retryable: impl Fn(&KvCallError) -> bool,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            metrics::record_kv_op(op);
            match call().await {
                Ok(resp) => {
                    if attempt > 1 {
                        debug!(op, attempt, "kv rpc succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if e.kind != KvErrorKind::Canceled {
                        warn!(op, attempt, error = %e.message, "kv rpc failed");
                    }
                    if e.kind == KvErrorKind::Canceled
                        || !retryable(&e)
                        || attempt >= self.config.max_tries
                    {
                        return Err(EngineError::kv(op, e.kind, e.message));
                    }
                    let delay = self.config.backoff_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Err(EngineError::Cancelled),
                    }
                }
            }
        }
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<PutResponse> {
        self.retry_rpc("Put", |e| default_retryable(e), || {
            self.backend.put(key.clone(), value.clone())
        })
        .await
    }

    pub async fn get(&self, key: Vec<u8>, prefix: bool) -> Result<GetResponse> {
        self.retry_rpc("Get", |e| default_retryable(e), || {
            self.backend.get(key.clone(), prefix)
        })
        .await
    }

    /// Delete is never retried: a replayed delete is observable.
    pub async fn delete(&self, key: Vec<u8>, prefix: bool) -> Result<DeleteResponse> {
        metrics::record_kv_op("Del");
        self.backend
            .delete(key, prefix)
            .await
            .map_err(|e| EngineError::kv("Del", e.kind, e.message))
    }

    /// Transactional commit under an overall deadline. Conflicts are not
    /// retried; the caller owns conflict resolution.
    pub async fn txn(&self, req: TxnRequest) -> Result<TxnResponse> {
        let deadline = std::time::Duration::from_secs(self.config.txn_timeout_secs);
        let fut = self.retry_rpc("Txn", |e| txn_retryable(e), || self.backend.txn(req.clone()));
        match tokio::time::timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(EngineError::kv(
                "Txn",
                KvErrorKind::DeadlineExceeded,
                "transaction commit deadline exceeded",
            )),
        }
    }

    pub async fn grant(&self, ttl_secs: i64) -> Result<LeaseGrantResponse> {
        self.retry_rpc("Grant", |e| default_retryable(e), || {
            self.backend.grant(ttl_secs)
        })
        .await
    }

    /// Revoke a lease. A lease that is already expired or revoked counts as
    /// success.
    pub async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let res = self
            .retry_rpc(
                "Revoke",
                |e| e.kind != KvErrorKind::LeaseNotFound && default_retryable(e),
                || self.backend.revoke(lease),
            )
            .await;
        match res {
            Err(ref e) if e.kv_kind() == Some(KvErrorKind::LeaseNotFound) => {
                info!(lease, "lease already gone, treating revoke as success");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn time_to_live(&self, lease: LeaseId) -> Result<LeaseTimeToLiveResponse> {
        self.retry_rpc("TimeToLive", |e| default_retryable(e), || {
            self.backend.time_to_live(lease)
        })
        .await
    }

    /// Open a supervised watch.
    ///
    /// Returns a buffered channel fed by a background task that keeps the
    /// underlying watch alive. The channel closes when the shutdown signal
    /// fires. `role` only labels logs and metrics.
    pub fn watch(
        &self,
        key: Vec<u8>,
        role: &str,
        opts: WatchOptions,
    ) -> mpsc::Receiver<WatchResponse> {
        let (tx, rx) = mpsc::channel(self.config.watch_buffer);
        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let role = role.to_string();
        tokio::spawn(async move {
            watch_loop(backend, config, shutdown, tx, key, role, opts).await;
        });
        rx
    }
}

fn default_retryable(e: &KvCallError) -> bool {
    matches!(
        e.kind,
        KvErrorKind::Unavailable | KvErrorKind::DeadlineExceeded
    )
}

/// Transactions must not blindly replay: a conflict means another writer
/// won, and only the caller can decide what that implies.
fn txn_retryable(e: &KvCallError) -> bool {
    e.kind == KvErrorKind::Unavailable
}

async fn watch_loop<B: KvBackend>(
    backend: Arc<B>,
    config: KvClientConfig,
    mut shutdown: watch::Receiver<bool>,
    out: mpsc::Sender<WatchResponse>,
    key: Vec<u8>,
    role: String,
    opts: WatchOptions,
) {
    // Seed from the caller's start revision so the first reopen cannot fall
    // behind the intended start point.
    let mut last_revision = opts.start_revision.unwrap_or(0);
    let watch_timeout = std::time::Duration::from_secs(config.watch_timeout_secs);
    let progress_interval = std::time::Duration::from_secs(config.progress_interval_secs);

    let mut inner = backend.watch(key.clone(), opts.clone());
    let mut ticker = tokio::time::interval(progress_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_received = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = inner.recv() => {
                let Some(response) = maybe else {
                    // The raw stream ended without cancellation; back off a
                    // beat, then reopen from the last delivered revision.
                    warn!(role = %role, last_revision, "raw watch stream ended, reopening");
                    metrics::record_watch_reset(&role);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(progress_interval) => {}
                    }
                    inner = reopen(&*backend, &key, &opts, last_revision);
                    last_received = Instant::now();
                    continue;
                };
                last_received = Instant::now();
                if response.is_clean() {
                    last_revision = response.header.revision;
                }

                // Forward, holding the response until the consumer takes it.
                // A slow consumer only earns warnings; events are never
                // dropped on the floor.
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        permit = out.reserve() => {
                            match permit {
                                Ok(permit) => {
                                    permit.send(response);
                                    break;
                                }
                                // Receiver dropped; nothing left to feed.
                                Err(_) => return,
                            }
                        }
                        _ = ticker.tick() => {
                            if last_received.elapsed() >= watch_timeout {
                                warn!(
                                    role = %role,
                                    blocked_for = ?last_received.elapsed(),
                                    "watch output blocked too long, the consumer may be stuck"
                                );
                            }
                        }
                    }
                }
                ticker.reset();
            }
            _ = ticker.tick() => {
                if let Err(e) = backend.request_progress().await {
                    warn!(role = %role, error = %e.message, "failed to request watch progress");
                }
                if last_received.elapsed() >= watch_timeout {
                    warn!(
                        role = %role,
                        idle_for = ?last_received.elapsed(),
                        last_revision,
                        "watch channel silent too long, reopening"
                    );
                    metrics::record_watch_reset(&role);
                    inner = reopen(&*backend, &key, &opts, last_revision);
                    last_received = Instant::now();
                }
            }
        }
    }
    info!(role = %role, "watch loop exited");
}

/// Reopen the raw watch at `last_revision`, preserving the caller's option
/// set. The revision already delivered downstream is re-requested, never
/// skipped, so consumers observe no backward jumps.
fn reopen<B: KvBackend>(
    backend: &B,
    key: &[u8],
    opts: &WatchOptions,
    last_revision: i64,
) -> mpsc::Receiver<WatchResponse> {
    let mut reopened = opts.clone();
    reopened.start_revision = Some(last_revision);
    backend.watch(key.to_vec(), reopened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend: point calls pop pre-programmed results, watches
    /// record their options and yield test-fed channels.
    struct MockBackend {
        put_results: Mutex<VecDeque<KvResult<PutResponse>>>,
        delete_results: Mutex<VecDeque<KvResult<DeleteResponse>>>,
        txn_results: Mutex<VecDeque<KvResult<TxnResponse>>>,
        revoke_results: Mutex<VecDeque<KvResult<()>>>,
        calls: Mutex<Vec<&'static str>>,
        watch_opts: Mutex<Vec<WatchOptions>>,
        watch_feeds: Mutex<VecDeque<mpsc::Receiver<WatchResponse>>>,
        // keeps fallback watch channels open so watch loops park on recv
        watch_keepalive: Mutex<Vec<mpsc::Sender<WatchResponse>>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                put_results: Mutex::new(VecDeque::new()),
                delete_results: Mutex::new(VecDeque::new()),
                txn_results: Mutex::new(VecDeque::new()),
                revoke_results: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                watch_opts: Mutex::new(Vec::new()),
                watch_feeds: Mutex::new(VecDeque::new()),
                watch_keepalive: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self, op: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
        }

        fn unavailable() -> KvCallError {
            KvCallError::new(KvErrorKind::Unavailable, "connection refused")
        }
    }

    impl KvBackend for MockBackend {
        fn put(&self, _key: Vec<u8>, _value: Vec<u8>) -> BoxKvFuture<'_, PutResponse> {
            self.calls.lock().unwrap().push("put");
            let res = self
                .put_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(PutResponse::default()));
            Box::pin(async move { res })
        }

        fn get(&self, _key: Vec<u8>, _prefix: bool) -> BoxKvFuture<'_, GetResponse> {
            self.calls.lock().unwrap().push("get");
            Box::pin(async move { Ok(GetResponse::default()) })
        }

        fn delete(&self, _key: Vec<u8>, _prefix: bool) -> BoxKvFuture<'_, DeleteResponse> {
            self.calls.lock().unwrap().push("delete");
            let res = self
                .delete_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(DeleteResponse::default()));
            Box::pin(async move { res })
        }

        fn txn(&self, _req: TxnRequest) -> BoxKvFuture<'_, TxnResponse> {
            self.calls.lock().unwrap().push("txn");
            let res = self
                .txn_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TxnResponse::default()));
            Box::pin(async move { res })
        }

        fn grant(&self, ttl_secs: i64) -> BoxKvFuture<'_, LeaseGrantResponse> {
            self.calls.lock().unwrap().push("grant");
            Box::pin(async move {
                Ok(LeaseGrantResponse {
                    id: 1,
                    ttl: ttl_secs,
                })
            })
        }

        fn revoke(&self, _lease: LeaseId) -> BoxKvFuture<'_, ()> {
            self.calls.lock().unwrap().push("revoke");
            let res = self
                .revoke_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            Box::pin(async move { res })
        }

        fn time_to_live(&self, lease: LeaseId) -> BoxKvFuture<'_, LeaseTimeToLiveResponse> {
            self.calls.lock().unwrap().push("ttl");
            Box::pin(async move {
                Ok(LeaseTimeToLiveResponse {
                    id: lease,
                    ttl: 10,
                    granted_ttl: 10,
                })
            })
        }

        fn request_progress(&self) -> BoxKvFuture<'_, ()> {
            self.calls.lock().unwrap().push("progress");
            Box::pin(async move { Ok(()) })
        }

        fn watch(&self, _key: Vec<u8>, opts: WatchOptions) -> mpsc::Receiver<WatchResponse> {
            self.watch_opts.lock().unwrap().push(opts);
            self.watch_feeds.lock().unwrap().pop_front().unwrap_or_else(|| {
                let (tx, rx) = mpsc::channel(1);
                self.watch_keepalive.lock().unwrap().push(tx);
                rx
            })
        }
    }

    fn client(backend: Arc<MockBackend>) -> (RetryingKvClient<MockBackend>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            RetryingKvClient::new(backend, KvClientConfig::for_testing(), rx),
            tx,
        )
    }

    fn events_response(revision: i64) -> WatchResponse {
        WatchResponse {
            header: ResponseHeader { revision },
            events: vec![WatchEvent {
                kind: WatchEventKind::Put,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                mod_revision: revision,
            }],
            is_progress_notify: false,
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_retries_until_success() {
        let backend = Arc::new(MockBackend::new());
        backend.put_results.lock().unwrap().extend([
            Err(MockBackend::unavailable()),
            Err(MockBackend::unavailable()),
            Ok(PutResponse::default()),
        ]);
        let (client, _tx) = client(Arc::clone(&backend));

        client.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(backend.call_count("put"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_gives_up_after_max_tries() {
        let backend = Arc::new(MockBackend::new());
        for _ in 0..10 {
            backend
                .put_results
                .lock()
                .unwrap()
                .push_back(Err(MockBackend::unavailable()));
        }
        let (client, _tx) = client(Arc::clone(&backend));

        let err = client.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
        assert_eq!(err.kv_kind(), Some(KvErrorKind::Unavailable));
        // for_testing caps at 3 tries
        assert_eq!(backend.call_count("put"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_immediately() {
        let backend = Arc::new(MockBackend::new());
        backend
            .put_results
            .lock()
            .unwrap()
            .push_back(Err(KvCallError::new(KvErrorKind::Internal, "corrupt")));
        let (client, _tx) = client(Arc::clone(&backend));

        let err = client.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
        assert_eq!(err.kv_kind(), Some(KvErrorKind::Internal));
        assert_eq!(backend.call_count("put"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_never_retried() {
        let backend = Arc::new(MockBackend::new());
        backend
            .delete_results
            .lock()
            .unwrap()
            .push_back(Err(MockBackend::unavailable()));
        let (client, _tx) = client(Arc::clone(&backend));

        let err = client.delete(b"k".to_vec(), false).await.unwrap_err();
        assert_eq!(err.kv_kind(), Some(KvErrorKind::Unavailable));
        assert_eq!(backend.call_count("delete"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_txn_conflict_not_retried() {
        let backend = Arc::new(MockBackend::new());
        backend
            .txn_results
            .lock()
            .unwrap()
            .push_back(Err(KvCallError::new(KvErrorKind::TxnConflict, "conflict")));
        let (client, _tx) = client(Arc::clone(&backend));

        let err = client.txn(TxnRequest::default()).await.unwrap_err();
        assert_eq!(err.kv_kind(), Some(KvErrorKind::TxnConflict));
        assert_eq!(backend.call_count("txn"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_lease_gone_is_success() {
        let backend = Arc::new(MockBackend::new());
        backend
            .revoke_results
            .lock()
            .unwrap()
            .push_back(Err(KvCallError::new(
                KvErrorKind::LeaseNotFound,
                "lease expired",
            )));
        let (client, _tx) = client(Arc::clone(&backend));

        client.revoke(7).await.unwrap();
        assert_eq!(backend.call_count("revoke"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_forwards_events() {
        let backend = Arc::new(MockBackend::new());
        let (feed_tx, feed_rx) = mpsc::channel(4);
        backend.watch_feeds.lock().unwrap().push_back(feed_rx);
        let (client, _tx) = client(Arc::clone(&backend));

        let mut rx = client.watch(b"/owner".to_vec(), "owner", WatchOptions::default());
        feed_tx.send(events_response(5)).await.unwrap();
        feed_tx.send(events_response(6)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().header.revision, 5);
        assert_eq!(rx.recv().await.unwrap().header.revision, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reopens_at_last_revision_preserving_options() {
        let backend = Arc::new(MockBackend::new());
        let (feed_tx, feed_rx) = mpsc::channel(4);
        let (_feed2_tx, feed2_rx) = mpsc::channel(4);
        {
            let mut feeds = backend.watch_feeds.lock().unwrap();
            feeds.push_back(feed_rx);
            feeds.push_back(feed2_rx);
        }
        let (client, _tx) = client(Arc::clone(&backend));

        let opts = WatchOptions {
            start_revision: Some(3),
            prefix: true,
        };
        let mut rx = client.watch(b"/tables/".to_vec(), "agent", opts);

        // deliver one event, then go silent past the watch timeout
        feed_tx.send(events_response(9)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().header.revision, 9);

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let opts_seen = backend.watch_opts.lock().unwrap().clone();
        assert!(opts_seen.len() >= 2, "expected a reopen, got {opts_seen:?}");
        // never less than the highest delivered revision
        assert_eq!(opts_seen[1].start_revision, Some(9));
        // the original option set is preserved on reopen
        assert!(opts_seen[1].prefix);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_progress_notify_does_not_advance_revision() {
        let backend = Arc::new(MockBackend::new());
        let (feed_tx, feed_rx) = mpsc::channel(4);
        let (_feed2_tx, feed2_rx) = mpsc::channel(4);
        {
            let mut feeds = backend.watch_feeds.lock().unwrap();
            feeds.push_back(feed_rx);
            feeds.push_back(feed2_rx);
        }
        let (client, _tx) = client(Arc::clone(&backend));

        let mut rx = client.watch(b"/k".to_vec(), "test", WatchOptions::default());

        feed_tx.send(events_response(4)).await.unwrap();
        // a progress notification with a higher revision must not move the
        // reopen point
        feed_tx
            .send(WatchResponse {
                header: ResponseHeader { revision: 100 },
                events: vec![],
                is_progress_notify: true,
                error: None,
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().header.revision, 4);
        assert!(rx.recv().await.unwrap().is_progress_notify);

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let opts_seen = backend.watch_opts.lock().unwrap().clone();
        assert!(opts_seen.len() >= 2);
        assert_eq!(opts_seen[1].start_revision, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_closes_on_shutdown() {
        let backend = Arc::new(MockBackend::new());
        let (_feed_tx, feed_rx) = mpsc::channel::<WatchResponse>(4);
        backend.watch_feeds.lock().unwrap().push_back(feed_rx);
        let (client, tx) = client(Arc::clone(&backend));

        let mut rx = client.watch(b"/k".to_vec(), "test", WatchOptions::default());
        tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
