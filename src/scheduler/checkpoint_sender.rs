// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paced checkpoint forwarding to the owner.
//!
//! Checkpoints are advisory: the owner only needs a recent one, not every
//! one. The sender throttles to the configured interval and never sends a
//! new checkpoint while an earlier one is still en route, since the owner
//! must observe them in order.

use super::ProcessorMessenger;
use crate::error::Result;
use crate::model::Ts;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tracks the en-route checkpoint and the send cadence.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointTsSender {
    send_checkpoint_interval: Duration,
    last_send_time: Option<Instant>,
    /// Highest checkpoint the owner is known to have received.
    last_sent_checkpoint_ts: Ts,
    /// Checkpoint handed to the messenger but not yet acknowledged.
    en_route_checkpoint_ts: Option<Ts>,
}

impl CheckpointTsSender {
    pub fn new(send_checkpoint_interval: Duration) -> Self {
        Self {
            send_checkpoint_interval,
            last_send_time: None,
            last_sent_checkpoint_ts: 0,
            en_route_checkpoint_ts: None,
        }
    }

    /// The last checkpoint known to have reached the owner.
    pub fn last_sent_checkpoint_ts(&self) -> Ts {
        self.last_sent_checkpoint_ts
    }

    /// Maybe send a checkpoint obtained from `provider`.
    ///
    /// The provider returns `None` when no meaningful checkpoint exists
    /// (e.g. no table is running), which skips the send entirely.
    pub async fn send_checkpoint<M: ProcessorMessenger + ?Sized>(
        &mut self,
        messenger: &M,
        provider: impl FnOnce() -> Option<(Ts, Ts)>,
    ) -> Result<()> {
        // Settle the en-route checkpoint before considering a new one.
        if let Some(en_route) = self.en_route_checkpoint_ts {
            if !messenger.barrier() {
                debug!("checkpoint still en route, not sending another");
                return Ok(());
            }
            self.last_sent_checkpoint_ts = en_route;
            self.en_route_checkpoint_ts = None;
        }

        if let Some(last) = self.last_send_time {
            if last.elapsed() < self.send_checkpoint_interval {
                return Ok(());
            }
        }

        let Some((checkpoint_ts, resolved_ts)) = provider() else {
            return Ok(());
        };
        if messenger.send_checkpoint(checkpoint_ts, resolved_ts).await? {
            self.en_route_checkpoint_ts = Some(checkpoint_ts);
            self.last_send_time = Some(Instant::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaptureId, TableId};
    use crate::scheduler::BoxSchedFuture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(Ts, Ts)>>,
        barrier_done: AtomicBool,
        accept: AtomicBool,
    }

    impl RecordingMessenger {
        fn new(barrier_done: bool, accept: bool) -> Self {
            let m = Self::default();
            m.barrier_done.store(barrier_done, Ordering::SeqCst);
            m.accept.store(accept, Ordering::SeqCst);
            m
        }
    }

    impl ProcessorMessenger for RecordingMessenger {
        fn finish_table_operation(&self, _table_id: TableId) -> BoxSchedFuture<'_, bool> {
            Box::pin(async { Ok(true) })
        }

        fn sync_task_statuses(
            &self,
            _running: Vec<TableId>,
            _adding: Vec<TableId>,
            _removing: Vec<TableId>,
        ) -> BoxSchedFuture<'_, bool> {
            Box::pin(async { Ok(true) })
        }

        fn send_checkpoint(&self, checkpoint_ts: Ts, resolved_ts: Ts) -> BoxSchedFuture<'_, bool> {
            self.sent.lock().unwrap().push((checkpoint_ts, resolved_ts));
            let accept = self.accept.load(Ordering::SeqCst);
            Box::pin(async move { Ok(accept) })
        }

        fn barrier(&self) -> bool {
            self.barrier_done.load(Ordering::SeqCst)
        }

        fn on_owner_changed(&self, _new_owner: CaptureId) {}

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_acknowledge() {
        let messenger = RecordingMessenger::new(true, true);
        let mut sender = CheckpointTsSender::new(Duration::from_secs(1));

        sender
            .send_checkpoint(&messenger, || Some((100, 120)))
            .await
            .unwrap();
        assert_eq!(messenger.sent.lock().unwrap().as_slice(), &[(100, 120)]);
        // not yet acknowledged
        assert_eq!(sender.last_sent_checkpoint_ts(), 0);

        // past the interval, the barrier confirms delivery and a new
        // checkpoint goes out
        tokio::time::sleep(Duration::from_secs(2)).await;
        sender
            .send_checkpoint(&messenger, || Some((200, 220)))
            .await
            .unwrap();
        assert_eq!(sender.last_sent_checkpoint_ts(), 100);
        assert_eq!(messenger.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_blocks_next_send() {
        let messenger = RecordingMessenger::new(false, true);
        let mut sender = CheckpointTsSender::new(Duration::from_millis(0));

        sender
            .send_checkpoint(&messenger, || Some((100, 120)))
            .await
            .unwrap();
        // previous checkpoint unacknowledged: no further sends
        sender
            .send_checkpoint(&messenger, || Some((200, 220)))
            .await
            .unwrap();
        assert_eq!(messenger.sent.lock().unwrap().len(), 1);
        assert_eq!(sender.last_sent_checkpoint_ts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_throttles() {
        let messenger = RecordingMessenger::new(true, true);
        let mut sender = CheckpointTsSender::new(Duration::from_secs(3600));

        sender
            .send_checkpoint(&messenger, || Some((100, 120)))
            .await
            .unwrap();
        sender
            .send_checkpoint(&messenger, || Some((200, 220)))
            .await
            .unwrap();
        // the second call was inside the interval
        assert_eq!(messenger.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_checkpoint_available_skips() {
        let messenger = RecordingMessenger::new(true, true);
        let mut sender = CheckpointTsSender::new(Duration::from_millis(0));
        sender
            .send_checkpoint(&messenger, || None)
            .await
            .unwrap();
        assert!(messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_retries_later() {
        let messenger = RecordingMessenger::new(true, false);
        let mut sender = CheckpointTsSender::new(Duration::from_millis(0));

        sender
            .send_checkpoint(&messenger, || Some((100, 120)))
            .await
            .unwrap();
        // messenger declined: nothing en route, retry allowed immediately
        messenger.accept.store(true, Ordering::SeqCst);
        sender
            .send_checkpoint(&messenger, || Some((100, 120)))
            .await
            .unwrap();
        assert_eq!(messenger.sent.lock().unwrap().len(), 2);
    }
}
