// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async pipeline node: non-blocking stash-and-forward between stages.
//!
//! An [`ActorNode`] sits between a parent stage that produces messages and a
//! processor that consumes them. Neither side may block: the parent hands
//! out a message only when one is ready, and the processor signals
//! backpressure by declining a message. A declined message is stashed (one
//! slot) and retried on the next run, so nothing is dropped and nothing
//! waits on a channel.

use crate::error::Result;
use crate::model::{RowChangedEvent, Ts};

/// A message travelling between pipeline stages.
#[derive(Debug, Clone)]
pub enum PipelineMessage {
    /// A row-level change event.
    Row(Box<RowChangedEvent>),
    /// All events at or below this timestamp have been emitted upstream.
    ResolvedTs(Ts),
    /// A barrier the stage must not reorder across.
    BarrierTs(Ts),
}

/// A stage that can hand out its next message without blocking.
pub trait MessageHolder {
    /// Return the next message if one is ready, `None` otherwise.
    fn try_get_message(&mut self) -> Option<PipelineMessage>;
}

/// A stage that can accept messages without blocking.
pub trait MessageProcessor {
    /// Try to consume a message. `Ok(true)` consumes it; `Ok(false)` signals
    /// backpressure and the message is retried later; errors stop the node.
    fn try_handle_message(&mut self, msg: &PipelineMessage) -> Result<bool>;
}

/// Adapter turning a closure into a [`MessageHolder`].
pub struct HolderFn<F>(pub F);

impl<F: FnMut() -> Option<PipelineMessage>> MessageHolder for HolderFn<F> {
    fn try_get_message(&mut self) -> Option<PipelineMessage> {
        (self.0)()
    }
}

/// Adapter turning a closure into a [`MessageProcessor`].
pub struct ProcessorFn<F>(pub F);

impl<F: FnMut(&PipelineMessage) -> Result<bool>> MessageProcessor for ProcessorFn<F> {
    fn try_handle_message(&mut self, msg: &PipelineMessage) -> Result<bool> {
        (self.0)(msg)
    }
}

/// Non-blocking forwarding node with a single-slot stash.
pub struct ActorNode<H, P> {
    stash: Option<PipelineMessage>,
    parent: H,
    processor: P,
}

impl<H: MessageHolder, P: MessageProcessor> ActorNode<H, P> {
    pub fn new(parent: H, processor: P) -> Self {
        Self {
            stash: None,
            parent,
            processor,
        }
    }

    /// Forward messages until the parent runs dry or the processor pushes
    /// back. At most one message is ever stashed.
    pub fn try_run(&mut self) -> Result<()> {
        loop {
            if self.stash.is_none() {
                self.stash = self.parent.try_get_message();
            }
            let Some(msg) = self.stash.as_ref() else {
                return Ok(());
            };
            if self.processor.try_handle_message(msg)? {
                self.stash = None;
            } else {
                // backpressure: keep the message for the next run
                return Ok(());
            }
        }
    }

    /// Whether a message is parked waiting for the processor.
    pub fn has_stashed(&self) -> bool {
        self.stash.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::collections::VecDeque;

    struct QueueHolder(VecDeque<PipelineMessage>);

    impl MessageHolder for QueueHolder {
        fn try_get_message(&mut self) -> Option<PipelineMessage> {
            self.0.pop_front()
        }
    }

    struct CountingProcessor {
        handled: Vec<Ts>,
        accept: bool,
        fail: bool,
    }

    impl MessageProcessor for CountingProcessor {
        fn try_handle_message(&mut self, msg: &PipelineMessage) -> Result<bool> {
            if self.fail {
                return Err(EngineError::Pipeline("processor failed".into()));
            }
            if !self.accept {
                return Ok(false);
            }
            if let PipelineMessage::ResolvedTs(ts) = msg {
                self.handled.push(*ts);
            }
            Ok(true)
        }
    }

    fn resolved(ts: Ts) -> PipelineMessage {
        PipelineMessage::ResolvedTs(ts)
    }

    #[test]
    fn test_forwards_until_dry() {
        let holder = QueueHolder(VecDeque::from(vec![resolved(1), resolved(2), resolved(3)]));
        let mut node = ActorNode::new(
            holder,
            CountingProcessor {
                handled: Vec::new(),
                accept: true,
                fail: false,
            },
        );
        node.try_run().unwrap();
        assert_eq!(node.processor.handled, vec![1, 2, 3]);
        assert!(!node.has_stashed());
    }

    #[test]
    fn test_backpressure_stashes_one_message() {
        let holder = QueueHolder(VecDeque::from(vec![resolved(1), resolved(2)]));
        let mut node = ActorNode::new(
            holder,
            CountingProcessor {
                handled: Vec::new(),
                accept: false,
                fail: false,
            },
        );
        node.try_run().unwrap();
        assert!(node.has_stashed());
        assert!(node.processor.handled.is_empty());
        // second message stays with the parent
        assert_eq!(node.parent.0.len(), 1);

        // once the processor recovers, both messages flow in order
        node.processor.accept = true;
        node.try_run().unwrap();
        assert_eq!(node.processor.handled, vec![1, 2]);
        assert!(!node.has_stashed());
    }

    #[test]
    fn test_processor_error_propagates_and_keeps_stash() {
        let holder = QueueHolder(VecDeque::from(vec![resolved(9)]));
        let mut node = ActorNode::new(
            holder,
            CountingProcessor {
                handled: Vec::new(),
                accept: true,
                fail: true,
            },
        );
        let err = node.try_run().unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(_)));
        assert!(node.has_stashed());
    }

    #[test]
    fn test_empty_parent_is_a_noop() {
        let holder = QueueHolder(VecDeque::new());
        let mut node = ActorNode::new(
            holder,
            CountingProcessor {
                handled: Vec::new(),
                accept: true,
                fail: false,
            },
        );
        node.try_run().unwrap();
        assert!(node.processor.handled.is_empty());
    }

    #[test]
    fn test_closure_adapters() {
        let mut sent = false;
        let holder = HolderFn(move || {
            if sent {
                None
            } else {
                sent = true;
                Some(resolved(42))
            }
        });
        let mut handled = Vec::new();
        {
            let processor = ProcessorFn(|msg: &PipelineMessage| {
                if let PipelineMessage::ResolvedTs(ts) = msg {
                    handled.push(*ts);
                }
                Ok(true)
            });
            let mut node = ActorNode::new(holder, processor);
            node.try_run().unwrap();
        }
        assert_eq!(handled, vec![42]);
    }
}
