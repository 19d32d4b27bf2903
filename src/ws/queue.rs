//! Bounded inbound queue with a drop-newest overflow policy.
//!
//! [`InboundQueue`] wraps a [`tokio::sync::mpsc`] channel. The read loop
//! publishes with [`InboundQueue::publish`], which never waits: when the
//! buffer is full the item being published is discarded and counted, so a
//! slow consumer can never stall the protocol engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Producer half of a bounded, single-consumer inbound queue.
#[derive(Debug)]
pub struct InboundQueue<T> {
    sender: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

// Manual impl: `T` itself need not be `Clone`.
impl<T> Clone for InboundQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Creates a queue holding at most `capacity` items (minimum 1).
#[must_use]
pub fn channel<T>(capacity: usize) -> (InboundQueue<T>, mpsc::Receiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let queue = InboundQueue {
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (queue, receiver)
}

impl<T> InboundQueue<T> {
    /// Publishes `item` without waiting.
    ///
    /// Returns `false` if the item was dropped, either because the buffer is
    /// full or because the consumer is gone.
    pub fn publish(&self, item: T) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "inbound queue full, dropping newest item");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Returns how many items were discarded because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns `true` once the consumer has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
