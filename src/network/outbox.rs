//! Bounded drop-oldest send queue between a connection and its outbound pump.

use std::collections::VecDeque;

use parking_lot::Mutex;
use web_time::Instant;

use crate::network::messages::Message;

/// A message waiting for the pump, with the time it was queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// When the connection handed the message over.
    pub queued_at: Instant,
    /// The unstamped message.
    pub message: Message,
}

/// Bounded FIFO of outgoing messages.
///
/// When full, pushing evicts the oldest entry: under back-pressure the
/// connection would rather lose a stale keep-alive than its newest input run.
#[derive(Debug)]
pub struct Outbox {
    entries: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    #[cfg(feature = "tokio")]
    notify: tokio::sync::Notify,
}

impl Outbox {
    /// Creates an outbox holding at most `capacity` messages (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            #[cfg(feature = "tokio")]
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Queues a message, returning the evicted entry if the queue was full.
    pub fn push(&self, message: Message, now: Instant) -> Option<QueueEntry> {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(QueueEntry {
                queued_at: now,
                message,
            });
            evicted
        };
        if let Some(entry) = &evicted {
            tracing::trace!(
                message_type = ?entry.message.message_type(),
                "outbox full, dropped oldest message"
            );
        }
        #[cfg(feature = "tokio")]
        self.notify.notify_one();
        evicted
    }

    /// Takes the oldest entry.
    pub fn pop(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of queued messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for and takes the oldest entry.
    #[cfg(feature = "tokio")]
    pub async fn recv(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.pop() {
                return entry;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{InputAck, MessageBody};
    use crate::Frame;

    fn ack(frame: i32) -> Message {
        Message::unstamped(MessageBody::InputAck(InputAck {
            ack_frame: Frame::new(frame),
        }))
    }

    #[test]
    fn fifo_order() {
        let outbox = Outbox::new(4);
        let now = Instant::now();
        outbox.push(ack(1), now);
        outbox.push(ack(2), now);
        assert_eq!(outbox.pop().unwrap().message, ack(1));
        assert_eq!(outbox.pop().unwrap().message, ack(2));
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let outbox = Outbox::new(2);
        let now = Instant::now();
        assert!(outbox.push(ack(1), now).is_none());
        assert!(outbox.push(ack(2), now).is_none());
        let evicted = outbox.push(ack(3), now).unwrap();
        assert_eq!(evicted.message, ack(1));
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pop().unwrap().message, ack(2));
        assert_eq!(outbox.pop().unwrap().message, ack(3));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let outbox = Outbox::new(0);
        assert_eq!(outbox.capacity(), 1);
        outbox.push(ack(1), Instant::now());
        outbox.push(ack(2), Instant::now());
        assert_eq!(outbox.len(), 1);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn recv_waits_for_push() {
        let outbox = std::sync::Arc::new(Outbox::new(4));
        let reader = outbox.clone();
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        outbox.push(ack(7), Instant::now());
        assert_eq!(handle.await.unwrap().message, ack(7));
    }
}
