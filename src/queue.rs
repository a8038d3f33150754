//! Message queues
//!
//! The bridge has two directions, each with exactly one producer role and one
//! consumer role. Both are unbounded FIFO channels that live as long as the
//! process.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::topic::Topic;

/// A message travelling between the chat side and the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<Topic>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Producer half of a queue
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueSender {
    /// Enqueue a message. Returns `false` once the consumer is gone.
    pub fn push(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Consumer half of a queue
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl QueueReceiver {
    /// Wait for the next message. `None` once every producer is dropped.
    pub async fn pop(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued
    pub fn try_pop(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Create an unbounded FIFO queue
pub fn unbounded() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}
