//! Topic Dispatcher
//!
//! Routes each inbound broker message to the handler registered for its
//! exact topic. Handlers run one at a time in arrival order; an error or a
//! panic inside one is logged and the loop moves on.


use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerConnection;
use crate::chat::ChatSender;
use crate::queue::Message;
use crate::shutdown::Shutdown;
use crate::topic::Topic;

/// Payload bytes shown in diagnostics
const PAYLOAD_PREVIEW: usize = 64;

/// Error reported by a topic handler
#[derive(Debug)]
pub enum HandlerError {
    /// The payload was not what the handler expected
    InvalidPayload(String),
    /// Anything else
    Failed(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            HandlerError::Failed(msg) => write!(f, "Handler failed: {}", msg),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Logic attached to one topic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, topic: &Topic, payload: Bytes) -> Result<(), HandlerError>;
}

/// Exact topic → handler table
#[derive(Default)]
pub struct TopicRegistry {
    handlers: HashMap<Topic, Arc<dyn TopicHandler>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Last writer wins.
    /// Returns `true` if a previous handler was replaced.
    pub fn register(&mut self, topic: Topic, handler: Arc<dyn TopicHandler>) -> bool {
        let replaced = self.handlers.insert(topic.clone(), handler).is_some();
        if replaced {
            debug!("Dispatch: replaced handler for {}", topic);
        }
        replaced
    }

    pub fn get(&self, topic: &Topic) -> Option<&Arc<dyn TopicHandler>> {
        self.handlers.get(topic)
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

/// What became of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler for the topic
    Unhandled,
    /// The handler returned an error or panicked
    Failed,
}

/// Printable head of a payload
pub fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PAYLOAD_PREVIEW);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > PAYLOAD_PREVIEW {
        text.push_str("...");
    }
    text
}

/// Runs inbound messages through the topic registry
#[derive(Debug, Clone)]
pub struct TopicDispatcher {
    registry: Arc<TopicRegistry>,
}

impl TopicDispatcher {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self { registry }
    }

    /// Hand one message to its handler and wait for it to finish
    pub async fn dispatch(&self, message: Message) -> DispatchOutcome {
        let Message { topic, payload } = message;
        debug!("Dispatch: {} <- {}", topic, preview(&payload));

        let Some(handler) = self.registry.get(&topic) else {
            let known: Vec<String> = self
                .registry
                .topics()
                .iter()
                .map(Topic::to_string)
                .collect();
            info!(
                "Dispatch: unhandled topic {} (known topics: [{}])",
                topic,
                known.join(", ")
            );
            return DispatchOutcome::Unhandled;
        };

        let shown = preview(&payload);
        let result = AssertUnwindSafe(handler.handle(&topic, payload))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                warn!("Dispatch: handler for {} failed ({}): {}", topic, shown, e);
                DispatchOutcome::Failed
            }
            Err(_) => {
                error!("Dispatch: handler for {} panicked ({})", topic, shown);
                DispatchOutcome::Failed
            }
        }
    }

    /// Pull from the inbound queue until shutdown or until the queue closes
    pub async fn run(self, connection: BrokerConnection, mut shutdown: Shutdown) {
        loop {
            let message = tokio::select! {
                _ = shutdown.recv() => break,
                message = connection.receive() => message,
            };

            match message {
                Some(message) => {
                    self.dispatch(message).await;
                }
                None => {
                    debug!("Dispatch: inbound queue closed");
                    break;
                }
            }
        }
        debug!("Dispatch: stopped");
    }
}

/// Forwards a topic's payloads into a chat room
#[derive(Debug, Clone)]
pub struct RoomForward {
    room: String,
    chat: ChatSender,
}

impl RoomForward {
    pub fn new(room: impl Into<String>, chat: ChatSender) -> Self {
        Self {
            room: room.into(),
            chat,
        }
    }

    /// Text written to the room for one message
    pub fn format(topic: &Topic, payload: &[u8]) -> String {
        format!("<mqtt> {}: {}", topic, String::from_utf8_lossy(payload))
    }
}

#[async_trait]
impl TopicHandler for RoomForward {
    async fn handle(&self, topic: &Topic, payload: Bytes) -> Result<(), HandlerError> {
        self.chat
            .send_to_room(&self.room, Self::format(topic, &payload));
        Ok(())
    }
}
