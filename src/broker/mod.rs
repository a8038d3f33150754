//! Broker Connection Adapter
//!
//! Owns the connection to the MQTT broker. [`BrokerConnection`] is the cheap,
//! cloneable handle the rest of the bridge talks to; [`BrokerPump`] and
//! [`OutboundDrain`] are the two perpetual loops behind it. Inbound and
//! outbound traffic flow through two independent FIFO queues.

mod error;
mod pump;
mod session;

#[cfg(test)]
mod tests;

pub use error::ConnectionError;
pub use pump::{BrokerPump, OutboundDrain};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::queue::{self, Message, QueueReceiver, QueueSender};
use crate::topic::{validate_topic_filter, Topic};

/// Status of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected and not trying (before start, after shutdown)
    Disconnected,
    /// TCP connect or CONNECT/CONNACK in progress
    Connecting,
    /// Session established
    Connected,
    /// Last attempt failed, waiting before the next one
    Backoff,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Backoff => write!(f, "backoff"),
        }
    }
}

/// Requests handed to the pump task
#[derive(Debug)]
enum BrokerCommand {
    /// Publish one message, reporting the outcome
    Publish {
        message: Message,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    /// Subscribe on the live session
    Subscribe(Topic),
    /// Unsubscribe on the live session
    Unsubscribe(Topic),
}

/// State shared between the handle and the pump
struct Shared {
    status: RwLock<ConnectionStatus>,
    subscriptions: RwLock<BTreeSet<Topic>>,
}

/// Handle to the broker connection
#[derive(Clone)]
pub struct BrokerConnection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<BrokerCommand>,
    outbound: QueueSender,
    inbound: Arc<Mutex<QueueReceiver>>,
}

impl BrokerConnection {
    /// Create the handle together with the two loops that serve it.
    ///
    /// Nothing touches the network until [`BrokerPump::run`] is polled.
    pub fn new(config: BrokerConfig) -> (Self, BrokerPump, OutboundDrain) {
        let shared = Arc::new(Shared {
            status: RwLock::new(ConnectionStatus::Disconnected),
            subscriptions: RwLock::new(BTreeSet::new()),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = queue::unbounded();
        let (outbound_tx, outbound_rx) = queue::unbounded();

        let connection = Self {
            shared: shared.clone(),
            commands: commands_tx,
            outbound: outbound_tx,
            inbound: Arc::new(Mutex::new(inbound_rx)),
        };
        let pump = BrokerPump::new(config, shared, commands_rx, inbound_tx);
        let drain = OutboundDrain::new(outbound_rx, connection.clone());

        (connection, pump, drain)
    }

    /// Current session status
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Snapshot of the subscription set, in topic order
    pub fn subscriptions(&self) -> Vec<Topic> {
        self.shared.subscriptions.read().iter().cloned().collect()
    }

    /// Add `topic` to the subscription set.
    ///
    /// Idempotent. Returns `true` if the topic was new. The SUBSCRIBE goes
    /// out on the live session, or with the whole set on the next connect.
    pub fn subscribe(&self, topic: Topic) -> bool {
        if let Err(e) = validate_topic_filter(topic.as_str()) {
            warn!("Broker: not subscribing to '{}': {}", topic, e);
            return false;
        }

        let connected = {
            let mut subscriptions = self.shared.subscriptions.write();
            if !subscriptions.insert(topic.clone()) {
                return false;
            }
            self.is_connected()
        };

        debug!("Broker: subscription added: {}", topic);
        if connected {
            let _ = self.commands.send(BrokerCommand::Subscribe(topic));
        }
        true
    }

    /// Remove `topic` from the subscription set. No-op when absent.
    pub fn unsubscribe(&self, topic: &Topic) -> bool {
        let connected = {
            let mut subscriptions = self.shared.subscriptions.write();
            if !subscriptions.remove(topic) {
                return false;
            }
            self.is_connected()
        };

        debug!("Broker: subscription removed: {}", topic);
        if connected {
            let _ = self.commands.send(BrokerCommand::Unsubscribe(topic.clone()));
        }
        true
    }

    /// Enqueue a message for publishing. Never waits on the network.
    pub fn send(&self, message: Message) {
        if !self.outbound.push(message) {
            warn!("Broker: outbound queue closed, message dropped");
        }
    }

    /// Producer half of the outbound queue, for components that only enqueue
    pub fn outbound(&self) -> QueueSender {
        self.outbound.clone()
    }

    /// Wait for the next inbound message, in arrival order.
    /// Returns `None` once the pump has stopped and the queue is empty.
    pub async fn receive(&self) -> Option<Message> {
        self.inbound.lock().await.pop().await
    }

    /// Publish immediately on the live session.
    ///
    /// Fails with [`ConnectionError::NotConnected`] while the pump is backing
    /// off or has stopped.
    pub async fn publish(&self, message: Message) -> Result<(), ConnectionError> {
        let (ack, result) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Publish { message, ack })
            .map_err(|_| ConnectionError::NotConnected)?;
        result.await.map_err(|_| ConnectionError::NotConnected)?
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("status", &self.status())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}
