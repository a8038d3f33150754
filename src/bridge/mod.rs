//! Bridge Orchestrator
//!
//! Wires the chat adapter, the broker adapter and the two dispatchers
//! together, then runs the four perpetual loops side by side:
//!
//! - chat session event loop
//! - broker network pump
//! - outbound drain
//! - topic dispatch loop
//!
//! The first loop to end, or the external shutdown signal, stops the rest.
//! A broker outage is not a reason to stop: the pump keeps reconnecting
//! while chat stays live.
//!
//! # Example Configuration
//!
//! ```toml
//! [bridge]
//! topic_prefix = "b11y/dev"
//! subscriptions = ["status/#"]
//!
//! [[route]]
//! topic = "echo"
//! room = "jkiv"
//! ```

mod builder;


pub use builder::BridgeBuilder;

use std::fmt;
use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, BrokerPump, OutboundDrain};
use crate::chat::{ChatClient, ChatError, ChatSender};
use crate::config::{Config, ConfigError};
use crate::dispatch::TopicDispatcher;
use crate::shutdown::Shutdown;

/// Error that ends the bridge
#[derive(Debug)]
pub enum BridgeError {
    /// The configuration was rejected before anything started
    Config(ConfigError),
    /// The chat session failed in a way reconnecting cannot fix
    Chat(ChatError),
    /// A loop panicked
    Task(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "Configuration error: {}", e),
            BridgeError::Chat(e) => write!(f, "Chat error: {}", e),
            BridgeError::Task(msg) => write!(f, "Task failed: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Config(e) => Some(e),
            BridgeError::Chat(e) => Some(e),
            BridgeError::Task(_) => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

impl From<ChatError> for BridgeError {
    fn from(e: ChatError) -> Self {
        BridgeError::Chat(e)
    }
}

/// Which loop finished, and how
#[derive(Debug)]
enum Exit {
    Chat(Result<(), ChatError>),
    Pump,
    Drain,
    Dispatch,
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Chat(_) => write!(f, "chat session"),
            Exit::Pump => write!(f, "broker pump"),
            Exit::Drain => write!(f, "outbound drain"),
            Exit::Dispatch => write!(f, "topic dispatch"),
        }
    }
}

/// A fully wired bridge, ready to run
pub struct Bridge {
    chat: ChatSender,
    chat_client: ChatClient,
    broker: BrokerConnection,
    pump: BrokerPump,
    drain: OutboundDrain,
    topics: TopicDispatcher,
}

impl Bridge {
    /// Start wiring a bridge from a validated configuration
    pub fn builder(config: Config) -> Result<BridgeBuilder, BridgeError> {
        BridgeBuilder::new(config)
    }

    pub fn broker(&self) -> &BrokerConnection {
        &self.broker
    }

    pub fn chat(&self) -> &ChatSender {
        &self.chat
    }

    /// Run every loop until `signal` resolves or one of them ends.
    ///
    /// Returns the first unrecoverable error, if any.
    pub async fn run<F>(self, signal: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown = || Shutdown::new(shutdown_tx.subscribe());

        let mut tasks = JoinSet::new();
        {
            let shutdown = shutdown();
            let client = self.chat_client;
            tasks.spawn(async move { Exit::Chat(client.run(shutdown).await) });
        }
        {
            let shutdown = shutdown();
            let pump = self.pump;
            tasks.spawn(async move {
                pump.run(shutdown).await;
                Exit::Pump
            });
        }
        {
            let shutdown = shutdown();
            let drain = self.drain;
            tasks.spawn(async move {
                drain.run(shutdown).await;
                Exit::Drain
            });
        }
        {
            let shutdown = shutdown();
            let topics = self.topics;
            let broker = self.broker.clone();
            tasks.spawn(async move {
                topics.run(broker, shutdown).await;
                Exit::Dispatch
            });
        }
        info!("Bridge: running");

        let mut first_error = None;

        tokio::pin!(signal);
        tokio::select! {
            _ = &mut signal => info!("Bridge: shutdown requested"),
            Some(joined) = tasks.join_next() => {
                record_exit(joined, &mut first_error, true);
            }
        }

        let _ = shutdown_tx.send(());
        while let Some(joined) = tasks.join_next().await {
            record_exit(joined, &mut first_error, false);
        }
        info!("Bridge: stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log how a loop ended and keep the first fatal error
fn record_exit(
    joined: Result<Exit, tokio::task::JoinError>,
    first_error: &mut Option<BridgeError>,
    unexpected: bool,
) {
    let error = match joined {
        Ok(Exit::Chat(Err(e))) => {
            error!("Bridge: chat session ended: {}", e);
            Some(BridgeError::Chat(e))
        }
        Ok(exit) => {
            if unexpected {
                warn!("Bridge: {} stopped, shutting down", exit);
            } else {
                debug!("Bridge: {} stopped", exit);
            }
            None
        }
        Err(e) => {
            error!("Bridge: task failed: {}", e);
            Some(BridgeError::Task(e.to_string()))
        }
    };

    if first_error.is_none() {
        *first_error = error;
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("broker", &self.broker)
            .field("topics", &self.topics)
            .finish()
    }
}
