//! chatmq - Bridge between Twitch chat rooms and an MQTT broker
//!
//! Chat commands are relayed onto broker topics, and messages arriving on
//! subscribed topics are dispatched to handlers that may write back into
//! chat. The two transports are decoupled by a pair of FIFO queues.

pub mod bridge;
pub mod broker;
pub mod chat;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod queue;
pub mod shutdown;
pub mod topic;

pub use bridge::{Bridge, BridgeBuilder, BridgeError};
pub use broker::{BrokerConnection, ConnectionError, ConnectionStatus};
pub use chat::{ChatSender, RoomListener, RoomMessage};
pub use command::{CommandContext, CommandError, CommandHandler, Invocation};
pub use config::Config;
pub use dispatch::{HandlerError, TopicHandler};
pub use protocol::QoS;
pub use queue::Message;
pub use topic::Topic;
