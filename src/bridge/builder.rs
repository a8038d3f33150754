//! Explicit wiring of commands, topic handlers and subscriptions

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Bridge, BridgeError};
use crate::broker::{BrokerConnection, BrokerPump, OutboundDrain};
use crate::chat::{ChatClient, ChatSender, OutgoingMessage};
use crate::command::{CommandContext, CommandDispatcher, CommandHandler, CommandRegistry};
use crate::config::Config;
use crate::dispatch::{RoomForward, TopicDispatcher, TopicHandler, TopicRegistry};
use crate::topic::Topic;

/// Collects registrations before the loops start.
///
/// Created with the built-in commands, every configured route registered as
/// a [`RoomForward`] and every configured subscription added.
pub struct BridgeBuilder {
    config: Config,
    prefix: Option<Topic>,
    commands: CommandRegistry,
    topics: TopicRegistry,
    chat: ChatSender,
    outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    broker: BrokerConnection,
    pump: BrokerPump,
    drain: OutboundDrain,
}

impl BridgeBuilder {
    pub(super) fn new(config: Config) -> Result<Self, BridgeError> {
        config.validate()?;

        let prefix = config.bridge.prefix();
        let (chat, outgoing) = ChatSender::channel();
        let (broker, pump, drain) = BrokerConnection::new(config.broker.clone());

        let mut builder = Self {
            prefix,
            commands: CommandRegistry::with_builtins(),
            topics: TopicRegistry::new(),
            chat,
            outgoing,
            broker,
            pump,
            drain,
            config,
        };

        for route in builder.config.routes.clone() {
            let forward = RoomForward::new(route.room, builder.chat.clone());
            builder = builder.topic(route.topic.as_str(), Arc::new(forward));
        }
        for filter in builder.config.bridge.subscriptions.clone() {
            builder = builder.subscribe(filter.as_str());
        }

        Ok(builder)
    }

    /// Handle for writing into chat rooms, for handlers built outside
    pub fn chat(&self) -> ChatSender {
        self.chat.clone()
    }

    /// Handle to the broker connection, for handlers built outside
    pub fn broker(&self) -> BrokerConnection {
        self.broker.clone()
    }

    /// Register a chat command, replacing any command with the same name
    pub fn command(
        mut self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        moderator_only: bool,
    ) -> Self {
        self.commands.register(name, handler, moderator_only);
        self
    }

    /// Register a handler for `topic` (relative to the topic prefix) and
    /// subscribe to it.
    ///
    /// Handlers match exact topics only, so a wildcard filter is skipped.
    pub fn topic(mut self, topic: impl Into<Topic>, handler: Arc<dyn TopicHandler>) -> Self {
        let topic = topic.into().with_prefix(self.prefix.as_ref());
        if let Err(e) = topic.validate_name() {
            warn!("Bridge: not registering handler for '{}': {}", topic, e);
            return self;
        }
        debug!("Bridge: handler registered for {}", topic);
        self.topics.register(topic.clone(), handler);
        self.broker.subscribe(topic);
        self
    }

    /// Subscribe to `filter` (relative to the topic prefix) without a handler
    pub fn subscribe(self, filter: impl Into<Topic>) -> Self {
        let filter = filter.into().with_prefix(self.prefix.as_ref());
        self.broker.subscribe(filter);
        self
    }

    pub fn build(self) -> Bridge {
        let context = CommandContext::new(
            self.chat.clone(),
            self.broker.outbound(),
            self.prefix.clone(),
            self.config.chat.mods_only,
        );
        let dispatcher_commands = self.commands.len();
        let dispatcher = CommandDispatcher::new(
            self.config.chat.prefix_char(),
            Arc::new(self.commands),
            context,
        );
        info!(
            "Bridge: wired {} commands, {} topic handlers and {} subscriptions",
            dispatcher_commands,
            self.topics.len(),
            self.broker.subscriptions().len()
        );

        let chat_client = ChatClient::new(self.config.chat, self.outgoing, Arc::new(dispatcher));
        let topics = TopicDispatcher::new(Arc::new(self.topics));

        Bridge {
            chat: self.chat,
            chat_client,
            broker: self.broker,
            pump: self.pump,
            drain: self.drain,
            topics,
        }
    }
}
