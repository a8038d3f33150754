//! Command Dispatcher
//!
//! Turns room messages into commands. Every message passes through
//! [`CommandDispatcher::dispatch`], which logs it, applies the moderator
//! gate, parses `<prefix><keyword> [remainder]` and runs the registered
//! [`CommandHandler`].

mod builtin;

#[cfg(test)]
mod tests;

pub use builtin::{Ping, Relay, ToggleMod};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::chat::{ChatSender, RoomListener, RoomMessage};
use crate::queue::QueueSender;
use crate::topic::Topic;

/// Why a command did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The prefix was not followed by a keyword
    MissingKeyword,
    /// No command is registered under the keyword
    UnknownCommand(String),
    /// The handler could not make sense of its arguments
    MalformedArguments(String),
    /// The author, who lacks the moderator capability
    PermissionDenied(String),
    /// The handler ran but failed
    Failed(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::MissingKeyword => write!(f, "Missing command keyword"),
            CommandError::UnknownCommand(name) => write!(f, "Unknown command: {}", name),
            CommandError::MalformedArguments(msg) => write!(f, "Malformed arguments: {}", msg),
            CommandError::PermissionDenied(author) => {
                write!(f, "Permission denied for {}", author)
            }
            CommandError::Failed(msg) => write!(f, "Command failed: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// What became of a room message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Not a command, just chat
    Ignored,
    /// Stopped by the moderator gate
    Dropped,
    /// Parsed but refused
    Rejected(CommandError),
    /// The handler ran to completion
    Handled,
}

/// One parsed command as seen by its handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub author: String,
    pub author_is_moderator: bool,
    pub room: String,
    /// Keyword as typed, lowercased
    pub command: String,
    /// Everything after the keyword, trimmed
    pub args: String,
}

/// Services available to every handler
#[derive(Debug, Clone)]
pub struct CommandContext {
    chat: ChatSender,
    outbound: QueueSender,
    topic_prefix: Option<Topic>,
    mods_only: Arc<AtomicBool>,
}

impl CommandContext {
    pub fn new(
        chat: ChatSender,
        outbound: QueueSender,
        topic_prefix: Option<Topic>,
        mods_only: bool,
    ) -> Self {
        Self {
            chat,
            outbound,
            topic_prefix,
            mods_only: Arc::new(AtomicBool::new(mods_only)),
        }
    }

    /// Write `text` into the room the invocation came from
    pub fn reply(&self, invocation: &Invocation, text: impl Into<String>) {
        self.chat.send_to_room(&invocation.room, text);
    }

    pub fn chat(&self) -> &ChatSender {
        &self.chat
    }

    /// Producer half of the outbound (chat → broker) queue
    pub fn outbound(&self) -> &QueueSender {
        &self.outbound
    }

    pub fn topic_prefix(&self) -> Option<&Topic> {
        self.topic_prefix.as_ref()
    }

    /// Whether only moderators may run commands
    pub fn mods_only(&self) -> bool {
        self.mods_only.load(Ordering::Relaxed)
    }

    pub fn set_mods_only(&self, enabled: bool) {
        self.mods_only.store(enabled, Ordering::Relaxed);
    }

    /// Flip moderator-only mode, returning the new value
    pub fn toggle_mods_only(&self) -> bool {
        !self.mods_only.fetch_xor(true, Ordering::Relaxed)
    }
}

/// A chat command implementation
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CommandContext, invocation: &Invocation)
        -> Result<(), CommandError>;
}

struct Registered {
    handler: Arc<dyn CommandHandler>,
    moderator_only: bool,
}

/// Keyword → handler table. Filled during wiring, read-only afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Registered>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `ping`, `relay` (also as `mqtt`) and `togglemod`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let relay: Arc<dyn CommandHandler> = Arc::new(Relay);
        registry.register("ping", Arc::new(Ping), false);
        registry.register("relay", relay.clone(), false);
        registry.register("mqtt", relay, false);
        registry.register("togglemod", Arc::new(ToggleMod), true);
        registry
    }

    /// Register `handler` under `name`, replacing any previous entry.
    /// Returns `true` if an entry was replaced.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        moderator_only: bool,
    ) -> bool {
        let name = name.trim().to_lowercase();
        let replaced = self
            .commands
            .insert(
                name.clone(),
                Registered {
                    handler,
                    moderator_only,
                },
            )
            .is_some();
        if replaced {
            debug!("Command: replaced handler for '{}'", name);
        }
        replaced
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_lowercase())
    }

    /// Whether `name` is registered as moderator only
    pub fn is_moderator_only(&self, name: &str) -> Option<bool> {
        self.commands
            .get(&name.to_lowercase())
            .map(|entry| entry.moderator_only)
    }

    /// Registered keywords, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn get(&self, name: &str) -> Option<&Registered> {
        self.commands.get(name)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// Split `<prefix><keyword> [remainder]`.
///
/// `Ok(None)` means the text is ordinary chat. The keyword is lowercased and
/// the remainder trimmed.
pub fn parse_command(text: &str, prefix: char) -> Result<Option<(String, String)>, CommandError> {
    let Some(body) = text.trim().strip_prefix(prefix) else {
        return Ok(None);
    };

    let (keyword, args) = match body.split_once(char::is_whitespace) {
        Some((keyword, args)) => (keyword, args.trim()),
        None => (body, ""),
    };
    if keyword.is_empty() {
        return Err(CommandError::MissingKeyword);
    }

    Ok(Some((keyword.to_lowercase(), args.to_string())))
}

/// Room listener that runs chat commands
pub struct CommandDispatcher {
    prefix: char,
    registry: Arc<CommandRegistry>,
    context: CommandContext,
}

impl CommandDispatcher {
    pub fn new(prefix: char, registry: Arc<CommandRegistry>, context: CommandContext) -> Self {
        Self {
            prefix,
            registry,
            context,
        }
    }

    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    /// Take one room message through gate, parse and dispatch
    pub async fn dispatch(&self, message: &RoomMessage) -> CommandOutcome {
        info!(
            "Chat: [{}] #{} <{}> {}",
            message.timestamp, message.room, message.author, message.text
        );

        let parsed = parse_command(&message.text, self.prefix);
        if matches!(parsed, Ok(None)) {
            return CommandOutcome::Ignored;
        }

        if self.context.mods_only() && !message.author_is_moderator {
            let error = CommandError::PermissionDenied(message.author.clone());
            debug!("Command: moderator-only mode: {}", error);
            return CommandOutcome::Dropped;
        }

        let (command, args) = match parsed {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return CommandOutcome::Ignored,
            Err(e) => return self.reject(message, e),
        };

        let Some(entry) = self.registry.get(&command) else {
            return self.reject(message, CommandError::UnknownCommand(command));
        };

        if entry.moderator_only && !message.author_is_moderator {
            let error = CommandError::PermissionDenied(message.author.clone());
            warn!("Command: '{}' is moderator only: {}", command, error);
            return CommandOutcome::Dropped;
        }

        let invocation = Invocation {
            author: message.author.clone(),
            author_is_moderator: message.author_is_moderator,
            room: message.room.clone(),
            command,
            args,
        };

        match entry.handler.handle(&self.context, &invocation).await {
            Ok(()) => {
                debug!("Command: {} handled for {}", invocation.command, invocation.author);
                CommandOutcome::Handled
            }
            Err(e) => self.reject(message, e),
        }
    }

    fn reject(&self, message: &RoomMessage, error: CommandError) -> CommandOutcome {
        warn!(
            "Command: rejected '{}' from {}: {}",
            message.text, message.author, error
        );
        CommandOutcome::Rejected(error)
    }
}

#[async_trait]
impl RoomListener for CommandDispatcher {
    async fn on_room_message(&self, message: RoomMessage) {
        self.dispatch(&message).await;
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .field("mods_only", &self.context.mods_only())
            .finish()
    }
}
