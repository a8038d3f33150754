//! Chat Platform Adapter
//!
//! Twitch chat spoken as IRC over WebSocket. [`ChatClient`] owns the session
//! and hands every room message to a single [`RoomListener`]; anything that
//! wants to talk back into a room holds a [`ChatSender`].

mod client;
pub mod irc;

#[cfg(test)]
mod tests;

pub use client::ChatClient;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::normalize_room;
use irc::IrcMessage;

/// A message typed into a chat room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    /// Milliseconds since the Unix epoch, as stamped by the server
    pub timestamp: u64,
    /// Display name of the author
    pub author: String,
    pub author_is_moderator: bool,
    /// Room name without the leading `#`
    pub room: String,
    pub text: String,
}

impl RoomMessage {
    /// Build a room message from a `PRIVMSG` line
    pub fn from_privmsg(msg: &IrcMessage) -> Option<Self> {
        if msg.command != "PRIVMSG" || msg.params.len() < 2 {
            return None;
        }

        let room = normalize_room(&msg.params[0]);
        let text = strip_action(&msg.params[1]).to_string();

        let author = match msg.tag("display-name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => msg.nick()?.to_string(),
        };

        let is_broadcaster = msg
            .tag("badges")
            .map(|badges| {
                badges
                    .split(',')
                    .any(|badge| badge.split('/').next() == Some("broadcaster"))
            })
            .unwrap_or(false);
        let author_is_moderator = msg.tag("mod") == Some("1") || is_broadcaster;

        let timestamp = msg
            .tag("tmi-sent-ts")
            .and_then(|ts| ts.parse().ok())
            .unwrap_or_else(now_millis);

        Some(Self {
            timestamp,
            author,
            author_is_moderator,
            room,
            text,
        })
    }
}

/// `/me` messages arrive wrapped in a CTCP ACTION
fn strip_action(text: &str) -> &str {
    text.strip_prefix("\u{1}ACTION ")
        .and_then(|t| t.strip_suffix('\u{1}'))
        .unwrap_or(text)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Receives every room message, before any command parsing
#[async_trait]
pub trait RoomListener: Send + Sync {
    async fn on_room_message(&self, message: RoomMessage);
}

/// A line of text bound for a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub room: String,
    pub text: String,
}

/// Fire-and-forget handle for writing into rooms
#[derive(Debug, Clone)]
pub struct ChatSender {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChatSender {
    /// A sender plus the receiving end a [`ChatClient`] drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `text` for `room`. Failures are logged, never returned.
    pub fn send_to_room(&self, room: &str, text: impl Into<String>) {
        let message = OutgoingMessage {
            room: normalize_room(room),
            text: text.into(),
        };
        if self.tx.send(message).is_err() {
            debug!("Chat: session gone, dropping message for #{}", room);
        }
    }
}

/// Error type for the chat session
#[derive(Debug)]
pub enum ChatError {
    /// The server refused our credentials; reconnecting will not help
    LoginFailed(String),
    /// WebSocket transport error
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// The session ended unexpectedly
    ConnectionLost(String),
    /// Connecting took too long
    Timeout,
}

impl ChatError {
    /// Whether the session loop should give up instead of reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::LoginFailed(_))
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::LoginFailed(msg) => write!(f, "Login failed: {}", msg),
            ChatError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ChatError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ChatError::Timeout => write!(f, "Connection timed out"),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatError::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::WebSocket(e)
    }
}
