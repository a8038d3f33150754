//! Chat Session Configuration

use std::time::Duration;

use serde::Deserialize;

use super::Secret;

/// Default Twitch IRC-over-WebSocket endpoint
pub const DEFAULT_CHAT_URL: &str = "ws://irc-ws.chat.twitch.tv:80";

/// Settings for the chat platform session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// WebSocket URL of the IRC gateway
    pub url: String,

    /// OAuth token, with or without the `oauth:` prefix
    pub token: Secret,

    /// Application client id
    pub client_id: Secret,

    /// Login nickname
    pub nick: String,

    /// Command prefix character
    pub prefix: String,

    /// Rooms joined at startup
    pub rooms: Vec<String>,

    /// Start in moderator-only mode
    pub mods_only: bool,

    /// Timeout for the WebSocket handshake (e.g. "10s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// First reconnect delay, doubled after every failed attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CHAT_URL.to_string(),
            token: Secret::default(),
            client_id: Secret::default(),
            nick: String::new(),
            prefix: "!".to_string(),
            rooms: Vec::new(),
            mods_only: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
        }
    }
}

impl ChatConfig {
    /// The command prefix as a single character
    pub fn prefix_char(&self) -> char {
        self.prefix.chars().next().unwrap_or('!')
    }

    /// Whether `room` is one of the rooms joined at startup
    pub fn joins(&self, room: &str) -> bool {
        let room = normalize_room(room);
        self.rooms.iter().any(|r| *r == room)
    }

    pub(super) fn normalize(&mut self) {
        let mut rooms: Vec<String> = Vec::with_capacity(self.rooms.len());
        for room in self.rooms.iter().map(|r| normalize_room(r)) {
            if !room.is_empty() && !rooms.contains(&room) {
                rooms.push(room);
            }
        }
        self.rooms = rooms;
        self.nick = self.nick.trim().to_lowercase();
    }
}

/// Canonical room name: lowercase, without the IRC `#`
pub fn normalize_room(room: &str) -> String {
    room.trim().trim_start_matches('#').to_lowercase()
}
