//! Configuration Module
//!
//! TOML configuration for chatmq with support for:
//! - Broker connection settings
//! - Chat session settings (token, nick, rooms, command prefix)
//! - Topic prefix, startup subscriptions and topic → room routes
//! - Environment variable overrides (CHATMQ__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::BrokerConfig;
pub use chat::{normalize_room, ChatConfig, DEFAULT_CHAT_URL};
pub use secret::Secret;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::topic::Topic;

mod broker;
mod chat;
mod secret;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Chat session
    pub chat: ChatConfig,
    /// Topic prefix and subscriptions
    pub bridge: BridgeConfig,
    /// Topic → room forwarding routes
    #[serde(rename = "route")]
    pub routes: Vec<RouteConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Bridge-wide topic settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix placed in front of every topic the bridge publishes or subscribes
    pub topic_prefix: String,
    /// Extra topics subscribed at startup without a handler
    pub subscriptions: Vec<String>,
}

impl BridgeConfig {
    /// The topic prefix, if one is configured
    pub fn prefix(&self) -> Option<Topic> {
        let prefix = Topic::parse(&self.topic_prefix);
        if prefix.is_empty() {
            None
        } else {
            Some(prefix)
        }
    }
}

/// Forward everything published on `topic` into chat `room`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Topic, relative to the topic prefix
    pub topic: String,
    /// Room the payload is written to
    pub room: String,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `CHATMQ__` prefix with double underscores for nesting:
    ///    - `CHATMQ__BROKER__HOST=mqtt.local` overrides `broker.host`
    ///    - `CHATMQ__CHAT__TOKEN=abc123` overrides `chat.token`
    ///    - `CHATMQ__CHAT__ROOMS=one,two` overrides `chat.rooms`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", 1883)?
            .set_default("broker.keepalive", 60)?
            .set_default("broker.clean_session", true)?
            .set_default("broker.connect_timeout", "10s")?
            .set_default("broker.reconnect_interval", "1s")?
            .set_default("broker.max_reconnect_interval", "60s")?
            .set_default("broker.qos", 0)?
            .set_default("broker.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("chat.url", DEFAULT_CHAT_URL)?
            .set_default("chat.prefix", "!")?
            .set_default("chat.mods_only", true)?
            .set_default("chat.connect_timeout", "10s")?
            .set_default("chat.reconnect_interval", "1s")?
            .set_default("chat.max_reconnect_interval", "60s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("CHATMQ")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("chat.rooms")
                    .with_list_parse_key("bridge.subscriptions")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Point the broker connection somewhere else (`host` or `host:port`)
    pub fn override_broker(&mut self, address: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Validation(format!("invalid broker address '{}'", address));

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (address, None),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        self.broker.host = host.to_string();
        if let Some(port) = port {
            self.broker.port = port;
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.chat.normalize();
        for route in &mut self.routes {
            route.room = normalize_room(&route.room);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.host must not be empty".to_string(),
            ));
        }

        if self.broker.qos > 1 {
            return Err(ConfigError::Validation(
                "broker.qos must be 0 or 1".to_string(),
            ));
        }

        if self.broker.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "broker.max_packet_size must be greater than zero".to_string(),
            ));
        }

        for (name, interval, max) in [
            (
                "broker",
                self.broker.reconnect_interval,
                self.broker.max_reconnect_interval,
            ),
            (
                "chat",
                self.chat.reconnect_interval,
                self.chat.max_reconnect_interval,
            ),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{}.reconnect_interval must be greater than zero",
                    name
                )));
            }
            if max < interval {
                return Err(ConfigError::Validation(format!(
                    "{}.max_reconnect_interval must not be below reconnect_interval",
                    name
                )));
            }
        }

        if self.chat.nick.is_empty() {
            return Err(ConfigError::Validation(
                "chat.nick must not be empty".to_string(),
            ));
        }

        if self.chat.token.is_empty() {
            return Err(ConfigError::Validation(
                "chat.token must not be empty".to_string(),
            ));
        }

        if self.chat.prefix.chars().count() != 1 {
            return Err(ConfigError::Validation(format!(
                "chat.prefix must be exactly one character, got '{}'",
                self.chat.prefix
            )));
        }

        if self.chat.rooms.is_empty() {
            return Err(ConfigError::Validation(
                "chat.rooms must name at least one room".to_string(),
            ));
        }

        let prefix = self.bridge.prefix();
        for raw in &self.bridge.subscriptions {
            let topic = Topic::parse(raw).with_prefix(prefix.as_ref());
            crate::topic::validate_topic_filter(topic.as_str()).map_err(|e| {
                ConfigError::Validation(format!("subscription '{}': {}", raw, e))
            })?;
        }

        for route in &self.routes {
            let topic = Topic::parse(&route.topic).with_prefix(prefix.as_ref());
            topic.validate_name().map_err(|e| {
                ConfigError::Validation(format!("route topic '{}': {}", route.topic, e))
            })?;

            if !self.chat.joins(&route.room) {
                return Err(ConfigError::Validation(format!(
                    "route '{}' targets room '{}' which is not in chat.rooms",
                    route.topic, route.room
                )));
            }
        }

        Ok(())
    }
}
