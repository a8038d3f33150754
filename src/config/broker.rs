//! Broker Connection Configuration

use std::time::Duration;

use serde::Deserialize;

use super::Secret;
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::protocol::QoS;

/// Settings for the MQTT broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or address
    pub host: String,

    /// Broker TCP port
    pub port: u16,

    /// Client identifier sent in CONNECT
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<Secret>,

    /// Keep-alive interval in seconds (0 disables PINGREQ)
    pub keepalive: u16,

    /// Ask the broker to discard any previous session
    pub clean_session: bool,

    /// Timeout for TCP connect and CONNACK (e.g. "10s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// First reconnect delay, doubled after every failed attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// QoS used for outbound publishes and subscriptions (0 or 1)
    pub qos: u8,

    /// Largest inbound packet accepted, in bytes. Bigger packets are skipped.
    pub max_packet_size: usize,
}

fn default_client_id() -> String {
    format!("chatmq-{}", std::process::id())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            qos: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl BrokerConfig {
    /// `host:port` for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configured QoS, clamped to what this client supports
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn keepalive_duration(&self) -> Option<Duration> {
        match self.keepalive {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }
}
