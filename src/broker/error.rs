//! Broker connection errors

use std::fmt;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError};

/// Error type for broker connection operations
///
/// None of these are fatal: the pump logs them and reconnects.
#[derive(Debug)]
pub enum ConnectionError {
    /// TCP connect or CONNACK did not arrive in time
    Timeout,
    /// The session dropped
    ConnectionLost(String),
    /// The broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// No session is established right now
    NotConnected,
    /// Socket error
    Io(std::io::Error),
    /// The broker sent something this client cannot handle
    Protocol(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Timeout => write!(f, "Operation timed out"),
            ConnectionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ConnectionError::Rejected(code) => write!(f, "Rejected by broker: {}", code),
            ConnectionError::NotConnected => write!(f, "Not connected"),
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(format!("Decode error: {}", e))
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(format!("Encode error: {}", e))
    }
}
