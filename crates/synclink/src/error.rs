//! Error handling for the sync protocol client.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Comprehensive error type for all client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket failed to open or dropped unexpectedly.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// An operation required an open socket and there was none.
    #[error("Not connected")]
    NotConnected,

    /// The server reported a fatal protocol error for this connection.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Authentication was rejected by the server.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// A one-shot operation's deadline elapsed with no matching response.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The server function itself returned an error result.
    #[error("Application error: {message}")]
    Application {
        message: String,
        /// Structured error payload, when the function attached one.
        data: Option<serde_json::Value>,
    },

    /// An inbound frame failed to parse. Logged and dropped by the engine.
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    /// Serialization/deserialization errors outside frame decoding.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Too many requests in flight.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// The client was disposed while the operation was pending.
    #[error("Client disposed")]
    Disposed,

    /// Internal errors (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClientError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an application error without a structured payload.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            data: None,
        }
    }

    /// Create a malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
