//! Core type definitions for the sync protocol.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one entry in the query set.
///
/// Allocated per client, starting at 0; the server addresses transition
/// modifications by this id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(u32);

impl QueryId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw integer value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for one-shot mutation/action requests.
///
/// Drawn from a process-wide counter, so an id is never reused within the
/// process lifetime, including across reconnects and across client instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

impl RequestId {
    /// Allocate the next process-unique request id.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw integer value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of one-shot request a pending entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Mutation,
    Action,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutation => write!(f, "mutation"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Outcome of one server-side function evaluation.
///
/// Subscriptions receive every result through their update channel; one-shot
/// operations convert the error variants into
/// [`ClientError::Application`](crate::ClientError::Application).
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionResult {
    /// The function returned a value.
    Value(Value),
    /// The function failed with a plain error message.
    ErrorMessage(String),
    /// The function failed with a structured application error payload.
    ErrorPayload { message: String, data: Value },
}

impl FunctionResult {
    /// Get the value if this is a success result.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Check whether this result is an error.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Value(_))
    }

    /// Convert into a plain result, mapping error variants onto
    /// [`ClientError::Application`](crate::ClientError::Application).
    pub fn into_result(self) -> crate::error::ClientResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::ErrorMessage(message) => Err(crate::error::ClientError::Application {
                message,
                data: None,
            }),
            Self::ErrorPayload { message, data } => Err(crate::error::ClientError::Application {
                message,
                data: Some(data),
            }),
        }
    }
}

/// Public view of the connection, observed through a watch channel.
///
/// Exactly one Connecting -> Connected transition happens per successful
/// handshake, and one Connected -> Connecting per socket loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The socket is closed; the client is dialing or backing off.
    Connecting,
    /// The socket is open and the handshake has completed.
    Connected,
}
