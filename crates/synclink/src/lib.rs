//! # synclink
//!
//! Client engine for a WebSocket-based real-time sync protocol: one socket
//! multiplexes one-shot function calls (queries, mutations, actions) and
//! long-lived reactive subscriptions, with its own handshake, query-set
//! versioning, and keepalive sub-protocols.
//!
//! # Architecture
//!
//! The engine uses an actor-based architecture:
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────┐
//! │ SyncClient  │────▶│ ConnectionActor │────▶│  Deployment  │
//! │  (Clone)    │     │   (Background)  │     │ /api/sync ws │
//! └─────────────┘     └───────┬─────────┘     └──────────────┘
//!                             │
//!          ┌──────────────────┴────────────────────┐
//!          ▼                                       ▼
//! ┌─────────────────────┐             ┌────────────────────────┐
//! │ PendingRequestStore │             │    QuerySetManager     │
//! │  (request_id → tx)  │             │ (query_id → entry, vN) │
//! └─────────────────────┘             └────────────────────────┘
//! ```
//!
//! The connection task owns the socket, the session identity, and every
//! protocol transition: it dials, sends the `Connect` handshake, re-installs
//! the cached auth token, retransmits the query set from version 0, and then
//! routes inbound frames — responses to pending requests, transitions to
//! subscriptions, server pings to immediate pongs. On any socket loss it
//! reconnects with exponential backoff, bounded by a configurable attempt
//! ceiling; a manual [`SyncClient::reconnect`] bypasses the backoff.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use synclink::{ClientConfig, SyncClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SyncClient::connect(ClientConfig::new("https://deployment.example.com"))?;
//!
//!     // Reactive subscription: updates arrive for as long as the handle lives,
//!     // across reconnects.
//!     let mut messages = client.subscribe("messages:list", json!({})).await?;
//!
//!     // One-shot calls.
//!     client.mutation("messages:send", json!({"body": "hi"})).await?;
//!     let me = client.query("users:me", json!({})).await?;
//!     println!("me: {me}");
//!
//!     while let Some(update) = messages.next().await {
//!         println!("messages: {update:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Structure
//!
//! - `config`: client configuration and endpoint derivation
//! - `types`: core ids, request kinds, function results, connection state
//! - `protocol`: wire envelopes and the text-frame codec
//! - `transport`: socket adapter over `tokio-tungstenite`
//! - `pending`: correlation table for one-shot requests
//! - `query_set`: the versioned subscription set
//! - `session`: session identity across reconnects
//! - `actor`: the background connection task
//! - `client`: the public [`SyncClient`] facade

mod actor;
mod client;
mod config;
mod error;
mod pending;
mod protocol;
mod query_set;
mod reconnect;
mod session;
mod transport;
mod types;

pub use client::{Subscription, SyncClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use protocol::{
    decode, encode, wrap_args, ClientMessage, QuerySetModification, ServerMessage,
    TransitionModification,
};
pub use types::{ConnectionState, FunctionResult, QueryId, RequestId, RequestKind};
