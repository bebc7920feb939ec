//! Correlation table for outstanding one-shot requests.
//!
//! Tracks mutation/action calls awaiting their response, with capacity
//! management and stale-entry cleanup. At most one entry exists per request
//! id; resolving an id that is not present is a no-op, which makes duplicate
//! or late server responses harmless.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    config::ClientConfig,
    error::{ClientError, ClientResult},
    types::{FunctionResult, RequestId, RequestKind},
};

/// A pending request awaiting a response.
struct PendingRequest {
    kind: RequestKind,
    response_tx: oneshot::Sender<ClientResult<FunctionResult>>,
    created_at: Instant,
    timeout: Duration,
}

/// Store for pending one-shot requests.
pub(crate) struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    config: Arc<ClientConfig>,
}

impl PendingRequestStore {
    pub(crate) fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            requests: scc::HashMap::new(),
            config,
        }
    }

    /// Register a new pending request with its completion slot.
    ///
    /// Fails if capacity is exhausted or the id is somehow already live.
    pub(crate) fn register(
        &self,
        id: RequestId,
        kind: RequestKind,
        response_tx: oneshot::Sender<ClientResult<FunctionResult>>,
        timeout: Option<Duration>,
    ) -> ClientResult<()> {
        if self.requests.len() >= self.config.max_pending_requests {
            return Err(ClientError::capacity_exceeded("Too many pending requests"));
        }

        let pending = PendingRequest {
            kind,
            response_tx,
            created_at: Instant::now(),
            timeout: timeout.unwrap_or(self.config.request_timeout),
        };

        if self.requests.insert(id, pending).is_err() {
            return Err(ClientError::internal(format!(
                "Duplicate pending request id {id}"
            )));
        }
        Ok(())
    }

    /// Resolve a pending request with a response.
    ///
    /// Returns `true` if the request was found, `false` if the id was unknown
    /// (already timed out, already resolved, or never ours).
    pub(crate) fn resolve(
        &self,
        id: RequestId,
        kind: RequestKind,
        response: ClientResult<FunctionResult>,
    ) -> bool {
        if let Some((_, pending)) = self.requests.remove(&id) {
            if pending.kind != kind {
                warn!(request_id = %id, expected = %pending.kind, got = %kind,
                      "Response kind does not match the pending request");
            }
            // The caller may have given up already; a dropped receiver is the
            // silent drop the timeout contract requires.
            let _ = pending.response_tx.send(response);
            return true;
        }
        false
    }

    /// Remove a pending request without notifying the caller.
    pub(crate) fn remove(&self, id: RequestId) -> bool {
        self.requests.remove(&id).is_some()
    }

    /// Sweep expired requests, failing each with a timeout error.
    pub(crate) fn cleanup_stale_with_notify(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.requests.retain(|id, pending| {
            if now.duration_since(pending.created_at) >= pending.timeout {
                expired.push((*id, pending.timeout));
            }
            true
        });

        for (id, timeout) in expired {
            if let Some((_, pending)) = self.requests.remove(&id) {
                let _ = pending.response_tx.send(Err(ClientError::timeout(timeout)));
            }
        }
    }

    /// Check if there's capacity for more requests.
    pub(crate) fn has_capacity(&self) -> bool {
        self.requests.len() < self.config.max_pending_requests
    }

    /// Get the current number of pending requests.
    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Fail every pending request, draining the store.
    ///
    /// Used on disconnect (transport error) and on dispose (cancellation).
    pub(crate) fn clear_with_error(&self, make_error: impl Fn() -> ClientError) {
        let mut ids = Vec::new();
        self.requests.retain(|id, _| {
            ids.push(*id);
            true
        });

        for id in ids {
            if let Some((_, pending)) = self.requests.remove(&id) {
                let _ = pending.response_tx.send(Err(make_error()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn test_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new("https://deployment.example.com").max_pending_requests(4))
    }

    #[test]
    fn test_register_and_resolve() {
        let store = PendingRequestStore::new(test_config());
        let id = RequestId::next();
        let (tx, mut rx) = oneshot::channel();

        store
            .register(id, RequestKind::Mutation, tx, None)
            .unwrap();
        assert_eq!(store.len(), 1);

        let resolved = store.resolve(
            id,
            RequestKind::Mutation,
            Ok(FunctionResult::Value(json!({"ok": true}))),
        );
        assert!(resolved);
        assert_eq!(store.len(), 0);
        assert!(matches!(rx.try_recv(), Ok(Ok(FunctionResult::Value(_)))));
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let store = PendingRequestStore::new(test_config());
        let resolved = store.resolve(
            RequestId::next(),
            RequestKind::Action,
            Ok(FunctionResult::Value(json!(null))),
        );
        assert!(!resolved);
    }

    #[test]
    fn test_capacity_limit() {
        let store = PendingRequestStore::new(test_config());

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel();
            store
                .register(RequestId::next(), RequestKind::Mutation, tx, None)
                .unwrap();
            receivers.push(rx);
        }
        assert!(!store.has_capacity());

        let (tx, _rx) = oneshot::channel();
        let err = store
            .register(RequestId::next(), RequestKind::Mutation, tx, None)
            .unwrap_err();
        assert!(matches!(err, ClientError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_cleanup_stale_notifies_timeout() {
        let store = PendingRequestStore::new(test_config());
        let id = RequestId::next();
        let (tx, mut rx) = oneshot::channel();
        store
            .register(id, RequestKind::Action, tx, Some(Duration::from_millis(1)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        store.cleanup_stale_with_notify();

        assert_eq!(store.len(), 0);
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Timeout { .. }))));
    }

    #[test]
    fn test_clear_with_error() {
        let store = PendingRequestStore::new(test_config());
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        store
            .register(RequestId::next(), RequestKind::Mutation, tx1, None)
            .unwrap();
        store
            .register(RequestId::next(), RequestKind::Action, tx2, None)
            .unwrap();

        store.clear_with_error(|| ClientError::Disposed);

        assert_eq!(store.len(), 0);
        assert!(matches!(rx1.try_recv(), Ok(Err(ClientError::Disposed))));
        assert!(matches!(rx2.try_recv(), Ok(Err(ClientError::Disposed))));
    }
}
