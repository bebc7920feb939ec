//! The versioned query set: the client's view of its active subscriptions.
//!
//! Every entry maps a query id to a server function plus the channel its
//! updates are delivered on. While connected, each local change is mirrored
//! to the server as a `ModifyQuerySet` diff whose `(base, new)` version pair
//! advances by exactly one; after a reconnect the server has forgotten the
//! session, so the whole set is retransmitted from version 0 as one batch.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    protocol::{wrap_args, ClientMessage, QuerySetModification},
    types::{FunctionResult, QueryId},
};

struct QueryEntry {
    udf_path: String,
    args: Value,
    update_tx: mpsc::UnboundedSender<FunctionResult>,
}

/// Store for the active query set.
///
/// Entries and the version counter are only mutated from the connection task,
/// which serializes all version arithmetic; the facade reads counts.
pub(crate) struct QuerySetManager {
    entries: scc::HashMap<QueryId, QueryEntry>,
    version: AtomicU32,
    next_query_id: AtomicU32,
}

impl QuerySetManager {
    pub(crate) fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
            version: AtomicU32::new(0),
            next_query_id: AtomicU32::new(0),
        }
    }

    /// Insert a new entry and allocate its query id. No wire traffic happens
    /// here; the connection task decides whether an Add can be sent.
    pub(crate) fn register(
        &self,
        udf_path: impl Into<String>,
        args: Value,
        update_tx: mpsc::UnboundedSender<FunctionResult>,
    ) -> QueryId {
        let id = QueryId::new(self.next_query_id.fetch_add(1, Ordering::Relaxed));
        let entry = QueryEntry {
            udf_path: udf_path.into(),
            args,
            update_tx,
        };
        // Ids are never reused, so the insert cannot collide.
        let _ = self.entries.insert(id, entry);
        id
    }

    /// Drop an entry. Returns `false` if it was already gone.
    pub(crate) fn remove(&self, id: QueryId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Advance the version by one, returning the `(base, new)` pair for the
    /// `ModifyQuerySet` message that mirrors the change.
    pub(crate) fn advance_version(&self) -> (u32, u32) {
        let base = self.version.fetch_add(1, Ordering::Relaxed);
        (base, base + 1)
    }

    /// Build the Add modification for one live entry.
    pub(crate) fn add_modification(&self, id: QueryId) -> Option<QuerySetModification> {
        self.entries.update(&id, |_, entry| QuerySetModification::Add {
            query_id: id,
            udf_path: entry.udf_path.clone(),
            args: wrap_args(entry.args.clone()),
        })
    }

    /// Build the post-reconnect batch re-adding every live entry, resetting
    /// the version counter to match.
    ///
    /// Returns `None` when the set is empty (nothing to retransmit; the
    /// version simply restarts at 0).
    pub(crate) fn rebuild_batch(&self) -> Option<ClientMessage> {
        let mut live = Vec::new();
        self.entries.retain(|id, entry| {
            live.push(QuerySetModification::Add {
                query_id: *id,
                udf_path: entry.udf_path.clone(),
                args: wrap_args(entry.args.clone()),
            });
            true
        });

        live.sort_by_key(|modification| match modification {
            QuerySetModification::Add { query_id, .. }
            | QuerySetModification::Remove { query_id } => *query_id,
        });

        let count = u32::try_from(live.len()).unwrap_or(u32::MAX);
        self.version.store(count, Ordering::Relaxed);

        if live.is_empty() {
            return None;
        }
        Some(ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: count,
            modifications: live,
        })
    }

    /// Deliver one transition result to the matching live entry.
    ///
    /// Returns `false` for an unknown id (cancelled locally before the server
    /// caught up); callers treat that as ignorable, not as an error.
    pub(crate) fn deliver(&self, id: QueryId, result: FunctionResult) -> bool {
        self.entries
            .update(&id, |_, entry| {
                // A closed receiver means the subscriber is gone; the entry
                // will be removed when its cancel command drains.
                let _ = entry.update_tx.send(result);
            })
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry, ending all subscriber channels.
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_version_pairs_advance_by_one() {
        let qs = QuerySetManager::new();
        assert_eq!(qs.advance_version(), (0, 1));
        assert_eq!(qs.advance_version(), (1, 2));
        assert_eq!(qs.advance_version(), (2, 3));
    }

    #[test]
    fn test_register_allocates_sequential_ids() {
        let qs = QuerySetManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = qs.register("messages:list", json!({}), tx.clone());
        let b = qs.register("users:me", json!({}), tx);
        assert_eq!(a.as_u32(), 0);
        assert_eq!(b.as_u32(), 1);
        assert_eq!(qs.len(), 2);
    }

    #[test]
    fn test_deliver_routes_to_entry_channel() {
        let qs = QuerySetManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = qs.register("messages:list", json!({}), tx);

        assert!(qs.deliver(id, FunctionResult::Value(json!([1, 2]))));
        assert_eq!(
            rx.try_recv().unwrap(),
            FunctionResult::Value(json!([1, 2]))
        );
    }

    #[test]
    fn test_deliver_unknown_id_is_ignored() {
        let qs = QuerySetManager::new();
        assert!(!qs.deliver(QueryId::new(42), FunctionResult::Value(json!(null))));
    }

    #[test]
    fn test_rebuild_batch_readds_everything_from_version_zero() {
        let qs = QuerySetManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        qs.register("a:one", json!({"k": 1}), tx.clone());
        let b = qs.register("b:two", json!({}), tx.clone());
        qs.register("c:three", json!({}), tx);
        qs.remove(b);

        // Simulate earlier connected-phase traffic.
        qs.advance_version();
        qs.advance_version();

        let batch = qs.rebuild_batch().unwrap();
        match batch {
            ClientMessage::ModifyQuerySet {
                base_version,
                new_version,
                modifications,
            } => {
                assert_eq!(base_version, 0);
                assert_eq!(new_version, 2);
                assert_eq!(modifications.len(), 2);
                assert!(matches!(
                    &modifications[0],
                    QuerySetModification::Add { udf_path, .. } if udf_path == "a:one"
                ));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // Version arithmetic resumes from the batch's new version.
        assert_eq!(qs.advance_version(), (2, 3));
    }

    #[test]
    fn test_rebuild_batch_empty_set_sends_nothing() {
        let qs = QuerySetManager::new();
        qs.advance_version();
        assert!(qs.rebuild_batch().is_none());
        // But the version still restarts at zero.
        assert_eq!(qs.advance_version(), (0, 1));
    }
}
