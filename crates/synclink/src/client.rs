//! User-facing sync client API.
//!
//! [`SyncClient`] composes the connection task, the correlation table, and
//! the query set into the public operation surface: one-shot calls
//! (`query`/`mutation`/`action`), durable subscriptions, auth, manual
//! reconnect, and dispose, plus the connection-state and auth-state
//! observables.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::{
    actor::{ActorCommand, AuthStore, ConnectionActor},
    config::ClientConfig,
    error::{ClientError, ClientResult},
    pending::PendingRequestStore,
    query_set::QuerySetManager,
    types::{ConnectionState, FunctionResult, QueryId, RequestId, RequestKind},
};

/// Client for one sync protocol deployment.
///
/// Construction spawns a background connection task that dials, performs the
/// session handshake, and keeps reconnecting with exponential backoff until
/// the client is disposed. The client is cheap to clone and can be shared
/// across tasks; disposing any clone disposes all of them.
///
/// # Example
///
/// ```rust,ignore
/// let client = SyncClient::connect(ClientConfig::new("https://deployment.example.com"))?;
///
/// let mut messages = client.subscribe("messages:list", json!({})).await?;
/// client.mutation("messages:send", json!({"body": "hi"})).await?;
///
/// while let Some(update) = messages.next().await {
///     println!("messages: {update:?}");
/// }
/// ```
#[derive(Clone)]
pub struct SyncClient {
    cmd_tx: mpsc::Sender<ActorCommand>,
    pending: Arc<PendingRequestStore>,
    query_set: Arc<QuerySetManager>,
    auth: Arc<AuthStore>,
    config: Arc<ClientConfig>,
    state_rx: watch::Receiver<ConnectionState>,
    auth_rx: watch::Receiver<bool>,
}

impl SyncClient {
    /// Validate the configuration and spawn the connection task.
    ///
    /// Returns immediately; the first dial happens in the background. Must be
    /// called from within a tokio runtime.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate().map_err(ClientError::config)?;
        let sync_url = config.sync_url()?;

        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let pending = Arc::new(PendingRequestStore::new(Arc::clone(&config)));
        let query_set = Arc::new(QuerySetManager::new());
        let (auth, auth_rx) = AuthStore::new();
        let auth = Arc::new(auth);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let actor = ConnectionActor::new(
            Arc::clone(&config),
            sync_url,
            cmd_rx,
            Arc::clone(&pending),
            Arc::clone(&query_set),
            Arc::clone(&auth),
            state_tx,
        );
        tokio::spawn(actor.run());

        info!(url = %config.deployment_url, "Sync client created");

        Ok(Self {
            cmd_tx,
            pending,
            query_set,
            auth,
            config,
            state_rx,
            auth_rx,
        })
    }

    // ========================================================================
    // One-shot operations
    // ========================================================================

    /// Run a query once and return its first result.
    ///
    /// Uses the default timeout from configuration.
    pub async fn query(&self, udf_path: &str, args: Value) -> ClientResult<Value> {
        self.query_with_timeout(udf_path, args, None).await
    }

    /// Run a query once with a custom timeout.
    ///
    /// There is no query message in the protocol: the query rides the query
    /// set as a temporary subscription that is cancelled after its first
    /// transition (or after the timeout, which also removes the orphaned
    /// entry).
    pub async fn query_with_timeout(
        &self,
        udf_path: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> ClientResult<Value> {
        let deadline = timeout.unwrap_or(self.config.request_timeout);
        let mut subscription = self.subscribe(udf_path, args).await?;

        match tokio::time::timeout(deadline, subscription.next()).await {
            Ok(Some(result)) => result.into_result(),
            Ok(None) => Err(ClientError::Disposed),
            Err(_) => Err(ClientError::timeout(deadline)),
        }
        // Dropping the subscription here cancels it, which emits the Remove.
    }

    /// Run a mutation and await its response.
    pub async fn mutation(&self, udf_path: &str, args: Value) -> ClientResult<Value> {
        self.mutation_with_timeout(udf_path, args, None).await
    }

    /// Run a mutation with a custom timeout.
    pub async fn mutation_with_timeout(
        &self,
        udf_path: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> ClientResult<Value> {
        self.request(RequestKind::Mutation, udf_path, args, timeout)
            .await
    }

    /// Run an action and await its response.
    pub async fn action(&self, udf_path: &str, args: Value) -> ClientResult<Value> {
        self.action_with_timeout(udf_path, args, None).await
    }

    /// Run an action with a custom timeout.
    pub async fn action_with_timeout(
        &self,
        udf_path: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> ClientResult<Value> {
        self.request(RequestKind::Action, udf_path, args, timeout)
            .await
    }

    async fn request(
        &self,
        kind: RequestKind,
        udf_path: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> ClientResult<Value> {
        if !self.pending.has_capacity() {
            return Err(ClientError::capacity_exceeded("Too many pending requests"));
        }

        let request_id = RequestId::next();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ActorCommand::Request {
                kind,
                udf_path: udf_path.to_owned(),
                args,
                request_id,
                reply_tx,
                timeout,
            })
            .await
            .map_err(|_| ClientError::Disposed)?;

        let deadline = timeout.unwrap_or(self.config.request_timeout);
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(_)) => Err(ClientError::internal("Reply channel dropped")),
            Err(_) => {
                // The periodic sweep would reap it eventually; reap it now so
                // a late response is silently dropped rather than buffered.
                self.pending.remove(request_id);
                Err(ClientError::timeout(deadline))
            }
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a reactive subscription to a query.
    ///
    /// The subscription delivers every transition value for its query through
    /// the returned handle, including across reconnects (it is re-added to
    /// the server's query set silently). It stays active until the handle is
    /// cancelled or dropped.
    pub async fn subscribe(&self, udf_path: &str, args: Value) -> ClientResult<Subscription> {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ActorCommand::Subscribe {
                udf_path: udf_path.to_owned(),
                args,
                update_tx,
                reply_tx,
            })
            .await
            .map_err(|_| ClientError::Disposed)?;

        let query_id = reply_rx.await.map_err(|_| ClientError::Disposed)??;

        Ok(Subscription {
            query_id,
            update_rx,
            cmd_tx: self.cmd_tx.clone(),
            cancelled: false,
        })
    }

    // ========================================================================
    // Auth, lifecycle, introspection
    // ========================================================================

    /// Cache an auth token (or clear it with `None`).
    ///
    /// The auth observable flips synchronously; the token is pushed to the
    /// server now if connected, otherwise on the next handshake.
    pub async fn set_auth(&self, token: Option<String>) {
        self.auth.set_token(token);
        let _ = self.cmd_tx.send(ActorCommand::AuthChanged).await;
    }

    /// Close any live socket and dial again immediately, skipping backoff.
    ///
    /// Resolves once the new handshake completes, bounded by twice the
    /// configured connect timeout (dial plus handshake).
    pub async fn reconnect(&self) -> ClientResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCommand::Reconnect { reply_tx })
            .await
            .map_err(|_| ClientError::Disposed)?;

        let wait = self.config.connect_timeout.saturating_mul(2);
        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disposed),
            Err(_) => Err(ClientError::timeout(wait)),
        }
    }

    /// Dispose the client: cancel all pending requests with a cancellation
    /// error, end every subscription, close the socket, and stop the
    /// connection task.
    pub async fn dispose(&self) {
        let _ = self.cmd_tx.send(ActorCommand::Close).await;
    }

    /// Observe the connection state (`Connecting` / `Connected`).
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Observe whether an auth token is currently installed.
    pub fn auth_state(&self) -> watch::Receiver<bool> {
        self.auth_rx.clone()
    }

    /// Number of one-shot requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of live query-set entries.
    pub fn subscription_count(&self) -> usize {
        self.query_set.len()
    }
}

/// Handle over one query-set entry.
///
/// Updates arrive through [`next`](Self::next) in server order. Cancelling
/// (or dropping) the handle stops delivery immediately and removes the entry
/// from the query set; the wire Remove is best-effort, since a set rebuild on
/// the next connect would omit the entry anyway.
pub struct Subscription {
    query_id: QueryId,
    update_rx: mpsc::UnboundedReceiver<FunctionResult>,
    cmd_tx: mpsc::Sender<ActorCommand>,
    cancelled: bool,
}

impl Subscription {
    /// The query-set id backing this subscription.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Wait for the next update.
    ///
    /// Returns `None` after the subscription is cancelled or the client is
    /// disposed.
    pub async fn next(&mut self) -> Option<FunctionResult> {
        if self.cancelled {
            return None;
        }
        self.update_rx.recv().await
    }

    /// Take an already-delivered update without waiting.
    pub fn try_next(&mut self) -> Option<FunctionResult> {
        if self.cancelled {
            return None;
        }
        self.update_rx.try_recv().ok()
    }

    /// Cancel the subscription. Idempotent: the second call (and the drop
    /// that follows) does nothing.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.update_rx.close();
        send_unsubscribe(&self.cmd_tx, self.query_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Best-effort Unsubscribe from a non-async context.
fn send_unsubscribe(cmd_tx: &mpsc::Sender<ActorCommand>, query_id: QueryId) {
    let command = ActorCommand::Unsubscribe { query_id };
    match cmd_tx.try_send(command) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(query_id = %query_id, "Connection task gone while cancelling subscription");
        }
        Err(mpsc::error::TrySendError::Full(command)) => {
            let cmd_tx = cmd_tx.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if cmd_tx.send(command).await.is_err() {
                            debug!("Connection task gone while sending unsubscribe");
                        }
                    });
                }
                Err(_) => {
                    if cmd_tx.blocking_send(command).is_err() {
                        debug!("Connection task gone while sending unsubscribe");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SyncClient>();
        assert_sync::<SyncClient>();
        assert_send::<Subscription>();
    }
}
