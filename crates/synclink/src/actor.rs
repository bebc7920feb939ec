//! Connection task for the sync protocol lifecycle.
//!
//! The task runs in the background and handles:
//! - Dialing and the session handshake (Connect, Authenticate, query-set
//!   rebuild, in that order, before any queued command traffic)
//! - Automatic reconnection with exponential backoff and a bounded attempt
//!   ceiling, plus immediate manual reconnects
//! - Keepalive (server `Ping` -> client `Pong`)
//! - Routing inbound frames to pending requests and subscriptions
//! - Command processing from the client facade

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    error::{ClientError, ClientResult},
    pending::PendingRequestStore,
    protocol::{self, ClientMessage, QuerySetModification, ServerMessage},
    query_set::QuerySetManager,
    reconnect::calculate_backoff,
    session::Session,
    transport::{Socket, SocketEvent, SocketReader, SocketWriter},
    types::{ConnectionState, FunctionResult, QueryId, RequestId, RequestKind},
};

// ---------------------------------------------------------------------------
// Commands and shared auth state
// ---------------------------------------------------------------------------

/// Commands sent from the client facade to the connection task.
pub(crate) enum ActorCommand {
    /// Register a subscription and mirror it to the server.
    Subscribe {
        udf_path: String,
        args: Value,
        update_tx: mpsc::UnboundedSender<FunctionResult>,
        reply_tx: oneshot::Sender<ClientResult<QueryId>>,
    },
    /// Drop a subscription; the wire Remove is best-effort.
    Unsubscribe { query_id: QueryId },
    /// Send a correlated one-shot request.
    Request {
        kind: RequestKind,
        udf_path: String,
        args: Value,
        request_id: RequestId,
        reply_tx: oneshot::Sender<ClientResult<FunctionResult>>,
        timeout: Option<Duration>,
    },
    /// The cached auth token changed; push it to the server if connected.
    AuthChanged,
    /// Close any live socket and dial again immediately, skipping backoff.
    Reconnect {
        reply_tx: oneshot::Sender<ClientResult<()>>,
    },
    /// Dispose the client: cancel everything and stop the task.
    Close,
}

/// Auth token cache shared between the facade and the connection task.
///
/// The facade writes the token and flips the auth observable synchronously;
/// the task reads it during the handshake and clears it on `AuthError`.
pub(crate) struct AuthStore {
    token: RwLock<Option<String>>,
    state_tx: watch::Sender<bool>,
}

impl AuthStore {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (state_tx, state_rx) = watch::channel(false);
        (
            Self {
                token: RwLock::new(None),
                state_tx,
            },
            state_rx,
        )
    }

    pub(crate) fn set_token(&self, token: Option<String>) {
        let authenticated = token.is_some();
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
        self.state_tx.send_replace(authenticated);
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn clear(&self) {
        self.set_token(None);
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Private lifecycle states of the connection task.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ActorState {
    /// Dial as soon as possible.
    Connecting,
    /// A socket was lost or a dial failed; back off before the next dial.
    Reconnecting,
    /// The attempt ceiling was hit; wait for a manual reconnect or dispose.
    Failed,
    /// Dispose requested; tear everything down.
    Closing,
    /// Terminal.
    Closed,
}

/// Why the connected loop ended.
enum ConnectionExit {
    /// Dispose requested.
    Close,
    /// Manual reconnect requested: dial again immediately.
    Reconnect,
    /// The socket was lost; take the backoff path.
    Lost,
}

/// Outcome of command handling while no socket is up.
enum IdleExit {
    DialNow,
    Close,
}

pub(crate) struct ConnectionActor {
    config: Arc<ClientConfig>,
    sync_url: Url,
    cmd_rx: mpsc::Receiver<ActorCommand>,
    pending: Arc<PendingRequestStore>,
    query_set: Arc<QuerySetManager>,
    auth: Arc<AuthStore>,
    state_tx: watch::Sender<ConnectionState>,
    session: Session,
    state: ActorState,
    writer: Option<SocketWriter>,
    reconnect_attempt: u32,
    /// Callers of a manual reconnect waiting for the next handshake.
    reconnect_acks: Vec<oneshot::Sender<ClientResult<()>>>,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        sync_url: Url,
        cmd_rx: mpsc::Receiver<ActorCommand>,
        pending: Arc<PendingRequestStore>,
        query_set: Arc<QuerySetManager>,
        auth: Arc<AuthStore>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            sync_url,
            cmd_rx,
            pending,
            query_set,
            auth,
            state_tx,
            session: Session::new(),
            state: ActorState::Connecting,
            writer: None,
            reconnect_attempt: 0,
            reconnect_acks: Vec::new(),
        }
    }

    /// Main entry point - run the task until disposed.
    pub(crate) async fn run(mut self) {
        info!(url = %self.sync_url, session_id = self.session.session_id(), "Starting sync connection task");

        loop {
            match self.state {
                ActorState::Connecting => match Socket::connect(
                    &self.sync_url,
                    self.config.connect_timeout,
                )
                .await
                {
                    Ok(socket) => {
                        self.reconnect_attempt = 0;
                        match self.run_connection(socket).await {
                            ConnectionExit::Close => self.state = ActorState::Closing,
                            ConnectionExit::Reconnect => {
                                self.reconnect_attempt = 0;
                                self.state = ActorState::Connecting;
                            }
                            ConnectionExit::Lost => self.state = ActorState::Reconnecting,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection failed");
                        self.session.record_close_reason(e.to_string());
                        self.state = ActorState::Reconnecting;
                    }
                },
                ActorState::Reconnecting => {
                    if self.give_up_reached() {
                        error!(
                            attempts = self.reconnect_attempt,
                            "Max reconnection attempts exceeded; giving up"
                        );
                        self.pending.clear_with_error(|| {
                            ClientError::transport("Max reconnection attempts exceeded")
                        });
                        for ack in self.reconnect_acks.drain(..) {
                            let _ = ack.send(Err(ClientError::transport(
                                "Max reconnection attempts exceeded",
                            )));
                        }
                        self.state = ActorState::Failed;
                        continue;
                    }
                    match self.wait_before_reconnect().await {
                        WaitOutcome::Elapsed => {
                            self.reconnect_attempt += 1;
                            self.state = ActorState::Connecting;
                        }
                        WaitOutcome::DialNow => {
                            self.reconnect_attempt = 0;
                            self.state = ActorState::Connecting;
                        }
                        WaitOutcome::Close => self.state = ActorState::Closing,
                    }
                }
                ActorState::Failed => self.park().await,
                ActorState::Closing => {
                    self.shutdown().await;
                    self.state = ActorState::Closed;
                }
                ActorState::Closed => break,
            }
        }

        info!("Sync connection task stopped");
    }

    fn give_up_reached(&self) -> bool {
        match self.config.reconnect_max_attempts {
            Some(max) => self.reconnect_attempt >= max,
            None => false,
        }
    }

    /// Sleep the backoff delay, draining commands while waiting.
    async fn wait_before_reconnect(&mut self) -> WaitOutcome {
        let delay = calculate_backoff(self.config.backoff(), self.reconnect_attempt);
        debug!(
            delay_ms = delay.as_millis(),
            attempt = self.reconnect_attempt,
            "Waiting before reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return WaitOutcome::Elapsed,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => match self.handle_command_disconnected(cmd) {
                        None => {}
                        Some(IdleExit::DialNow) => return WaitOutcome::DialNow,
                        Some(IdleExit::Close) => return WaitOutcome::Close,
                    },
                    None => return WaitOutcome::Close,
                },
            }
        }
    }

    /// Wait for commands in the give-up state; only a manual reconnect or
    /// dispose leaves it.
    async fn park(&mut self) {
        loop {
            match self.cmd_rx.recv().await {
                Some(cmd) => match self.handle_command_disconnected(cmd) {
                    None => {}
                    Some(IdleExit::DialNow) => {
                        self.reconnect_attempt = 0;
                        self.state = ActorState::Connecting;
                        return;
                    }
                    Some(IdleExit::Close) => {
                        self.state = ActorState::Closing;
                        return;
                    }
                },
                None => {
                    self.state = ActorState::Closing;
                    return;
                }
            }
        }
    }

    /// Handshake on a fresh socket, then run the connected loop.
    async fn run_connection(&mut self, socket: Socket) -> ConnectionExit {
        let (mut writer, mut reader) = socket.split();

        let (connection_count, last_close_reason) = self.session.begin_connection();
        let connect = ClientMessage::Connect {
            session_id: self.session.session_id().to_owned(),
            connection_count,
            last_close_reason,
            client_ts: Session::client_ts(),
            max_observed_timestamp: self.session.max_observed_timestamp(),
        };
        if let Err(e) = Self::send_on(&mut writer, &connect).await {
            return self.lost(&e);
        }

        if let Some(token) = self.auth.token() {
            let authenticate = ClientMessage::Authenticate { token: Some(token) };
            if let Err(e) = Self::send_on(&mut writer, &authenticate).await {
                return self.lost(&e);
            }
        }

        // The server has no memory of a prior session's subscriptions; the
        // rebuild must precede any other outbound traffic on this socket.
        if let Some(batch) = self.query_set.rebuild_batch() {
            if let Err(e) = Self::send_on(&mut writer, &batch).await {
                return self.lost(&e);
            }
        }

        self.writer = Some(writer);
        info!(connection_count, "Sync connection established");
        self.state_tx.send_replace(ConnectionState::Connected);
        for ack in self.reconnect_acks.drain(..) {
            let _ = ack.send(Ok(()));
        }

        let exit = self.connected_loop(&mut reader).await;

        self.state_tx.send_replace(ConnectionState::Connecting);
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        exit
    }

    /// The main event loop while the socket is up.
    async fn connected_loop(&mut self, reader: &mut SocketReader) -> ConnectionExit {
        let mut cleanup = tokio::time::interval(self.config.pending_cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Inbound frames first: a server ping must be answered ahead
                // of whatever commands have queued up.
                biased;

                event = reader.next_event() => match event {
                    SocketEvent::Text(text) => {
                        if let Some(exit) = self.handle_frame(&text).await {
                            return exit;
                        }
                    }
                    SocketEvent::Closed { reason } => {
                        return self.lost(&ClientError::transport(reason));
                    }
                    SocketEvent::Errored { message } => {
                        return self.lost(&ClientError::transport(message));
                    }
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(exit) = self.handle_command_connected(cmd).await {
                            return exit;
                        }
                    }
                    None => {
                        debug!("All client handles dropped; disposing");
                        return ConnectionExit::Close;
                    }
                },

                _ = cleanup.tick() => self.pending.cleanup_stale_with_notify(),
            }
        }
    }

    /// Record a socket loss and hand control back to the reconnect path.
    ///
    /// Pending one-shots are left in place: they resolve only by a response,
    /// their own timeout, or dispose, so a transient disconnect never fails
    /// an unrelated caller.
    fn lost(&mut self, error: &ClientError) -> ConnectionExit {
        warn!(error = %error, "Connection lost");
        self.session.record_close_reason(error.to_string());
        ConnectionExit::Lost
    }

    /// Handle one inbound text frame. Malformed frames are logged and
    /// dropped, never escalated.
    async fn handle_frame(&mut self, text: &str) -> Option<ConnectionExit> {
        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return None;
            }
        };

        match message {
            ServerMessage::Ping {} => {
                // Answered inline so the pong precedes any queued work; a
                // missed pong reads as a dead connection server-side.
                if let Err(e) = self.send_connected(&ClientMessage::pong()).await {
                    return Some(self.lost(&e));
                }
                None
            }

            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                debug!(
                    start_version,
                    end_version,
                    count = modifications.len(),
                    "Applying transition"
                );
                for modification in modifications {
                    Self::log_udf_lines(&modification.log_lines);
                    let result = modification.function_result();
                    if !self.query_set.deliver(modification.query_id, result) {
                        debug!(
                            query_id = %modification.query_id,
                            "Transition for unknown query id ignored"
                        );
                    }
                }
                None
            }

            ServerMessage::MutationResponse {
                request_id,
                success,
                result,
                ts,
                error_data,
                log_lines,
            } => {
                if let Some(ts) = ts {
                    self.session.observe_timestamp(ts);
                }
                Self::log_udf_lines(&log_lines);
                let outcome = protocol::response_result(success, result, error_data);
                if !self
                    .pending
                    .resolve(request_id, RequestKind::Mutation, Ok(outcome))
                {
                    debug!(request_id = %request_id, "Late or duplicate mutation response dropped");
                }
                None
            }

            ServerMessage::ActionResponse {
                request_id,
                success,
                result,
                error_data,
                log_lines,
            } => {
                Self::log_udf_lines(&log_lines);
                let outcome = protocol::response_result(success, result, error_data);
                if !self
                    .pending
                    .resolve(request_id, RequestKind::Action, Ok(outcome))
                {
                    debug!(request_id = %request_id, "Late or duplicate action response dropped");
                }
                None
            }

            ServerMessage::FatalError { error } => {
                error!(error = %error, "Server reported a fatal error; closing socket");
                self.pending
                    .clear_with_error(|| ClientError::protocol(error.clone()));
                Some(self.lost(&ClientError::protocol(error)))
            }

            ServerMessage::AuthError { error } => {
                warn!(error = %error, "Authentication rejected; clearing auth state");
                self.auth.clear();
                None
            }
        }
    }

    /// Handle a command while the socket is up.
    async fn handle_command_connected(&mut self, cmd: ActorCommand) -> Option<ConnectionExit> {
        match cmd {
            ActorCommand::Subscribe {
                udf_path,
                args,
                update_tx,
                reply_tx,
            } => {
                let query_id = self.query_set.register(udf_path, args, update_tx);
                // The subscription exists regardless of what the socket does
                // next; a failed Add is repaired by the reconnect rebuild.
                let _ = reply_tx.send(Ok(query_id));

                let Some(modification) = self.query_set.add_modification(query_id) else {
                    return None;
                };
                let (base_version, new_version) = self.query_set.advance_version();
                let message = ClientMessage::ModifyQuerySet {
                    base_version,
                    new_version,
                    modifications: vec![modification],
                };
                match self.send_connected(&message).await {
                    Ok(()) => None,
                    Err(e) => Some(self.lost(&e)),
                }
            }

            ActorCommand::Unsubscribe { query_id } => {
                if !self.query_set.remove(query_id) {
                    // Already gone; a duplicate cancel must not emit a second
                    // Remove.
                    return None;
                }
                let (base_version, new_version) = self.query_set.advance_version();
                let message = ClientMessage::ModifyQuerySet {
                    base_version,
                    new_version,
                    modifications: vec![QuerySetModification::Remove { query_id }],
                };
                match self.send_connected(&message).await {
                    Ok(()) => None,
                    Err(e) => Some(self.lost(&e)),
                }
            }

            ActorCommand::Request {
                kind,
                udf_path,
                args,
                request_id,
                reply_tx,
                timeout,
            } => {
                if !self.pending.has_capacity() {
                    let _ = reply_tx.send(Err(ClientError::capacity_exceeded(
                        "Too many pending requests",
                    )));
                    return None;
                }
                if let Err(e) = self.pending.register(request_id, kind, reply_tx, timeout) {
                    warn!(request_id = %request_id, error = %e, "Failed to register request");
                    return None;
                }

                let args = protocol::wrap_args(args);
                let message = match kind {
                    RequestKind::Mutation => ClientMessage::Mutation {
                        request_id,
                        udf_path,
                        args,
                    },
                    RequestKind::Action => ClientMessage::Action {
                        request_id,
                        udf_path,
                        args,
                    },
                };
                match self.send_connected(&message).await {
                    Ok(()) => None,
                    Err(e) => {
                        self.pending
                            .resolve(request_id, kind, Err(ClientError::NotConnected));
                        Some(self.lost(&e))
                    }
                }
            }

            ActorCommand::AuthChanged => {
                let message = ClientMessage::Authenticate {
                    token: self.auth.token(),
                };
                match self.send_connected(&message).await {
                    Ok(()) => None,
                    Err(e) => Some(self.lost(&e)),
                }
            }

            ActorCommand::Reconnect { reply_tx } => {
                info!("Manual reconnect requested");
                self.reconnect_acks.push(reply_tx);
                Some(ConnectionExit::Reconnect)
            }

            ActorCommand::Close => Some(ConnectionExit::Close),
        }
    }

    /// Handle a command while no socket is up.
    fn handle_command_disconnected(&mut self, cmd: ActorCommand) -> Option<IdleExit> {
        match cmd {
            ActorCommand::Subscribe {
                udf_path,
                args,
                update_tx,
                reply_tx,
            } => {
                // Registered now, mirrored to the server by the rebuild on
                // the next established connection.
                let query_id = self.query_set.register(udf_path, args, update_tx);
                let _ = reply_tx.send(Ok(query_id));
                None
            }
            ActorCommand::Unsubscribe { query_id } => {
                // No wire Remove: the server either forgot the session already
                // or will receive a rebuild that omits this entry.
                self.query_set.remove(query_id);
                None
            }
            ActorCommand::Request { reply_tx, .. } => {
                let _ = reply_tx.send(Err(ClientError::NotConnected));
                None
            }
            ActorCommand::AuthChanged => None,
            ActorCommand::Reconnect { reply_tx } => {
                info!("Manual reconnect requested");
                self.reconnect_acks.push(reply_tx);
                Some(IdleExit::DialNow)
            }
            ActorCommand::Close => Some(IdleExit::Close),
        }
    }

    /// Dispose: cancel every pending request and subscription, drop the
    /// socket, and let the task terminate.
    async fn shutdown(&mut self) {
        self.pending.clear_with_error(|| ClientError::Disposed);
        self.query_set.clear();
        for ack in self.reconnect_acks.drain(..) {
            let _ = ack.send(Err(ClientError::Disposed));
        }
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
    }

    async fn send_connected(&mut self, message: &ClientMessage) -> ClientResult<()> {
        match self.writer.as_mut() {
            Some(writer) => Self::send_on(writer, message).await,
            None => Err(ClientError::NotConnected),
        }
    }

    async fn send_on(writer: &mut SocketWriter, message: &ClientMessage) -> ClientResult<()> {
        let text = protocol::encode(message)?;
        writer.send_text(text).await
    }

    fn log_udf_lines(lines: &[String]) {
        for line in lines {
            debug!(target: "synclink::udf", "{line}");
        }
    }
}

/// Outcome of the backoff wait.
enum WaitOutcome {
    Elapsed,
    DialNow,
    Close,
}
