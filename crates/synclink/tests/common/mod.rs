//! Shared test harness: an in-process WebSocket server whose connections are
//! scripted through channels, so tests can assert exact wire traffic.
#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use synclink::ClientConfig;

const WAIT: Duration = Duration::from_secs(5);

/// A listening server; every accepted socket surfaces as a [`ServerConn`].
pub struct TestServer {
    pub url: String,
    conn_rx: mpsc::UnboundedReceiver<ServerConn>,
}

/// One accepted connection, driven by the test.
///
/// Dropping the handle drops the socket, which the client observes as an
/// abnormal disconnect.
pub struct ServerConn {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let ws = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    let (mut write, mut read) = ws.split();
                    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<String>();
                    let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
                    let (close_tx, mut close_rx) = oneshot::channel::<()>();

                    let _ = conn_tx.send(ServerConn {
                        to_client: to_client_tx,
                        from_client: from_client_rx,
                        close_tx: Some(close_tx),
                    });

                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = from_client_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            out = to_client_rx.recv() => match out {
                                Some(text) => {
                                    if write.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            _ = &mut close_rx => break,
                        }
                    }
                });
            }
        });

        Self {
            url: format!("http://{addr}"),
            conn_rx,
        }
    }

    /// Wait for the next client connection.
    pub async fn next_conn(&mut self) -> ServerConn {
        timeout(WAIT, self.conn_rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("listener task ended")
    }
}

impl ServerConn {
    /// Receive the next frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection closed while expecting a frame");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Receive the next frame and assert its `type` discriminator.
    pub async fn expect_type(&mut self, message_type: &str) -> Value {
        let value = self.recv_json().await;
        assert_eq!(
            value["type"], message_type,
            "expected a {message_type} frame, got: {value}"
        );
        value
    }

    /// Assert that the client stays quiet for `duration`.
    pub async fn expect_silence(&mut self, duration: Duration) {
        if let Ok(Some(text)) = timeout(duration, self.from_client.recv()).await {
            panic!("expected no client frame, got: {text}");
        }
    }

    /// Wait for the client to close this connection.
    pub async fn expect_closed(&mut self) {
        loop {
            match timeout(WAIT, self.from_client.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(_) => panic!("timed out waiting for the connection to close"),
            }
        }
    }

    /// Push a frame to the client.
    pub fn send_json(&self, value: &Value) {
        self.to_client
            .send(value.to_string())
            .expect("connection task ended");
    }

    /// Drop the socket abruptly, simulating a network failure.
    pub fn drop_connection(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
    }
}

/// Route client logs through `RUST_LOG` when a test needs them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Client configuration tuned for fast, deterministic tests.
pub fn test_config(url: &str) -> ClientConfig {
    ClientConfig::new(url)
        .reconnect_initial_delay(Duration::from_millis(10))
        .reconnect_max_delay(Duration::from_millis(50))
        .reconnect_jitter(0.0)
        .request_timeout(Duration::from_secs(5))
        .pending_cleanup_interval(Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(5))
}
