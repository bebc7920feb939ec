//! Thin socket adapter over `tokio-tungstenite`.
//!
//! Dial, split, send text frames, close. No protocol knowledge lives here;
//! the connection task interprets the frames.

use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, ClientResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established socket, before splitting into halves.
pub(crate) struct Socket {
    inner: WsStream,
}

impl Socket {
    /// Dial the endpoint, bounding the whole attempt by `timeout`.
    pub(crate) async fn connect(url: &Url, timeout: Duration) -> ClientResult<Self> {
        debug!(url = %url, "Dialing WebSocket");
        let attempt = tokio::time::timeout(timeout, connect_async(url.as_str()));
        match attempt.await {
            Ok(Ok((inner, _response))) => Ok(Self { inner }),
            Ok(Err(e)) => Err(ClientError::transport(e.to_string())),
            Err(_) => Err(ClientError::timeout(timeout)),
        }
    }

    pub(crate) fn split(self) -> (SocketWriter, SocketReader) {
        let (sink, stream) = self.inner.split();
        (SocketWriter { sink }, SocketReader { stream })
    }
}

/// Write half of an established socket.
pub(crate) struct SocketWriter {
    sink: SplitSink<WsStream, Message>,
}

impl SocketWriter {
    /// Send one text frame.
    pub(crate) async fn send_text(&mut self, text: String) -> ClientResult<()> {
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::transport(e.to_string()))
    }

    /// Send a normal close frame and shut the sink down. Best-effort.
    pub(crate) async fn close(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

/// What the read half observed on the socket.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// A complete text frame.
    Text(String),
    /// The peer closed the socket (or the stream ended).
    Closed { reason: String },
    /// The socket errored out.
    Errored { message: String },
}

/// Read half of an established socket.
pub(crate) struct SocketReader {
    stream: SplitStream<WsStream>,
}

impl SocketReader {
    /// Wait for the next meaningful socket event.
    ///
    /// Control frames are absorbed here: tungstenite answers protocol-level
    /// pings internally as long as the stream keeps being polled.
    pub(crate) async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return SocketEvent::Text(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return SocketEvent::Text(text),
                    Err(_) => {
                        debug!(len = data.len(), "Ignoring non-UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => format!("{}: {}", frame.code, frame.reason),
                        None => "closed without a close frame".to_string(),
                    };
                    return SocketEvent::Closed { reason };
                }
                Some(Err(e)) => {
                    return SocketEvent::Errored {
                        message: e.to_string(),
                    };
                }
                None => {
                    return SocketEvent::Closed {
                        reason: "stream ended".to_string(),
                    };
                }
            }
        }
    }
}
