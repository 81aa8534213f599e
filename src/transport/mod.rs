//! WebSocket transport for the control channel, split into independently
//! owned reader and writer halves.

use crate::channel::{Inbound, Outbound};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
pub enum TransportError {
    Url(String),
    Handshake(tungstenite::Error),
    Io(tungstenite::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(err) => write!(f, "invalid websocket url: {err}"),
            Self::Handshake(err) => write!(f, "websocket connect failed: {err}"),
            Self::Io(err) => write!(f, "websocket io error: {err}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsWriter {
    pub async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        let message = match message {
            Outbound::Binary(bytes) => Message::binary(bytes),
            Outbound::Text(text) => Message::text(text),
        };
        self.sink.send(message).await.map_err(TransportError::Io)
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(TransportError::Io)
    }
}

pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Next data message. `None` once the peer closes or the stream ends.
    pub async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(Inbound::Binary(data.to_vec()))),
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(frame = ?frame, "websocket close frame received");
                    return None;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(err) => return Some(Err(TransportError::Io(err))),
            }
        }
    }
}

pub async fn connect(url: &str) -> Result<(WsWriter, WsReader), TransportError> {
    let request = url
        .into_client_request()
        .map_err(|err| TransportError::Url(format!("{url}: {err}")))?;
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(TransportError::Handshake)?;
    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the control endpoint URL for a device host.
pub fn control_url(host: &str, path: &str, tls: bool) -> String {
    let scheme = if tls { "wss" } else { "ws" };
    let host = host
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .trim_end_matches('/');
    let path = path.trim();
    if path.starts_with('/') {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}/{path}")
    }
}
