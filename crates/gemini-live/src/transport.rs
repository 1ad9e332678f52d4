//! The duplex frame transport underneath a Live session.
//!
//! A [`Connector`] opens one connection and hands back its two halves, so a
//! session can run its reader and writer as independent tasks.

use crate::LiveError;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info};

/// Something that happened on the inbound half of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame.
    Frame(String),
    /// The peer closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The connection failed underneath us.
    Error(String),
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), LiveError>;
    async fn close(&mut self) -> Result<(), LiveError>;
}

/// Inbound half of a transport. `None` means the stream ended.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// An open connection, split into its halves.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens transports. One call, one connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Transport, LiveError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to a fixed URL.
#[derive(Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Targets the Live API endpoint at `base_url`, authenticated by `api_key`.
    pub fn with_api_key(base_url: &str, api_key: &str) -> Self {
        Self::new(format!("{base_url}?key={api_key}"))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Transport, LiveError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| LiveError::Transport(e.to_string()))?;
        info!("Connected to Live WebSocket.");
        let (sink, stream) = ws_stream.split();
        Ok(Transport {
            sink: Box::new(WsFrameSink(sink)),
            stream: Box::new(WsFrameStream(stream)),
        })
    }
}

struct WsFrameSink(SplitSink<WsStream, WsMessage>);

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: String) -> Result<(), LiveError> {
        self.0
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| LiveError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), LiveError> {
        self.0
            .close()
            .await
            .map_err(|e| LiveError::Transport(e.to_string()))
    }
}

struct WsFrameStream(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(TransportEvent::Error(e.to_string())),
            };
            match message {
                WsMessage::Text(text) => return Some(TransportEvent::Frame(text.to_string())),
                // The Live API delivers its JSON in binary frames as well.
                WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(TransportEvent::Frame(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                WsMessage::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(TransportEvent::Closed { code, reason });
                }
                _ => {}
            }
        }
    }
}
