use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::instrument;

use crate::core::errors::DeltaError;

/// Write half of an established streaming connection.
#[async_trait]
pub trait WsSink: Send {
    async fn send(&mut self, text: String) -> Result<(), DeltaError>;
    async fn close(&mut self) -> Result<(), DeltaError>;
}

/// Read half of an established streaming connection. `next` yields text
/// frames; `None` means the peer closed the connection.
#[async_trait]
pub trait WsStream: Send {
    async fn next(&mut self) -> Option<Result<String, DeltaError>>;
}

/// Transport factory injected into the session at construction time, so
/// tests can swap the real socket for a scripted one.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn WsSink>, Box<dyn WsStream>), DeltaError>;
}

/// Production connector backed by tokio-tungstenite.
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self))]
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn WsSink>, Box<dyn WsStream>), DeltaError> {
        let connection = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| DeltaError::ConnectFailure("connection timed out".to_string()))?;

        let (ws_stream, _) = connection
            .map_err(|e| DeltaError::ConnectFailure(format!("websocket connect: {}", e)))?;

        let (write, read) = ws_stream.split();
        Ok((
            Box::new(TungsteniteSink { write }),
            Box::new(TungsteniteStream { read }),
        ))
    }
}

struct TungsteniteSink {
    write: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl WsSink for TungsteniteSink {
    async fn send(&mut self, text: String) -> Result<(), DeltaError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| DeltaError::Transport(format!("send failed: {}", e)))
    }

    async fn close(&mut self) -> Result<(), DeltaError> {
        // A failed close means the peer is already gone.
        let _ = self.write.send(Message::Close(None)).await;
        Ok(())
    }
}

struct TungsteniteStream {
    read: SplitStream<WsSocket>,
}

#[async_trait]
impl WsStream for TungsteniteStream {
    async fn next(&mut self) -> Option<Result<String, DeltaError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // tungstenite queues the pong reply itself; ping/pong frames
                // never reach the session.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(DeltaError::Transport(format!("receive failed: {}", e)))),
            }
        }
    }
}
