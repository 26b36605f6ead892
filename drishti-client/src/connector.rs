// Socket seam for the client actor

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};

/// Opens stream connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// One open stream connection.
#[async_trait]
pub trait Connection: Send {
    /// Next text message; `None` once the peer closed. Must be cancel safe.
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// tokio-tungstenite connector with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Reject anything that is not a ws:// or wss:// URL before dialing.
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ClientError::InvalidUrl(format!(
            "unsupported scheme '{}' in {}",
            other, url
        ))),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        validate_url(url)?;
        let (stream, _) = tokio::time::timeout(self.timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(_)) => debug!("Ignoring binary frame"),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(ClientError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close error: {}", e);
        }
    }
}
