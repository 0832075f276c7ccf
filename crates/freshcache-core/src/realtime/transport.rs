//! Push connection seam.
//!
//! The channel only needs text frames in both directions, so the transport
//! is reduced to that. `WsTransport` is the WebSocket implementation.

use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::api::ApiError;

/// An open push connection.
pub trait PushConnection: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ApiError>>;

    /// Next text frame. `None` once the peer closed the connection.
    fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ApiError>>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens push connections; called again for every reconnect.
pub trait PushTransport: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn PushConnection>, ApiError>>;
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushTransport for WsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn PushConnection>, ApiError>> {
        async move {
            let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| ApiError::Channel(e.to_string()))?;
            debug!(url = %self.url, "WebSocket connected");
            Ok(Box::new(WsConnection { stream }) as Box<dyn PushConnection>)
        }
        .boxed()
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushConnection for WsConnection {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), ApiError>> {
        async move {
            self.stream
                .send(Message::Text(text))
                .await
                .map_err(|e| ApiError::Channel(e.to_string()))
        }
        .boxed()
    }

    fn next_text(&mut self) -> BoxFuture<'_, Option<Result<String, ApiError>>> {
        async move {
            while let Some(message) = self.stream.next().await {
                match message {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {}
                    Err(e) => return Some(Err(ApiError::Channel(e.to_string()))),
                }
            }
            None
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.stream.close(None).await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
        .boxed()
    }
}
