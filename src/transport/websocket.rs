//! WebSocket transport backed by tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Connector, FrameSink, FrameStream, TransportError, TransportEvent};
use crate::protocol::close_code;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` sockets
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        if url.starts_with("wss://") {
            // Err means a provider is already installed
            let _ = rustls::crypto::ring::default_provider().install_default();
        }

        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketSink { inner: sink }),
            Box::new(WebSocketReader { inner: stream }),
        ))
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WebSocketReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketReader {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(TransportEvent::Text(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(TransportEvent::Text(text)),
                    Err(e) => {
                        tracing::warn!(len = bytes.len(), error = %e, "Skipping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(close_code::NO_STATUS);
                    return Some(TransportEvent::Closed(code));
                }
                // tungstenite answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(TransportEvent::Error(e.to_string())),
            }
        }
    }
}
