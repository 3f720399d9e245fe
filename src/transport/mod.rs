//! Socket Transport
//!
//! The connection talks to the backend through three small traits so the
//! session logic does not depend on a concrete socket implementation.
//!
//! - [`Connector`]: opens a socket to a URL
//! - [`FrameSink`]: write half, one text frame per message
//! - [`FrameStream`]: read half, yields [`TransportEvent`]s
//!
//! A stream reports an error as [`TransportEvent::Error`] and then always
//! ends, either with [`TransportEvent::Closed`] or by returning `None`
//! (treated as close code 1006).

mod memory;
mod websocket;

pub use memory::{MemoryConnector, MemoryListener, MemoryServerSocket};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use thiserror::Error;

/// Something read from a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame
    Text(String),
    /// A transport-level failure; the socket is unusable afterwards
    Error(String),
    /// The peer closed the socket with this code
    Closed(u16),
}

/// Opens sockets
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

/// Write half of a socket
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the socket, best effort
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a socket.
///
/// `Error` and `Closed` are terminal: the reader stops after either one.
/// Problems confined to a single frame are logged and skipped instead.
#[async_trait]
pub trait FrameStream: Send {
    /// Next event, or `None` once the socket is gone
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// Errors raised by a transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Socket closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}
