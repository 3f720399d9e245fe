//! In-process transport
//!
//! A connector whose sockets are channel pairs. The server side of every
//! accepted socket is handed to a [`MemoryListener`], which lets tests and
//! demos play the backend without a network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Connector, FrameSink, FrameStream, TransportError, TransportEvent};
use crate::protocol::Envelope;

/// Connector producing in-memory sockets
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryServerSocket>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    fail_sends: Arc<AtomicU32>,
}

/// Receives the server side of every socket the connector opens
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryServerSocket>,
}

/// Server side of one in-memory socket
pub struct MemoryServerSocket {
    url: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl MemoryConnector {
    /// Create a connector and the listener for its sockets
    pub fn new() -> (Arc<Self>, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accept_tx,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            fail_sends: Arc::new(AtomicU32::new(0)),
        });
        (connector, MemoryListener { accept_rx })
    }

    /// Number of connect attempts made so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make later connect attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make the next `count` frame sends fail, across all sockets
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{} refused", url)));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();

        let server = MemoryServerSocket {
            url: url.to_string(),
            from_client,
            to_client: Some(to_client),
        };
        self.accept_tx
            .send(server)
            .map_err(|_| TransportError::Connect("listener dropped".to_string()))?;

        Ok((
            Box::new(MemorySink {
                tx: Some(client_tx),
                fail_sends: Arc::clone(&self.fail_sends),
            }),
            Box::new(MemoryStream { rx: client_rx }),
        ))
    }
}

impl MemoryListener {
    /// Wait for the next socket
    pub async fn accept(&mut self) -> Option<MemoryServerSocket> {
        self.accept_rx.recv().await
    }

    /// Take an already-opened socket without waiting
    pub fn try_accept(&mut self) -> Option<MemoryServerSocket> {
        self.accept_rx.try_recv().ok()
    }
}

impl MemoryServerSocket {
    /// URL the client connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.to_client.as_ref().ok_or(TransportError::Closed)?;
        tx.send(TransportEvent::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Push a JSON frame to the client
    pub fn send_json(&self, value: serde_json::Value) -> Result<(), TransportError> {
        self.send_text(value.to_string())
    }

    /// Report a transport error to the client
    pub fn send_error(&self, message: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.to_client.as_ref().ok_or(TransportError::Closed)?;
        tx.send(TransportEvent::Error(message.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the socket with a close code
    pub fn close(&mut self, code: u16) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(TransportEvent::Closed(code));
        }
    }

    /// Next raw frame sent by the client, `None` once the client hung up
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame sent by the client, parsed
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let text = self.recv_text().await?;
        match serde_json::from_str(&text) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Client sent an unparseable frame");
                None
            }
        }
    }

    /// Frame already sent by the client, without waiting
    pub fn try_recv_text(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
    fail_sends: Arc<AtomicU32>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let injected = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Send("injected failure".to_string()));
        }

        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}
