//! Ready-made message handlers
//!
//! Feature code usually implements [`MessageHandler`] itself. These cover the
//! two common shapes: hand messages to an async consumer, or just log them.

use tokio::sync::mpsc;

use crate::protocol::Envelope;
use crate::router::MessageHandler;

/// Forwards every message into a channel
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelHandler {
    /// Create a handler and the receiver it feeds
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn handle_message(&self, envelope: &Envelope) {
        if self.tx.send(envelope.clone()).is_err() {
            tracing::debug!(route = %envelope.route, "Handler receiver dropped");
        }
    }
}

/// Logs the payload of every message as pretty JSON
#[derive(Debug, Default)]
pub struct JsonLogHandler;

impl JsonLogHandler {
    /// Render the payload, or the whole envelope when there is none
    pub fn render(envelope: &Envelope) -> String {
        let rendered = match &envelope.data {
            Some(data) => serde_json::to_string_pretty(data),
            None => serde_json::to_string_pretty(envelope),
        };
        rendered.unwrap_or_else(|e| format!("<unprintable: {}>", e))
    }
}

impl MessageHandler for JsonLogHandler {
    fn handle_message(&self, envelope: &Envelope) {
        tracing::info!(
            route = %envelope.route,
            kind = %envelope.kind,
            "Received\n{}",
            Self::render(envelope)
        );
    }
}
