//! Message Router
//!
//! Maps route keys to feature handlers. The connection owns one router and
//! dispatches every inbound frame that is not a control message through it.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::protocol::Envelope;

/// A feature that receives messages for one route
pub trait MessageHandler: Send + Sync {
    /// Handle a single inbound message
    fn handle_message(&self, envelope: &Envelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn handle_message(&self, envelope: &Envelope) {
        self(envelope)
    }
}

/// Route key → handler table
#[derive(Default)]
pub struct MessageRouter {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}

/// Normalize a route key: trimmed, lower-case
pub fn normalize_route(key: &str) -> String {
    key.trim().to_lowercase()
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same key replaces it
    pub fn register(&mut self, key: &str, handler: Arc<dyn MessageHandler>) {
        let key = normalize_route(key);
        if self.routes.insert(key.clone(), handler).is_some() {
            tracing::debug!(route = %key, "Replaced message handler");
        } else {
            tracing::debug!(route = %key, "Registered message handler");
        }
    }

    /// Remove a handler, returning whether one was registered
    pub fn unregister(&mut self, key: &str) -> bool {
        self.routes.remove(&normalize_route(key)).is_some()
    }

    /// Deliver a message to the handler for `key`.
    ///
    /// Returns false when no handler is registered; the miss is logged and
    /// the message dropped. A panicking handler is logged and contained.
    pub fn dispatch(&self, key: &str, envelope: &Envelope) -> bool {
        match self.routes.get(&normalize_route(key)) {
            Some(handler) => {
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(envelope)));
                if let Err(payload) = delivered {
                    tracing::error!(
                        route = %key,
                        kind = %envelope.kind,
                        panic = panic_message(payload.as_ref()),
                        "Message handler panicked, dropping message"
                    );
                }
                true
            }
            None => {
                tracing::error!(route = %key, kind = %envelope.kind, "Received invalid message route");
                false
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.routes.contains_key(&normalize_route(key))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered route keys, sorted
    pub fn routes(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.routes.keys().cloned().collect();
        keys.sort();
        keys
    }
}
