//! Session events observable by feature code

use serde::Serialize;
use serde_json::Value;

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// `initialize` received; queued sends are being flushed
    Established { session_id: String },
    /// Login approved
    AuthComplete { is_admin: bool },
    /// Socket gone and credentials cleared; show a logged-out view
    Closed { code: u16 },
    /// A pagelet arrived; `component` names the destination page
    Navigated {
        component: String,
        fragment: Option<Value>,
    },
    /// Error the user should see
    Notice { route: String, message: String },
    /// A send was dropped after exhausting its retries
    SendFailed {
        route: String,
        kind: String,
        attempts: u32,
    },
}

impl SessionEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Established { .. } => "established",
            SessionEvent::AuthComplete { .. } => "auth_complete",
            SessionEvent::Closed { .. } => "closed",
            SessionEvent::Navigated { .. } => "navigated",
            SessionEvent::Notice { .. } => "notice",
            SessionEvent::SendFailed { .. } => "send_failed",
        }
    }
}
