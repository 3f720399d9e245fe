//! Connection state and credentials

use serde::Serialize;
use std::fmt;

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket requested, transport not open yet
    Connecting,
    /// Transport open, waiting for `initialize`
    Authenticating,
    /// Session id assigned; sends go straight out
    Ready,
    /// Shutting down, no further transitions
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Tokens and session id held by the connection
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub session_id: Option<String>,
}

impl Credentials {
    /// Drop everything; safe when nothing was ever set
    pub fn clear(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.session_id = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.session_id.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(value: &Option<String>) -> &'static str {
            if value.is_some() {
                "<set>"
            } else {
                "<none>"
            }
        }

        f.debug_struct("Credentials")
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &mask(&self.refresh_token))
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Point-in-time view of the connection, published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub credentials: Credentials,
    /// Client-side location, `/<component>` of the last pagelet
    pub location: String,
    /// Envelopes waiting for the session to be established
    pub pending_sends: usize,
    /// Sockets opened over the connection's lifetime
    pub sockets_opened: u64,
    /// Set once the connection has been closed for good
    pub terminated: bool,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            credentials: Credentials::default(),
            location: "/".to_string(),
            pending_sends: 0,
            sockets_opened: 0,
            terminated: false,
        }
    }
}
