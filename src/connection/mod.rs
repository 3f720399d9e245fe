//! Connection Manager
//!
//! Keeps one socket to the backend alive on behalf of every feature:
//!
//! - Opens the socket and walks the handshake (`initialize`, then `auth`)
//! - Queues sends until a session id is assigned, then flushes them in order
//! - Stamps credentials on every outbound frame and retries failed sends
//! - Sends keepalives while authenticated
//! - Routes inbound frames to feature handlers through a [`MessageRouter`]
//!
//! A single task owns all of this state. [`Connection`] is a handle that
//! posts commands to it; state changes are observable through
//! [`Connection::subscribe`] and [`Connection::watch`].
//!
//! ## Handshake
//!
//! ```text
//! Disconnected ─open─▶ Connecting ─transport open─▶ Authenticating
//!      ▲                                                 │ initialize
//!      └──────────── close / denied / error ◀──── Ready ◀┘
//! ```
//!
//! [`MessageRouter`]: crate::router::MessageRouter

mod client;
mod error;
mod events;
mod state;
mod task;

#[cfg(test)]
mod tests;

pub use client::Connection;
pub use error::{SessionError, SessionResult};
pub use events::SessionEvent;
pub use state::{ConnectionSnapshot, ConnectionState, Credentials};
