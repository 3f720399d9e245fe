//! # Growlink
//!
//! Client-side connection manager for a backend reached over a single
//! WebSocket. Features talk to the backend through one shared [`Connection`]
//! instead of owning sockets themselves.
//!
//! ## Features
//!
//! - **Handshake**: `initialize` assigns a session id, `auth` approves a login
//! - **Queue until ready**: sends made before the session exists go out in order once it does
//! - **Credential stamping**: token, refresh token and session id on every frame
//! - **Retry and reconnect**: failed sends are retried, queued sends reopen the socket
//! - **Keepalive**: periodic `keepalive` while authenticated
//! - **Routing**: inbound frames reach feature handlers by route key
//!
//! ## Modules
//!
//! - [`connection`]: Lifecycle, handshake, send queue and keepalive
//! - [`router`]: Route key → handler table
//! - [`protocol`]: Wire envelope and close codes
//! - [`transport`]: Socket abstraction, WebSocket and in-memory
//! - [`recovery`]: Last-page key persisted across restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use growlink::{Config, Connection, Envelope, SessionEvent, WebSocketConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let conn = Connection::start(&config, Arc::new(WebSocketConnector::new()));
//!     let mut events = conn.subscribe();
//!
//!     conn.login("admin", "secret")?;
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::AuthComplete { .. } = event {
//!             conn.send(Envelope::new("seeds", "getInventory").component("getInventory"))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod handlers;
pub mod logging;
pub mod protocol;
pub mod recovery;
pub mod router;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, ConnectionSnapshot, ConnectionState, SessionError, SessionEvent};
pub use protocol::Envelope;
pub use router::{MessageHandler, MessageRouter};
pub use transport::{MemoryConnector, WebSocketConnector};
