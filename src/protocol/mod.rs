//! Wire Protocol
//!
//! Defines the JSON envelope exchanged with the backend and the close-code
//! vocabulary of the underlying socket.
//!
//! ## Schema
//!
//! Every frame is one JSON object. `route` selects the feature handler,
//! `type` the message kind within it, `component`/`subComponent` qualify the
//! kind. `token`, `refreshToken`, `sessionID` and `timestamp` are written by
//! the connection right before a frame leaves; callers never set them.
//!
//! ```json
//! {"route": "seeds", "type": "getInventory", "component": "getInventory",
//!  "token": "...", "sessionID": "...", "timestamp": 1699000000000}
//! ```

pub mod close_code;
mod envelope;

pub use envelope::{
    AuthOutcome, Authentication, ControlKind, Envelope, COMPONENT_ACTIVE, COMPONENT_AUTHENTICATE,
    KIND_AUTH, KIND_GET_PAGELET, KIND_INITIALIZE, KIND_KEEPALIVE,
};
