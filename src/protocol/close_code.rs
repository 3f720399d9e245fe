//! WebSocket close codes
//!
//! Human-readable meanings for the standard close codes. Used for
//! diagnostics only; no connection behaviour depends on the code.

/// Normal closure
pub const NORMAL: u16 = 1000;
/// Endpoint going away, used when the client shuts down
pub const GOING_AWAY: u16 = 1001;
/// Close frame without a status code
pub const NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const ABNORMAL: u16 = 1006;

/// Describe a close code
pub fn describe(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "An endpoint is \"going away\", such as a server going down or a client navigating away",
        1002 => "Terminating the connection due to a protocol error",
        1003 => "Terminating the connection because it has received a type of data it cannot accept",
        1004 => "Reserved. The specific meaning might be defined in the future",
        1005 => "No status code was actually present",
        1006 => "The connection was closed abnormally",
        1007 => "Terminating the connection because it has received data within a message that was not consistent with the type of the message",
        1008 => "Terminating the connection because it has received a message that \"violates its policy\"",
        1009 => "Terminating the connection because it has received a message that is too big for it to process",
        1010 => "Client is terminating the connection because it expected the server to negotiate one or more extensions, but the server didn't return them in the handshake response",
        1011 => "Server is terminating the connection because it encountered an unexpected condition that prevented it from fulfilling the request",
        1012 => "Server is restarting",
        1013 => "Server is terminating the connection due to a temporary condition, try again later",
        1014 => "Gateway or proxy received an invalid response from the upstream server",
        1015 => "Closed due to a failure to perform a TLS handshake (e.g., the server certificate can't be verified)",
        _ => "Unknown error code",
    }
}
