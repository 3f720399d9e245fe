//! Message Envelope
//!
//! The single structured message unit exchanged with the backend. The same
//! type is used in both directions: outbound envelopes are built by feature
//! code, stamped by the connection and serialized; inbound frames are parsed
//! into it and routed on `route`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::connection::Credentials;

/// Message kind of an authentication exchange
pub const KIND_AUTH: &str = "auth";
/// Message kind carrying the server-assigned session id
pub const KIND_INITIALIZE: &str = "initialize";
/// Message kind of the liveness echo
pub const KIND_KEEPALIVE: &str = "keepalive";
/// Message kind used to fetch a pagelet and trigger client-side routing
pub const KIND_GET_PAGELET: &str = "getPagelet";

/// Component of an outbound login request
pub const COMPONENT_AUTHENTICATE: &str = "authenticate";
/// Component of an outbound keepalive
pub const COMPONENT_ACTIVE: &str = "active";

/// A tagged message exchanged over the connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Feature handler this message belongs to
    #[serde(default)]
    pub route: String,

    /// Message kind within the route
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_component: Option<String>,

    /// Kind-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Server-reported error; short-circuits normal handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(
        rename = "sessionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,

    /// Epoch milliseconds, set on transmission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Set by the server on an approved login for privileged users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,

    /// Token expiry reported by the server, epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_till: Option<i64>,
}

/// Login credentials carried by an `auth`/`authenticate` request
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub id: String,
    pub password: String,
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("id", &self.id)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Envelope {
    /// Create an envelope for a route and message kind
    pub fn new(route: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Set the component
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Set the sub-component
    pub fn sub_component(mut self, sub_component: impl Into<String>) -> Self {
        self.sub_component = Some(sub_component.into());
        self
    }

    /// Attach a payload
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach login credentials
    pub fn authentication(mut self, id: impl Into<String>, password: impl Into<String>) -> Self {
        self.authentication = Some(Authentication {
            id: id.into(),
            password: password.into(),
        });
        self
    }

    /// Overwrite the server-facing fields with the current credentials.
    ///
    /// Whatever the caller put in `token`, `refreshToken` or `sessionID` is
    /// replaced; absent credentials are left out of the frame.
    pub fn stamp(&mut self, credentials: &Credentials, now_ms: i64) {
        self.token = credentials.access_token.clone();
        self.refresh_token = credentials.refresh_token.clone();
        self.session_id = credentials.session_id.clone();
        self.timestamp = Some(now_ms);
    }

    /// Qualifier of an `auth` message.
    ///
    /// The outcome lives in `subComponent` when the server also names the
    /// request in `component`, otherwise in `component`.
    pub fn auth_outcome(&self) -> AuthOutcome {
        let raw = self
            .sub_component
            .as_deref()
            .or(self.component.as_deref())
            .unwrap_or_default();
        AuthOutcome::parse(raw)
    }

    /// Control kind of this envelope when it targets the connection itself
    pub fn control_kind(&self) -> ControlKind {
        ControlKind::parse(&self.kind)
    }
}

/// Message kinds the connection interprets itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    Auth,
    Initialize,
    Keepalive,
    GetPagelet,
    Unknown(String),
}

impl ControlKind {
    pub fn parse(kind: &str) -> Self {
        if kind.eq_ignore_ascii_case(KIND_AUTH) {
            ControlKind::Auth
        } else if kind.eq_ignore_ascii_case(KIND_INITIALIZE) {
            ControlKind::Initialize
        } else if kind.eq_ignore_ascii_case(KIND_KEEPALIVE) {
            ControlKind::Keepalive
        } else if kind.eq_ignore_ascii_case(KIND_GET_PAGELET) {
            ControlKind::GetPagelet
        } else {
            ControlKind::Unknown(kind.to_string())
        }
    }
}

/// Result of an authentication exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Approved,
    Refresh,
    Denied,
    Unknown(String),
}

impl AuthOutcome {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "approved" => AuthOutcome::Approved,
            "refresh" => AuthOutcome::Refresh,
            "denied" => AuthOutcome::Denied,
            _ => AuthOutcome::Unknown(raw.to_string()),
        }
    }
}
