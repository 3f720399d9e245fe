//! Connection Task
//!
//! Owns the socket, credentials, router, pending queue and timers. Commands
//! from [`Connection`](super::Connection) handles, socket events and timer
//! firings are processed here one at a time, so no state is shared.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::SessionEvent;
use super::state::{ConnectionSnapshot, ConnectionState, Credentials};
use crate::config::{RecoveryConfig, SessionConfig};
use crate::protocol::{
    close_code, AuthOutcome, ControlKind, Envelope, COMPONENT_ACTIVE, KIND_GET_PAGELET,
    KIND_KEEPALIVE,
};
use crate::recovery::{RecoveryKey, RecoveryStore, HOME_PAGE};
use crate::router::{normalize_route, MessageHandler, MessageRouter};
use crate::transport::{Connector, FrameSink, TransportError, TransportEvent};

/// Requests processed by the connection task
pub(super) enum Command {
    Send(Envelope),
    Register {
        route: String,
        handler: Arc<dyn MessageHandler>,
    },
    Unregister(String),
    Retry {
        envelope: Envelope,
        attempt: u32,
    },
    KeepaliveTick,
    Reconnect,
    Close,
}

/// Event from the I/O task of one socket
pub(super) struct SocketEvent {
    socket: u64,
    kind: SocketEventKind,
}

enum SocketEventKind {
    Opened(Box<dyn FrameSink>),
    Transport(TransportEvent),
}

impl SocketEvent {
    fn transport(socket: u64, event: TransportEvent) -> Self {
        Self {
            socket,
            kind: SocketEventKind::Transport(event),
        }
    }
}

/// The one live socket
struct Socket {
    id: u64,
    /// Correlates log lines of one socket
    tag: String,
    /// Write half, present once the transport is open
    sink: Option<Box<dyn FrameSink>>,
    io: JoinHandle<()>,
}

/// Channels the task publishes on
pub(super) struct Outputs {
    pub events: broadcast::Sender<SessionEvent>,
    pub snapshot: watch::Sender<ConnectionSnapshot>,
    pub commands: mpsc::WeakUnboundedSender<Command>,
}

pub(super) struct ConnectionTask {
    url: String,
    route: String,
    config: SessionConfig,
    recovery_config: RecoveryConfig,
    recovery: Option<RecoveryStore>,
    connector: Arc<dyn Connector>,
    router: MessageRouter,

    state: ConnectionState,
    credentials: Credentials,
    location: String,
    socket: Option<Socket>,
    sockets_opened: u64,
    pending: VecDeque<Envelope>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    terminated: bool,

    outputs: Outputs,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
}

impl ConnectionTask {
    pub(super) fn new(
        url: String,
        config: SessionConfig,
        recovery_config: RecoveryConfig,
        connector: Arc<dyn Connector>,
        router: MessageRouter,
        outputs: Outputs,
        socket_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let recovery = recovery_config
            .enabled
            .then(|| RecoveryStore::new(&recovery_config.file));

        Self {
            url,
            route: normalize_route(&config.route),
            config,
            recovery_config,
            recovery,
            connector,
            router,
            state: ConnectionState::Disconnected,
            credentials: Credentials::default(),
            location: "/".to_string(),
            socket: None,
            sockets_opened: 0,
            pending: VecDeque::new(),
            keepalive: None,
            reconnect: None,
            reconnect_attempts: 0,
            terminated: false,
            outputs,
            socket_tx,
        }
    }

    /// Run until closed or every handle is dropped
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut sockets: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        self.open_socket().await;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = sockets.recv() => self.handle_socket_event(event).await,
            }
        }
    }

    /// Returns false once the task should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send(envelope) => self.submit(envelope, 1).await,
            Command::Retry { envelope, attempt } => self.submit(envelope, attempt).await,
            Command::Register { route, handler } => self.router.register(&route, handler),
            Command::Unregister(route) => {
                self.router.unregister(&route);
            }
            Command::KeepaliveTick => self.keepalive().await,
            Command::Reconnect => {
                self.reconnect = None;
                if self.state == ConnectionState::Disconnected && !self.pending.is_empty() {
                    self.open_socket().await;
                }
            }
            Command::Close => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Send now if the session is ready, otherwise queue until it is
    async fn submit(&mut self, envelope: Envelope, attempt: u32) {
        match self.state {
            ConnectionState::Ready => self.transmit(envelope, attempt).await,
            ConnectionState::Connecting | ConnectionState::Authenticating => self.defer(envelope),
            ConnectionState::Disconnected => {
                self.open_socket().await;
                self.defer(envelope);
            }
            ConnectionState::Closing => {
                tracing::debug!(route = %envelope.route, kind = %envelope.kind, "Dropping send during close");
            }
        }
    }

    fn defer(&mut self, envelope: Envelope) {
        tracing::debug!(
            route = %envelope.route,
            kind = %envelope.kind,
            queued = self.pending.len() + 1,
            "Session not established, queueing send"
        );
        self.pending.push_back(envelope);
        self.publish();
    }

    async fn transmit(&mut self, envelope: Envelope, attempt: u32) {
        let mut outgoing = envelope.clone();
        outgoing.stamp(&self.credentials, Utc::now().timestamp_millis());

        let text = match serde_json::to_string(&outgoing) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(route = %envelope.route, error = %e, "Failed to serialize message");
                return;
            }
        };

        let result = match self.socket.as_mut().and_then(|s| s.sink.as_mut()) {
            Some(sink) => sink.send_text(text).await,
            None => Err(TransportError::Closed),
        };

        match result {
            Ok(()) => {
                tracing::trace!(route = %envelope.route, kind = %envelope.kind, "Message sent");
            }
            Err(e) => {
                tracing::error!(
                    route = %envelope.route,
                    kind = %envelope.kind,
                    attempt,
                    error = %e,
                    "WebSocket send failed"
                );
                self.schedule_retry(envelope, attempt);
            }
        }
    }

    fn schedule_retry(&mut self, envelope: Envelope, attempt: u32) {
        let max = self.config.max_send_attempts;
        if max > 0 && attempt >= max {
            tracing::error!(
                route = %envelope.route,
                kind = %envelope.kind,
                attempts = attempt,
                "Giving up on send"
            );
            self.emit(SessionEvent::SendFailed {
                route: envelope.route,
                kind: envelope.kind,
                attempts: attempt,
            });
            return;
        }

        self.after(
            self.config.retry_delay(),
            Command::Retry {
                envelope,
                attempt: attempt + 1,
            },
        );
    }

    /// Post a command back to this task after a delay
    fn after(&self, delay: Duration, command: Command) -> JoinHandle<()> {
        let commands = self.outputs.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(command);
            }
        })
    }

    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::debug!(count = self.pending.len(), "Flushing queued sends");

        let queued: Vec<Envelope> = self.pending.drain(..).collect();
        for envelope in queued {
            self.submit(envelope, 1).await;
        }
        self.publish();
    }

    // ── Socket lifecycle ────────────────────────────────────────────────────

    /// Replace any existing socket with a new one
    async fn open_socket(&mut self) {
        if let Some(old) = self.socket.take() {
            close_socket(old).await;
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }

        self.sockets_opened += 1;
        let id = self.sockets_opened;
        let tag = Uuid::new_v4().to_string();
        tracing::info!(socket = %tag, url = %self.url, "Opening WebSocket");

        let io = tokio::spawn(run_socket(
            Arc::clone(&self.connector),
            self.url.clone(),
            id,
            self.socket_tx.clone(),
        ));

        self.socket = Some(Socket {
            id,
            tag,
            sink: None,
            io,
        });
        self.state = ConnectionState::Connecting;
        self.publish();
    }

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        let current = matches!(&self.socket, Some(socket) if socket.id == event.socket);
        if !current {
            if let SocketEventKind::Opened(mut sink) = event.kind {
                let _ = sink.close().await;
            }
            tracing::trace!(socket_id = event.socket, "Ignoring event from replaced socket");
            return;
        }

        match event.kind {
            SocketEventKind::Opened(sink) => {
                if let Some(socket) = self.socket.as_mut() {
                    tracing::info!(socket = %socket.tag, "WebSocket established");
                    socket.sink = Some(sink);
                }
                self.state = ConnectionState::Authenticating;
                self.publish();
            }
            SocketEventKind::Transport(TransportEvent::Text(text)) => self.handle_frame(&text).await,
            SocketEventKind::Transport(TransportEvent::Error(error)) => {
                tracing::error!(error = %error, "Web Socket received an error");
                self.teardown(close_code::ABNORMAL);
            }
            SocketEventKind::Transport(TransportEvent::Closed(code)) => self.teardown(code),
        }
    }

    /// Back to `Disconnected`: socket, credentials and keepalive are dropped
    fn teardown(&mut self, code: u16) {
        tracing::info!(code, reason = close_code::describe(code), "Web Socket Closed");

        if let Some(socket) = self.socket.take() {
            socket.io.abort();
        }
        self.credentials.clear();
        self.cancel_keepalive();
        self.state = ConnectionState::Disconnected;
        self.emit(SessionEvent::Closed { code });
        self.schedule_reconnect();
        self.publish();
    }

    /// Close our side after a denial and tear the session down
    async fn deny(&mut self) {
        tracing::error!("Auth denied");
        if let Some(sink) = self.socket.as_mut().and_then(|s| s.sink.as_mut()) {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "Close after denial failed");
            }
        }
        self.teardown(close_code::NORMAL);
    }

    fn schedule_reconnect(&mut self) {
        if self.pending.is_empty() || self.reconnect.is_some() {
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            tracing::error!(
                queued = self.pending.len(),
                "Max reconnect attempts reached, waiting for the next send"
            );
            return;
        }

        let delay = self.config.reconnect_delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        tracing::info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            queued = self.pending.len(),
            "Scheduling reconnect"
        );
        self.reconnect = Some(self.after(delay, Command::Reconnect));
    }

    async fn shutdown(&mut self) {
        tracing::info!("Closing connection");
        self.state = ConnectionState::Closing;
        self.publish();

        self.cancel_keepalive();
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
        if let Some(socket) = self.socket.take() {
            close_socket(socket).await;
        }
        if !self.pending.is_empty() {
            tracing::warn!(count = self.pending.len(), "Queued sends abandoned on close");
        }

        self.credentials.clear();
        self.state = ConnectionState::Disconnected;
        self.terminated = true;
        self.emit(SessionEvent::Closed {
            code: close_code::GOING_AWAY,
        });
        self.publish();
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    async fn handle_frame(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Received unparseable message");
                return;
            }
        };

        if normalize_route(&envelope.route) == self.route {
            self.handle_control(envelope).await;
            return;
        }

        if let Some(message) = envelope.error.clone() {
            tracing::warn!(route = %envelope.route, kind = %envelope.kind, error = %message, "Server reported an error");
            self.emit(SessionEvent::Notice {
                route: envelope.route,
                message,
            });
            return;
        }

        self.router.dispatch(&envelope.route, &envelope);
    }

    async fn handle_control(&mut self, envelope: Envelope) {
        match envelope.control_kind() {
            ControlKind::Auth => self.handle_auth(envelope).await,
            ControlKind::Initialize => self.handle_initialize(envelope).await,
            ControlKind::GetPagelet => self.handle_pagelet(envelope),
            ControlKind::Keepalive => {
                tracing::trace!(timestamp = ?envelope.timestamp, "Keepalive received");
            }
            ControlKind::Unknown(kind) => {
                tracing::error!(kind = %kind, "Unrecognized control message");
                self.deny().await;
            }
        }
    }

    async fn handle_initialize(&mut self, envelope: Envelope) {
        let Some(session_id) = envelope.session_id else {
            tracing::error!("No session id on initialize");
            return;
        };

        tracing::info!(session_id = %session_id, "Session established");
        self.credentials.session_id = Some(session_id.clone());
        self.state = ConnectionState::Ready;
        self.reconnect_attempts = 0;
        self.emit(SessionEvent::Established { session_id });
        self.publish();

        self.flush_pending().await;

        // approval may have arrived before initialize
        if self.credentials.is_authenticated() && self.keepalive.is_none() {
            self.keepalive().await;
        }
    }

    async fn handle_auth(&mut self, envelope: Envelope) {
        match envelope.auth_outcome() {
            AuthOutcome::Approved => {
                let Some(token) = envelope.token else {
                    tracing::error!("No token on approved authentication");
                    self.deny().await;
                    return;
                };

                let is_admin = envelope.is_admin.unwrap_or(false);
                tracing::info!(is_admin, "Authentication approved");
                self.credentials.access_token = Some(token);
                self.publish();

                self.keepalive().await;
                self.emit(SessionEvent::AuthComplete { is_admin });
                self.restore_last_page().await;
            }
            AuthOutcome::Refresh => match envelope.refresh_token {
                Some(refresh_token) => {
                    tracing::debug!("Refresh token rotated");
                    self.credentials.refresh_token = Some(refresh_token);
                    self.publish();
                }
                None => tracing::warn!("Refresh message without a refresh token"),
            },
            AuthOutcome::Denied => {
                tracing::error!("Authentication denied");
                self.notice_from(&envelope);
                self.deny().await;
            }
            AuthOutcome::Unknown(outcome) => {
                tracing::error!(outcome = %outcome, "Unrecognized authentication response");
                self.notice_from(&envelope);
                self.deny().await;
            }
        }
    }

    fn handle_pagelet(&mut self, envelope: Envelope) {
        if let Some(error) = envelope.error {
            tracing::error!(error = %error, "Pagelet request failed");
            self.location = "/".to_string();
            self.remember_page(HOME_PAGE);
            self.emit(SessionEvent::Notice {
                route: self.route.clone(),
                message: error,
            });
        } else {
            let component = envelope
                .component
                .unwrap_or_else(|| HOME_PAGE.to_string());
            tracing::debug!(component = %component, "Navigating");
            self.location = format!("/{}", component);
            self.remember_page(&component);
            self.emit(SessionEvent::Navigated {
                component,
                fragment: envelope.data,
            });
        }
        self.publish();
    }

    fn notice_from(&self, envelope: &Envelope) {
        if let Some(message) = &envelope.error {
            self.emit(SessionEvent::Notice {
                route: envelope.route.clone(),
                message: message.clone(),
            });
        }
    }

    // ── Keepalive ───────────────────────────────────────────────────────────

    /// Send a keepalive and arm the next tick, replacing any pending one
    async fn keepalive(&mut self) {
        self.cancel_keepalive();

        if self.state != ConnectionState::Ready || !self.credentials.is_authenticated() {
            tracing::debug!(state = %self.state, "Keepalive not armed");
            return;
        }

        let envelope = Envelope::new(self.route.clone(), KIND_KEEPALIVE).component(COMPONENT_ACTIVE);
        self.submit(envelope, 1).await;

        self.keepalive = Some(self.after(self.config.keepalive_interval(), Command::KeepaliveTick));
    }

    fn cancel_keepalive(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    fn remember_page(&self, page_type: &str) {
        if let Some(store) = &self.recovery {
            if let Err(e) = store.save(&RecoveryKey::now(page_type)) {
                tracing::warn!(path = ?store.path(), error = %e, "Failed to store last page");
            }
        }
    }

    async fn restore_last_page(&mut self) {
        if !self.recovery_config.restore_on_auth {
            return;
        }
        let Some(store) = &self.recovery else {
            return;
        };

        let max_age = Duration::from_secs(self.recovery_config.max_age_secs);
        match store.load_fresh(max_age) {
            Ok(Some(key)) => {
                tracing::info!(page = %key.page_type, "Restoring last page");
                let envelope =
                    Envelope::new(self.route.clone(), KIND_GET_PAGELET).component(key.page_type);
                self.submit(envelope, 1).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read last page"),
        }
    }

    // ── Outputs ─────────────────────────────────────────────────────────────

    fn emit(&self, event: SessionEvent) {
        tracing::debug!(event = event.name(), "Session event");
        // no subscribers is fine
        let _ = self.outputs.events.send(event);
    }

    fn publish(&self) {
        self.outputs.snapshot.send_replace(ConnectionSnapshot {
            state: self.state,
            credentials: self.credentials.clone(),
            location: self.location.clone(),
            pending_sends: self.pending.len(),
            sockets_opened: self.sockets_opened,
            terminated: self.terminated,
        });
    }
}

async fn close_socket(socket: Socket) {
    socket.io.abort();
    if let Some(mut sink) = socket.sink {
        if let Err(e) = sink.close().await {
            tracing::debug!(socket = %socket.tag, error = %e, "Close of replaced socket failed");
        }
    }
}

/// Connect, then forward everything the socket yields to the task.
///
/// Always ends with a `Closed` or `Error` event, including when the connect
/// fails. Either one ends the socket.
async fn run_socket(
    connector: Arc<dyn Connector>,
    url: String,
    id: u64,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let (sink, mut stream) = match connector.connect(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = events.send(SocketEvent::transport(id, TransportEvent::Error(e.to_string())));
            return;
        }
    };

    let opened = SocketEvent {
        socket: id,
        kind: SocketEventKind::Opened(sink),
    };
    if events.send(opened).is_err() {
        return;
    }

    while let Some(event) = stream.next_event().await {
        let last = matches!(event, TransportEvent::Closed(_) | TransportEvent::Error(_));
        if events.send(SocketEvent::transport(id, event)).is_err() || last {
            return;
        }
    }

    let _ = events.send(SocketEvent::transport(
        id,
        TransportEvent::Closed(close_code::ABNORMAL),
    ));
}
