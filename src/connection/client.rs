//! Connection handle

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use super::error::{SessionError, SessionResult};
use super::events::SessionEvent;
use super::state::{ConnectionSnapshot, ConnectionState};
use super::task::{Command, ConnectionTask, Outputs};
use crate::config::Config;
use crate::protocol::{Envelope, COMPONENT_AUTHENTICATE, KIND_AUTH, KIND_GET_PAGELET};
use crate::router::{MessageHandler, MessageRouter};
use crate::transport::Connector;

const EVENT_CAPACITY: usize = 64;

/// Handle to a running connection.
///
/// Cheap to clone. The connection keeps running while any handle is alive
/// or until [`close`](Connection::close) is called.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    route: String,
}

impl Connection {
    /// Start a connection with no feature handlers and open the first socket
    pub fn start(config: &Config, connector: Arc<dyn Connector>) -> Self {
        Self::start_with_router(config, connector, MessageRouter::new())
    }

    /// Start a connection with handlers registered up front
    pub fn start_with_router(
        config: &Config,
        connector: Arc<dyn Connector>,
        router: MessageRouter,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(ConnectionSnapshot::default());

        let task = ConnectionTask::new(
            config.endpoint.url(),
            config.session.clone(),
            config.recovery.clone(),
            connector,
            router,
            Outputs {
                events: events.clone(),
                snapshot: snapshot_tx,
                commands: command_tx.downgrade(),
            },
            socket_tx,
        );
        tokio::spawn(task.run(command_rx, socket_rx));

        Self {
            commands: command_tx,
            events,
            snapshot,
            route: config.session.route.clone(),
        }
    }

    fn command(&self, command: Command) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Stopped)
    }

    /// Send an envelope, queueing it until the session is established.
    ///
    /// Credentials and timestamp are stamped at transmission time, replacing
    /// whatever the caller put in those fields.
    pub fn send(&self, envelope: Envelope) -> SessionResult<()> {
        self.command(Command::Send(envelope))
    }

    /// Register the handler for a route; the last registration wins
    pub fn register_handler(
        &self,
        route: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SessionResult<()> {
        self.command(Command::Register {
            route: route.into(),
            handler,
        })
    }

    pub fn unregister_handler(&self, route: impl Into<String>) -> SessionResult<()> {
        self.command(Command::Unregister(route.into()))
    }

    /// Ask the server to authenticate a user
    pub fn login(&self, id: &str, password: &str) -> SessionResult<()> {
        tracing::debug!(user = %id, "Sending login");
        self.send(
            Envelope::new(self.route.clone(), KIND_AUTH)
                .component(COMPONENT_AUTHENTICATE)
                .authentication(id, password),
        )
    }

    /// Request the page fragment for a page type
    pub fn get_pagelet(&self, page_type: &str) -> SessionResult<()> {
        self.send(Envelope::new(self.route.clone(), KIND_GET_PAGELET).component(page_type))
    }

    /// Close the socket and stop the connection for good
    pub fn close(&self) -> SessionResult<()> {
        self.command(Command::Close)
    }

    /// Receive session events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Receiver that sees every published snapshot
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> SessionResult<ConnectionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Route of the connection's control messages
    pub fn route(&self) -> &str {
        &self.route
    }
}
