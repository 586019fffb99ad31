//! Notifications delivered to application code
//!
//! The client reports four kinds of notification as one tagged
//! `ClientEvent`; the server reports lifecycle/session changes as
//! `ServerEvent` and inbound messages separately.

use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::types::SessionId;

/// Client connection notification
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket opened
    Open,
    /// Socket closed by either side
    Close { code: Option<u16>, reason: String },
    /// Text message that did not resolve a pending call
    Message(String),
    /// Transport error; the socket is dropped and the retry loop takes over
    Error(String),
}

type ClientHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// The four client callbacks, each independently optional
///
/// Absent callbacks log the event at trace level.
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub on_open: Option<ClientHandler>,
    pub on_close: Option<ClientHandler>,
    pub on_message: Option<ClientHandler>,
    pub on_error: Option<ClientHandler>,
}

impl ClientCallbacks {
    /// Route an event to its callback
    pub fn dispatch(&self, event: &ClientEvent) {
        let handler = match event {
            ClientEvent::Open => &self.on_open,
            ClientEvent::Close { .. } => &self.on_close,
            ClientEvent::Message(_) => &self.on_message,
            ClientEvent::Error(_) => &self.on_error,
        };
        match handler {
            Some(handler) => handler(event),
            None => trace!("Unhandled client event: {:?}", event),
        }
    }
}

/// Public view of a server session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub sub_protocols: Vec<String>,
}

/// Discriminant of a server event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    ClientConnected,
    ClientDisconnected,
    Error,
    Started,
    Stopped,
}

/// Session or lifecycle change on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEvent {
    pub state: ServerState,
    pub session: Option<SessionInfo>,
    /// Human-readable detail (bound address, error description)
    pub detail: Option<String>,
}

impl ServerEvent {
    pub fn new(state: ServerState) -> Self {
        Self {
            state,
            session: None,
            detail: None,
        }
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type ServerEventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
pub type ServerMessageHandler = Arc<dyn Fn(&str, &SessionInfo) + Send + Sync>;

/// Server event and message callbacks
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    pub on_event: Option<ServerEventHandler>,
    pub on_message: Option<ServerMessageHandler>,
}

impl ServerCallbacks {
    pub fn event(&self, event: &ServerEvent) {
        match &self.on_event {
            Some(handler) => handler(event),
            None => trace!("Unhandled server event: {:?}", event),
        }
    }

    pub fn message(&self, text: &str, session: &SessionInfo) {
        match &self.on_message {
            Some(handler) => handler(text, session),
            None => trace!("Unhandled message from {}: {}", session.session_id, text),
        }
    }
}
