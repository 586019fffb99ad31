//! Server session registry
//!
//! Owns one entry per accepted connection: the socket handle plus the
//! subprotocols requested at upgrade time. Sessions are kept in
//! registration order so broadcasts iterate deterministically.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::event::SessionInfo;
use crate::transport::Socket;
use crate::types::{ReadyState, SessionId};

/// One accepted connection
pub struct ServerSession {
    pub id: SessionId,
    socket: Box<dyn Socket>,
    /// Requested subprotocols, in header order
    pub sub_protocols: Vec<String>,
    pub connected_at: Instant,
}

impl ServerSession {
    /// Subprotocol used for addressing
    ///
    /// Only the first negotiated subprotocol takes part in filtering.
    pub fn primary_sub_protocol(&self) -> Option<&str> {
        self.sub_protocols.first().map(String::as_str)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.socket.ready_state()
    }

    /// Time since registration
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// True if the socket is open and the subprotocol filter matches
    pub fn accepts(&self, sub_protocol: Option<&str>) -> bool {
        if self.ready_state() != ReadyState::Open {
            return false;
        }
        match sub_protocol {
            Some(wanted) => self.primary_sub_protocol() == Some(wanted),
            None => true,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            sub_protocols: self.sub_protocols.clone(),
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("sub_protocols", &self.sub_protocols)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// SessionId -> ServerSession, in registration order
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, ServerSession>,
    order: Vec<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket under a freshly generated id
    pub fn register(&mut self, socket: Box<dyn Socket>, sub_protocols: Vec<String>) -> SessionId {
        let id = loop {
            let id = SessionId::new();
            if !self.sessions.contains_key(&id) {
                break id;
            }
        };

        self.sessions.insert(
            id,
            ServerSession {
                id,
                socket,
                sub_protocols,
                connected_at: Instant::now(),
            },
        );
        self.order.push(id);
        debug!("Session {} registered ({} total)", id, self.sessions.len());
        id
    }

    /// Remove a session without touching its socket
    pub fn remove(&mut self, id: SessionId) -> Option<ServerSession> {
        let session = self.sessions.remove(&id)?;
        self.order.retain(|existing| *existing != id);
        debug!(
            "Session {} removed after {:?} ({} total)",
            id,
            session.connected_for(),
            self.sessions.len()
        );
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&ServerSession> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Session ids in registration order
    pub fn ids(&self) -> &[SessionId] {
        &self.order
    }

    /// Session descriptors in registration order
    pub fn infos(&self) -> Vec<SessionInfo> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(ServerSession::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deliver to one session
    ///
    /// False if the session is unknown, its socket is not open, or its
    /// primary subprotocol does not match `sub_protocol`.
    pub fn send_message(&self, payload: &str, id: SessionId, sub_protocol: Option<&str>) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        if !session.accepts(sub_protocol) {
            return false;
        }
        session.socket.send(payload.to_string())
    }

    /// Close a session's socket and remove it immediately
    pub fn disconnect(
        &mut self,
        id: SessionId,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Option<SessionInfo> {
        let Some(session) = self.remove(id) else {
            warn!("Disconnect requested for unknown session {}", id);
            return None;
        };
        session.socket.close(code, reason);
        Some(session.info())
    }

    /// Close and remove every session
    pub fn disconnect_all(&mut self, code: Option<u16>, reason: &str) -> Vec<SessionInfo> {
        let ids = std::mem::take(&mut self.order);
        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .map(|session| {
                session.socket.close(code, Some(reason.to_string()));
                session.info()
            })
            .collect()
    }
}
