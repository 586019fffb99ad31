//! Basic type definitions shared by the client and the server
//!
//! - `SessionId`: UUID-based unique session identifier
//! - `ConnectionState`: client connection manager state
//! - `ReadyState`: transport socket ready state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

/// Unique server session identifier (newtype pattern)
///
/// Wraps a UUID v4. Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Client connection manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Ready state of a transport socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Ready state shared between a socket handle and its I/O task
#[derive(Debug, Clone)]
pub struct SharedReadyState(Arc<AtomicU8>);

impl SharedReadyState {
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `Connecting` to `Open`
    ///
    /// Fails if a close was requested while the handshake was running.
    pub fn mark_open(&self) -> bool {
        self.0
            .compare_exchange(
                ReadyState::Connecting as u8,
                ReadyState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closing` unless the socket is already closing or closed
    ///
    /// Returns true if this call performed the transition.
    pub fn begin_close(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ReadyState::from_u8(current) {
                    ReadyState::Connecting | ReadyState::Open => {
                        Some(ReadyState::Closing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok()
    }
}

/// Parse a `Sec-WebSocket-Protocol` header value
///
/// Entries are comma-separated and trimmed; empty entries are dropped.
pub fn parse_sub_protocols(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_sub_protocols() {
        assert_eq!(
            parse_sub_protocols(" chat , ,json,  "),
            vec!["chat".to_string(), "json".to_string()]
        );
        assert!(parse_sub_protocols("").is_empty());
        assert!(parse_sub_protocols(" , ").is_empty());
    }

    #[test]
    fn test_ready_state_begin_close_once() {
        let state = SharedReadyState::new(ReadyState::Open);
        assert!(state.begin_close());
        assert_eq!(state.get(), ReadyState::Closing);
        assert!(!state.begin_close());

        state.set(ReadyState::Closed);
        assert!(!state.begin_close());
        assert_eq!(state.get(), ReadyState::Closed);
    }
}
