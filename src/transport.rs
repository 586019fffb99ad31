//! Transport socket capability
//!
//! A socket is a duplex text channel with `send`, `close` and a ready
//! state. Its I/O task reports open/close/message/error notifications
//! back to whoever owns it, tagged with a socket id so notifications
//! from a replaced socket can be told apart from the current one.

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{ReadyState, SharedReadyState};

/// Notification raised by a socket's I/O task
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Closed { code: Option<u16>, reason: String },
    Message(String),
    Error(String),
}

/// Handle to one live socket
pub trait Socket: Send + Sync {
    /// Queue text for sending; false if the socket can no longer send
    fn send(&self, text: String) -> bool;

    /// Start closing the socket; a no-op once closing or closed
    fn close(&self, code: Option<u16>, reason: Option<String>);

    fn ready_state(&self) -> ReadyState;
}

/// Sender side of a socket's notification channel
#[derive(Debug, Clone)]
pub struct NoticeSender {
    socket_id: u64,
    tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl NoticeSender {
    pub fn new(socket_id: u64, tx: mpsc::UnboundedSender<(u64, SocketEvent)>) -> Self {
        Self { socket_id, tx }
    }

    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    pub fn notify(&self, event: SocketEvent) {
        if self.tx.send((self.socket_id, event)).is_err() {
            debug!("Notice receiver gone for socket {}", self.socket_id);
        }
    }
}

/// Opens client sockets
///
/// `open` returns immediately with a socket in `Connecting` state; the
/// outcome arrives later through `notices`.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str, notices: NoticeSender) -> Box<dyn Socket>;
}

/// Frame queued for a socket's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: Option<u16>, reason: String },
}

/// Socket backed by an mpsc channel to a writer task
#[derive(Debug, Clone)]
pub struct ChannelSocket {
    sender: mpsc::UnboundedSender<Outbound>,
    state: SharedReadyState,
}

impl ChannelSocket {
    pub fn new(state: ReadyState) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let socket = Self {
            sender,
            state: SharedReadyState::new(state),
        };
        (socket, receiver)
    }

    /// Ready state shared with the I/O task
    pub fn shared_state(&self) -> SharedReadyState {
        self.state.clone()
    }
}

impl Socket for ChannelSocket {
    fn send(&self, text: String) -> bool {
        if self.state.get() != ReadyState::Open {
            return false;
        }
        self.sender.send(Outbound::Text(text)).is_ok()
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
        if !self.state.begin_close() {
            return;
        }
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.unwrap_or_default(),
        });
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }
}
