//! Reconnecting connection manager
//!
//! `ConnectionManager` is an actor owning the current socket, the
//! outbound queue and the pending-call registry. Commands from `WsClient`
//! handles, socket notifications, retry ticks and call deadlines are
//! processed one at a time in `run`, so no state is shared or locked.
//!
//! State machine: Disconnected -> Connecting (attempt) -> Connected
//! (open notification) -> Disconnected (close or error notification).
//! While not connected a repeating timer attempts a new connection every
//! `reconnect_interval`; it is cancelled when a socket opens and restarted
//! when one closes or errors.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::ClientConfig;
use crate::connector::TungsteniteConnector;
use crate::event::ClientEvent;
use crate::message::Payload;
use crate::pending::{Continuation, PendingCalls, PendingReply};
use crate::queue::OutboundQueue;
use crate::transport::{Connector, NoticeSender, Socket, SocketEvent};
use crate::types::ConnectionState;

/// Lower bound for the retry period
const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(10);

/// Commands sent from handles to the connection manager
#[derive(Debug)]
enum ClientCommand {
    /// Start (or restart) the connect loop
    Init,
    /// Fire-and-forget text
    Send(String),
    /// Text expecting a correlated reply
    Request {
        payload: String,
        correlation_id: String,
        timeout: Duration,
        continuation: Continuation,
    },
    /// Deliver a reply for a pending call
    Resolve {
        correlation_id: String,
        value: Value,
    },
    /// Drop the current socket and connect now
    Reconnect,
    /// Close the current socket
    Disconnect,
    /// Stop the manager
    Shutdown,
}

/// The socket currently owned by the manager
struct CurrentSocket {
    id: u64,
    socket: Box<dyn Socket>,
}

/// Connection manager actor
struct ConnectionManager {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    notice_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
    notice_rx: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    state: watch::Sender<ConnectionState>,
    socket: Option<CurrentSocket>,
    next_socket_id: u64,
    retry: Option<Interval>,
    queue: OutboundQueue,
    pending: PendingCalls,
}

impl ConnectionManager {
    fn new(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            commands,
            notice_tx,
            notice_rx,
            state,
            socket: None,
            next_socket_id: 0,
            retry: None,
            queue: OutboundQueue::new(),
            pending: PendingCalls::new(),
        }
    }

    /// Run the manager event loop until shutdown or all handles are dropped
    async fn run(mut self) {
        debug!("Connection manager started for {}", self.config.url);

        loop {
            let deadline = self.pending.next_deadline();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some((socket_id, event)) = self.notice_rx.recv() => {
                    self.handle_notice(socket_id, event);
                }
                _ = next_retry(&mut self.retry) => {
                    debug!("Retry timer fired");
                    self.connect();
                }
                _ = sleep_until(deadline) => self.expire_calls(),
            }
        }

        self.stop();
        info!("Connection manager stopped");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Init => {
                info!("Starting connect loop for {}", self.config.url);
                self.connect();
                self.start_retry();
            }
            ClientCommand::Send(text) => self.send(text),
            ClientCommand::Request {
                payload,
                correlation_id,
                timeout,
                continuation,
            } => {
                if correlation_id.is_empty() {
                    warn!("Request sent with an empty correlation id");
                }
                let deadline = Instant::now() + timeout;
                if self
                    .pending
                    .register(correlation_id.clone(), continuation, deadline)
                {
                    debug!("Pending call '{}' replaced", correlation_id);
                }
                self.send(payload);
            }
            ClientCommand::Resolve {
                correlation_id,
                value,
            } => self.resolve(&correlation_id, value),
            ClientCommand::Reconnect => {
                info!("Reconnect requested");
                self.connect();
                self.start_retry();
            }
            ClientCommand::Disconnect => match &self.socket {
                Some(current) => {
                    debug!("Closing socket {}", current.id);
                    current.socket.close(None, None);
                }
                None => debug!("Disconnect requested with no socket"),
            },
            ClientCommand::Shutdown => {}
        }
    }

    /// Process a notification from a socket
    ///
    /// Notifications from any socket other than the current one are stale
    /// and ignored.
    fn handle_notice(&mut self, socket_id: u64, event: SocketEvent) {
        let is_current = self
            .socket
            .as_ref()
            .is_some_and(|current| current.id == socket_id);
        if !is_current {
            trace!("Ignoring {:?} from stale socket {}", event, socket_id);
            return;
        }

        match event {
            SocketEvent::Opened => {
                info!("Connected to {}", self.config.url);
                self.retry = None;
                self.set_state(ConnectionState::Connected);
                self.flush_queue();
                self.config.callbacks.dispatch(&ClientEvent::Open);
            }
            SocketEvent::Message(text) => self.handle_inbound(text),
            SocketEvent::Closed { code, reason } => {
                info!("Connection closed (code {:?}): {}", code, reason);
                self.socket = None;
                self.set_state(ConnectionState::Disconnected);
                self.start_retry();
                self.config
                    .callbacks
                    .dispatch(&ClientEvent::Close { code, reason });
            }
            SocketEvent::Error(description) => {
                warn!("Connection error: {}", description);
                if let Some(current) = self.socket.take() {
                    current.socket.close(None, None);
                }
                self.set_state(ConnectionState::Disconnected);
                self.start_retry();
                self.config
                    .callbacks
                    .dispatch(&ClientEvent::Error(description));
            }
        }
    }

    /// Route an inbound message to a pending call or the message callback
    fn handle_inbound(&mut self, text: String) {
        if let Some(extractor) = &self.config.correlation {
            if let Some((correlation_id, value)) = extractor.extract(&text) {
                if self.pending.resolve(&correlation_id, value) {
                    trace!("Inbound reply resolved '{}'", correlation_id);
                    return;
                }
            }
        }
        self.config.callbacks.dispatch(&ClientEvent::Message(text));
    }

    /// Close any current socket and open a new one
    fn connect(&mut self) {
        if let Some(previous) = self.socket.take() {
            debug!("Closing socket {} before reconnecting", previous.id);
            previous.socket.close(None, None);
        }

        self.next_socket_id += 1;
        let id = self.next_socket_id;
        let notices = NoticeSender::new(id, self.notice_tx.clone());
        let socket = self.connector.open(&self.config.url, notices);

        debug!("Opened socket {} to {}", id, self.config.url);
        self.socket = Some(CurrentSocket { id, socket });
        self.set_state(ConnectionState::Connecting);
    }

    /// (Re)start the retry timer; the first tick is one period from now
    fn start_retry(&mut self) {
        let period = self.config.reconnect_interval.max(MIN_RECONNECT_INTERVAL);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.retry = Some(interval);
    }

    /// Forward when connected, otherwise queue or drop
    ///
    /// A socket that is already closing refuses the message; it is then
    /// handled as if disconnected.
    fn send(&mut self, text: String) {
        if self.connection_state() == ConnectionState::Connected {
            if let Some(current) = &self.socket {
                if current.socket.send(text.clone()) {
                    return;
                }
                debug!("Socket {} refused a message", current.id);
            }
        }

        if self.config.queue_messages {
            trace!("Queueing message while disconnected");
            self.queue.push(text, Instant::now());
        } else {
            trace!("Dropping message while disconnected");
        }
    }

    fn resolve(&mut self, correlation_id: &str, value: Value) {
        if !self.pending.resolve(correlation_id, value) {
            warn!(
                "No pending call for '{}' (already timed out or never sent)",
                correlation_id
            );
        }
    }

    fn expire_calls(&mut self) {
        for correlation_id in self.pending.expire(Instant::now()) {
            debug!("Pending call '{}' timed out", correlation_id);
        }
    }

    /// Replay queued messages on a fresh connection
    fn flush_queue(&mut self) {
        let flush = self.queue.flush(Instant::now(), self.config.max_queue_age);
        if flush.expired > 0 {
            debug!("Dropped {} expired queued messages", flush.expired);
        }
        if flush.fresh.is_empty() {
            return;
        }

        debug!("Replaying {} queued messages", flush.fresh.len());
        if let Some(current) = &self.socket {
            for text in flush.fresh {
                current.socket.send(text);
            }
        }
    }

    fn stop(&mut self) {
        self.retry = None;
        if let Some(current) = self.socket.take() {
            current.socket.close(None, None);
        }
        self.pending.cancel_all();
        self.set_state(ConnectionState::Disconnected);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn next_retry(retry: &mut Option<Interval>) {
    match retry {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a connection manager
///
/// Cheap to clone; every clone talks to the same manager. The manager
/// stops when `shutdown` is called or the last handle is dropped.
#[derive(Clone)]
pub struct WsClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl WsClient {
    /// Spawn a manager dialing real WebSocket URLs
    ///
    /// Must be called inside a tokio runtime. Nothing connects until `init`.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, TungsteniteConnector)
    }

    /// Spawn a manager over a custom transport
    pub fn with_connector(config: ClientConfig, connector: impl Connector) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let span = info_span!("ws_client", name = %config.name);
        let manager = ConnectionManager::new(config, Box::new(connector), cmd_rx, state_tx);
        tokio::spawn(manager.run().instrument(span));

        Self {
            commands: cmd_tx,
            state: state_rx,
        }
    }

    /// Begin the connect loop; calling again restarts it
    pub fn init(&self) {
        self.command(ClientCommand::Init);
    }

    /// Send now if connected, otherwise queue (or drop if queueing is off)
    pub fn send(&self, payload: impl Into<Payload>) {
        self.command(ClientCommand::Send(payload.into().into_text()));
    }

    /// Send and wait for a correlated reply
    ///
    /// The returned future yields the value passed to the matching
    /// `resolve`, or `None` after `timeout`.
    pub fn send_with_correlation(
        &self,
        payload: impl Into<Payload>,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> PendingReply {
        let (continuation, reply) = PendingReply::channel();
        self.command(ClientCommand::Request {
            payload: payload.into().into_text(),
            correlation_id: correlation_id.into(),
            timeout,
            continuation,
        });
        reply
    }

    /// Complete the pending call for `correlation_id`
    pub fn resolve(&self, correlation_id: impl Into<String>, value: impl Into<Value>) {
        self.command(ClientCommand::Resolve {
            correlation_id: correlation_id.into(),
            value: value.into(),
        });
    }

    /// Close the current socket and connect immediately
    pub fn reconnect(&self) {
        self.command(ClientCommand::Reconnect);
    }

    /// Close the current socket; the retry loop keeps running
    pub fn disconnect(&self) {
        self.command(ClientCommand::Disconnect);
    }

    /// Stop the manager, closing the socket and failing pending calls
    pub fn shutdown(&self) {
        self.command(ClientCommand::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the manager reaches `state`
    ///
    /// Returns false if the manager stopped first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> bool {
        let mut receiver = self.state.clone();
        let reached = receiver.wait_for(|current| *current == state).await.is_ok();
        reached
    }

    fn command(&self, cmd: ClientCommand) {
        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(cmd) {
            warn!("Connection manager stopped, dropping {:?}", cmd);
            if let ClientCommand::Request { continuation, .. } = cmd {
                let _ = continuation.send(None);
            }
        }
    }
}
