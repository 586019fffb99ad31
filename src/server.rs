//! Relay server actor
//!
//! `ServerActor` owns the session registry and the listener task. Connection
//! handlers, the accept loop and `WsServer` handles talk to it only through
//! `ServerCommand`s, so registry state is never shared or locked.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broadcast::{deliver, Target};
use crate::config::ServerConfig;
use crate::error::{AppError, StartResult};
use crate::event::{ServerEvent, ServerState, SessionInfo};
use crate::handler::handle_connection;
use crate::message::Payload;
use crate::session::SessionRegistry;
use crate::transport::Socket;
use crate::types::SessionId;

/// Close code sent to sessions when the listener stops
pub(crate) const GOING_AWAY: u16 = 1001;

/// Delay between keep-alive bind attempts
const KEEP_ALIVE_RETRY: Duration = Duration::from_secs(1);

/// Commands processed by the server actor
pub(crate) enum ServerCommand {
    /// Bind the listener
    Start { reply: oneshot::Sender<StartResult> },
    /// Stop then start
    Restart { reply: oneshot::Sender<StartResult> },
    /// Stop for good; suppresses keep-alive restarts
    Shutdown { reply: oneshot::Sender<()> },
    /// New upgraded connection accepted by listener `generation`
    ///
    /// Replies `None` if that listener has since stopped.
    Register {
        generation: u64,
        socket: Box<dyn Socket>,
        sub_protocols: Vec<String>,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    /// Connection closed
    Unregister { session_id: SessionId },
    /// Connection failed
    SessionError {
        session_id: SessionId,
        description: String,
    },
    /// Text received from a session
    Inbound { session_id: SessionId, text: String },
    /// Outbound delivery
    Send {
        payload: String,
        target: Target,
        sub_protocol: Option<String>,
        reply: oneshot::Sender<usize>,
    },
    /// Close and forget one session
    Disconnect {
        session_id: SessionId,
        code: Option<u16>,
        reason: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    /// Snapshot of registered sessions
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    /// Address of the running listener
    LocalAddr {
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    /// Accept loop ended on its own
    ListenerFinished { generation: u64, error: String },
}

/// Running accept loop
struct ListenerTask {
    generation: u64,
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// The server actor
struct ServerActor {
    config: ServerConfig,
    registry: SessionRegistry,
    receiver: mpsc::UnboundedReceiver<ServerCommand>,
    /// Handed to accept loops; weak so dropped handles stop the actor
    sender: mpsc::WeakUnboundedSender<ServerCommand>,
    listener: Option<ListenerTask>,
    generation: u64,
    shutdown_requested: bool,
    /// Next keep-alive bind attempt after a failed restart
    rebind_at: Option<Instant>,
}

impl ServerActor {
    fn new(
        config: ServerConfig,
        receiver: mpsc::UnboundedReceiver<ServerCommand>,
        sender: mpsc::WeakUnboundedSender<ServerCommand>,
    ) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            receiver,
            sender,
            listener: None,
            generation: 0,
            shutdown_requested: false,
            rebind_at: None,
        }
    }

    /// Run the actor until every sender is dropped
    async fn run(mut self) {
        debug!("Server actor started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = sleep_until(self.rebind_at) => {
                    self.rebind_at = None;
                    self.keep_alive_restart().await;
                }
            }
        }

        self.stop().await;
        debug!("Server actor shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            ServerCommand::Restart { reply } => {
                info!("Restarting server");
                self.stop().await;
                let result = self.start().await;
                let _ = reply.send(result);
            }
            ServerCommand::Shutdown { reply } => {
                info!("Shutdown requested");
                self.shutdown_requested = true;
                self.rebind_at = None;
                self.stop().await;
                let _ = reply.send(());
            }
            ServerCommand::Register {
                generation,
                socket,
                sub_protocols,
                reply,
            } => self.handle_register(generation, socket, sub_protocols, reply),
            ServerCommand::Unregister { session_id } => {
                if let Some(session) = self.registry.remove(session_id) {
                    info!(
                        "Session {} disconnected after {:?}",
                        session_id,
                        session.connected_for()
                    );
                    self.emit(
                        ServerEvent::new(ServerState::ClientDisconnected)
                            .with_session(session.info()),
                    );
                }
            }
            ServerCommand::SessionError {
                session_id,
                description,
            } => {
                if let Some(session) = self.registry.remove(session_id) {
                    warn!("Session {} failed: {}", session_id, description);
                    let info = session.info();
                    self.emit(
                        ServerEvent::new(ServerState::Error)
                            .with_session(info.clone())
                            .with_detail(description),
                    );
                    self.emit(ServerEvent::new(ServerState::ClientDisconnected).with_session(info));
                }
            }
            ServerCommand::Inbound { session_id, text } => match self.registry.get(session_id) {
                Some(session) => self.config.callbacks.message(&text, &session.info()),
                None => debug!("Dropping message from unregistered session {}", session_id),
            },
            ServerCommand::Send {
                payload,
                target,
                sub_protocol,
                reply,
            } => {
                let delivered = deliver(&self.registry, &payload, &target, sub_protocol.as_deref());
                let _ = reply.send(delivered);
            }
            ServerCommand::Disconnect {
                session_id,
                code,
                reason,
                reply,
            } => {
                let disconnected = match self.registry.disconnect(session_id, code, reason) {
                    Some(info) => {
                        info!("Session {} disconnected by server", session_id);
                        self.emit(ServerEvent::new(ServerState::ClientDisconnected).with_session(info));
                        true
                    }
                    None => false,
                };
                let _ = reply.send(disconnected);
            }
            ServerCommand::Sessions { reply } => {
                let _ = reply.send(self.registry.infos());
            }
            ServerCommand::LocalAddr { reply } => {
                let _ = reply.send(self.listener.as_ref().map(|l| l.local_addr));
            }
            ServerCommand::ListenerFinished { generation, error } => {
                self.handle_listener_finished(generation, error).await;
            }
        }
    }

    fn handle_register(
        &mut self,
        generation: u64,
        socket: Box<dyn Socket>,
        sub_protocols: Vec<String>,
        reply: oneshot::Sender<Option<SessionId>>,
    ) {
        let accepting = self
            .listener
            .as_ref()
            .is_some_and(|listener| listener.generation == generation);
        if !accepting {
            debug!("Rejecting connection from stopped listener {}", generation);
            let _ = reply.send(None);
            return;
        }

        let session_id = self.registry.register(socket, sub_protocols);
        if reply.send(Some(session_id)).is_err() {
            // Handler went away mid-registration
            self.registry.remove(session_id);
            return;
        }

        if let Some(session) = self.registry.get(session_id) {
            let info = session.info();
            info!(
                "Session {} registered (subprotocols: {:?})",
                session_id, info.sub_protocols
            );
            self.emit(ServerEvent::new(ServerState::ClientConnected).with_session(info));
        }
    }

    async fn handle_listener_finished(&mut self, generation: u64, error: String) {
        let is_current = self
            .listener
            .as_ref()
            .is_some_and(|listener| listener.generation == generation);
        if !is_current {
            debug!("Ignoring finish of stale listener {}", generation);
            return;
        }

        if let Some(listener) = self.listener.take() {
            listener.handle.abort();
            let _ = listener.handle.await;
        }
        error!("Listener finished unexpectedly: {}", error);
        self.emit(ServerEvent::new(ServerState::Error).with_detail(error));

        self.keep_alive_restart().await;
    }

    /// Bring a dropped listener back if keep-alive is set
    ///
    /// A failed bind is retried every `KEEP_ALIVE_RETRY` until it succeeds
    /// or shutdown is requested.
    async fn keep_alive_restart(&mut self) {
        if !self.config.keep_alive || self.shutdown_requested || self.listener.is_some() {
            return;
        }

        info!("Keep-alive set, restarting listener");
        if let Err(e) = self.start().await {
            warn!(
                "Keep-alive restart failed, retrying in {:?}: {}",
                KEEP_ALIVE_RETRY, e
            );
            self.rebind_at = Some(Instant::now() + KEEP_ALIVE_RETRY);
        }
    }

    /// Bind and spawn the accept loop
    async fn start(&mut self) -> StartResult {
        if let Some(listener) = &self.listener {
            warn!("Server already running on {}", listener.local_addr);
            return Ok(listener.local_addr);
        }

        let addr = self.config.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", addr, e);
                self.emit(
                    ServerEvent::new(ServerState::Error)
                        .with_detail(format!("failed to bind {}: {}", addr, e)),
                );
                return Err(AppError::bind(addr, e));
            }
        };
        let local_addr = listener.local_addr()?;

        self.generation += 1;
        self.shutdown_requested = false;
        self.rebind_at = None;
        let handle = tokio::spawn(
            accept_loop(listener, self.generation, self.sender.clone()).in_current_span(),
        );
        self.listener = Some(ListenerTask {
            generation: self.generation,
            local_addr,
            handle,
        });

        info!("Listening on {}", local_addr);
        self.emit(ServerEvent::new(ServerState::Started).with_detail(local_addr.to_string()));
        Ok(local_addr)
    }

    /// Abort the accept loop and close every session
    ///
    /// Returns once the listening socket is released.
    async fn stop(&mut self) {
        let Some(listener) = self.listener.take() else {
            debug!("Stop requested while not running");
            return;
        };
        listener.handle.abort();
        let _ = listener.handle.await;

        for info in self.registry.disconnect_all(Some(GOING_AWAY), "server stopping") {
            self.emit(ServerEvent::new(ServerState::ClientDisconnected).with_session(info));
        }

        info!("Stopped listening on {}", listener.local_addr);
        self.emit(ServerEvent::new(ServerState::Stopped).with_detail(listener.local_addr.to_string()));
    }

    fn emit(&self, event: ServerEvent) {
        self.config.callbacks.event(&event);
    }
}

/// Accept connections until the listener fails
async fn accept_loop(
    listener: TcpListener,
    generation: u64,
    commands: mpsc::WeakUnboundedSender<ServerCommand>,
) {
    let error = loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(cmd_tx) = commands.upgrade() else {
                    return;
                };
                debug!("New connection from {}", addr);

                // Spawn handler task for each connection
                tokio::spawn(
                    async move {
                        if let Err(e) = handle_connection(stream, generation, cmd_tx).await {
                            error!("Connection handler error: {}", e);
                        }
                    }
                    .in_current_span(),
                );
            }
            Err(e) => break e,
        }
    };

    // Release the port before the actor rebinds it
    drop(listener);

    if let Some(cmd_tx) = commands.upgrade() {
        let _ = cmd_tx.send(ServerCommand::ListenerFinished {
            generation,
            error: error.to_string(),
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a server actor
///
/// Cheap to clone. The actor stops once every handle and every live
/// connection is gone.
#[derive(Clone)]
pub struct WsServer {
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl WsServer {
    /// Spawn the actor; nothing listens until `start`
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let span = info_span!("ws_server", name = %config.name);
        let actor = ServerActor::new(config, cmd_rx, cmd_tx.downgrade());
        tokio::spawn(actor.run().instrument(span));
        Self { commands: cmd_tx }
    }

    /// Bind the listener and start accepting
    pub async fn start(&self) -> Result<SocketAddr, AppError> {
        self.request(|reply| ServerCommand::Start { reply }).await?
    }

    /// Stop, closing every session, then start again
    pub async fn restart(&self) -> Result<SocketAddr, AppError> {
        self.request(|reply| ServerCommand::Restart { reply }).await?
    }

    /// Stop without keep-alive restarting the listener
    pub async fn shutdown(&self) {
        if let Err(e) = self.request(|reply| ServerCommand::Shutdown { reply }).await {
            warn!("Shutdown not delivered: {}", e);
        }
    }

    /// Send to one session
    pub async fn send_message(
        &self,
        payload: impl Into<Payload>,
        session_id: SessionId,
        sub_protocol: Option<&str>,
    ) -> bool {
        self.deliver(payload, Target::Session(session_id), sub_protocol)
            .await
            == 1
    }

    /// Send to every session; returns the number reached
    pub async fn send_message_to_all(
        &self,
        payload: impl Into<Payload>,
        sub_protocol: Option<&str>,
    ) -> usize {
        self.deliver(payload, Target::All, sub_protocol).await
    }

    /// Send to every session except `exclude`
    pub async fn send_message_to_others(
        &self,
        payload: impl Into<Payload>,
        exclude: SessionId,
        sub_protocol: Option<&str>,
    ) -> usize {
        self.deliver(payload, Target::Others(exclude), sub_protocol)
            .await
    }

    /// Send to the listed sessions
    pub async fn send_message_to_group(
        &self,
        payload: impl Into<Payload>,
        session_ids: Vec<SessionId>,
        sub_protocol: Option<&str>,
    ) -> usize {
        self.deliver(payload, Target::Group(session_ids), sub_protocol)
            .await
    }

    /// Close a session and drop it from the registry
    ///
    /// False if no such session exists.
    pub async fn disconnect_session(
        &self,
        session_id: SessionId,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> bool {
        let reason = reason.map(str::to_string);
        self.request(|reply| ServerCommand::Disconnect {
            session_id,
            code,
            reason,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Registered sessions in registration order
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.request(|reply| ServerCommand::Sessions { reply })
            .await
            .unwrap_or_default()
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.request(|reply| ServerCommand::LocalAddr { reply })
            .await
            .ok()
            .flatten()
    }

    async fn deliver(
        &self,
        payload: impl Into<Payload>,
        target: Target,
        sub_protocol: Option<&str>,
    ) -> usize {
        let payload = payload.into().into_text();
        let sub_protocol = sub_protocol.map(str::to_string);
        self.request(|reply| ServerCommand::Send {
            payload,
            target,
            sub_protocol,
            reply,
        })
        .await
        .unwrap_or(0)
    }

    /// Send a command and wait for its reply
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| AppError::ChannelSend)?;
        reply_rx.await.map_err(|_| AppError::ChannelSend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        server: WsServer,
        addr: SocketAddr,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        messages: mpsc::UnboundedReceiver<(String, SessionInfo)>,
    }

    impl Harness {
        async fn start(keep_alive: bool) -> Self {
            Self::start_on(0, keep_alive).await
        }

        async fn start_on(port: u16, keep_alive: bool) -> Self {
            let (event_tx, events) = mpsc::unbounded_channel();
            let (message_tx, messages) = mpsc::unbounded_channel();
            let config = ServerConfig::new("test", port)
                .host("127.0.0.1")
                .keep_alive(keep_alive)
                .on_event(move |event| {
                    let _ = event_tx.send(event.clone());
                })
                .on_message(move |text, session| {
                    let _ = message_tx.send((text.to_string(), session.clone()));
                });

            let server = WsServer::new(config);
            let addr = server.start().await.unwrap();
            let mut harness = Self {
                server,
                addr,
                events,
                messages,
            };
            assert_eq!(harness.next_event().await.state, ServerState::Started);
            harness
        }

        async fn next_event(&mut self) -> ServerEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn next_message(&mut self) -> (String, SessionInfo) {
            tokio::time::timeout(WAIT, self.messages.recv())
                .await
                .unwrap()
                .unwrap()
        }

        /// Connect a peer and wait for its session to register
        async fn connect(&mut self, protocols: Option<&str>) -> (Peer, SessionInfo) {
            let mut request = format!("ws://{}", self.addr).into_client_request().unwrap();
            if let Some(protocols) = protocols {
                request.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_str(protocols).unwrap(),
                );
            }
            let (peer, _) = tokio_tungstenite::connect_async(request).await.unwrap();

            let event = self.next_event().await;
            assert_eq!(event.state, ServerState::ClientConnected);
            (peer, event.session.unwrap())
        }
    }

    /// Upgrade request for peers speaking raw TCP
    const UPGRADE_HEAD: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    /// A loopback port that was free a moment ago
    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    }

    async fn next_text(peer: &mut Peer) -> String {
        loop {
            let msg = tokio::time::timeout(WAIT, peer.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return text.to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_messages() {
        let mut h = Harness::start(false).await;
        let (mut peer, session) = h.connect(Some("chat, json")).await;
        assert_eq!(session.sub_protocols, vec!["chat", "json"]);
        assert_eq!(h.server.sessions().await, vec![session.clone()]);

        peer.send(Message::Text("hello".into())).await.unwrap();
        let (text, from) = h.next_message().await;
        assert_eq!(text, "hello");
        assert_eq!(from.session_id, session.session_id);

        assert!(
            h.server
                .send_message("direct", session.session_id, Some("chat"))
                .await
        );
        assert_eq!(next_text(&mut peer).await, "direct");

        // Only the primary subprotocol is matched
        assert_eq!(h.server.send_message_to_all("x", Some("json")).await, 0);
        assert!(!h.server.send_message("x", SessionId::new(), None).await);

        peer.close(None).await.unwrap();
        let event = h.next_event().await;
        assert_eq!(event.state, ServerState::ClientDisconnected);
        assert_eq!(event.session.unwrap().session_id, session.session_id);
        assert!(h.server.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_others_and_group() {
        let mut h = Harness::start(false).await;
        let (mut a, sa) = h.connect(None).await;
        let (mut b, sb) = h.connect(None).await;
        let (mut c, _sc) = h.connect(None).await;

        let sent = h
            .server
            .send_message_to_others("from a", sa.session_id, None)
            .await;
        assert_eq!(sent, 2);
        assert_eq!(next_text(&mut b).await, "from a");
        assert_eq!(next_text(&mut c).await, "from a");

        let sent = h
            .server
            .send_message_to_group(
                serde_json::json!({"n": 1}),
                vec![sa.session_id, sb.session_id],
                None,
            )
            .await;
        assert_eq!(sent, 2);
        assert_eq!(next_text(&mut a).await, r#"{"n":1}"#);
        assert_eq!(next_text(&mut b).await, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_disconnect_session() {
        let mut h = Harness::start(false).await;
        let (mut peer, session) = h.connect(None).await;

        assert!(
            h.server
                .disconnect_session(session.session_id, Some(4000), Some("bye"))
                .await
        );
        let event = h.next_event().await;
        assert_eq!(event.state, ServerState::ClientDisconnected);
        assert!(h.server.sessions().await.is_empty());

        // Peer sees the close frame
        let msg = tokio::time::timeout(WAIT, peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        assert!(
            !h.server
                .disconnect_session(session.session_id, None, None)
                .await
        );
    }

    #[tokio::test]
    async fn test_plain_http_gets_501() {
        let h = Harness::start(false).await;
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 501"));
        assert!(h.server.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_closes_sessions() {
        let mut h = Harness::start(false).await;
        let (_peer, session) = h.connect(None).await;

        h.server.restart().await.unwrap();
        let event = h.next_event().await;
        assert_eq!(event.state, ServerState::ClientDisconnected);
        assert_eq!(event.session.unwrap().session_id, session.session_id);
        assert_eq!(h.next_event().await.state, ServerState::Stopped);
        assert_eq!(h.next_event().await.state, ServerState::Started);
        assert!(h.server.local_addr().await.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_restarts_listener() {
        let mut h = Harness::start(true).await;

        h.server
            .commands
            .send(ServerCommand::ListenerFinished {
                generation: 1,
                error: "accept failed".to_string(),
            })
            .unwrap();

        let event = h.next_event().await;
        assert_eq!(event.state, ServerState::Error);
        assert_eq!(event.detail.as_deref(), Some("accept failed"));
        assert_eq!(h.next_event().await.state, ServerState::Started);
        assert!(h.server.local_addr().await.is_some());
    }

    #[tokio::test]
    async fn test_no_restart_without_keep_alive() {
        let mut h = Harness::start(false).await;

        h.server
            .commands
            .send(ServerCommand::ListenerFinished {
                generation: 1,
                error: "accept failed".to_string(),
            })
            .unwrap();

        assert_eq!(h.next_event().await.state, ServerState::Error);
        assert!(h.server.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_not_restarted() {
        let mut h = Harness::start(true).await;
        h.server.shutdown().await;
        assert_eq!(h.next_event().await.state, ServerState::Stopped);

        // A late finish from the aborted listener is ignored
        h.server
            .commands
            .send(ServerCommand::ListenerFinished {
                generation: 1,
                error: "aborted".to_string(),
            })
            .unwrap();
        assert!(h.server.local_addr().await.is_none());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = WsServer::new(
            ServerConfig::new("test", port)
                .host("127.0.0.1")
                .on_event(move |event| {
                    let _ = event_tx.send(event.clone());
                }),
        );
        let result = server.start().await;
        assert!(matches!(result, Err(AppError::Bind { .. })));
        assert_eq!(events.recv().await.unwrap().state, ServerState::Error);
    }

    #[tokio::test]
    async fn test_restart_rebinds_same_port() {
        let port = free_port().await;
        let mut h = Harness::start_on(port, false).await;
        let (_peer, _session) = h.connect(None).await;

        for _ in 0..3 {
            let addr = h.server.restart().await.unwrap();
            assert_eq!(addr.port(), port);
            let mut states = Vec::new();
            while states.last() != Some(&ServerState::Started) {
                states.push(h.next_event().await.state);
            }
            assert!(states.contains(&ServerState::Stopped));
        }

        // Still accepting on the same address
        let (mut peer, session) = h.connect(None).await;
        assert!(h.server.send_message("again", session.session_id, None).await);
        assert_eq!(next_text(&mut peer).await, "again");
    }

    #[tokio::test]
    async fn test_keep_alive_rebinds_same_port() {
        let port = free_port().await;
        let mut h = Harness::start_on(port, true).await;

        h.server
            .commands
            .send(ServerCommand::ListenerFinished {
                generation: 1,
                error: "accept failed".to_string(),
            })
            .unwrap();

        assert_eq!(h.next_event().await.state, ServerState::Error);
        let started = h.next_event().await;
        assert_eq!(started.state, ServerState::Started);
        assert_eq!(h.server.local_addr().await.map(|a| a.port()), Some(port));
        let (_peer, _session) = h.connect(None).await;
    }

    #[tokio::test]
    async fn test_keep_alive_retries_failed_bind() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let blocked_addr = blocker.local_addr().unwrap();
        let config = ServerConfig::new("test", blocked_addr.port())
            .host("127.0.0.1")
            .keep_alive(true);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut actor = ServerActor::new(config, cmd_rx, cmd_tx.downgrade());
        actor.generation = 1;
        actor.listener = Some(ListenerTask {
            generation: 1,
            local_addr: blocked_addr,
            handle: tokio::spawn(async {}),
        });

        actor
            .handle_listener_finished(1, "accept failed".to_string())
            .await;
        assert!(actor.listener.is_none());
        assert!(actor.rebind_at.is_some());

        // Port frees up; the next attempt succeeds
        drop(blocker);
        actor.keep_alive_restart().await;
        assert_eq!(
            actor.listener.as_ref().map(|l| l.local_addr),
            Some(blocked_addr)
        );
        assert!(actor.rebind_at.is_none());

        // Shutdown cancels any pending attempt
        actor.rebind_at = Some(Instant::now() + KEEP_ALIVE_RETRY);
        let (reply, _done) = oneshot::channel();
        actor.handle_command(ServerCommand::Shutdown { reply }).await;
        assert!(actor.listener.is_none());
        assert!(actor.rebind_at.is_none());
        actor.keep_alive_restart().await;
        assert!(actor.listener.is_none());
        drop(cmd_tx);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_handshake_in_progress() {
        let mut h = Harness::start(false).await;
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        // Head without its terminating blank line
        stream.write_all(&UPGRADE_HEAD[..UPGRADE_HEAD.len() - 2]).await.unwrap();
        // Let the accept loop hand the connection to its handler
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.server.shutdown().await;
        assert_eq!(h.next_event().await.state, ServerState::Stopped);

        stream.write_all(b"\r\n").await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 101"));

        assert!(h.server.sessions().await.is_empty());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_drops_silent_peer() {
        let mut h = Harness::start(false).await;
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        stream.write_all(UPGRADE_HEAD).await.unwrap();
        let session = h.next_event().await.session.unwrap();

        assert!(
            h.server
                .disconnect_session(session.session_id, Some(4000), None)
                .await
        );

        // The peer never answers the close frame; the server still hangs up
        let mut received = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.starts_with(b"HTTP/1.1 101"));
        assert!(received.contains(&0x88));
    }
}
