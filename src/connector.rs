//! tokio-tungstenite client sockets
//!
//! Each opened socket gets one task that performs the handshake and then
//! pumps frames in both directions until either side closes.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::{ChannelSocket, Connector, NoticeSender, Outbound, Socket, SocketEvent};
use crate::types::{ReadyState, SharedReadyState};

/// Connector dialing real `ws://` / `wss://` URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn open(&self, url: &str, notices: NoticeSender) -> Box<dyn Socket> {
        let (socket, outbound) = ChannelSocket::new(ReadyState::Connecting);
        tokio::spawn(run_socket(
            url.to_string(),
            socket.shared_state(),
            outbound,
            notices,
        ));
        Box::new(socket)
    }
}

/// Build a close frame for an optional status code
pub(crate) fn close_frame(code: Option<u16>, reason: &str) -> Option<CloseFrame<'static>> {
    code.map(|code| CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    })
}

/// Split a received close frame into code and reason
pub(crate) fn close_parts(frame: Option<CloseFrame<'_>>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
        None => (None, String::new()),
    }
}

async fn run_socket(
    url: String,
    state: SharedReadyState,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    notices: NoticeSender,
) {
    let id = notices.socket_id();
    debug!("Socket {} connecting to {}", id, url);

    let ws_stream = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!("Socket {} failed to connect to {}: {}", id, url, e);
                state.set(ReadyState::Closed);
                notices.notify(SocketEvent::Error(e.to_string()));
                return;
            }
        },
        // Only a close can be queued while connecting
        frame = outbound.recv() => {
            let (code, reason) = match frame {
                Some(Outbound::Close { code, reason }) => (code, reason),
                _ => (None, String::new()),
            };
            debug!("Socket {} closed before handshake completed", id);
            state.set(ReadyState::Closed);
            notices.notify(SocketEvent::Closed { code, reason });
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if state.mark_open() {
        debug!("Socket {} open", id);
        notices.notify(SocketEvent::Opened);
    }

    let (code, reason) = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        warn!("Socket {} send failed: {}", id, e);
                        state.set(ReadyState::Closed);
                        notices.notify(SocketEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = ws_sender.send(Message::Close(close_frame(code, &reason))).await;
                    break (code, reason);
                }
                None => {
                    // Handle dropped by its owner
                    let _ = ws_sender.close().await;
                    break (None, String::new());
                }
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    notices.notify(SocketEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Socket {} received close frame", id);
                    break close_parts(frame);
                }
                Some(Ok(_)) => {
                    // Ping/pong handled by tungstenite, binary ignored
                }
                Some(Err(e)) => {
                    warn!("Socket {} read failed: {}", id, e);
                    state.set(ReadyState::Closed);
                    notices.notify(SocketEvent::Error(e.to_string()));
                    return;
                }
                None => break (None, String::new()),
            },
        }
    };

    state.set(ReadyState::Closed);
    debug!("Socket {} closed", id);
    notices.notify(SocketEvent::Closed { code, reason });
}
