//! WebSocket connection handler
//!
//! Handles individual server connections: upgrade check, WebSocket
//! handshake with subprotocol selection, session registration, and the
//! read/write pumps between the socket and the server actor.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connector::{close_frame, close_parts};
use crate::error::AppError;
use crate::server::{ServerCommand, GOING_AWAY};
use crate::transport::{ChannelSocket, Outbound};
use crate::types::ReadyState;
use crate::upgrade;

/// Time the writer gets to flush a close reply after the peer closed
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

/// Handle a new TCP connection
///
/// Performs the upgrade check and WebSocket handshake, registers the
/// session with the listener that accepted it, and pumps frames until
/// either side closes.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let Some(request) = upgrade::peek_request(&stream).await? else {
        debug!("{} closed before sending a request", peer_addr);
        return Ok(());
    };

    if !request.is_websocket() {
        info!("Rejecting non-WebSocket request from {} with 501", peer_addr);
        upgrade::reject_not_implemented(&mut stream).await?;
        return Ok(());
    }

    let sub_protocols = request.sub_protocols;
    let selected = sub_protocols.first().cloned();

    // WebSocket handshake, echoing the first requested subprotocol
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        move |_request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            if let Some(protocol) = selected {
                if let Ok(value) = HeaderValue::from_str(&protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Register before reading anything from the peer
    let (socket, mut outbound) = ChannelSocket::new(ReadyState::Open);
    let state = socket.shared_state();
    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand::Register {
            generation,
            socket: Box::new(socket),
            sub_protocols,
            reply: reply_tx,
        })
        .map_err(|_| AppError::ChannelSend)?;
    let Some(session_id) = reply_rx.await.map_err(|_| AppError::ChannelSend)? else {
        info!("Server stopped during handshake with {}, closing", peer_addr);
        let _ = ws_sender
            .send(Message::Close(close_frame(Some(GOING_AWAY), "server stopping")))
            .await;
        let _ = ws_sender.close().await;
        return Ok(());
    };

    info!("Session {} connected from {}", session_id, peer_addr);

    // Clone cmd_tx for read task
    let cmd_tx_read = cmd_tx.clone();

    // Spawn read task (WebSocket -> ServerCommand)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    let cmd = ServerCommand::Inbound {
                        session_id,
                        text: text.to_string(),
                    };
                    if cmd_tx_read.send(cmd).is_err() {
                        debug!("Server closed, ending read task for {}", session_id);
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = close_parts(frame);
                    debug!(
                        "Session {} sent close frame ({:?} {})",
                        session_id, code, reason
                    );
                    break;
                }
                Ok(_) => {
                    // Ping/pong handled by tungstenite, binary ignored
                }
                Err(e) => {
                    warn!("WebSocket error for {}: {}", session_id, e);
                    let _ = cmd_tx_read.send(ServerCommand::SessionError {
                        session_id,
                        description: e.to_string(),
                    });
                    break;
                }
            }
        }
        debug!("Read task ended for {}", session_id);
    });

    // Spawn write task (Outbound -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(close_frame(code, &reason)))
                        .await;
                    break;
                }
            }
        }
        debug!("Write task ended for {}", session_id);

        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    let read_finished = tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", session_id);
            true
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", session_id);
            false
        }
    };

    state.set(ReadyState::Closed);
    let _ = cmd_tx.send(ServerCommand::Unregister { session_id });

    if read_finished {
        // Writer ends once the session is dropped, flushing the close reply
        if tokio::time::timeout(CLOSE_DRAIN, &mut write_task).await.is_err() {
            write_task.abort();
        }
    } else {
        read_task.abort();
    }

    info!("Session {} disconnected", session_id);

    Ok(())
}
