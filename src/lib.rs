//! Resilient WebSocket client and relay server
//!
//! Built on tokio-tungstenite, using the Actor pattern for state management.
//!
//! # Features
//! - Client that reconnects on a fixed interval after drops
//! - Outbound queue with optional maximum age, replayed on reconnect
//! - Request/response correlation with per-call timeouts
//! - Server session registry with subprotocol-aware addressing
//! - Unicast, group, all and all-but-one delivery
//! - Keep-alive restart of a failed listener
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `WsClient` is a handle to a connection manager actor that owns the
//!   socket, the retry interval, the queue and the pending calls
//! - `WsServer` is a handle to a server actor that owns the listener and
//!   the session registry
//! - Each server connection has a `handler` task communicating with the
//!   server actor
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use ws_relay::{ServerConfig, WsServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::new("relay", 8080)
//!         .on_message(|text, session| println!("{}: {}", session.session_id, text));
//!     let server = WsServer::new(config);
//!     server.start().await.unwrap();
//!     server.send_message_to_all("hello", None).await;
//! }
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
mod handler;
pub mod logging;
pub mod message;
pub mod pending;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
pub mod upgrade;

// Re-export main types for convenience
pub use broadcast::Target;
pub use client::WsClient;
pub use config::{ClientConfig, ServerConfig};
pub use connector::TungsteniteConnector;
pub use error::AppError;
pub use event::{ClientEvent, ServerEvent, ServerState, SessionInfo};
pub use logging::{LogLevel, Logger};
pub use message::{CorrelationExtractor, Payload};
pub use pending::PendingReply;
pub use server::WsServer;
pub use transport::{Connector, Socket, SocketEvent};
pub use types::{ConnectionState, ReadyState, SessionId};
