//! WebSocket Relay - Entry Point
//!
//! `ws_relay server [addr]` relays every inbound message to all other
//! sessions. `ws_relay client <url>` sends stdin lines and prints what
//! arrives.

use std::env;
use std::io::IsTerminal;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use ws_relay::{
    AppError, ClientConfig, ClientEvent, LogLevel, Logger, ServerConfig, ServerState, SessionId,
    WsClient, WsServer,
};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Environment variable holding the log level name
const LOG_ENV: &str = "WS_RELAY_LOG";

const USAGE: &str = "usage: ws_relay server [addr] | ws_relay client <url>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG still overrides, e.g. RUST_LOG=ws_relay=trace
    let level = match env::var(LOG_ENV) {
        Ok(name) => name.parse()?,
        Err(_) => LogLevel::Info,
    };
    let _logger = Logger::init(level, std::io::stderr().is_terminal())?;

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("server") => {
            let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
            run_server(addr.parse()?).await?;
        }
        Some("client") => {
            let url = args.next().ok_or(USAGE)?;
            run_client(url).await?;
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}

/// Relay each inbound message to every other session until Ctrl-C
async fn run_server(addr: SocketAddr) -> Result<(), AppError> {
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<(String, SessionId)>();

    let config = ServerConfig::new("relay", addr.port())
        .host(addr.ip().to_string())
        .keep_alive(true)
        .on_event(|event| {
            if event.state == ServerState::Error {
                warn!("Server error: {:?}", event.detail);
            }
        })
        .on_message(move |text, session| {
            let _ = relay_tx.send((text.to_string(), session.session_id));
        });

    let server = WsServer::new(config);
    let local_addr = server.start().await?;
    info!("WebSocket relay listening on {}", local_addr);

    loop {
        tokio::select! {
            Some((text, from)) = relay_rx.recv() => {
                let delivered = server.send_message_to_others(text, from, None).await;
                info!("Relayed message from {} to {} sessions", from, delivered);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    server.shutdown().await;
    Ok(())
}

/// Send stdin lines, print inbound messages, until EOF or Ctrl-C
async fn run_client(url: String) -> Result<(), AppError> {
    let config = ClientConfig::new("relay-client", url)
        .reconnect_interval(5)
        .on_message(|event| {
            if let ClientEvent::Message(text) = event {
                println!("{}", text);
            }
        })
        .on_open(|_| info!("Connected"))
        .on_close(|event| info!("Connection closed: {:?}", event))
        .on_error(|event| warn!("Connection error: {:?}", event));

    let client = WsClient::new(config);
    client.init();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => client.send(line),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    client.shutdown();
    Ok(())
}
