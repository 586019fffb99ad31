//! Upgrade request inspection
//!
//! Before handing a TCP stream to the WebSocket handshake, the request
//! head is peeked (not consumed) to check the `Upgrade` header. Plain
//! HTTP requests get a 501 instead of a handshake error.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::types::parse_sub_protocols;

/// Largest request head inspected
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Time allowed for the full request head to arrive
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between peeks while the head is incomplete
const PEEK_RETRY: Duration = Duration::from_millis(5);

const NOT_IMPLEMENTED: &[u8] =
    b"HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Headers relevant to the upgrade decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Value of the `Upgrade` header, if any
    pub upgrade: Option<String>,
    /// Parsed `Sec-WebSocket-Protocol` entries
    pub sub_protocols: Vec<String>,
}

impl UpgradeRequest {
    /// Parse a raw request head (request line plus header lines)
    pub fn parse(head: &str) -> Self {
        Self {
            upgrade: header_value(head, "upgrade").map(str::to_string),
            sub_protocols: header_value(head, "sec-websocket-protocol")
                .map(parse_sub_protocols)
                .unwrap_or_default(),
        }
    }

    pub fn is_websocket(&self) -> bool {
        self.upgrade
            .as_deref()
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }
}

/// Case-insensitive lookup of a header in a request head
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Peek at the request head without consuming it
///
/// Returns `None` if the peer closed before sending anything.
pub async fn peek_request(stream: &TcpStream) -> std::io::Result<Option<UpgradeRequest>> {
    match tokio::time::timeout(HEAD_TIMEOUT, peek_head(stream)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "request head not received in time",
        )),
    }
}

async fn peek_head(stream: &TcpStream) -> std::io::Result<Option<UpgradeRequest>> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let complete = buf[..n].windows(4).any(|w| w == b"\r\n\r\n");
        if complete || n == buf.len() {
            let head = String::from_utf8_lossy(&buf[..n]);
            return Ok(Some(UpgradeRequest::parse(&head)));
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Refuse a non-WebSocket request
pub async fn reject_not_implemented(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(NOT_IMPLEMENTED).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const WS_HEAD: &str = "GET /socket HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: WebSocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Protocol: chat, , json\r\n\
        \r\n";

    #[test]
    fn test_parse_websocket_request() {
        let request = UpgradeRequest::parse(WS_HEAD);
        assert!(request.is_websocket());
        assert_eq!(request.sub_protocols, vec!["chat", "json"]);
    }

    #[test]
    fn test_parse_plain_http_request() {
        let request = UpgradeRequest::parse("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(!request.is_websocket());
        assert!(request.upgrade.is_none());
        assert!(request.sub_protocols.is_empty());
    }

    #[test]
    fn test_headers_after_blank_line_ignored() {
        let request = UpgradeRequest::parse("GET / HTTP/1.1\r\n\r\nUpgrade: websocket\r\n");
        assert!(!request.is_websocket());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let request = peek_request(&stream).await.unwrap().unwrap();
        assert!(!request.is_websocket());

        // Head is still readable after peeking
        let mut first = [0u8; 3];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"GET");

        reject_not_implemented(&mut stream).await.unwrap();
        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 501"));
    }
}
