//! Client and server configuration
//!
//! Builder-style structs; every field has a working default except the
//! name and the address.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{ClientCallbacks, ClientEvent, ServerCallbacks, ServerEvent, SessionInfo};
use crate::message::CorrelationExtractor;

/// Default reconnect interval in seconds
pub const DEFAULT_RECONNECT_SECS: u64 = 30;

/// Default listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Connection manager configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Tag used in log lines
    pub name: String,
    pub url: String,
    pub reconnect_interval: Duration,
    pub queue_messages: bool,
    /// `None` keeps queued messages regardless of age
    pub max_queue_age: Option<Duration>,
    pub callbacks: ClientCallbacks,
    pub correlation: Option<CorrelationExtractor>,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            queue_messages: true,
            max_queue_age: None,
            callbacks: ClientCallbacks::default(),
            correlation: None,
        }
    }

    /// Reconnect interval in seconds
    pub fn reconnect_interval(self, secs: u64) -> Self {
        self.reconnect_every(Duration::from_secs(secs))
    }

    pub fn reconnect_every(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn queue_messages(mut self, enabled: bool) -> Self {
        self.queue_messages = enabled;
        self
    }

    /// Maximum queue age in seconds; 0 means unlimited
    pub fn max_queue_age(mut self, secs: u64) -> Self {
        self.max_queue_age = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Route inbound replies to pending calls
    pub fn correlate(mut self, extractor: CorrelationExtractor) -> Self {
        self.correlation = Some(extractor);
        self
    }
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Tag used in log lines
    pub name: String,
    pub host: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// Restart the listener if it stops without a shutdown request
    pub keep_alive: bool,
    pub callbacks: ServerCallbacks,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: DEFAULT_HOST.to_string(),
            port,
            keep_alive: false,
            callbacks: ServerCallbacks::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_event = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &SessionInfo) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::new("test", "ws://localhost:8080");
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert!(config.queue_messages);
        assert!(config.max_queue_age.is_none());
        assert!(config.correlation.is_none());
    }

    #[test]
    fn test_zero_queue_age_is_unlimited() {
        let config = ClientConfig::new("test", "ws://x").max_queue_age(0);
        assert!(config.max_queue_age.is_none());

        let config = config.max_queue_age(5);
        assert_eq!(config.max_queue_age, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_server_bind_addr() {
        let config = ServerConfig::new("relay", 9001).host("127.0.0.1");
        assert_eq!(config.bind_addr(), "127.0.0.1:9001");
        assert!(!config.keep_alive);
    }
}
