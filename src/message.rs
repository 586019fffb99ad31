//! Outbound payloads and inbound correlation
//!
//! The transport only carries text. `Payload` lets callers hand over
//! either text or a JSON value; JSON is serialized on the way out.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;

/// Value handed to `send`
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already textual, sent as-is
    Text(String),
    /// Serialized to compact JSON text before sending
    Json(Value),
}

impl Payload {
    /// Serialize any `Serialize` value into a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, AppError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Text form as written to the socket
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

type ExtractFn = dyn Fn(&str) -> Option<(String, Value)> + Send + Sync;

/// Pulls a correlation id and result value out of an inbound message
///
/// Returning `None` means the message is not a reply and goes to the
/// general message handler.
#[derive(Clone)]
pub struct CorrelationExtractor(Arc<ExtractFn>);

impl CorrelationExtractor {
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&str) -> Option<(String, Value)> + Send + Sync + 'static,
    {
        Self(Arc::new(extract))
    }

    /// Treat JSON objects carrying a string `field` as replies
    ///
    /// The whole parsed object becomes the resolved value.
    pub fn json_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |text| {
            let value: Value = serde_json::from_str(text).ok()?;
            let id = value.get(&field)?.as_str()?.to_string();
            Some((id, value))
        })
    }

    pub fn extract(&self, text: &str) -> Option<(String, Value)> {
        (self.0)(text)
    }
}

impl std::fmt::Debug for CorrelationExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CorrelationExtractor")
    }
}
