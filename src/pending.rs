//! Pending-call registry
//!
//! Maps correlation ids to a single waiting continuation with a deadline.
//! Each entry fires exactly once: by `resolve` with a value, or by
//! `expire` with `None`. Whichever comes first removes the entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Result of a request-style send
///
/// Completes with the resolved value, or `None` once the deadline passes.
/// A reply whose registration was overwritten by a later call with the
/// same correlation id is never completed.
#[derive(Debug)]
pub struct PendingReply {
    receiver: Option<oneshot::Receiver<Option<Value>>>,
}

/// Sending half that fires a `PendingReply`
pub type Continuation = oneshot::Sender<Option<Value>>;

impl PendingReply {
    /// Create a reply and the continuation that completes it
    pub fn channel() -> (Continuation, Self) {
        let (continuation, receiver) = oneshot::channel();
        (
            continuation,
            Self {
                receiver: Some(receiver),
            },
        )
    }
}

impl Future for PendingReply {
    type Output = Option<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(value)) => {
                self.receiver = None;
                Poll::Ready(value)
            }
            Poll::Ready(Err(_)) => {
                // Superseded without being fired
                self.receiver = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    continuation: Continuation,
    deadline: Instant,
}

/// Correlation id -> pending continuation
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call
    ///
    /// Returns true when an existing entry for the id was replaced. The
    /// replaced continuation is dropped without being fired.
    pub fn register(
        &mut self,
        correlation_id: String,
        continuation: Continuation,
        deadline: Instant,
    ) -> bool {
        self.calls
            .insert(
                correlation_id,
                PendingCall {
                    continuation,
                    deadline,
                },
            )
            .is_some()
    }

    /// Fire the call for `correlation_id` with a value
    ///
    /// Returns false if no call is waiting on that id.
    pub fn resolve(&mut self, correlation_id: &str, value: Value) -> bool {
        match self.calls.remove(correlation_id) {
            Some(call) => {
                // Caller may have stopped waiting
                let _ = call.continuation.send(Some(value));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.contains_key(correlation_id)
    }

    /// Earliest deadline among waiting calls
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|call| call.deadline).min()
    }

    /// Fire every call whose deadline is at or before `now` with `None`
    ///
    /// Returns the expired correlation ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &due {
            if let Some(call) = self.calls.remove(id) {
                let _ = call.continuation.send(None);
            }
        }
        due
    }

    /// Fire every call with `None`
    pub fn cancel_all(&mut self) {
        for (_, call) in self.calls.drain() {
            let _ = call.continuation.send(None);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn register(calls: &mut PendingCalls, id: &str, deadline: Instant) -> (PendingReply, bool) {
        let (continuation, reply) = PendingReply::channel();
        let replaced = calls.register(id.to_string(), continuation, deadline);
        (reply, replaced)
    }

    #[tokio::test]
    async fn test_resolve_fires_once() {
        let mut calls = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_millis(100);
        let (reply, replaced) = register(&mut calls, "id1", deadline);
        assert!(!replaced);

        assert!(calls.resolve("id1", json!(42)));
        assert_eq!(reply.await, Some(json!(42)));

        // Second resolution finds nothing
        assert!(!calls.resolve("id1", json!(43)));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_expire_fires_none_and_removes() {
        let mut calls = PendingCalls::new();
        let now = Instant::now();
        let (early, _) = register(&mut calls, "early", now + Duration::from_millis(10));
        let (_late, _) = register(&mut calls, "late", now + Duration::from_millis(50));

        assert_eq!(calls.next_deadline(), Some(now + Duration::from_millis(10)));

        let expired = calls.expire(now + Duration::from_millis(10));
        assert_eq!(expired, vec!["early".to_string()]);
        assert_eq!(early.await, None);

        assert!(calls.contains("late"));
        assert!(!calls.resolve("early", json!(1)));
    }

    #[tokio::test]
    async fn test_overwrite_never_notifies_first() {
        let mut calls = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (first, _) = register(&mut calls, "dup", deadline);
        let (second, replaced) = register(&mut calls, "dup", deadline);
        assert!(replaced);
        assert_eq!(calls.len(), 1);

        assert!(calls.resolve("dup", json!("v")));
        assert_eq!(second.await, Some(json!("v")));

        let first_result = tokio::time::timeout(Duration::from_millis(20), first).await;
        assert!(first_result.is_err(), "superseded reply must not complete");
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut calls = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (a, _) = register(&mut calls, "a", deadline);
        let (b, _) = register(&mut calls, "b", deadline);

        calls.cancel_all();
        assert!(calls.is_empty());
        assert_eq!(a.await, None);
        assert_eq!(b.await, None);
    }
}
