//! Broadcast router
//!
//! Resolves a `Target` to session ids and delivers best-effort through
//! `SessionRegistry::send_message`. Unreachable targets only lower the
//! returned count.

use tracing::trace;

use crate::session::SessionRegistry;
use crate::types::SessionId;

/// Addressing mode for an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single session
    Session(SessionId),
    /// Every registered session
    All,
    /// Every session except one
    Others(SessionId),
    /// An explicit list, delivered in the given order
    Group(Vec<SessionId>),
}

impl Target {
    /// Session ids addressed by this target, before readiness filtering
    pub fn resolve(&self, registry: &SessionRegistry) -> Vec<SessionId> {
        match self {
            Self::Session(id) => vec![*id],
            Self::All => registry.ids().to_vec(),
            Self::Others(excluded) => registry
                .ids()
                .iter()
                .copied()
                .filter(|id| id != excluded)
                .collect(),
            Self::Group(ids) => ids.clone(),
        }
    }
}

/// Deliver `payload` to every session in `target`
///
/// Returns the number of sessions that accepted the message.
pub fn deliver(
    registry: &SessionRegistry,
    payload: &str,
    target: &Target,
    sub_protocol: Option<&str>,
) -> usize {
    let delivered = target
        .resolve(registry)
        .into_iter()
        .filter(|id| registry.send_message(payload, *id, sub_protocol))
        .count();
    trace!("Delivered to {} sessions ({:?})", delivered, target);
    delivered
}
