//! Broker client seam.
//!
//! The orchestrator only needs two capabilities from a session-aware broker: accept the next
//! unlocked session, and operate on that session through its lease. Both are traits so the core
//! can be exercised without a live broker.

use std::{fmt, time::Duration};

use async_trait::async_trait;

use crate::message::Message;

mod memory;

pub use memory::InMemoryBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Connection or transport fault talking to the broker.
    Network,
    /// Credentials rejected.
    Unauthorized,
    /// The session lease (or a message lock) is no longer held.
    LockLost,
    /// The session was closed, by the broker or by a previous release.
    SessionClosed,
    Other,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerErrorKind::Network => "network",
            BrokerErrorKind::Unauthorized => "unauthorized",
            BrokerErrorKind::LockLost => "lock lost",
            BrokerErrorKind::SessionClosed => "session closed",
            BrokerErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("broker {kind}: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Network, message)
    }

    pub fn lock_lost(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::LockLost, message)
    }

    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::SessionClosed, message)
    }
}

#[async_trait]
/// Accepts session leases from a queue. Shared by every worker of an invocation.
pub trait SessionBroker: Send + Sync {
    /// Lock the next available session of `queue`, waiting up to `wait`.
    ///
    /// `Ok(None)` means no session became available in time. That is the normal outcome on a
    /// quiet queue, not an error.
    async fn accept_next_session(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError>;
}

#[async_trait]
/// Operations on one locked session. Owned by exactly one task.
pub trait SessionReceiver: Send {
    fn session_id(&self) -> &str;

    /// Receive the next message, waiting at most `timeout`. `Ok(None)` when the session is idle.
    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError>;

    /// Acknowledge one received message.
    async fn complete(&mut self, message: &Message) -> Result<(), BrokerError>;

    /// Return every received but unacknowledged message for redelivery. The lease stays held.
    async fn abandon(&mut self) -> Result<(), BrokerError>;

    /// Release the session lease.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
