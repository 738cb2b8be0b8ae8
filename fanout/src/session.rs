//! Exclusive session leases.
//!
//! A [`SessionHandle`] owns one broker lease. Releasing it (`close` or `abandon`) consumes the
//! handle, so a lease can be released at most once. A handle dropped without an explicit release
//! (cancelled or panicked task) abandons and closes the lease from a background task.

use std::time::Duration;

use crate::{
    broker::{BrokerError, SessionReceiver},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a lease was granted.
pub enum LeaseOrigin {
    /// Locked by the host runtime before the invocation was triggered.
    Triggered,
    /// Accepted from the broker by an additional-session worker.
    Acquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a lease was given back to the broker.
pub enum Release {
    /// Lease released after settling (or without receiving anything).
    Closed,
    /// Unacknowledged messages returned for redelivery, then lease released.
    Abandoned,
}

pub struct SessionHandle {
    session_id: String,
    origin: LeaseOrigin,
    receiver: Option<Box<dyn SessionReceiver>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("origin", &self.origin)
            .field("held", &self.receiver.is_some())
            .finish()
    }
}

impl SessionHandle {
    /// Wrap a lease that the host runtime already holds for this invocation.
    pub fn triggered(receiver: Box<dyn SessionReceiver>) -> Self {
        Self::new(receiver, LeaseOrigin::Triggered)
    }

    /// Wrap a lease accepted directly from the broker.
    pub fn acquired(receiver: Box<dyn SessionReceiver>) -> Self {
        Self::new(receiver, LeaseOrigin::Acquired)
    }

    fn new(receiver: Box<dyn SessionReceiver>, origin: LeaseOrigin) -> Self {
        Self {
            session_id: receiver.session_id().to_string(),
            origin,
            receiver: Some(receiver),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn origin(&self) -> LeaseOrigin {
        self.origin
    }

    pub async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        self.receiver()?.receive_next(timeout).await
    }

    pub async fn complete(&mut self, message: &Message) -> Result<(), BrokerError> {
        self.receiver()?.complete(message).await
    }

    /// Release the lease. Messages received but not completed go back to the broker.
    pub async fn close(mut self) -> Result<Release, BrokerError> {
        let mut receiver = self.take_receiver()?;
        receiver.close().await?;
        Ok(Release::Closed)
    }

    /// Return unacknowledged messages for redelivery, then release the lease.
    ///
    /// The lease is released even when the abandon call fails; the first error is reported.
    pub async fn abandon(mut self) -> Result<Release, BrokerError> {
        let mut receiver = self.take_receiver()?;
        let abandoned = receiver.abandon().await;
        let closed = receiver.close().await;
        abandoned.and(closed).map(|()| Release::Abandoned)
    }

    fn receiver(&mut self) -> Result<&mut Box<dyn SessionReceiver>, BrokerError> {
        let session_id = &self.session_id;
        self.receiver
            .as_mut()
            .ok_or_else(|| BrokerError::session_closed(format!("session {session_id} already released")))
    }

    fn take_receiver(&mut self) -> Result<Box<dyn SessionReceiver>, BrokerError> {
        self.receiver.take().ok_or_else(|| {
            BrokerError::session_closed(format!("session {} already released", self.session_id))
        })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };

        let session_id = std::mem::take(&mut self.session_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                event = "session_lease_leaked",
                session_id = %session_id,
                "session handle dropped outside a runtime; lease left to expire"
            );
            return;
        };

        tracing::warn!(
            event = "session_lease_dropped",
            session_id = %session_id,
            "session handle dropped without release; abandoning in background"
        );
        runtime.spawn(async move {
            let abandoned = receiver.abandon().await;
            let closed = receiver.close().await;
            if let Err(err) = abandoned.and(closed) {
                tracing::warn!(
                    event = "session_release_failed",
                    session_id = %session_id,
                    error = %err,
                    "background release failed"
                );
            }
        });
    }
}
