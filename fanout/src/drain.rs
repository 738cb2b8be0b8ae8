//! Pull a locked session until it goes idle.
//!
//! Each receive waits at most `idle_timeout`. A short timeout bounds how long a worker can sit
//! on a session that has fewer messages than expected.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    broker::{BrokerError, BrokerErrorKind},
    message::Message,
    session::SessionHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum DrainFailure {
    #[error("receive failed for session {session_id} after {received} messages: {source}")]
    Receive {
        session_id: String,
        received: usize,
        #[source]
        source: BrokerError,
    },
    #[error("drain of session {session_id} cancelled after {received} messages")]
    Cancelled { session_id: String, received: usize },
}

#[derive(Debug, Clone)]
pub struct SessionDrainer {
    idle_timeout: Duration,
    max_messages: Option<usize>,
}

impl SessionDrainer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            max_messages: None,
        }
    }

    /// Stop after `max` messages. The rest stay on the broker for a later lease.
    pub fn with_max_messages(mut self, max: Option<usize>) -> Self {
        self.max_messages = max.map(|m| m.max(1));
        self
    }

    /// Receive until the session is idle or closed. Nothing is acknowledged here.
    ///
    /// The returned messages are in receipt order and may be empty. On error the caller still owns
    /// the handle and must release it.
    pub async fn drain(
        &self,
        handle: &mut SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, DrainFailure> {
        let mut messages = Vec::new();
        loop {
            if self.max_messages.is_some_and(|max| messages.len() >= max) {
                tracing::debug!(
                    event = "drain_capped",
                    session_id = %handle.session_id(),
                    received = messages.len(),
                    "drain reached max messages"
                );
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DrainFailure::Cancelled {
                        session_id: handle.session_id().to_string(),
                        received: messages.len(),
                    });
                }
                next = handle.receive_next(self.idle_timeout) => next,
            };

            match next {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(err) if err.kind == BrokerErrorKind::SessionClosed => {
                    tracing::debug!(
                        event = "drain_session_closed",
                        session_id = %handle.session_id(),
                        received = messages.len(),
                        error = %err,
                        "session closed while draining"
                    );
                    break;
                }
                Err(source) => {
                    return Err(DrainFailure::Receive {
                        session_id: handle.session_id().to_string(),
                        received: messages.len(),
                        source,
                    });
                }
            }
        }

        tracing::debug!(
            event = "session_drained",
            session_id = %handle.session_id(),
            received = messages.len(),
            "drain finished"
        );
        Ok(messages)
    }
}
