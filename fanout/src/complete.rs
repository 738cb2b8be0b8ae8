//! Settle a session after its forward call.
//!
//! Success acknowledges every message in receipt order and closes the lease. Failure acknowledges
//! nothing and abandons the lease, so the broker redelivers the whole batch to a later worker.
//! Acknowledging and releasing are separate steps for leases that must stay held after settling.

use crate::{
    broker::BrokerError,
    forward::{ForwardFailure, ForwardResult},
    message::SessionBatch,
    session::{LeaseOrigin, Release, SessionHandle},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("acknowledge of message {message_id} (seq {sequence_number}) in session {session_id} failed: {source}")]
pub struct AcknowledgeFailure {
    pub session_id: String,
    pub message_id: String,
    pub sequence_number: i64,
    #[source]
    pub source: BrokerError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Forward succeeded; acknowledgment was attempted for every message.
    Acknowledged,
    /// Forward failed; nothing acknowledged, session returned for redelivery.
    Abandoned { cause: ForwardFailure },
}

#[derive(Debug, Clone)]
/// What happened to one forwarded session.
pub struct SettleReport {
    pub session_id: String,
    pub origin: LeaseOrigin,
    /// Messages in the forwarded batch.
    pub batch_size: usize,
    pub settlement: Settlement,
    /// Sequence numbers acknowledged, in acknowledgment order.
    pub acknowledged: Vec<i64>,
    pub ack_failures: Vec<AcknowledgeFailure>,
    pub release: Result<Release, BrokerError>,
}

impl SettleReport {
    /// Forwarded, every message acknowledged, and the lease closed.
    pub fn is_clean(&self) -> bool {
        self.settlement == Settlement::Acknowledged
            && self.ack_failures.is_empty()
            && self.release.is_ok()
    }

    pub fn forward_failure(&self) -> Option<&ForwardFailure> {
        match &self.settlement {
            Settlement::Abandoned { cause } => Some(cause),
            Settlement::Acknowledged => None,
        }
    }
}

/// Acknowledgment outcome for a session whose lease is still held.
#[derive(Debug, Clone)]
pub struct Acknowledged {
    pub session_id: String,
    pub batch_size: usize,
    pub settlement: Settlement,
    /// Sequence numbers acknowledged, in acknowledgment order.
    pub acknowledged: Vec<i64>,
    pub ack_failures: Vec<AcknowledgeFailure>,
}

impl Acknowledged {
    pub fn forward_failure(&self) -> Option<&ForwardFailure> {
        match &self.settlement {
            Settlement::Abandoned { cause } => Some(cause),
            Settlement::Acknowledged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCompleter;

impl SessionCompleter {
    pub fn new() -> Self {
        Self
    }

    /// Acknowledge or abandon `batch` according to `result`, then release `handle`.
    ///
    /// Always releases the lease exactly once. Individual acknowledge failures are recorded and do
    /// not stop the remaining acknowledgments.
    pub async fn complete(
        &self,
        mut handle: SessionHandle,
        batch: &SessionBatch,
        result: ForwardResult,
    ) -> SettleReport {
        let acked = self.acknowledge(&mut handle, batch, result).await;
        self.release(handle, acked).await
    }

    /// Acknowledge every message of `batch` in order when `result` is a success. The lease stays
    /// held; pass the result to [`SessionCompleter::release`].
    ///
    /// A triggered session settles in two steps so its lock outlives the rest of the invocation.
    pub async fn acknowledge(
        &self,
        handle: &mut SessionHandle,
        batch: &SessionBatch,
        result: ForwardResult,
    ) -> Acknowledged {
        let session_id = batch.session_id().to_string();
        let batch_size = batch.messages().len();

        if let Err(cause) = result {
            tracing::warn!(
                event = "forward_failed",
                session_id = %session_id,
                batch_size,
                error = %cause,
                "forward failed; nothing acknowledged"
            );
            return Acknowledged {
                session_id,
                batch_size,
                settlement: Settlement::Abandoned { cause },
                acknowledged: Vec::new(),
                ack_failures: Vec::new(),
            };
        }

        let mut acknowledged = Vec::with_capacity(batch_size);
        let mut ack_failures = Vec::new();
        for message in batch.messages() {
            match handle.complete(message).await {
                Ok(()) => acknowledged.push(message.sequence_number),
                Err(source) => {
                    tracing::warn!(
                        event = "acknowledge_failed",
                        session_id = %session_id,
                        message_id = %message.message_id,
                        sequence_number = message.sequence_number,
                        error = %source,
                        "acknowledge failed; continuing with the rest of the batch"
                    );
                    ack_failures.push(AcknowledgeFailure {
                        session_id: session_id.clone(),
                        message_id: message.message_id.clone(),
                        sequence_number: message.sequence_number,
                        source,
                    });
                }
            }
        }
        Acknowledged {
            session_id,
            batch_size,
            settlement: Settlement::Acknowledged,
            acknowledged,
            ack_failures,
        }
    }

    /// Give the lease back: close after a successful forward, abandon for redelivery otherwise.
    pub async fn release(&self, handle: SessionHandle, acked: Acknowledged) -> SettleReport {
        let origin = handle.origin();
        let release = match acked.settlement {
            Settlement::Acknowledged => handle.close().await,
            Settlement::Abandoned { .. } => handle.abandon().await,
        };

        if let Err(err) = &release {
            tracing::warn!(
                event = "session_release_failed",
                session_id = %acked.session_id,
                error = %err,
                "lease release failed"
            );
        }

        tracing::info!(
            event = "session_settled",
            session_id = %acked.session_id,
            origin = ?origin,
            batch_size = acked.batch_size,
            acknowledged = acked.acknowledged.len(),
            ack_failures = acked.ack_failures.len(),
            abandoned = matches!(acked.settlement, Settlement::Abandoned { .. }),
            "session settled"
        );

        SettleReport {
            session_id: acked.session_id,
            origin,
            batch_size: acked.batch_size,
            settlement: acked.settlement,
            acknowledged: acked.acknowledged,
            ack_failures: acked.ack_failures,
            release,
        }
    }
}
