//! Broker messages and the ordered per-session batches built from them.

use std::fmt;

use bytes::Bytes;

/// Broker-issued token identifying one delivery of a message. Required to complete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message received from a session. Never mutated after receipt.
pub struct Message {
    /// Broker message id (stable across redeliveries).
    pub message_id: String,
    pub session_id: String,
    /// Publish order within the session.
    pub sequence_number: i64,
    pub lock_token: LockToken,
    /// How many times the broker has handed this message out, this delivery included.
    pub delivery_count: u32,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Reasons a set of messages cannot form a [`SessionBatch`].
pub enum BatchError {
    #[error("session {session_id} batch is empty")]
    Empty { session_id: String },
    #[error("message {message_id} belongs to session {found}, expected {expected}")]
    ForeignMessage {
        expected: String,
        found: String,
        message_id: String,
    },
}

#[derive(Debug, Clone)]
/// Non-empty messages of one session, in receipt order.
pub struct SessionBatch {
    session_id: String,
    messages: Vec<Message>,
}

impl SessionBatch {
    /// Build a batch for `session_id`, rejecting an empty set or messages from another session.
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Result<Self, BatchError> {
        let session_id = session_id.into();
        if messages.is_empty() {
            return Err(BatchError::Empty { session_id });
        }
        if let Some(foreign) = messages.iter().find(|m| m.session_id != session_id) {
            return Err(BatchError::ForeignMessage {
                found: foreign.session_id.clone(),
                message_id: foreign.message_id.clone(),
                expected: session_id,
            });
        }
        Ok(Self {
            session_id,
            messages,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn sequence_numbers(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.sequence_number).collect()
    }
}

#[cfg(test)]
pub(crate) fn test_message(session_id: &str, sequence_number: i64) -> Message {
    Message {
        message_id: format!("{session_id}-{sequence_number}"),
        session_id: session_id.to_string(),
        sequence_number,
        lock_token: LockToken::new(format!("lock-{session_id}-{sequence_number}")),
        delivery_count: 1,
        body: Bytes::from(format!("body-{sequence_number}")),
    }
}
