//! In-process session broker.
//!
//! Implements session locks, in-flight tracking, abandon/close with redelivery, and keeps
//! per-session accounting (acknowledged message ids, leases granted, releases) so callers can
//! check what a run actually settled.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{BrokerError, BrokerErrorKind, SessionBroker, SessionReceiver};
use crate::message::{LockToken, Message};

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, BTreeMap<String, SessionState>>,
    next_message_id: u64,
}

#[derive(Default)]
struct SessionState {
    available: VecDeque<StoredMessage>,
    in_flight: Vec<InFlight>,
    lease: Option<Uuid>,
    next_sequence: i64,
    acknowledged: Vec<String>,
    leases_granted: u32,
    releases: u32,
}

impl SessionState {
    /// Put received-but-unsettled messages back at the head of the session, preserving order.
    fn requeue_in_flight(&mut self) {
        for held in self.in_flight.drain(..).rev() {
            self.available.push_front(held.message);
        }
    }
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    sequence_number: i64,
    delivery_count: u32,
    body: Bytes,
}

struct InFlight {
    lock_token: LockToken,
    message: StoredMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to `session_id` of `queue`. Returns the broker message id.
    pub async fn send(&self, queue: &str, session_id: &str, body: impl Into<Bytes>) -> String {
        let mut state = self.shared.state.lock().await;
        state.next_message_id += 1;
        let message_id = format!("msg-{}", state.next_message_id);

        let session = state
            .queues
            .entry(queue.to_string())
            .or_default()
            .entry(session_id.to_string())
            .or_default();
        session.next_sequence += 1;
        session.available.push_back(StoredMessage {
            message_id: message_id.clone(),
            sequence_number: session.next_sequence,
            delivery_count: 0,
            body: body.into(),
        });
        drop(state);

        self.shared.notify.notify_waiters();
        message_id
    }

    /// Lock one specific session, the way a host runtime does before triggering an invocation.
    pub async fn accept_session(
        &self,
        queue: &str,
        session_id: &str,
    ) -> Result<Box<dyn SessionReceiver>, BrokerError> {
        let mut state = self.shared.state.lock().await;
        let session = state
            .queues
            .get_mut(queue)
            .and_then(|sessions| sessions.get_mut(session_id))
            .ok_or_else(|| {
                BrokerError::new(
                    BrokerErrorKind::Other,
                    format!("unknown session {session_id} on {queue}"),
                )
            })?;
        if session.lease.is_some() {
            return Err(BrokerError::lock_lost(format!(
                "session {session_id} is locked by another receiver"
            )));
        }
        Ok(Box::new(self.grant(queue, session_id, session)))
    }

    /// Message ids acknowledged for a session, in acknowledgment order.
    pub async fn acknowledged(&self, queue: &str, session_id: &str) -> Vec<String> {
        self.inspect(queue, session_id, |s| s.acknowledged.clone())
            .await
            .unwrap_or_default()
    }

    /// Number of times a lease on the session has been released.
    pub async fn releases(&self, queue: &str, session_id: &str) -> u32 {
        self.inspect(queue, session_id, |s| s.releases)
            .await
            .unwrap_or_default()
    }

    pub async fn leases_granted(&self, queue: &str, session_id: &str) -> u32 {
        self.inspect(queue, session_id, |s| s.leases_granted)
            .await
            .unwrap_or_default()
    }

    /// Messages not yet acknowledged (available or in flight).
    pub async fn pending(&self, queue: &str, session_id: &str) -> usize {
        self.inspect(queue, session_id, |s| s.available.len() + s.in_flight.len())
            .await
            .unwrap_or_default()
    }

    pub async fn is_locked(&self, queue: &str, session_id: &str) -> bool {
        self.inspect(queue, session_id, |s| s.lease.is_some())
            .await
            .unwrap_or_default()
    }

    async fn inspect<T>(
        &self,
        queue: &str,
        session_id: &str,
        f: impl FnOnce(&SessionState) -> T,
    ) -> Option<T> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .and_then(|sessions| sessions.get(session_id))
            .map(f)
    }

    fn grant(
        &self,
        queue: &str,
        session_id: &str,
        session: &mut SessionState,
    ) -> InMemorySessionReceiver {
        let lease = Uuid::new_v4();
        session.lease = Some(lease);
        session.leases_granted += 1;
        InMemorySessionReceiver {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            session_id: session_id.to_string(),
            lease,
        }
    }
}

#[async_trait]
impl SessionBroker for InMemoryBroker {
    async fn accept_next_session(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Created before the check so a send between check and wait is not missed.
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().await;
                if let Some(sessions) = state.queues.get_mut(queue) {
                    let next = sessions
                        .iter_mut()
                        .find(|(_, s)| s.lease.is_none() && !s.available.is_empty());
                    if let Some((session_id, session)) = next {
                        let session_id = session_id.clone();
                        return Ok(Some(Box::new(self.grant(queue, &session_id, session))));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

struct InMemorySessionReceiver {
    shared: Arc<Shared>,
    queue: String,
    session_id: String,
    lease: Uuid,
}

impl InMemorySessionReceiver {
    fn session_mut<'a>(&self, state: &'a mut BrokerState) -> Result<&'a mut SessionState, BrokerError> {
        let session = state
            .queues
            .get_mut(&self.queue)
            .and_then(|sessions| sessions.get_mut(&self.session_id))
            .ok_or_else(|| {
                BrokerError::session_closed(format!("session {} no longer exists", self.session_id))
            })?;
        match session.lease {
            Some(lease) if lease == self.lease => Ok(session),
            Some(_) => Err(BrokerError::lock_lost(format!(
                "session {} is leased to another receiver",
                self.session_id
            ))),
            None => Err(BrokerError::session_closed(format!(
                "session {} lease already released",
                self.session_id
            ))),
        }
    }
}

#[async_trait]
impl SessionReceiver for InMemorySessionReceiver {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().await;
                let session = self.session_mut(&mut state)?;
                if let Some(mut stored) = session.available.pop_front() {
                    stored.delivery_count += 1;
                    let lock_token = LockToken::new(Uuid::new_v4().to_string());
                    let message = Message {
                        message_id: stored.message_id.clone(),
                        session_id: self.session_id.clone(),
                        sequence_number: stored.sequence_number,
                        lock_token: lock_token.clone(),
                        delivery_count: stored.delivery_count,
                        body: stored.body.clone(),
                    };
                    session.in_flight.push(InFlight {
                        lock_token,
                        message: stored,
                    });
                    return Ok(Some(message));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&mut self, message: &Message) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;
        let session = self.session_mut(&mut state)?;
        let pos = session
            .in_flight
            .iter()
            .position(|held| held.lock_token == message.lock_token)
            .ok_or_else(|| {
                BrokerError::lock_lost(format!(
                    "lock token {} is not held in session {}",
                    message.lock_token, self.session_id
                ))
            })?;
        let held = session.in_flight.remove(pos);
        session.acknowledged.push(held.message.message_id);
        Ok(())
    }

    async fn abandon(&mut self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;
        self.session_mut(&mut state)?.requeue_in_flight();
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;
        let session = self.session_mut(&mut state)?;
        session.requeue_in_flight();
        session.lease = None;
        session.releases += 1;
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
