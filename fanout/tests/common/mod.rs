#![allow(dead_code)]

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use session_fanout::{
    broker::{BrokerError, InMemoryBroker, SessionBroker, SessionReceiver},
    drain::SessionDrainer,
    forward::{ForwardFailure, ForwardGateway, ForwardReceipt, ForwardResult},
    message::{LockToken, Message, SessionBatch},
    orchestrator::TriggeredSession,
    session::SessionHandle,
};
use tokio_util::sync::CancellationToken;

pub const QUEUE: &str = "orders";

pub async fn seed(broker: &InMemoryBroker, session_id: &str, bodies: &[&str]) -> Vec<String> {
    let mut ids = Vec::with_capacity(bodies.len());
    for body in bodies {
        ids.push(broker.send(QUEUE, session_id, body.to_string()).await);
    }
    ids
}

/// Lock and drain `session_id` the way the host runtime does before triggering an invocation.
pub async fn trigger(broker: &InMemoryBroker, session_id: &str) -> TriggeredSession {
    let receiver = broker.accept_session(QUEUE, session_id).await.unwrap();
    let mut handle = SessionHandle::triggered(receiver);
    let messages = SessionDrainer::new(Duration::from_millis(50))
        .drain(&mut handle, &CancellationToken::new())
        .await
        .unwrap();
    TriggeredSession::new(handle, messages).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub session_id: String,
    pub message_ids: Vec<String>,
    pub delivery_counts: Vec<u32>,
}

/// Records every forwarded batch. Sessions in `failing` time out.
#[derive(Default)]
pub struct RecordingGateway {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ForwardCall>>,
}

impl RecordingGateway {
    pub fn failing(sessions: &[&str]) -> Self {
        Self {
            failing: Mutex::new(sessions.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ForwardCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, session_id: &str) -> Vec<ForwardCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.session_id == session_id)
            .collect()
    }
}

#[async_trait]
impl ForwardGateway for RecordingGateway {
    async fn forward(&self, batch: &SessionBatch) -> ForwardResult {
        self.calls.lock().unwrap().push(ForwardCall {
            session_id: batch.session_id().to_string(),
            message_ids: batch
                .messages()
                .iter()
                .map(|m| m.message_id.clone())
                .collect(),
            delivery_counts: batch.messages().iter().map(|m| m.delivery_count).collect(),
        });
        // Stand-in for downstream latency so additional workers overlap the primary call.
        tokio::time::sleep(Duration::from_millis(200)).await;

        if self.failing.lock().unwrap().contains(batch.session_id()) {
            return Err(ForwardFailure::Timeout(Duration::from_secs(30)));
        }
        Ok(ForwardReceipt {
            status: Some(200),
            messages: batch.messages().len(),
        })
    }
}

#[derive(Debug, Default)]
pub struct LeaseCounts {
    pub closes: AtomicUsize,
    pub abandons: AtomicUsize,
}

/// A locked session that never yields a message.
pub struct EmptySession {
    session_id: String,
    counts: Arc<LeaseCounts>,
}

#[async_trait]
impl SessionReceiver for EmptySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn complete(&mut self, message: &Message) -> Result<(), BrokerError> {
        Err(BrokerError::lock_lost(format!(
            "message {} was never delivered from {}",
            message.message_id, self.session_id
        )))
    }

    async fn abandon(&mut self) -> Result<(), BrokerError> {
        self.counts.abandons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.counts.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory broker that also hands out lockable sessions with nothing left in them.
///
/// Real brokers can grant a session whose last messages were settled between the lock and the
/// first receive; the in-memory broker only grants sessions with pending messages.
pub struct BrokerWithEmptySessions {
    pub inner: InMemoryBroker,
    empty: Mutex<VecDeque<(String, Arc<LeaseCounts>)>>,
}

impl BrokerWithEmptySessions {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            empty: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add_empty(&self, session_id: &str) -> Arc<LeaseCounts> {
        let counts = Arc::new(LeaseCounts::default());
        self.empty
            .lock()
            .unwrap()
            .push_back((session_id.to_string(), Arc::clone(&counts)));
        counts
    }
}

#[async_trait]
impl SessionBroker for BrokerWithEmptySessions {
    async fn accept_next_session(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError> {
        if let Some(receiver) = self.inner.accept_next_session(queue, Duration::ZERO).await? {
            return Ok(Some(receiver));
        }
        let next = self.empty.lock().unwrap().pop_front();
        if let Some((session_id, counts)) = next {
            return Ok(Some(Box::new(EmptySession { session_id, counts })));
        }
        self.inner.accept_next_session(queue, wait).await
    }
}

/// A locked session that yields its messages, then fails the next receive.
pub struct BrokenSession {
    session_id: String,
    messages: VecDeque<Message>,
    pub counts: Arc<LeaseCounts>,
    pub completed: Arc<AtomicUsize>,
}

impl BrokenSession {
    pub fn new(session_id: &str, messages: usize) -> Self {
        let messages = (1..=messages as i64)
            .map(|seq| Message {
                message_id: format!("{session_id}-{seq}"),
                session_id: session_id.to_string(),
                sequence_number: seq,
                lock_token: LockToken::new(format!("{session_id}-lock-{seq}")),
                delivery_count: 1,
                body: Bytes::from(format!("{session_id} body {seq}")),
            })
            .collect();
        Self {
            session_id: session_id.to_string(),
            messages,
            counts: Arc::new(LeaseCounts::default()),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SessionReceiver for BrokenSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn receive_next(&mut self, _timeout: Duration) -> Result<Option<Message>, BrokerError> {
        match self.messages.pop_front() {
            Some(message) => Ok(Some(message)),
            None => Err(BrokerError::network("connection reset while receiving")),
        }
    }

    async fn complete(&mut self, _message: &Message) -> Result<(), BrokerError> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abandon(&mut self) -> Result<(), BrokerError> {
        self.counts.abandons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.counts.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers each accept from a fixed script, then reports no session available.
pub struct ScriptedBroker {
    accepts: Mutex<VecDeque<Result<Box<dyn SessionReceiver>, BrokerError>>>,
}

impl ScriptedBroker {
    pub fn new(accepts: Vec<Result<Box<dyn SessionReceiver>, BrokerError>>) -> Self {
        Self {
            accepts: Mutex::new(accepts.into()),
        }
    }
}

#[async_trait]
impl SessionBroker for ScriptedBroker {
    async fn accept_next_session(
        &self,
        _queue: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn SessionReceiver>>, BrokerError> {
        let next = self.accepts.lock().unwrap().pop_front();
        match next {
            Some(accepted) => accepted.map(Some),
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }
}
