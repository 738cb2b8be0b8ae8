//! One invocation: the triggered session plus up to N opportunistic sessions.
//!
//! The primary forwards the triggered batch as soon as the invocation starts and keeps its lock
//! until every worker has finished. Alongside it a fixed set of workers each accept one more
//! session from the broker, drain it, forward it, and settle it. Worker problems stay inside the worker: they are logged, the lease is released, and
//! the outcome is recorded in the [`InvocationReport`]. Only the primary session can fail the
//! invocation.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use serde_json::json;
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    broker::{BrokerError, SessionBroker},
    complete::{Acknowledged, AcknowledgeFailure, SessionCompleter, SettleReport, Settlement},
    config::DeadlinePolicy,
    drain::{DrainFailure, SessionDrainer},
    forward::{forward_with_retry, ForwardFailure, ForwardGateway, ForwardResult, RetryPolicy},
    message::{BatchError, Message, SessionBatch},
    session::SessionHandle,
};

/// The batch the host runtime delivered, with the lease it already holds for it.
#[derive(Debug)]
pub struct TriggeredSession {
    handle: SessionHandle,
    batch: SessionBatch,
}

impl TriggeredSession {
    pub fn new(handle: SessionHandle, messages: Vec<Message>) -> Result<Self, BatchError> {
        let batch = SessionBatch::new(handle.session_id(), messages)?;
        Ok(Self { handle, batch })
    }

    pub fn session_id(&self) -> &str {
        self.batch.session_id()
    }

    pub fn batch(&self) -> &SessionBatch {
        &self.batch
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue_name: String,
    pub receive_idle_timeout: Duration,
    /// Bounded wait for an unlocked session.
    pub session_wait_timeout: Duration,
    pub max_messages_per_session: Option<usize>,
    /// Workers are cancelled this long before the invocation deadline.
    pub deadline_margin: Duration,
    pub deadline_policy: DeadlinePolicy,
    pub forward_retry: RetryPolicy,
}

impl OrchestratorConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            receive_idle_timeout: Duration::from_millis(500),
            session_wait_timeout: Duration::from_secs(2),
            max_messages_per_session: None,
            deadline_margin: Duration::from_secs(5),
            deadline_policy: DeadlinePolicy::default(),
            forward_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum WorkerOutcome {
    /// No unlocked session became available within the wait.
    NoSession,
    /// Cancelled by the deadline before a session was acquired.
    Skipped,
    /// Drained nothing; lease released without forwarding.
    Empty { session_id: String },
    /// Forwarded, then acknowledged or abandoned.
    Settled(SettleReport),
    Failed(WorkerError),
}

impl WorkerOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerOutcome::NoSession => "no_session",
            WorkerOutcome::Skipped => "skipped",
            WorkerOutcome::Empty { .. } => "empty",
            WorkerOutcome::Settled(report) => match report.settlement {
                Settlement::Acknowledged => "settled",
                Settlement::Abandoned { .. } => "abandoned",
            },
            WorkerOutcome::Failed(_) => "failed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            WorkerOutcome::NoSession | WorkerOutcome::Skipped => None,
            WorkerOutcome::Empty { session_id } => Some(session_id.as_str()),
            WorkerOutcome::Settled(report) => Some(report.session_id.as_str()),
            WorkerOutcome::Failed(err) => err.session_id(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("acquire failed: {0}")]
    Acquire(#[source] BrokerError),
    #[error(transparent)]
    Drain(#[from] DrainFailure),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("forward of session {session_id} ({messages} messages) cut off by deadline")]
    Deadline { session_id: String, messages: usize },
    #[error("release of session {session_id} failed: {source}")]
    Release {
        session_id: String,
        #[source]
        source: BrokerError,
    },
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            WorkerError::Drain(DrainFailure::Receive { session_id, .. })
            | WorkerError::Drain(DrainFailure::Cancelled { session_id, .. })
            | WorkerError::Deadline { session_id, .. }
            | WorkerError::Release { session_id, .. } => Some(session_id.as_str()),
            WorkerError::Batch(BatchError::Empty { session_id })
            | WorkerError::Batch(BatchError::ForeignMessage {
                expected: session_id,
                ..
            }) => Some(session_id.as_str()),
            WorkerError::Acquire(_) | WorkerError::Panicked(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct WorkerReport {
    /// 1-based worker slot.
    pub slot: usize,
    pub outcome: WorkerOutcome,
}

#[derive(Debug)]
pub struct InvocationReport {
    /// `None` only when the primary panicked.
    pub primary: Option<SettleReport>,
    /// One entry per worker, ordered by slot.
    pub workers: Vec<WorkerReport>,
    pub deadline_hit: bool,
    pub elapsed: Duration,
}

impl InvocationReport {
    /// Sessions forwarded and acknowledged this invocation, primary included.
    pub fn sessions_processed(&self) -> usize {
        let primary = self
            .primary
            .iter()
            .filter(|r| r.settlement == Settlement::Acknowledged)
            .count();
        let workers = self
            .workers
            .iter()
            .filter(|w| {
                matches!(&w.outcome, WorkerOutcome::Settled(r) if r.settlement == Settlement::Acknowledged)
            })
            .count();
        primary + workers
    }

    pub fn worker(&self, session_id: &str) -> Option<&WorkerReport> {
        self.workers
            .iter()
            .find(|w| w.outcome.session_id() == Some(session_id))
    }

    pub fn summary(&self) -> serde_json::Value {
        fn settle(report: &SettleReport) -> serde_json::Value {
            json!({
                "sessionId": report.session_id,
                "batchSize": report.batch_size,
                "acknowledged": report.acknowledged,
                "ackFailures": report.ack_failures.len(),
                "forwardError": report.forward_failure().map(|e| e.to_string()),
                "released": report.release.is_ok(),
            })
        }

        let workers: Vec<serde_json::Value> = self
            .workers
            .iter()
            .map(|w| {
                let mut entry = json!({
                    "slot": w.slot,
                    "outcome": w.outcome.kind(),
                    "sessionId": w.outcome.session_id(),
                });
                match &w.outcome {
                    WorkerOutcome::Settled(report) => entry["settle"] = settle(report),
                    WorkerOutcome::Failed(err) => entry["error"] = json!(err.to_string()),
                    _ => {}
                }
                entry
            })
            .collect();

        json!({
            "primary": self.primary.as_ref().map(settle),
            "workers": workers,
            "sessionsProcessed": self.sessions_processed(),
            "deadlineHit": self.deadline_hit,
            "elapsedMs": self.elapsed.as_millis() as u64,
        })
    }
}

#[derive(Debug, thiserror::Error)]
/// The primary session did not settle. Worker outcomes are still attached.
pub enum InvocationError {
    #[error("primary session {session_id} forward failed: {cause}")]
    Forward {
        session_id: String,
        cause: ForwardFailure,
        report: Box<InvocationReport>,
    },
    #[error("primary session {session_id}: {} of {batch_size} acknowledgements failed", .failures.len())]
    Acknowledge {
        session_id: String,
        batch_size: usize,
        failures: Vec<AcknowledgeFailure>,
        report: Box<InvocationReport>,
    },
    #[error("primary session {session_id} task failed: {detail}")]
    Aborted {
        session_id: String,
        detail: String,
        report: Box<InvocationReport>,
    },
}

impl InvocationError {
    pub fn report(&self) -> &InvocationReport {
        match self {
            InvocationError::Forward { report, .. }
            | InvocationError::Acknowledge { report, .. }
            | InvocationError::Aborted { report, .. } => report,
        }
    }
}

struct Inner {
    broker: Arc<dyn SessionBroker>,
    gateway: Arc<dyn ForwardGateway>,
    config: OrchestratorConfig,
    drainer: SessionDrainer,
    completer: SessionCompleter,
}

/// Runs invocations against one broker and one downstream gateway.
#[derive(Clone)]
pub struct ConcurrentSessionOrchestrator {
    inner: Arc<Inner>,
}

impl ConcurrentSessionOrchestrator {
    pub fn new(
        broker: Arc<dyn SessionBroker>,
        gateway: Arc<dyn ForwardGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        let drainer = SessionDrainer::new(config.receive_idle_timeout)
            .with_max_messages(config.max_messages_per_session);
        Self {
            inner: Arc::new(Inner {
                broker,
                gateway,
                config,
                drainer,
                completer: SessionCompleter::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Process `primary` and up to `additional_sessions` more sessions, then wait for all of them.
    ///
    /// When `deadline` is set, additional workers are cancelled `deadline_margin` before it. The
    /// primary is never cancelled, and its lease is released only after every worker has finished.
    pub async fn run(
        &self,
        primary: TriggeredSession,
        additional_sessions: usize,
        deadline: Option<Instant>,
    ) -> Result<InvocationReport, InvocationError> {
        let started = Instant::now();
        let primary_session = primary.session_id().to_string();
        tracing::info!(
            event = "invocation_started",
            queue = %self.inner.config.queue_name,
            session_id = %primary_session,
            batch_size = primary.batch().messages().len(),
            additional_sessions,
            "invocation started"
        );

        let TriggeredSession {
            handle: mut primary_handle,
            batch: primary_batch,
        } = primary;

        let cancel = CancellationToken::new();
        let cancel_at = deadline.map(|d| {
            d.checked_sub(self.inner.config.deadline_margin)
                .unwrap_or_else(Instant::now)
        });
        let mut deadline_hit = false;
        if cancel_at.is_some_and(|at| at <= Instant::now()) {
            deadline_hit = true;
            tracing::warn!(
                event = "deadline_cancel",
                session_id = %primary_session,
                "invocation deadline already within margin; additional workers will not acquire"
            );
            cancel.cancel();
        }

        let mut workers = JoinSet::new();
        for slot in 1..=additional_sessions {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let outcome = AssertUnwindSafe(run_worker(&inner, slot, &cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        WorkerOutcome::Failed(WorkerError::Panicked(panic_message(&*panic)))
                    });
                (slot, outcome)
            });
        }

        // The primary runs on this task so its handle stays here: the triggered lock is held until
        // every worker has been joined, and no worker can accept the primary session meanwhile.
        let mut outcomes: Vec<Option<WorkerOutcome>> =
            (0..additional_sessions).map(|_| None).collect();
        let primary_acked = {
            let primary = AssertUnwindSafe(acknowledge_primary(
                &self.inner,
                &mut primary_handle,
                &primary_batch,
            ))
            .catch_unwind();
            tokio::pin!(primary);

            let mut acked = None;
            let mut workers_done = false;
            loop {
                if workers_done {
                    if let Some(acked) = acked.take() {
                        break acked;
                    }
                }
                tokio::select! {
                    done = &mut primary, if acked.is_none() => acked = Some(done),
                    _ = sleep_until(cancel_at), if !deadline_hit => {
                        deadline_hit = true;
                        tracing::warn!(
                            event = "deadline_cancel",
                            session_id = %primary_session,
                            policy = ?self.inner.config.deadline_policy,
                            "invocation deadline near; cancelling additional workers"
                        );
                        cancel.cancel();
                    }
                    joined = workers.join_next(), if !workers_done => match joined {
                        None => workers_done = true,
                        Some(Ok((slot, outcome))) => {
                            log_outcome(slot, &outcome);
                            if let Some(entry) = outcomes.get_mut(slot - 1) {
                                *entry = Some(outcome);
                            }
                        }
                        Some(Err(err)) => {
                            tracing::error!(
                                event = "worker_failed",
                                error = %err,
                                "worker task did not complete"
                            );
                        }
                    },
                }
            }
        };

        let workers = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| WorkerReport {
                slot: i + 1,
                outcome: outcome.unwrap_or_else(|| {
                    WorkerOutcome::Failed(WorkerError::Panicked("worker task aborted".to_string()))
                }),
            })
            .collect();
        let mut report = InvocationReport {
            primary: None,
            workers,
            deadline_hit,
            elapsed: started.elapsed(),
        };

        let acked = match primary_acked {
            Ok(acked) => acked,
            Err(panic) => {
                release_after_failure(primary_handle).await;
                report.elapsed = started.elapsed();
                log_settled(&report, false);
                return Err(InvocationError::Aborted {
                    session_id: primary_session,
                    detail: panic_message(&*panic),
                    report: Box::new(report),
                });
            }
        };
        let settle = self.inner.completer.release(primary_handle, acked).await;
        report.elapsed = started.elapsed();

        let forward_failure = settle.forward_failure().cloned();
        let ack_failures = settle.ack_failures.clone();
        let batch_size = settle.batch_size;
        report.primary = Some(settle);

        if let Some(cause) = forward_failure {
            log_settled(&report, false);
            return Err(InvocationError::Forward {
                session_id: primary_session,
                cause,
                report: Box::new(report),
            });
        }
        if !ack_failures.is_empty() {
            log_settled(&report, false);
            return Err(InvocationError::Acknowledge {
                session_id: primary_session,
                batch_size,
                failures: ack_failures,
                report: Box::new(report),
            });
        }

        log_settled(&report, true);
        Ok(report)
    }
}

/// Forward and acknowledge the triggered batch. The caller releases the lease.
async fn acknowledge_primary(
    inner: &Inner,
    handle: &mut SessionHandle,
    batch: &SessionBatch,
) -> Acknowledged {
    let result = forward_with_retry(
        inner.gateway.as_ref(),
        batch,
        &inner.config.forward_retry,
        None,
    )
    .await;
    log_forwarded(batch, &result);
    inner.completer.acknowledge(handle, batch, result).await
}

async fn run_worker(inner: &Inner, slot: usize, cancel: &CancellationToken) -> WorkerOutcome {
    let config = &inner.config;

    let acquired = tokio::select! {
        biased;
        _ = cancel.cancelled() => return WorkerOutcome::Skipped,
        acquired = inner
            .broker
            .accept_next_session(&config.queue_name, config.session_wait_timeout) => acquired,
    };
    let mut handle = match acquired {
        Ok(Some(receiver)) => SessionHandle::acquired(receiver),
        Ok(None) => {
            tracing::debug!(
                event = "no_session_available",
                slot,
                wait_ms = config.session_wait_timeout.as_millis() as u64,
                "no unlocked session"
            );
            return WorkerOutcome::NoSession;
        }
        Err(err) => return WorkerOutcome::Failed(WorkerError::Acquire(err)),
    };

    let session_id = handle.session_id().to_string();
    tracing::info!(
        event = "session_acquired",
        slot,
        session_id = %session_id,
        "additional session acquired"
    );

    let messages = match inner.drainer.drain(&mut handle, cancel).await {
        Ok(messages) => messages,
        Err(err) => {
            release_after_failure(handle).await;
            return WorkerOutcome::Failed(err.into());
        }
    };

    if messages.is_empty() {
        return match handle.close().await {
            Ok(_) => WorkerOutcome::Empty { session_id },
            Err(source) => WorkerOutcome::Failed(WorkerError::Release { session_id, source }),
        };
    }

    let batch = match SessionBatch::new(session_id.as_str(), messages) {
        Ok(batch) => batch,
        Err(err) => {
            release_after_failure(handle).await;
            return WorkerOutcome::Failed(err.into());
        }
    };

    let result = match config.deadline_policy {
        DeadlinePolicy::Abandon => tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(
                    event = "forward_cut_off",
                    slot,
                    session_id = %session_id,
                    batch_size = batch.messages().len(),
                    "deadline reached during forward; abandoning session"
                );
                release_after_failure(handle).await;
                return WorkerOutcome::Failed(WorkerError::Deadline {
                    session_id,
                    messages: batch.messages().len(),
                });
            }
            result = forward_with_retry(
                inner.gateway.as_ref(),
                &batch,
                &config.forward_retry,
                Some(cancel),
            ) => result,
        },
        DeadlinePolicy::FinishInFlight => {
            forward_with_retry(
                inner.gateway.as_ref(),
                &batch,
                &config.forward_retry,
                Some(cancel),
            )
            .await
        }
    };
    log_forwarded(&batch, &result);

    WorkerOutcome::Settled(inner.completer.complete(handle, &batch, result).await)
}

/// Abandon a lease after a failure. A failed release is logged; the broker lease expires anyway.
async fn release_after_failure(handle: SessionHandle) {
    let session_id = handle.session_id().to_string();
    if let Err(err) = handle.abandon().await {
        tracing::warn!(
            event = "session_release_failed",
            session_id = %session_id,
            error = %err,
            "abandon after failure did not complete"
        );
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn log_forwarded(batch: &SessionBatch, result: &ForwardResult) {
    if let Ok(receipt) = result {
        tracing::info!(
            event = "session_forwarded",
            session_id = %batch.session_id(),
            batch_size = batch.messages().len(),
            status = ?receipt.status,
            "session forwarded"
        );
    }
}

fn log_outcome(slot: usize, outcome: &WorkerOutcome) {
    match outcome {
        WorkerOutcome::Failed(err) => tracing::warn!(
            event = "worker_failed",
            slot,
            session_id = ?outcome.session_id(),
            error = %err,
            "additional session worker failed"
        ),
        _ => tracing::debug!(
            event = "worker_finished",
            slot,
            session_id = ?outcome.session_id(),
            outcome = outcome.kind(),
            "additional session worker finished"
        ),
    }
}

fn log_settled(report: &InvocationReport, primary_ok: bool) {
    tracing::info!(
        event = "invocation_settled",
        primary_ok,
        sessions_processed = report.sessions_processed(),
        workers = report.workers.len(),
        deadline_hit = report.deadline_hit,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "invocation settled"
    );
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{broker::InMemoryBroker, forward::ForwardReceipt, session::Release};

    const Q: &str = "orders";

    #[derive(Default)]
    struct TestGateway {
        delay: HashMap<String, Duration>,
        fail: HashSet<String>,
        panic_on: HashSet<String>,
        calls: Mutex<Vec<(String, Vec<i64>)>>,
    }

    impl TestGateway {
        fn calls(&self) -> Vec<(String, Vec<i64>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ForwardGateway for TestGateway {
        async fn forward(&self, batch: &SessionBatch) -> ForwardResult {
            let session_id = batch.session_id().to_string();
            self.calls
                .lock()
                .unwrap()
                .push((session_id.clone(), batch.sequence_numbers()));
            if let Some(delay) = self.delay.get(&session_id) {
                tokio::time::sleep(*delay).await;
            }
            if self.panic_on.contains(&session_id) {
                panic!("downstream client bug");
            }
            if self.fail.contains(&session_id) {
                return Err(ForwardFailure::Timeout(Duration::from_secs(30)));
            }
            Ok(ForwardReceipt {
                status: Some(200),
                messages: batch.messages().len(),
            })
        }
    }

    async fn seed(broker: &InMemoryBroker, session_id: &str, count: usize) {
        for i in 0..count {
            broker
                .send(Q, session_id, format!("{session_id}-body-{i}"))
                .await;
        }
    }

    async fn trigger(broker: &InMemoryBroker, session_id: &str) -> TriggeredSession {
        let mut handle = SessionHandle::triggered(broker.accept_session(Q, session_id).await.unwrap());
        let messages = SessionDrainer::new(Duration::from_millis(50))
            .drain(&mut handle, &CancellationToken::new())
            .await
            .unwrap();
        TriggeredSession::new(handle, messages).unwrap()
    }

    fn orchestrator(
        broker: &InMemoryBroker,
        gateway: &Arc<TestGateway>,
        config: OrchestratorConfig,
    ) -> ConcurrentSessionOrchestrator {
        ConcurrentSessionOrchestrator::new(Arc::new(broker.clone()), gateway.clone(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn primary_and_additional_sessions_settle_independently() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 3).await;
        seed(&broker, "S2", 2).await;
        let gateway = Arc::new(TestGateway::default());

        let primary = trigger(&broker, "S1").await;
        let report = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 2, None)
            .await
            .unwrap();

        let primary = report.primary.as_ref().unwrap();
        assert!(primary.is_clean());
        assert_eq!(primary.acknowledged, vec![1, 2, 3]);
        assert_eq!(report.sessions_processed(), 2);
        assert!(!report.deadline_hit);

        let s2 = report.worker("S2").unwrap();
        assert_eq!(s2.outcome.kind(), "settled");
        // Only one other session exists; the second worker finds nothing.
        assert_eq!(
            report
                .workers
                .iter()
                .filter(|w| matches!(w.outcome, WorkerOutcome::NoSession))
                .count(),
            1
        );

        assert_eq!(broker.acknowledged(Q, "S1").await.len(), 3);
        assert_eq!(broker.acknowledged(Q, "S2").await.len(), 2);
        assert_eq!(broker.releases(Q, "S1").await, 1);
        assert_eq!(broker.releases(Q, "S2").await, 1);

        let mut calls = gateway.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![("S1".to_string(), vec![1, 2, 3]), ("S2".to_string(), vec![1, 2])]
        );

        let summary = report.summary();
        assert_eq!(summary["sessionsProcessed"], 2);
        assert_eq!(summary["primary"]["sessionId"], "S1");
    }

    #[tokio::test(start_paused = true)]
    async fn primary_forward_failure_fails_invocation_but_workers_settle() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        seed(&broker, "S2", 2).await;
        let gateway = Arc::new(TestGateway {
            fail: HashSet::from(["S1".to_string()]),
            ..Default::default()
        });

        let primary = trigger(&broker, "S1").await;
        let err = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 1, None)
            .await
            .unwrap_err();

        match &err {
            InvocationError::Forward {
                session_id, cause, ..
            } => {
                assert_eq!(session_id, "S1");
                assert_eq!(cause, &ForwardFailure::Timeout(Duration::from_secs(30)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let report = err.report();
        let primary = report.primary.as_ref().unwrap();
        assert!(primary.acknowledged.is_empty());
        assert_eq!(primary.release, Ok(Release::Abandoned));
        assert_eq!(report.worker("S2").unwrap().outcome.kind(), "settled");

        assert!(broker.acknowledged(Q, "S1").await.is_empty());
        assert_eq!(broker.pending(Q, "S1").await, 1);
        assert!(!broker.is_locked(Q, "S1").await);
        assert_eq!(broker.releases(Q, "S1").await, 1);
        assert_eq!(broker.acknowledged(Q, "S2").await.len(), 2);

        let s1_calls = gateway.calls().into_iter().filter(|(s, _)| s == "S1").count();
        assert_eq!(s1_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_primary_stays_locked_until_workers_finish() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        let gateway = Arc::new(TestGateway {
            fail: HashSet::from(["S1".to_string()]),
            ..Default::default()
        });

        let primary = trigger(&broker, "S1").await;
        let err = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 2, None)
            .await
            .unwrap_err();

        assert!(matches!(err, InvocationError::Forward { .. }));
        assert!(err
            .report()
            .workers
            .iter()
            .all(|w| matches!(w.outcome, WorkerOutcome::NoSession)));
        assert_eq!(gateway.calls(), vec![("S1".to_string(), vec![1])]);
        assert_eq!(broker.leases_granted(Q, "S1").await, 1);
        assert_eq!(broker.releases(Q, "S1").await, 1);
        assert!(broker.acknowledged(Q, "S1").await.is_empty());
        assert_eq!(broker.pending(Q, "S1").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_forward_failure_is_isolated() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 2).await;
        seed(&broker, "S2", 2).await;
        seed(&broker, "S3", 1).await;
        let gateway = Arc::new(TestGateway {
            fail: HashSet::from(["S2".to_string()]),
            ..Default::default()
        });

        let primary = trigger(&broker, "S1").await;
        let report = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 2, None)
            .await
            .unwrap();

        assert_eq!(report.worker("S2").unwrap().outcome.kind(), "abandoned");
        assert_eq!(report.worker("S3").unwrap().outcome.kind(), "settled");
        assert_eq!(report.sessions_processed(), 2);

        assert!(broker.acknowledged(Q, "S2").await.is_empty());
        assert_eq!(broker.pending(Q, "S2").await, 2);
        assert!(!broker.is_locked(Q, "S2").await);
        assert_eq!(broker.acknowledged(Q, "S3").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_worker_is_reported_and_its_lease_released() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        seed(&broker, "S2", 2).await;
        let gateway = Arc::new(TestGateway {
            panic_on: HashSet::from(["S2".to_string()]),
            ..Default::default()
        });

        let primary = trigger(&broker, "S1").await;
        let report = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 1, None)
            .await
            .unwrap();

        assert!(report.primary.as_ref().unwrap().is_clean());
        match &report.workers[0].outcome {
            WorkerOutcome::Failed(WorkerError::Panicked(msg)) => {
                assert!(msg.contains("downstream client bug"))
            }
            other => panic!("unexpected {other:?}"),
        }

        for _ in 0..50 {
            if !broker.is_locked(Q, "S2").await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!broker.is_locked(Q, "S2").await);
        assert!(broker.acknowledged(Q, "S2").await.is_empty());
        assert_eq!(broker.pending(Q, "S2").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_in_flight_forward() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        seed(&broker, "S2", 2).await;
        let gateway = Arc::new(TestGateway {
            delay: HashMap::from([("S2".to_string(), Duration::from_secs(10))]),
            ..Default::default()
        });

        let primary = trigger(&broker, "S1").await;
        let deadline = Instant::now() + Duration::from_secs(8);
        let report = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 1, Some(deadline))
            .await
            .unwrap();

        assert!(report.deadline_hit);
        assert!(report.elapsed < Duration::from_secs(8));
        match &report.workers[0].outcome {
            WorkerOutcome::Failed(WorkerError::Deadline {
                session_id,
                messages,
            }) => {
                assert_eq!(session_id, "S2");
                assert_eq!(*messages, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(broker.acknowledged(Q, "S2").await.is_empty());
        assert_eq!(broker.pending(Q, "S2").await, 2);
        assert!(!broker.is_locked(Q, "S2").await);
        assert_eq!(broker.acknowledged(Q, "S1").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_in_flight_policy_lets_forward_complete() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        seed(&broker, "S2", 2).await;
        let gateway = Arc::new(TestGateway {
            delay: HashMap::from([("S2".to_string(), Duration::from_secs(10))]),
            ..Default::default()
        });
        let mut config = OrchestratorConfig::new(Q);
        config.deadline_policy = DeadlinePolicy::FinishInFlight;

        let primary = trigger(&broker, "S1").await;
        let deadline = Instant::now() + Duration::from_secs(8);
        let report = orchestrator(&broker, &gateway, config)
            .run(primary, 1, Some(deadline))
            .await
            .unwrap();

        assert!(report.deadline_hit);
        assert_eq!(report.worker("S2").unwrap().outcome.kind(), "settled");
        assert_eq!(broker.acknowledged(Q, "S2").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_skips_workers_but_not_primary() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 2).await;
        seed(&broker, "S2", 1).await;
        let gateway = Arc::new(TestGateway::default());

        let primary = trigger(&broker, "S1").await;
        let deadline = Instant::now() + Duration::from_secs(1);
        let report = orchestrator(&broker, &gateway, OrchestratorConfig::new(Q))
            .run(primary, 3, Some(deadline))
            .await
            .unwrap();

        assert!(report.primary.as_ref().unwrap().is_clean());
        assert_eq!(report.workers.len(), 3);
        assert!(report
            .workers
            .iter()
            .all(|w| matches!(w.outcome, WorkerOutcome::Skipped)));
        assert_eq!(broker.pending(Q, "S2").await, 1);
        assert_eq!(broker.leases_granted(Q, "S2").await, 0);
    }

    #[tokio::test]
    async fn triggered_session_rejects_empty_batch() {
        let broker = InMemoryBroker::new();
        seed(&broker, "S1", 1).await;
        let handle = SessionHandle::triggered(broker.accept_session(Q, "S1").await.unwrap());
        let err = TriggeredSession::new(handle, Vec::new()).unwrap_err();
        assert!(matches!(err, BatchError::Empty { .. }));
    }
}
