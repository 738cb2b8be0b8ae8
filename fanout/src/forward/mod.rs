//! Downstream forwarding.
//!
//! One call per session batch, carrying every message of the batch in drain order. Gateways do
//! not retry; [`forward_with_retry`] applies the orchestrator's bounded policy on top.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{config::DownstreamConfig, message::SessionBatch};

mod http;
mod lambda;

pub use http::HttpForwarder;
pub use lambda::LambdaForwarder;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Downstream acceptance of a whole batch.
pub struct ForwardReceipt {
    /// Downstream status code, when the transport has one.
    pub status: Option<u16>,
    pub messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardFailure {
    #[error("downstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("downstream rejected batch: {detail}")]
    Rejected { status: Option<u16>, detail: String },
    #[error("downstream transport error: {0}")]
    Transport(String),
    #[error("encode: {0}")]
    Encode(String),
}

impl ForwardFailure {
    /// Whether another attempt could plausibly succeed. Rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardFailure::Timeout(_) | ForwardFailure::Transport(_))
    }
}

pub type ForwardResult = Result<ForwardReceipt, ForwardFailure>;

#[async_trait]
/// The slow synchronous downstream call.
pub trait ForwardGateway: Send + Sync {
    async fn forward(&self, batch: &SessionBatch) -> ForwardResult;
}

/// Build the gateway described by `cfg`.
pub async fn build_gateway(
    queue: &str,
    cfg: &DownstreamConfig,
) -> anyhow::Result<Arc<dyn ForwardGateway>> {
    Ok(match cfg {
        DownstreamConfig::Http(http) => Arc::new(HttpForwarder::new(queue, http)?),
        DownstreamConfig::Lambda(lambda) => Arc::new(LambdaForwarder::new(queue, lambda).await?),
    })
}

#[derive(Debug, Serialize)]
struct ForwardItem<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
    #[serde(rename = "sequenceNumber")]
    sequence_number: i64,
    #[serde(rename = "deliveryCount")]
    delivery_count: u32,
    body: String,
    #[serde(rename = "isBase64Encoded")]
    is_base64_encoded: bool,
}

/// Encode a batch as the `{ "v": 1, "meta": ..., "messages": [...] }` downstream payload.
pub fn build_payload_bytes(
    queue: &str,
    batch: &SessionBatch,
    forwarded_at_ms: u64,
) -> Result<Bytes, serde_json::Error> {
    #[derive(Serialize)]
    struct ForwardEventBorrowed<'a> {
        v: u8,
        meta: ForwardMetaBorrowed<'a>,
        messages: Vec<ForwardItem<'a>>,
    }

    #[derive(Serialize)]
    struct ForwardMetaBorrowed<'a> {
        consumer: &'static str,
        queue: &'a str,
        #[serde(rename = "sessionId")]
        session_id: &'a str,
        #[serde(rename = "forwardedAtMs")]
        forwarded_at_ms: u64,
    }

    let event = ForwardEventBorrowed {
        v: 1,
        meta: ForwardMetaBorrowed {
            consumer: "session-fanout",
            queue,
            session_id: batch.session_id(),
            forwarded_at_ms,
        },
        messages: batch
            .messages()
            .iter()
            .map(|m| ForwardItem {
                message_id: &m.message_id,
                sequence_number: m.sequence_number,
                delivery_count: m.delivery_count,
                body: STANDARD.encode(&m.body),
                is_base64_encoded: true,
            })
            .collect(),
    };

    Ok(Bytes::from(serde_json::to_vec(&event)?))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Bounded in-process retry for forward calls. `max_attempts == 1` means a single call.
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before the second attempt; doubled for each further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Forward `batch`, retrying timeouts and transport faults per `policy`.
///
/// Retries stop early once `cancel` fires; the last failure is returned.
pub async fn forward_with_retry(
    gateway: &dyn ForwardGateway,
    batch: &SessionBatch,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
) -> ForwardResult {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        let err = match gateway.forward(batch).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let wait = policy
            .backoff
            .saturating_mul(1u32 << (attempt - 1).min(10));
        tracing::warn!(
            event = "forward_retry",
            session_id = %batch.session_id(),
            attempt,
            max_attempts,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "forward failed; retrying"
        );

        match cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => tokio::time::sleep(wait).await,
        }
        attempt += 1;
    }
}
