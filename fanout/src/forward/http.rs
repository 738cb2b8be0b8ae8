use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use super::{build_payload_bytes, now_ms, ForwardFailure, ForwardGateway, ForwardReceipt, ForwardResult};
use crate::{config::HttpDownstreamConfig, message::SessionBatch};

const MAX_DETAIL_CHARS: usize = 256;

/// POSTs each session batch to a downstream HTTP API.
#[derive(Clone)]
pub struct HttpForwarder {
    http: reqwest::Client,
    url: String,
    queue: String,
    timeout: Duration,
    headers: HeaderMap,
}

impl HttpForwarder {
    pub fn new(queue: &str, cfg: &HttpDownstreamConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::with_capacity(cfg.headers.len());
        for (name, value) in &cfg.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| anyhow::anyhow!("invalid downstream header name ({name}): {err}"))?;
            headers.insert(name, HeaderValue::from_str(value)?);
        }

        let timeout = Duration::from_millis(cfg.timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
            queue: queue.to_string(),
            timeout,
            headers,
        })
    }
}

#[async_trait]
impl ForwardGateway for HttpForwarder {
    async fn forward(&self, batch: &SessionBatch) -> ForwardResult {
        let payload = build_payload_bytes(&self.queue, batch, now_ms())
            .map_err(|err| ForwardFailure::Encode(err.to_string()))?;

        tracing::info!(
            event = "downstream_call",
            url = %self.url,
            session_id = %batch.session_id(),
            batch_size = batch.messages().len(),
            payload_bytes = payload.len(),
            "forwarding"
        );

        let resp = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ForwardFailure::Timeout(self.timeout)
                } else {
                    ForwardFailure::Transport(err.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = if body.is_empty() {
                format!("status {status}")
            } else {
                format!(
                    "status {status}: {}",
                    body.chars().take(MAX_DETAIL_CHARS).collect::<String>()
                )
            };
            return Err(ForwardFailure::Rejected {
                status: Some(status.as_u16()),
                detail,
            });
        }

        Ok(ForwardReceipt {
            status: Some(status.as_u16()),
            messages: batch.messages().len(),
        })
    }
}
