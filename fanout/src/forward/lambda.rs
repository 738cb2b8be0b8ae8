use std::time::Duration;

use async_trait::async_trait;

use super::{build_payload_bytes, now_ms, ForwardFailure, ForwardGateway, ForwardReceipt, ForwardResult};
use crate::{config::LambdaDownstreamConfig, message::SessionBatch};

const MAX_DETAIL_CHARS: usize = 256;

/// Synchronously invokes a downstream Lambda function with each session batch.
pub struct LambdaForwarder {
    client: aws_sdk_lambda::Client,
    function_name: String,
    queue: String,
    timeout: Duration,
}

impl LambdaForwarder {
    /// Create a forwarder using standard AWS credential resolution.
    pub async fn new(queue: &str, cfg: &LambdaDownstreamConfig) -> anyhow::Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = cfg.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_cfg = loader.load().await;
        Ok(Self {
            client: aws_sdk_lambda::Client::new(&sdk_cfg),
            function_name: cfg.function_name.clone(),
            queue: queue.to_string(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }
}

#[async_trait]
impl ForwardGateway for LambdaForwarder {
    async fn forward(&self, batch: &SessionBatch) -> ForwardResult {
        let payload = build_payload_bytes(&self.queue, batch, now_ms())
            .map_err(|err| ForwardFailure::Encode(err.to_string()))?;

        tracing::info!(
            event = "downstream_call",
            function_name = %self.function_name,
            session_id = %batch.session_id(),
            batch_size = batch.messages().len(),
            payload_bytes = payload.len(),
            "forwarding"
        );

        let call = self
            .client
            .invoke()
            .function_name(&self.function_name)
            .payload(aws_sdk_lambda::primitives::Blob::new(payload))
            .send();

        let out = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => return Err(ForwardFailure::Timeout(self.timeout)),
            Ok(Err(err)) => {
                return Err(ForwardFailure::Transport(
                    aws_sdk_lambda::error::DisplayErrorContext(&err).to_string(),
                ))
            }
            Ok(Ok(out)) => out,
        };

        let status = u16::try_from(out.status_code()).ok();
        if let Some(function_error) = out.function_error() {
            let body = out
                .payload()
                .map(|b| String::from_utf8_lossy(b.as_ref()).into_owned())
                .unwrap_or_default();
            return Err(ForwardFailure::Rejected {
                status,
                detail: format!(
                    "function error ({function_error}) for {}: {}",
                    self.function_name,
                    body.chars().take(MAX_DETAIL_CHARS).collect::<String>()
                ),
            });
        }

        Ok(ForwardReceipt {
            status,
            messages: batch.messages().len(),
        })
    }
}
