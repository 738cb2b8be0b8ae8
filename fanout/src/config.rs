//! Consumer configuration loaded from YAML.
//!
//! Everything here is an externally supplied constant. The additional-session count in particular
//! is tuned against observed downstream latency, so it can also be overridden from the
//! environment without editing the manifest.

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::{forward::RetryPolicy, orchestrator::OrchestratorConfig};

/// Overrides [`FanoutConfig::additional_sessions`] when set.
pub const ADDITIONAL_SESSIONS_ENV: &str = "FANOUT_ADDITIONAL_SESSIONS";

fn default_additional_sessions() -> usize {
    4
}

fn default_receive_idle_timeout_ms() -> u64 {
    500
}

fn default_session_wait_timeout_ms() -> u64 {
    2_000
}

fn default_deadline_margin_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_downstream_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What additional-session workers do with an in-flight forward when the invocation deadline nears.
pub enum DeadlinePolicy {
    /// Drop the forward call and abandon the session for redelivery.
    #[default]
    Abandon,
    /// Let the forward call finish, then settle normally.
    FinishInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardRetryConfig {
    #[serde(default = "default_max_attempts")]
    /// Total forward attempts per session, first call included.
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ForwardRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpDownstreamConfig {
    pub url: String,
    #[serde(default = "default_downstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    /// Static headers added to every downstream request.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LambdaDownstreamConfig {
    pub function_name: String,
    #[serde(default)]
    /// Optional AWS region override for the Lambda client.
    pub region: Option<String>,
    #[serde(default = "default_downstream_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownstreamConfig {
    Http(HttpDownstreamConfig),
    Lambda(LambdaDownstreamConfig),
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level consumer configuration.
pub struct FanoutConfig {
    /// Session-enabled queue the consumer reads.
    pub queue_name: String,

    #[serde(default = "default_additional_sessions")]
    /// Sessions accepted per invocation on top of the triggered one.
    pub additional_sessions: usize,

    #[serde(default = "default_receive_idle_timeout_ms")]
    /// Per-receive wait; a session is considered drained once a receive returns nothing.
    pub receive_idle_timeout_ms: u64,

    #[serde(default = "default_session_wait_timeout_ms")]
    /// How long a worker waits for an unlocked session before giving up.
    pub session_wait_timeout_ms: u64,

    #[serde(default)]
    /// Optional cap on messages taken from one session per invocation.
    pub max_messages_per_session: Option<usize>,

    #[serde(default = "default_deadline_margin_ms")]
    /// Additional workers are cancelled this long before the invocation deadline.
    pub deadline_margin_ms: u64,

    #[serde(default)]
    pub deadline_policy: DeadlinePolicy,

    #[serde(default)]
    pub forward_retry: ForwardRetryConfig,

    pub downstream: DownstreamConfig,
}

impl FanoutConfig {
    /// Parse a YAML config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Parse, apply environment overrides, and validate.
    pub fn load(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut cfg = Self::from_yaml_bytes(bytes)?;
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(raw) = lookup(ADDITIONAL_SESSIONS_ENV) {
            self.additional_sessions = raw.trim().parse().map_err(|err| {
                anyhow::anyhow!("invalid {ADDITIONAL_SESSIONS_ENV} ({raw}): {err}")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_name.trim().is_empty() {
            anyhow::bail!("queue_name must not be empty");
        }
        if self.receive_idle_timeout_ms == 0 {
            anyhow::bail!("receive_idle_timeout_ms must be greater than zero");
        }
        if self.forward_retry.max_attempts == 0 {
            anyhow::bail!("forward_retry.max_attempts must be at least 1");
        }
        match &self.downstream {
            DownstreamConfig::Http(http) if http.url.trim().is_empty() => {
                anyhow::bail!("downstream.url must not be empty")
            }
            DownstreamConfig::Lambda(lambda) if lambda.function_name.trim().is_empty() => {
                anyhow::bail!("downstream.function_name must not be empty")
            }
            _ => Ok(()),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            queue_name: self.queue_name.clone(),
            receive_idle_timeout: Duration::from_millis(self.receive_idle_timeout_ms),
            session_wait_timeout: Duration::from_millis(self.session_wait_timeout_ms),
            max_messages_per_session: self.max_messages_per_session,
            deadline_margin: Duration::from_millis(self.deadline_margin_ms),
            deadline_policy: self.deadline_policy,
            forward_retry: RetryPolicy {
                max_attempts: self.forward_retry.max_attempts,
                backoff: Duration::from_millis(self.forward_retry.backoff_ms),
            },
        }
    }
}
