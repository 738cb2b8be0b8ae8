//! Replay one invocation from a fixture against a configured downstream.
//!
//! The fixture seeds an in-memory broker; its primary session is locked and drained the way the
//! host runtime would before triggering the consumer.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use clap::Parser;
use serde::Deserialize;
use session_fanout::{
    broker::InMemoryBroker,
    config::FanoutConfig,
    drain::SessionDrainer,
    forward::build_gateway,
    orchestrator::{ConcurrentSessionOrchestrator, TriggeredSession},
    session::SessionHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
struct Args {
    /// YAML consumer config.
    #[arg(long)]
    config: String,
    /// JSON fixture with the sessions to seed.
    #[arg(long)]
    fixture: String,
    /// Invocation deadline, in milliseconds from start.
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Log line format on stderr. The report always goes to stdout.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fixture {
    primary_session: String,
    /// Message bodies per session, in publish order.
    sessions: BTreeMap<String, Vec<String>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;
    tracing::info!(config = %args.config, fixture = %args.fixture, "starting");

    let cfg = FanoutConfig::load(&tokio::fs::read(&args.config).await?)?;
    let fixture: Fixture = serde_json::from_slice(&tokio::fs::read(&args.fixture).await?)?;
    if !fixture.sessions.contains_key(&fixture.primary_session) {
        anyhow::bail!(
            "fixture primary session {} has no messages",
            fixture.primary_session
        );
    }

    let queue = cfg.queue_name.clone();
    let broker = InMemoryBroker::new();
    for (session_id, bodies) in &fixture.sessions {
        for body in bodies {
            broker.send(&queue, session_id, body.clone()).await;
        }
    }

    let orch_cfg = cfg.orchestrator_config();
    let mut handle =
        SessionHandle::triggered(broker.accept_session(&queue, &fixture.primary_session).await?);
    let messages = SessionDrainer::new(orch_cfg.receive_idle_timeout)
        .with_max_messages(orch_cfg.max_messages_per_session)
        .drain(&mut handle, &CancellationToken::new())
        .await?;
    let primary = TriggeredSession::new(handle, messages)?;

    let gateway = build_gateway(&queue, &cfg.downstream).await?;
    let orchestrator =
        ConcurrentSessionOrchestrator::new(Arc::new(broker.clone()), gateway, orch_cfg);
    let deadline = args
        .deadline_ms
        .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

    let result = orchestrator
        .run(primary, cfg.additional_sessions, deadline)
        .await;

    let mut pending = BTreeMap::new();
    for session_id in fixture.sessions.keys() {
        pending.insert(session_id.clone(), broker.pending(&queue, session_id).await);
    }

    let report = match &result {
        Ok(report) => report,
        Err(err) => err.report(),
    };
    let out = serde_json::json!({
        "ok": result.is_ok(),
        "report": report.summary(),
        "pending": pending,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);

    if let Err(err) = result {
        tracing::error!(event = "invocation_failed", error = %err, "invocation failed");
        anyhow::bail!("{err}");
    }
    Ok(())
}

/// Logs go to stderr so stdout carries only the JSON report.
fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("session_fanout=info,fanout_replay=info")
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    }
    .map_err(|err| anyhow::anyhow!("tracing init failed: {err}"))
}
