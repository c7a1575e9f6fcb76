//! The `run` subcommand: feed JSON-lines readings through a quality engine.

use anyhow::Context;
use lactoflow_core::alerts::AlertFilter;
use lactoflow_core::sinks::atomic_write_json;
use lactoflow_core::{
    Alert, EngineConfig, HttpAdvisor, HttpExplainer, HttpPredictor, IngestAck, MetricsSnapshot,
    MockAdvisor, MockExplainer, MockPredictor, NackReason, QualityEngine, RawReading,
    ShutdownReport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Retries of a reading refused because its worker queue was full.
const QUEUE_FULL_RETRIES: u32 = 200;

pub struct RunOptions {
    pub input: Option<PathBuf>,
    pub mock: bool,
    pub report: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
struct RunReport {
    lines: u64,
    unparsable: u64,
    nacks: u64,
    shutdown: ShutdownReport,
    metrics: MetricsSnapshot,
    alerts: Vec<Alert>,
}

/// Build the engine from configuration, replay the input, then shut down.
pub async fn run(config: EngineConfig, options: RunOptions) -> anyhow::Result<()> {
    let shutdown_timeout = Duration::from_millis(config.pipeline.shutdown_timeout_ms);
    let engine = build_engine(config, options.mock)?;

    let mut report = RunReport::default();
    match options.input.as_deref() {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            feed(&engine, BufReader::new(file), &mut report).await?;
        }
        _ => feed(&engine, BufReader::new(tokio::io::stdin()), &mut report).await?,
    }

    report.shutdown = engine.shutdown(shutdown_timeout).await?;
    report.metrics = engine.metrics();
    report.alerts = engine.get_alerts(&AlertFilter::default());

    print_summary(&report);
    if let Some(path) = &options.report {
        atomic_write_json(path, &report)
            .with_context(|| format!("cannot write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn build_engine(config: EngineConfig, mock: bool) -> anyhow::Result<QualityEngine> {
    let builder = QualityEngine::builder(config.clone());
    let builder = if mock {
        info!("Using built-in deterministic ports");
        builder
            .predictor(Arc::new(MockPredictor::echo()))
            .explainer(Arc::new(MockExplainer::new()))
            .advisor(Arc::new(MockAdvisor::echo()))
    } else {
        let remote = &config.remote;
        let predictor_url = remote.predictor_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("remote.predictor_url is not configured (use --mock for a local run)")
        })?;
        let mut builder = builder.predictor(Arc::new(HttpPredictor::new(predictor_url, remote)?));
        if let Some(url) = &remote.explainer_url {
            builder = builder.explainer(Arc::new(HttpExplainer::new(url, remote)?));
        }
        if let Some(url) = &remote.advisor_url {
            builder = builder.advisor(Arc::new(HttpAdvisor::new(url, remote)?));
        }
        builder
    };
    Ok(builder.build()?)
}

async fn feed<R>(engine: &QualityEngine, reader: R, report: &mut RunReport) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping intake");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.lines += 1;

        let raw: RawReading = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                report.unparsable += 1;
                warn!(line = report.lines, error = %e, "Skipping unparsable line");
                continue;
            }
        };
        if let IngestAck::Nack { sample_id, reason } = ingest_with_retry(engine, raw).await {
            report.nacks += 1;
            println!(
                "NACK {}: {}",
                sample_id.as_deref().unwrap_or("<no id>"),
                reason
            );
        }
    }
    Ok(())
}

/// A full worker queue is transient while replaying a file; wait for room
/// instead of dropping the reading.
async fn ingest_with_retry(engine: &QualityEngine, raw: RawReading) -> IngestAck {
    let mut attempts = 0;
    loop {
        let ack = engine.ingest(raw.clone());
        match &ack {
            IngestAck::Nack {
                reason: NackReason::QueueFull,
                ..
            } if attempts < QUEUE_FULL_RETRIES => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            _ => return ack,
        }
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Alerts ({}):", report.alerts.len());
    for alert in &report.alerts {
        println!(
            "  [{}] {} {} {} measured={:.3} threshold={:.3} x{}",
            alert.severity,
            alert.status,
            alert.rule_id,
            alert.entity,
            alert.measured,
            alert.threshold,
            alert.trigger_count
        );
        if let Some(rec) = &alert.recommendation {
            println!("      -> {} (owner: {})", rec.action, rec.owner);
        }
    }

    let m = &report.metrics;
    println!();
    println!(
        "Lines: {}  unparsable: {}  nacked: {}",
        report.lines, report.unparsable, report.nacks
    );
    println!(
        "Samples: accepted {}  processed {}  degraded {}  rejected {}  duplicates {}  dropped {}",
        m.samples_accepted,
        m.samples_processed,
        m.samples_degraded,
        m.samples_rejected,
        m.samples_duplicate,
        m.samples_dropped
    );
    if m.samples_backpressured > 0 {
        println!("Queue full: {} retried offers", m.samples_backpressured);
    }
    println!(
        "Alerts: opened {}  escalated {}  suppressed {}  resolved {}",
        m.alerts_opened, m.alerts_escalated, m.alerts_suppressed, m.alerts_resolved
    );
    println!(
        "Explanations: {} ok, {} failed  Recommendations: {} advisory, {} fallback",
        m.explanations_computed,
        m.explanations_failed,
        m.recommendations_delivered,
        m.recommendations_fallback
    );
    println!(
        "Sinks: {} ok, {} failed, {} dropped, {} sync skipped",
        m.sink_writes_ok, m.sink_writes_failed, m.sink_writes_dropped, m.sync_skipped
    );
    if report.shutdown.timed_out {
        println!(
            "Shutdown timed out: {} samples abandoned",
            report.shutdown.abandoned
        );
    }
}
