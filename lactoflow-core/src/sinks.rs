//! Persistence and downstream sync sinks, written from a decoupled queue.
//!
//! The pipeline hands records and payloads to [`SinkWriter`] without waiting.
//! A full queue drops the write with a warning so sinks never apply
//! backpressure to ingestion. Failed writes are retried with backoff and logged
//! once the retry budget is spent; the in-memory pipeline carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::aggregator::{AggregateState, Analytics};
use crate::alerts::Alert;
use crate::error::PersistenceError;
use crate::metrics::{Counter, EngineMetrics};
use crate::retry::{RetryConfig, with_retry};
use crate::types::{EntityKey, Metric, QualityMetrics, Sample, SampleStatus};

/// A record handed to persistence sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Record {
    Sample(Sample),
    Aggregate(AggregateState),
    Alert(Alert),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Sample(_) => "sample",
            Record::Aggregate(_) => "aggregate",
            Record::Alert(_) => "alert",
        }
    }
}

/// Compact aggregate view carried in sync payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub key: EntityKey,
    pub count: u64,
    pub version: u64,
    pub means: BTreeMap<Metric, f64>,
    pub analytics: Analytics,
    pub last_update: DateTime<Utc>,
}

impl From<&AggregateState> for AggregateSummary {
    fn from(state: &AggregateState) -> Self {
        Self {
            key: state.key.clone(),
            count: state.count,
            version: state.version,
            means: state.stats.iter().map(|(m, s)| (*m, s.mean)).collect(),
            analytics: state.analytics(),
            last_update: state.last_update,
        }
    }
}

/// Sample-centric payload for downstream systems. Raw spectra are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedPayload {
    pub sample_id: String,
    pub timestamp: DateTime<Utc>,
    pub supplier_id: String,
    pub route_id: String,
    pub batch_id: String,
    pub device_id: String,
    pub status: SampleStatus,
    pub metrics: QualityMetrics,
    pub alerts: Vec<Alert>,
    pub aggregates: Vec<AggregateSummary>,
}

impl EnrichedPayload {
    pub fn new(sample: &Sample, alerts: Vec<Alert>, aggregates: &[Arc<AggregateState>]) -> Self {
        Self {
            sample_id: sample.id.clone(),
            timestamp: sample.timestamp,
            supplier_id: sample.supplier_id.clone(),
            route_id: sample.route_id.clone(),
            batch_id: sample.batch_id.clone(),
            device_id: sample.device_id.clone(),
            status: sample.status,
            metrics: sample.metrics.clone(),
            alerts,
            aggregates: aggregates.iter().map(|a| AggregateSummary::from(a.as_ref())).collect(),
        }
    }
}

/// Durable storage for samples, aggregates and alerts.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn name(&self) -> &str;
    async fn save(&self, record: &Record) -> Result<(), PersistenceError>;
}

/// Downstream system receiving enriched payloads.
#[async_trait]
pub trait SyncSink: Send + Sync {
    fn name(&self) -> &str;
    async fn push(&self, payload: &EnrichedPayload) -> Result<(), PersistenceError>;
}

/// In-memory sink for tests. Can be told to fail its first `n` writes.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    payloads: Mutex<Vec<EnrichedPayload>>,
    failures_left: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            failures_left: Mutex::new(n),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn payloads(&self) -> Vec<EnrichedPayload> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_failure(&self) -> Result<(), PersistenceError> {
        let mut left = self.failures_left.lock().unwrap_or_else(|e| e.into_inner());
        if *left > 0 {
            *left -= 1;
            return Err(PersistenceError::WriteFailed {
                sink: "memory".into(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, record: &Record) -> Result<(), PersistenceError> {
        self.take_failure()?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl SyncSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, payload: &EnrichedPayload) -> Result<(), PersistenceError> {
        self.take_failure()?;
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        Ok(())
    }
}

/// Append-only JSON lines files, one per record kind (`samples.jsonl`,
/// `aggregates.jsonl`, `alerts.jsonl`). Each file is opened once and kept
/// open; a failed write closes it so the retry reopens it.
pub struct JsonlSink {
    dir: PathBuf,
    files: tokio::sync::Mutex<HashMap<&'static str, tokio::fs::File>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn open(&self, kind: &str) -> Result<tokio::fs::File, PersistenceError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.write_error(e))?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(kind))
            .await
            .map_err(|e| self.write_error(e))
    }

    #[cfg(test)]
    async fn open_files(&self) -> usize {
        self.files.lock().await.len()
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{kind}s.jsonl"))
    }

    fn write_error(&self, e: impl std::fmt::Display) -> PersistenceError {
        PersistenceError::WriteFailed {
            sink: "jsonl".into(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn save(&self, record: &Record) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record).map_err(|e| self.write_error(e))?;
        line.push('\n');
        let kind = record.kind();
        let mut files = self.files.lock().await;
        if !files.contains_key(kind) {
            let file = self.open(kind).await?;
            files.insert(kind, file);
        }
        let Some(file) = files.get_mut(kind) else {
            return Err(self.write_error("file handle missing"));
        };
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            files.remove(kind);
            return Err(self.write_error(e));
        }
        Ok(())
    }
}

/// Read every record from a JSON lines file written by [`JsonlSink`].
///
/// Returns an empty list if the file doesn't exist.
pub fn load_jsonl(path: &Path) -> io::Result<Vec<Record>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}

/// Atomically write JSON data to a file: write a `.tmp` sibling, then rename.
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// JSON POST of enriched payloads to a downstream endpoint.
pub struct HttpSyncSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSyncSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PersistenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistenceError::WriteFailed {
                sink: "http-sync".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SyncSink for HttpSyncSink {
    fn name(&self) -> &str {
        "http-sync"
    }

    async fn push(&self, payload: &EnrichedPayload) -> Result<(), PersistenceError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| PersistenceError::WriteFailed {
                sink: "http-sync".into(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PersistenceError::Rejected {
                sink: "http-sync".into(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Configuration for sink writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Pending writes before new ones are dropped.
    pub queue_capacity: usize,
    /// Per-write timeout.
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    /// Directory for the JSON lines sink; unset disables it.
    pub jsonl_dir: Option<PathBuf>,
    /// Endpoint for the HTTP sync sink; unset disables it.
    pub sync_url: Option<String>,
    pub persist_samples: bool,
    pub persist_aggregates: bool,
    pub persist_alerts: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            timeout_ms: 5_000,
            retry: RetryConfig::default(),
            jsonl_dir: None,
            sync_url: None,
            persist_samples: true,
            persist_aggregates: true,
            persist_alerts: true,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.retry.validate("sinks.retry");
        if self.queue_capacity == 0 {
            errors.push("sinks.queue_capacity must be at least 1".to_string());
        }
        if self.timeout_ms == 0 {
            errors.push("sinks.timeout_ms must be positive".to_string());
        }
        if let Some(url) = &self.sync_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("sinks.sync_url must be an http(s) URL, got '{url}'"));
            }
        }
        errors
    }
}

enum SinkJob {
    Save(Record),
    Push(EnrichedPayload),
}

struct SinkWorker {
    persistence: Vec<Arc<dyn PersistenceSink>>,
    sync: Vec<Arc<dyn SyncSink>>,
    config: SinkConfig,
    metrics: Arc<EngineMetrics>,
    last_pushed: HashMap<String, String>,
}

impl SinkWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SinkJob>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.process(job) => {}
            }
        }
        rx.close();
        let mut abandoned = 0u64;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            self.metrics.record_n(Counter::SinkWritesDropped, abandoned);
            warn!(abandoned, "Sink writes abandoned at shutdown");
        }
    }

    async fn process(&mut self, job: SinkJob) {
        match job {
            SinkJob::Save(record) => {
                for sink in &self.persistence {
                    let outcome = self.with_budget(sink.name(), || sink.save(&record)).await;
                    self.tally(sink.name(), record.kind(), outcome);
                }
            }
            SinkJob::Push(payload) => {
                for sink in &self.sync {
                    if self.last_pushed.get(sink.name()) == Some(&payload.sample_id) {
                        debug!(sink = sink.name(), sample_id = %payload.sample_id, "Sync skipped, already pushed");
                        self.metrics.record(Counter::SyncSkipped);
                        continue;
                    }
                    let outcome = self.with_budget(sink.name(), || sink.push(&payload)).await;
                    let ok = outcome.is_ok();
                    self.tally(sink.name(), "payload", outcome);
                    if ok {
                        self.last_pushed
                            .insert(sink.name().to_string(), payload.sample_id.clone());
                    }
                }
            }
        }
    }

    async fn with_budget<F, Fut>(&self, sink: &str, write: F) -> Result<(), PersistenceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), PersistenceError>>,
    {
        let timeout_ms = self.config.timeout_ms;
        let write = &write;
        with_retry(&self.config.retry, move || async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), write())
                .await
                .map_err(|_| PersistenceError::Timeout {
                    sink: sink.to_string(),
                    timeout_ms,
                })?
        })
        .await
    }

    fn tally(&self, sink: &str, kind: &str, outcome: Result<(), PersistenceError>) {
        match outcome {
            Ok(()) => self.metrics.record(Counter::SinkWritesOk),
            Err(e) => {
                self.metrics.record(Counter::SinkWritesFailed);
                error!(sink, kind, error = %e, "Sink write failed after retries");
            }
        }
    }
}

/// Queue front-end for all configured sinks.
pub struct SinkWriter {
    sender: Mutex<Option<mpsc::Sender<SinkJob>>>,
    metrics: Arc<EngineMetrics>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SinkWriter {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn start(
        persistence: Vec<Arc<dyn PersistenceSink>>,
        sync: Vec<Arc<dyn SyncSink>>,
        config: SinkConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let worker = SinkWorker {
            persistence,
            sync,
            config,
            metrics: metrics.clone(),
            last_pushed: HashMap::new(),
        };
        tracker.spawn(worker.run(rx, cancel.clone()));
        Self {
            sender: Mutex::new(Some(tx)),
            metrics,
            tracker,
            cancel,
        }
    }

    pub fn save(&self, record: Record) {
        self.enqueue(SinkJob::Save(record));
    }

    pub fn push(&self, payload: EnrichedPayload) {
        self.enqueue(SinkJob::Push(payload));
    }

    fn enqueue(&self, job: SinkJob) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(tx) = sender else {
            self.metrics.record(Counter::SinkWritesDropped);
            return;
        };
        if let Err(e) = tx.try_send(job) {
            self.metrics.record(Counter::SinkWritesDropped);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer closed",
            };
            warn!(reason, "Dropping sink write");
        }
    }

    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.tracker.close();
    }

    /// Flush queued writes. Returns false if the timeout elapsed and the
    /// remaining writes were abandoned.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return true;
        }
        self.cancel.cancel();
        self.tracker.wait().await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityMetrics;
    use tempfile::TempDir;

    fn sample(id: &str) -> Sample {
        Sample {
            id: id.into(),
            timestamp: Utc::now(),
            device_id: "dev".into(),
            supplier_id: "sup".into(),
            route_id: "route".into(),
            batch_id: "batch".into(),
            spectral_features: vec![0.5; 8],
            metrics: QualityMetrics {
                fat: Some(4.0),
                ..Default::default()
            },
            status: SampleStatus::Processed,
            degraded_reason: None,
        }
    }

    fn fast_config() -> SinkConfig {
        SinkConfig {
            timeout_ms: 200,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_per_kind() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path().join("out"));
        sink.save(&Record::Sample(sample("a"))).await.unwrap();
        sink.save(&Record::Sample(sample("b"))).await.unwrap();

        let records = load_jsonl(&sink.path_for("sample")).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1], Record::Sample(s) if s.id == "b"));
        assert!(load_jsonl(&sink.path_for("alert")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_sink_keeps_one_handle_per_kind() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path());
        for id in ["a", "b", "c"] {
            sink.save(&Record::Sample(sample(id))).await.unwrap();
        }
        assert_eq!(sink.open_files().await, 1);

        let aggregator = crate::aggregator::HierarchicalAggregator::new(Default::default());
        let mut complete = sample("d");
        complete.metrics.snf = Some(8.5);
        complete.metrics.ts = Some(12.5);
        let snapshots = aggregator.update(&complete).unwrap();
        sink.save(&Record::Aggregate((*snapshots[0]).clone())).await.unwrap();
        assert_eq!(sink.open_files().await, 2);
        assert_eq!(load_jsonl(&sink.path_for("sample")).unwrap().len(), 3);
        assert_eq!(load_jsonl(&sink.path_for("aggregate")).unwrap().len(), 1);
    }

    #[test]
    fn test_atomic_write_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("report.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Vec<i32> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_payload_omits_spectra() {
        let payload = EnrichedPayload::new(&sample("a"), Vec::new(), &[]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["sampleId"], "a");
        assert!(json.get("spectralFeatures").is_none());
    }

    #[tokio::test]
    async fn test_writer_retries_transient_failures() {
        let metrics = Arc::new(EngineMetrics::new());
        let sink = Arc::new(MemorySink::failing_first(2));
        let writer = SinkWriter::start(vec![sink.clone()], vec![], fast_config(), metrics.clone());
        writer.save(Record::Sample(sample("a")));
        assert!(writer.drain(Duration::from_secs(5)).await);
        assert_eq!(sink.records().len(), 1);
        assert_eq!(metrics.get(Counter::SinkWritesOk), 1);
        assert_eq!(metrics.get(Counter::SinkWritesFailed), 0);
    }

    #[tokio::test]
    async fn test_writer_gives_up_after_budget() {
        let metrics = Arc::new(EngineMetrics::new());
        let sink = Arc::new(MemorySink::failing_first(10));
        let writer = SinkWriter::start(vec![sink.clone()], vec![], fast_config(), metrics.clone());
        writer.save(Record::Sample(sample("a")));
        writer.save(Record::Sample(sample("b")));
        assert!(writer.drain(Duration::from_secs(5)).await);
        assert_eq!(metrics.get(Counter::SinkWritesFailed), 2);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_sync_deduplicates_consecutive_payloads() {
        let metrics = Arc::new(EngineMetrics::new());
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::start(vec![], vec![sink.clone()], fast_config(), metrics.clone());
        let payload = EnrichedPayload::new(&sample("a"), Vec::new(), &[]);
        writer.push(payload.clone());
        writer.push(payload);
        writer.push(EnrichedPayload::new(&sample("b"), Vec::new(), &[]));
        assert!(writer.drain(Duration::from_secs(5)).await);

        let pushed: Vec<String> = sink.payloads().into_iter().map(|p| p.sample_id).collect();
        assert_eq!(pushed, vec!["a", "b"]);
        assert_eq!(metrics.get(Counter::SyncSkipped), 1);
    }

    #[tokio::test]
    async fn test_writes_after_close_are_dropped() {
        let metrics = Arc::new(EngineMetrics::new());
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::start(vec![sink.clone()], vec![], fast_config(), metrics.clone());
        writer.close();
        writer.save(Record::Sample(sample("a")));
        assert_eq!(metrics.get(Counter::SinkWritesDropped), 1);
    }

    #[test]
    fn test_config_validation() {
        let config = SinkConfig {
            sync_url: Some("ftp://example".into()),
            queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().len(), 2);
    }
}
