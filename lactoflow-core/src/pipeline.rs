//! Pipeline orchestrator: wires every stage into a running engine.
//!
//! Accepted samples are partitioned across workers by supplier id, so one
//! supplier's samples are processed in arrival order by a single worker.
//! Route, batch and global keys are shared between workers; their updates
//! serialize on the aggregator's per-key entries and the alert engine's
//! per-(rule, entity) entries. Explanation, recommendation dispatch and sink
//! writes leave the worker as background work and never hold it up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregateState, HierarchicalAggregator};
use crate::alerts::{Alert, AlertEngine, AlertFilter, AlertOutcome};
use crate::config::EngineConfig;
use crate::dispatch::{Advisor, ContextBundle, RecommendationDispatcher, fallback_recommendation};
use crate::drift::DriftDetector;
use crate::error::{ConfigError, EngineError, Result, ValidationError};
use crate::explain::{ExplainTarget, ExplainabilityCache, ExplainabilityRecord, Explainer};
use crate::inference::{InferenceAdapter, Predictor};
use crate::metrics::{Counter, EngineMetrics, MetricsSnapshot};
use crate::normalizer::SampleNormalizer;
use crate::sinks::{
    EnrichedPayload, HttpSyncSink, JsonlSink, PersistenceSink, Record, SinkWriter, SyncSink,
};
use crate::types::{EntityKey, Level, RawReading, Sample};

/// Why a reading was refused at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NackReason {
    Invalid { message: String },
    Duplicate,
    QueueFull,
    ShuttingDown,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::Invalid { message } => write!(f, "invalid reading: {message}"),
            NackReason::Duplicate => write!(f, "duplicate sample id"),
            NackReason::QueueFull => write!(f, "{}", EngineError::QueueFull),
            NackReason::ShuttingDown => write!(f, "{}", EngineError::ShuttingDown),
        }
    }
}

/// Answer to an ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum IngestAck {
    Ack {
        sample_id: String,
    },
    Nack {
        sample_id: Option<String>,
        reason: NackReason,
    },
}

impl IngestAck {
    pub fn is_ack(&self) -> bool {
        matches!(self, IngestAck::Ack { .. })
    }
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Samples completed after intake was closed.
    pub drained: u64,
    /// Accepted samples that were never processed.
    pub abandoned: u64,
    /// Whether any stage had to be cancelled at the deadline.
    pub timed_out: bool,
}

/// Collects the ports an engine is built from.
pub struct EngineBuilder {
    config: EngineConfig,
    predictor: Option<Arc<dyn Predictor>>,
    explainer: Option<Arc<dyn Explainer>>,
    advisor: Option<Arc<dyn Advisor>>,
    persistence: Vec<Arc<dyn PersistenceSink>>,
    sync: Vec<Arc<dyn SyncSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            predictor: None,
            explainer: None,
            advisor: None,
            persistence: Vec::new(),
            sync: Vec::new(),
        }
    }

    pub fn predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Without an explainer no attributions are computed.
    pub fn explainer(mut self, explainer: Arc<dyn Explainer>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    /// Without an advisor every alert gets the fallback recommendation.
    pub fn advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn persistence_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence.push(sink);
        self
    }

    pub fn sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync.push(sink);
        self
    }

    /// Validate the configuration and start the engine. Must be called inside
    /// a Tokio runtime.
    pub fn build(mut self) -> Result<QualityEngine> {
        self.config.ensure_valid()?;
        let predictor = self.predictor.take().ok_or_else(|| ConfigError::Invalid {
            message: "a predictor is required".to_string(),
        })?;

        if let Some(dir) = &self.config.sinks.jsonl_dir {
            self.persistence.push(Arc::new(JsonlSink::new(dir.clone())));
        }
        if let Some(url) = &self.config.sinks.sync_url {
            let sink = HttpSyncSink::new(url.clone(), Duration::from_millis(self.config.sinks.timeout_ms))
                .map_err(|e| ConfigError::Invalid {
                    message: format!("sinks.sync_url: {e}"),
                })?;
            self.sync.push(Arc::new(sink));
        }

        Ok(QualityEngine::start(
            Arc::new(self.config),
            predictor,
            self.explainer,
            self.advisor,
            self.persistence,
            self.sync,
        ))
    }
}

/// Everything a worker needs to process one sample.
struct Stages {
    config: Arc<EngineConfig>,
    inference: InferenceAdapter,
    explain: Option<Arc<ExplainabilityCache>>,
    aggregator: HierarchicalAggregator,
    detector: DriftDetector,
    alerts: Arc<AlertEngine>,
    dispatcher: Option<RecommendationDispatcher>,
    sinks: SinkWriter,
    metrics: Arc<EngineMetrics>,
    background: TaskTracker,
    abort: CancellationToken,
}

impl Stages {
    async fn process(&self, sample: Sample) {
        let sample = self.inference.infer(sample).await;
        if !sample.is_processed() {
            self.metrics.record(Counter::SamplesDegraded);
            self.persist_sample(&sample, Vec::new(), &[]);
            return;
        }
        self.metrics.record(Counter::SamplesProcessed);
        self.spawn_explanations(&sample);

        let snapshots = self.aggregator.update(&sample).unwrap_or_default();

        // Resolve before recording so a re-violation after the cooldown opens
        // a fresh alert instead of reviving the expired one.
        self.alerts.observe(sample.timestamp);
        if let Some(now) = self.alerts.event_now() {
            let resolved = self.alerts.resolve_expired(now);
            self.persist_resolved(resolved);
        }

        let mut touched = Vec::new();
        for violation in self.detector.evaluate(&sample, &snapshots) {
            let outcome = self.alerts.record(&violation);
            let alert = match outcome {
                AlertOutcome::Opened(alert) => {
                    self.metrics.record(Counter::AlertsOpened);
                    self.dispatch(&alert, &sample, &snapshots);
                    self.persist_alert(&alert);
                    alert
                }
                AlertOutcome::Escalated { alert, .. } => {
                    self.metrics.record(Counter::AlertsEscalated);
                    self.dispatch(&alert, &sample, &snapshots);
                    self.persist_alert(&alert);
                    alert
                }
                AlertOutcome::DuplicateAlertSuppressed { alert_id } => {
                    self.metrics.record(Counter::AlertsSuppressed);
                    match self.alerts.get(&alert_id) {
                        Some(alert) => alert,
                        None => continue,
                    }
                }
            };
            touched.push(alert);
        }

        if self.config.sinks.persist_aggregates {
            for snapshot in &snapshots {
                self.sinks.save(Record::Aggregate((**snapshot).clone()));
            }
        }
        self.persist_sample(&sample, touched, &snapshots);
    }

    fn spawn_explanations(&self, sample: &Sample) {
        let Some(cache) = &self.explain else {
            return;
        };
        // Features stay registered for on-demand requests even when
        // background explanation is off.
        cache.register_features(&sample.id, &sample.spectral_features);
        if !cache.config().enabled {
            return;
        }
        let model_version = sample
            .metrics
            .model_version
            .clone()
            .unwrap_or_else(|| self.inference.model_version().to_string());

        for target in cache.config().targets.iter().copied() {
            let cache = cache.clone();
            let metrics = self.metrics.clone();
            let abort = self.abort.clone();
            let sample_id = sample.id.clone();
            let model_version = model_version.clone();
            self.background.spawn(async move {
                tokio::select! {
                    result = cache.get_or_compute(&sample_id, target, &model_version) => {
                        match result {
                            Ok(_) => metrics.record(Counter::ExplanationsComputed),
                            Err(_) => metrics.record(Counter::ExplanationsFailed),
                        }
                    }
                    _ = abort.cancelled() => {
                        debug!(sample_id = %sample_id, target = %target, "Explanation abandoned");
                    }
                }
            });
        }
    }

    fn dispatch(&self, alert: &Alert, sample: &Sample, snapshots: &[Arc<AggregateState>]) {
        let aggregate = snapshots
            .iter()
            .find(|s| s.key == alert.entity)
            .cloned();
        match &self.dispatcher {
            Some(dispatcher) => {
                dispatcher.submit(ContextBundle::new(alert.clone(), Some(sample), aggregate));
            }
            None => {
                self.metrics.record(Counter::RecommendationsFallback);
                self.alerts
                    .attach_recommendation(&alert.id, fallback_recommendation(alert));
            }
        }
    }

    fn persist_alert(&self, alert: &Alert) {
        if self.config.sinks.persist_alerts {
            self.sinks.save(Record::Alert(alert.clone()));
        }
    }

    fn persist_resolved(&self, resolved: Vec<Alert>) {
        if resolved.is_empty() {
            return;
        }
        self.metrics
            .record_n(Counter::AlertsResolved, resolved.len() as u64);
        for alert in &resolved {
            self.persist_alert(alert);
        }
    }

    fn persist_sample(&self, sample: &Sample, alerts: Vec<Alert>, snapshots: &[Arc<AggregateState>]) {
        if self.config.sinks.persist_samples {
            self.sinks.save(Record::Sample(sample.clone()));
        }
        self.sinks
            .push(EnrichedPayload::new(sample, alerts, snapshots));
    }

    fn sweep(&self) {
        let resolved = self.alerts.sweep();
        self.persist_resolved(resolved);
    }
}

/// The running quality engine.
pub struct QualityEngine {
    stages: Arc<Stages>,
    normalizer: SampleNormalizer,
    partitions: Mutex<Vec<mpsc::Sender<Sample>>>,
    workers: TaskTracker,
    sweeper: CancellationToken,
    shutting_down: AtomicBool,
}

impl QualityEngine {
    /// Start building an engine from a configuration.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn start(
        config: Arc<EngineConfig>,
        predictor: Arc<dyn Predictor>,
        explainer: Option<Arc<dyn Explainer>>,
        advisor: Option<Arc<dyn Advisor>>,
        persistence: Vec<Arc<dyn PersistenceSink>>,
        sync: Vec<Arc<dyn SyncSink>>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let rules = Arc::new(config.effective_rules());
        let alerts = Arc::new(AlertEngine::new(config.alerts.clone(), &rules));
        let dispatcher = advisor
            .filter(|_| config.dispatch.enabled)
            .map(|advisor| {
                RecommendationDispatcher::start(
                    advisor,
                    alerts.clone(),
                    metrics.clone(),
                    config.dispatch.clone(),
                )
            });
        let explain = explainer
            .map(|explainer| Arc::new(ExplainabilityCache::new(explainer, config.explain.clone())));

        let stages = Arc::new(Stages {
            inference: InferenceAdapter::new(
                predictor,
                config.inference.clone(),
                config.quality.clone(),
            ),
            explain,
            aggregator: HierarchicalAggregator::new(config.aggregation.clone()),
            detector: DriftDetector::new(rules.clone()),
            alerts,
            dispatcher,
            sinks: SinkWriter::start(persistence, sync, config.sinks.clone(), metrics.clone()),
            metrics,
            background: TaskTracker::new(),
            abort: CancellationToken::new(),
            config: config.clone(),
        });

        let workers = TaskTracker::new();
        let mut partitions = Vec::with_capacity(config.pipeline.workers);
        for index in 0..config.pipeline.workers.max(1) {
            let (tx, rx) = mpsc::channel(config.pipeline.queue_capacity.max(1));
            partitions.push(tx);
            workers.spawn(run_partition(index, stages.clone(), rx));
        }

        let sweeper = CancellationToken::new();
        stages
            .background
            .spawn(run_sweeper(stages.clone(), sweeper.clone()));

        info!(
            workers = partitions.len(),
            rules = rules.len(),
            explain = stages.explain.is_some(),
            dispatch = stages.dispatcher.is_some(),
            "Quality engine started"
        );

        Self {
            normalizer: SampleNormalizer::new(config.normalizer.clone()),
            stages,
            partitions: Mutex::new(partitions),
            workers,
            sweeper,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Validate a reading and queue it for processing.
    pub fn ingest(&self, raw: RawReading) -> IngestAck {
        let claimed_id = raw.sample_id.clone();
        if self.shutting_down.load(Ordering::Acquire) {
            return IngestAck::Nack {
                sample_id: claimed_id,
                reason: NackReason::ShuttingDown,
            };
        }

        let sample = match self.normalizer.normalize(raw) {
            Ok(sample) => sample,
            Err(ValidationError::Duplicate { sample_id }) => {
                self.stages.metrics.record(Counter::SamplesDuplicate);
                return IngestAck::Nack {
                    sample_id: Some(sample_id),
                    reason: NackReason::Duplicate,
                };
            }
            Err(e) => {
                self.stages.metrics.record(Counter::SamplesRejected);
                debug!(sample_id = ?claimed_id, error = %e, "Rejecting reading");
                return IngestAck::Nack {
                    sample_id: claimed_id,
                    reason: NackReason::Invalid {
                        message: e.to_string(),
                    },
                };
            }
        };

        let sender = {
            let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
            if partitions.is_empty() {
                None
            } else {
                Some(partitions[partition_of(&sample.supplier_id, partitions.len())].clone())
            }
        };
        let Some(sender) = sender else {
            self.normalizer.forget(&sample.id);
            return IngestAck::Nack {
                sample_id: Some(sample.id),
                reason: NackReason::ShuttingDown,
            };
        };

        let sample_id = sample.id.clone();
        match sender.try_send(sample) {
            Ok(()) => {
                self.stages.metrics.record(Counter::SamplesAccepted);
                IngestAck::Ack { sample_id }
            }
            Err(e) => {
                self.normalizer.forget(&sample_id);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => {
                        self.stages.metrics.record(Counter::SamplesBackpressured);
                        NackReason::QueueFull
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        self.stages.metrics.record(Counter::SamplesRejected);
                        NackReason::ShuttingDown
                    }
                };
                warn!(sample_id = %sample_id, reason = %reason, "Sample not queued");
                IngestAck::Nack {
                    sample_id: Some(sample_id),
                    reason,
                }
            }
        }
    }

    /// Aggregate state of an entity, optionally as of an earlier instant.
    pub fn get_aggregate(
        &self,
        level: Level,
        entity_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Option<Arc<AggregateState>> {
        let key = match level {
            Level::Sample => return None,
            Level::Global => EntityKey::global(),
            _ => EntityKey::new(level, entity_id),
        };
        self.stages.aggregator.get_as_of(&key, as_of)
    }

    /// Keys known at a level.
    pub fn entities(&self, level: Level) -> Vec<EntityKey> {
        self.stages.aggregator.keys(level)
    }

    pub fn get_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.stages.alerts.get_alerts(filter)
    }

    pub fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.stages.alerts.get(alert_id)
    }

    /// Attribution record for a sample. Returns the latest cached record, or
    /// computes one for the current model version when the sample's features
    /// are still retained.
    pub async fn get_explanation(
        &self,
        sample_id: &str,
        target: ExplainTarget,
    ) -> Option<Arc<ExplainabilityRecord>> {
        let cache = self.stages.explain.as_ref()?;
        if let Some(record) = cache.latest(sample_id, target) {
            return Some(record);
        }
        cache
            .get_or_compute(sample_id, target, self.stages.inference.model_version())
            .await
            .ok()
    }

    /// Operator acknowledgement of an open alert.
    pub fn acknowledge(&self, alert_id: &str, operator: &str) -> Result<Alert> {
        let alert = self.stages.alerts.acknowledge(alert_id, operator)?;
        self.stages.persist_alert(&alert);
        Ok(alert)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.stages.metrics.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.stages.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop intake and drain in-flight work within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyShutDown.into());
        }
        let deadline = Instant::now() + timeout;
        let completed = || {
            let m = &self.stages.metrics;
            m.get(Counter::SamplesProcessed) + m.get(Counter::SamplesDegraded)
        };
        let before = completed();
        let dropped_before = self.stages.metrics.get(Counter::SamplesDropped);
        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down quality engine");

        self.partitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.workers.close();
        self.sweeper.cancel();

        let mut timed_out = false;
        if tokio::time::timeout_at(deadline, self.workers.wait()).await.is_err() {
            timed_out = true;
            warn!("Worker drain timed out, abandoning queued samples");
            self.stages.abort.cancel();
            self.workers.wait().await;
        }

        self.stages.background.close();
        if tokio::time::timeout_at(deadline, self.stages.background.wait())
            .await
            .is_err()
        {
            timed_out = true;
            self.stages.abort.cancel();
            self.stages.background.wait().await;
        }

        // A final sweep at the drained watermark before downstream queues close.
        self.stages.sweep();

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(dispatcher) = &self.stages.dispatcher {
            timed_out |= !dispatcher.drain(remaining).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        timed_out |= !self.stages.sinks.drain(remaining).await;

        let report = ShutdownReport {
            drained: completed() - before,
            abandoned: self.stages.metrics.get(Counter::SamplesDropped) - dropped_before,
            timed_out,
        };
        if report.timed_out {
            warn!(
                drained = report.drained,
                abandoned = report.abandoned,
                "Quality engine stopped with partial results"
            );
        } else {
            info!(drained = report.drained, "Quality engine stopped");
        }
        Ok(report)
    }
}

fn partition_of(supplier_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    supplier_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

async fn run_partition(index: usize, stages: Arc<Stages>, mut rx: mpsc::Receiver<Sample>) {
    debug!(partition = index, "Worker started");
    loop {
        let sample = tokio::select! {
            biased;
            _ = stages.abort.cancelled() => break,
            sample = rx.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };
        let sample_id = sample.id.clone();
        // Inference is the only suspension point; nothing has been applied yet
        // when it is cancelled.
        tokio::select! {
            biased;
            _ = stages.abort.cancelled() => {
                stages.metrics.record(Counter::SamplesDropped);
                debug!(partition = index, sample_id = %sample_id, "Sample abandoned mid-inference");
                break;
            }
            _ = stages.process(sample) => {}
        }
    }
    rx.close();
    let mut abandoned = 0u64;
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        stages.metrics.record_n(Counter::SamplesDropped, abandoned);
        warn!(partition = index, abandoned, "Queued samples abandoned");
    }
    debug!(partition = index, "Worker stopped");
}

async fn run_sweeper(stages: Arc<Stages>, stop: CancellationToken) {
    let mut alerts = tokio::time::interval(Duration::from_millis(
        stages.config.alerts.sweep_interval_ms.max(1),
    ));
    let mut eviction = tokio::time::interval(Duration::from_secs(
        stages.config.explain.sweep_interval_secs.max(1),
    ));
    alerts.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = alerts.tick() => stages.sweep(),
            _ = eviction.tick() => {
                if let Some(cache) = &stages.explain {
                    cache.evict_expired();
                }
            }
        }
    }
    debug!("Sweeper stopped");
}
