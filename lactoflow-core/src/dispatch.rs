//! Recommendation dispatcher: forwards alert context to the advisory service
//! off the alerting path and attaches the structured reply.
//!
//! Submission never blocks: bundles go onto a bounded queue and a full queue
//! falls straight back to a deterministic recommendation. Advisory calls carry
//! a timeout and bounded retries; exhaustion, cancellation or a full queue all
//! end with the fallback attached, so no dispatched alert stays unannotated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::aggregator::AggregateState;
use crate::alerts::{Alert, AlertEngine};
use crate::error::AdvisoryError;
use crate::metrics::{Counter, EngineMetrics};
use crate::retry::{RetryConfig, with_retry};
use crate::types::{Metric, Sample, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    Advisory,
    Fallback,
}

/// Recommendation attached to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    pub root_cause: String,
    pub urgency: Severity,
    pub owner: String,
    pub source: RecommendationSource,
    pub generated_at: DateTime<Utc>,
}

/// Structured reply of the advisory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    pub action: String,
    pub root_cause: String,
    pub urgency: Severity,
    pub owner: String,
}

/// Context handed to the advisory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub alert: Alert,
    /// Triggering sample with its raw spectral features stripped.
    pub sample: Option<Sample>,
    /// Snapshot of the aggregate the alert is about, if any.
    pub aggregate: Option<AggregateState>,
}

impl ContextBundle {
    pub fn new(alert: Alert, sample: Option<&Sample>, aggregate: Option<Arc<AggregateState>>) -> Self {
        Self {
            alert,
            sample: sample.map(|s| Sample {
                spectral_features: Vec::new(),
                ..s.clone()
            }),
            aggregate: aggregate.map(|a| (*a).clone()),
        }
    }
}

/// Trait for the external advisory interface.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn recommend(&self, bundle: &ContextBundle) -> Result<Advice, AdvisoryError>;
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub enabled: bool,
    /// Pending bundles before submissions fall back immediately.
    pub queue_capacity: usize,
    /// Advisory calls in flight at once.
    pub concurrency: usize,
    /// Per-call timeout.
    pub timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 256,
            concurrency: 4,
            timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.retry.validate("dispatch.retry");
        if self.queue_capacity == 0 {
            errors.push("dispatch.queue_capacity must be at least 1".to_string());
        }
        if self.concurrency == 0 {
            errors.push("dispatch.concurrency must be at least 1".to_string());
        }
        if self.timeout_ms == 0 {
            errors.push("dispatch.timeout_ms must be positive".to_string());
        }
        errors
    }
}

/// Deterministic recommendation derived from the alert alone.
pub fn fallback_recommendation(alert: &Alert) -> Recommendation {
    let (action, owner) = match alert.metric {
        Metric::Fat => (
            "Check collection-point cooling and agitation; test for skimming",
            "Collection center",
        ),
        Metric::Snf | Metric::Ts => (
            "Test for dilution with water; review feed and animal health with the supplier",
            "Field officer",
        ),
        Metric::AdulterationRisk | Metric::AdulterationFlag => (
            "Hold the affected milk and run confirmatory adulteration tests",
            "Quality assurance",
        ),
        Metric::UnknownMilkType => (
            "Confirm milk source and species, then re-sample",
            "Collection center",
        ),
        Metric::QualityScore | Metric::Price => (
            "Review supplier grading history and schedule a quality visit",
            "Procurement",
        ),
    };
    Recommendation {
        action: action.to_string(),
        root_cause: format!(
            "Rule '{}' triggered for {}: {} measured {:.3} against threshold {:.3}",
            alert.rule_id, alert.entity, alert.metric, alert.measured, alert.threshold
        ),
        urgency: alert.severity,
        owner: owner.to_string(),
        source: RecommendationSource::Fallback,
        generated_at: Utc::now(),
    }
}

struct Worker {
    advisor: Arc<dyn Advisor>,
    alerts: Arc<AlertEngine>,
    metrics: Arc<EngineMetrics>,
    config: DispatchConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn handle(&self, bundle: ContextBundle) {
        let alert_id = bundle.alert.id.clone();
        let advised = tokio::select! {
            result = self.advise(&bundle) => result,
            _ = self.cancel.cancelled() => Err(AdvisoryError::Request {
                message: "dispatch cancelled at shutdown".into(),
            }),
        };
        let recommendation = match advised {
            Ok(advice) => {
                self.metrics.record(Counter::RecommendationsDelivered);
                debug!(alert_id = %alert_id, "Recommendation received");
                Recommendation {
                    action: advice.action,
                    root_cause: advice.root_cause,
                    urgency: advice.urgency,
                    owner: advice.owner,
                    source: RecommendationSource::Advisory,
                    generated_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!(alert_id = %alert_id, error = %e, "Advisory failed, attaching fallback");
                self.metrics.record(Counter::RecommendationsFallback);
                fallback_recommendation(&bundle.alert)
            }
        };
        self.alerts.attach_recommendation(&alert_id, recommendation);
    }

    async fn advise(&self, bundle: &ContextBundle) -> Result<Advice, AdvisoryError> {
        let advisor = self.advisor.as_ref();
        let timeout_ms = self.config.timeout_ms;
        with_retry(&self.config.retry, move || async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), advisor.recommend(bundle))
                .await
                .map_err(|_| AdvisoryError::Timeout { timeout_ms })?
        })
        .await
    }
}

/// Fire-and-forget dispatcher backed by a bounded queue.
pub struct RecommendationDispatcher {
    sender: Mutex<Option<mpsc::Sender<ContextBundle>>>,
    alerts: Arc<AlertEngine>,
    metrics: Arc<EngineMetrics>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl RecommendationDispatcher {
    /// Start the dispatch loop. Must be called inside a Tokio runtime.
    pub fn start(
        advisor: Arc<dyn Advisor>,
        alerts: Arc<AlertEngine>,
        metrics: Arc<EngineMetrics>,
        config: DispatchConfig,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ContextBundle>(config.queue_capacity.max(1));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let worker = Arc::new(Worker {
            advisor,
            alerts: alerts.clone(),
            metrics: metrics.clone(),
            config,
            cancel: cancel.clone(),
        });

        let spawner = tracker.clone();
        tracker.spawn(async move {
            while let Some(bundle) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = worker.clone();
                spawner.spawn(async move {
                    worker.handle(bundle).await;
                    drop(permit);
                });
            }
            debug!("Dispatch queue closed");
        });

        Self {
            sender: Mutex::new(Some(tx)),
            alerts,
            metrics,
            tracker,
            cancel,
        }
    }

    /// Queue a bundle. Returns false when the bundle was answered with the
    /// fallback immediately (queue full or dispatcher closed).
    pub fn submit(&self, bundle: ContextBundle) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let rejected = match sender {
            Some(tx) => match tx.try_send(bundle) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(bundle)) => {
                    warn!(alert_id = %bundle.alert.id, "Dispatch queue full, attaching fallback");
                    bundle
                }
                Err(mpsc::error::TrySendError::Closed(bundle)) => bundle,
            },
            None => bundle,
        };
        self.metrics.record(Counter::RecommendationsFallback);
        self.alerts
            .attach_recommendation(&rejected.alert.id, fallback_recommendation(&rejected.alert));
        false
    }

    /// Stop accepting bundles; queued bundles are still processed.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.tracker.close();
    }

    /// Wait for queued and in-flight bundles. Returns false on timeout, after
    /// cancelling the remainder so each gets its fallback.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return true;
        }
        let pending = self.tracker.len();
        warn!(pending, "Dispatch drain timed out, cancelling");
        self.cancel.cancel();
        // Cancelled handlers only attach a fallback, which does not await.
        let _ = tokio::time::timeout(Duration::from_millis(100), self.tracker.wait()).await;
        info!(pending, "Dispatch cancelled");
        false
    }

    /// Tasks still running (dispatch loop included).
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

type AdviseFn = dyn Fn(&ContextBundle) -> Result<Advice, AdvisoryError> + Send + Sync;

/// Deterministic advisor for tests.
pub struct MockAdvisor {
    advise_fn: Box<AdviseFn>,
    delay: Option<Duration>,
    calls: std::sync::atomic::AtomicU64,
}

impl MockAdvisor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ContextBundle) -> Result<Advice, AdvisoryError> + Send + Sync + 'static,
    {
        Self {
            advise_fn: Box::new(f),
            delay: None,
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Echoes the alert back as advice.
    pub fn echo() -> Self {
        Self::new(|bundle| {
            Ok(Advice {
                action: format!("Investigate {}", bundle.alert.entity),
                root_cause: format!("{} on {}", bundle.alert.rule_id, bundle.alert.metric),
                urgency: bundle.alert.severity,
                owner: "Quality team".to_string(),
            })
        })
    }

    pub fn failing() -> Self {
        Self::new(|_| {
            Err(AdvisoryError::Request {
                message: "advisory service unavailable".into(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Advisor for MockAdvisor {
    async fn recommend(&self, bundle: &ContextBundle) -> Result<Advice, AdvisoryError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.advise_fn)(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertConfig, AlertOutcome};
    use crate::drift::Violation;
    use crate::types::{EntityKey, Level};

    fn open_alert(engine: &AlertEngine) -> Alert {
        let violation = Violation {
            rule_id: "low_fat".into(),
            entity: EntityKey::new(Level::Supplier, "sup-1"),
            metric: Metric::Fat,
            measured: 2.1,
            threshold: 2.5,
            excess_ratio: 0.16,
            persistence: 1,
            severity: Severity::Medium,
            sample_id: "s-1".into(),
            observed_at: Utc::now(),
            aggregate_version: None,
        };
        match engine.record(&violation) {
            AlertOutcome::Opened(alert) => alert,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            timeout_ms: 50,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        }
    }

    fn setup(advisor: MockAdvisor, config: DispatchConfig) -> (Arc<MockAdvisor>, Arc<AlertEngine>, Arc<EngineMetrics>, RecommendationDispatcher) {
        let advisor = Arc::new(advisor);
        let alerts = Arc::new(AlertEngine::new(AlertConfig::default(), &[]));
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            RecommendationDispatcher::start(advisor.clone(), alerts.clone(), metrics.clone(), config);
        (advisor, alerts, metrics, dispatcher)
    }

    #[tokio::test]
    async fn test_advice_attached() {
        let (advisor, alerts, metrics, dispatcher) = setup(MockAdvisor::echo(), fast_config());
        let alert = open_alert(&alerts);
        assert!(dispatcher.submit(ContextBundle::new(alert.clone(), None, None)));
        assert!(dispatcher.drain(Duration::from_secs(5)).await);

        let rec = alerts.get(&alert.id).unwrap().recommendation.unwrap();
        assert_eq!(rec.source, RecommendationSource::Advisory);
        assert_eq!(rec.urgency, Severity::Medium);
        assert_eq!(advisor.calls(), 1);
        assert_eq!(metrics.get(Counter::RecommendationsDelivered), 1);
    }

    #[tokio::test]
    async fn test_failure_retries_then_falls_back() {
        let (advisor, alerts, metrics, dispatcher) = setup(MockAdvisor::failing(), fast_config());
        let alert = open_alert(&alerts);
        dispatcher.submit(ContextBundle::new(alert.clone(), None, None));
        assert!(dispatcher.drain(Duration::from_secs(5)).await);

        let rec = alerts.get(&alert.id).unwrap().recommendation.unwrap();
        assert_eq!(rec.source, RecommendationSource::Fallback);
        assert_eq!(rec.owner, "Collection center");
        assert_eq!(advisor.calls(), 3);
        assert_eq!(metrics.get(Counter::RecommendationsFallback), 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let (_, alerts, _, dispatcher) = setup(
            MockAdvisor::echo().with_delay(Duration::from_secs(2)),
            fast_config(),
        );
        let alert = open_alert(&alerts);
        dispatcher.submit(ContextBundle::new(alert.clone(), None, None));
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        let rec = alerts.get(&alert.id).unwrap().recommendation.unwrap();
        assert_eq!(rec.source, RecommendationSource::Fallback);
    }

    #[tokio::test]
    async fn test_submit_after_close_falls_back_immediately() {
        let (advisor, alerts, _, dispatcher) = setup(MockAdvisor::echo(), fast_config());
        dispatcher.close();
        let alert = open_alert(&alerts);
        assert!(!dispatcher.submit(ContextBundle::new(alert.clone(), None, None)));
        let rec = alerts.get(&alert.id).unwrap().recommendation.unwrap();
        assert_eq!(rec.source, RecommendationSource::Fallback);
        assert_eq!(advisor.calls(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_cancels_with_fallback() {
        let config = DispatchConfig {
            timeout_ms: 60_000,
            ..fast_config()
        };
        let (_, alerts, _, dispatcher) =
            setup(MockAdvisor::echo().with_delay(Duration::from_secs(30)), config);
        let alert = open_alert(&alerts);
        dispatcher.submit(ContextBundle::new(alert.clone(), None, None));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!dispatcher.drain(Duration::from_millis(50)).await);
        let rec = alerts.get(&alert.id).unwrap().recommendation.unwrap();
        assert_eq!(rec.source, RecommendationSource::Fallback);
    }

    #[test]
    fn test_bundle_strips_features() {
        let engine = AlertEngine::new(AlertConfig::default(), &[]);
        let alert = open_alert(&engine);
        let sample = Sample {
            id: "s-1".into(),
            timestamp: Utc::now(),
            device_id: "d".into(),
            supplier_id: "sup-1".into(),
            route_id: "r".into(),
            batch_id: "b".into(),
            spectral_features: vec![0.1; 64],
            metrics: Default::default(),
            status: crate::types::SampleStatus::Processed,
            degraded_reason: None,
        };
        let bundle = ContextBundle::new(alert, Some(&sample), None);
        assert!(bundle.sample.unwrap().spectral_features.is_empty());
    }

    #[test]
    fn test_fallback_is_deterministic_per_metric() {
        let engine = AlertEngine::new(AlertConfig::default(), &[]);
        let alert = open_alert(&engine);
        let a = fallback_recommendation(&alert);
        let b = fallback_recommendation(&alert);
        assert_eq!(a.action, b.action);
        assert_eq!(a.root_cause, b.root_cause);
        assert!(a.root_cause.contains("low_fat"));
        assert_eq!(a.urgency, Severity::Medium);
    }
}
