//! Inference adapter: wraps the external prediction interface.
//!
//! Turns a pending sample into a PROCESSED one with point metrics, or into a
//! DEGRADED one with null metrics when the predictor fails. Failures never
//! propagate beyond the sample they belong to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::InferenceError;
use crate::quality::{self, QualityConfig};
use crate::types::{MilkType, QualityMetrics, Sample};

/// Output of the external prediction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub fat: f64,
    pub snf: f64,
    pub ts: f64,
    #[serde(default)]
    pub milk_type: Option<MilkType>,
    /// Adulteration risk on a 0-100 scale.
    pub adulteration_risk: f64,
    /// Model confidence in 0..=1.
    pub confidence: f64,
    #[serde(default)]
    pub model_version: Option<String>,
}

/// Trait for the external prediction interface.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Predict quality metrics from spectral features.
    async fn predict(&self, features: &[f64]) -> Result<Prediction, InferenceError>;
}

/// Configuration for the inference adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Per-call timeout for the predictor.
    pub timeout_ms: u64,
    /// Predictions below this confidence are logged as low-confidence.
    pub min_confidence: f64,
    /// Model version recorded when the predictor does not report one.
    pub default_model_version: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            min_confidence: 0.5,
            default_model_version: "v1".to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout_ms == 0 {
            errors.push("inference.timeout_ms must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            errors.push("inference.min_confidence must be within 0..=1".to_string());
        }
        if self.default_model_version.trim().is_empty() {
            errors.push("inference.default_model_version must not be empty".to_string());
        }
        errors
    }
}

/// Wraps a [`Predictor`] with timeouts, validation and derived metrics.
pub struct InferenceAdapter {
    predictor: Arc<dyn Predictor>,
    config: InferenceConfig,
    quality: QualityConfig,
}

impl InferenceAdapter {
    pub fn new(predictor: Arc<dyn Predictor>, config: InferenceConfig, quality: QualityConfig) -> Self {
        Self {
            predictor,
            config,
            quality,
        }
    }

    /// Run inference on a pending sample.
    ///
    /// Always returns a sample: PROCESSED on success, DEGRADED with null
    /// metrics on any predictor failure.
    pub async fn infer(&self, sample: Sample) -> Sample {
        match self.call_predictor(&sample.spectral_features).await {
            Ok(prediction) => {
                if prediction.confidence < self.config.min_confidence {
                    warn!(
                        sample_id = %sample.id,
                        confidence = prediction.confidence,
                        min = self.config.min_confidence,
                        "Low-confidence prediction"
                    );
                }
                let metrics = self.derive_metrics(prediction);
                debug!(sample_id = %sample.id, fat = ?metrics.fat, "Inference complete");
                sample.processed(metrics)
            }
            Err(e) => {
                warn!(sample_id = %sample.id, error = %e, "Inference failed, degrading sample");
                let fallback = QualityMetrics {
                    model_version: Some(self.config.default_model_version.clone()),
                    ..Default::default()
                };
                sample.degraded(fallback, e.to_string())
            }
        }
    }

    async fn call_predictor(&self, features: &[f64]) -> Result<Prediction, InferenceError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let prediction = tokio::time::timeout(timeout, self.predictor.predict(features))
            .await
            .map_err(|_| InferenceError::Timeout {
                timeout_ms: self.config.timeout_ms,
            })??;
        check_prediction(&prediction)?;
        Ok(prediction)
    }

    /// Expand a raw prediction into the full metric set.
    pub fn derive_metrics(&self, prediction: Prediction) -> QualityMetrics {
        let (fat, snf, ts) = (Some(prediction.fat), Some(prediction.snf), Some(prediction.ts));
        let score = quality::quality_score(fat, snf, ts, &self.quality);
        let milk_type = prediction
            .milk_type
            .unwrap_or_else(|| quality::classify_milk_type(prediction.fat, prediction.snf));
        QualityMetrics {
            fat,
            snf,
            ts,
            milk_type: Some(milk_type),
            adulteration_risk: Some(prediction.adulteration_risk),
            is_adulterated: Some(prediction.adulteration_risk > self.quality.adulteration_threshold),
            quality_score: Some(score),
            price: Some(quality::price_estimate(score, &self.quality)),
            traffic_cards: Some(quality::traffic_cards(fat, snf, ts, &self.quality)),
            confidence: Some(prediction.confidence),
            model_version: Some(
                prediction
                    .model_version
                    .unwrap_or_else(|| self.config.default_model_version.clone()),
            ),
        }
    }

    pub fn model_version(&self) -> &str {
        &self.config.default_model_version
    }
}

fn check_prediction(p: &Prediction) -> Result<(), InferenceError> {
    let fields = [
        ("fat", p.fat),
        ("snf", p.snf),
        ("ts", p.ts),
        ("adulteration_risk", p.adulteration_risk),
        ("confidence", p.confidence),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(InferenceError::InvalidResponse {
            message: format!("{name} is not finite"),
        });
    }
    if !(0.0..=100.0).contains(&p.adulteration_risk) {
        return Err(InferenceError::InvalidResponse {
            message: format!("adulteration_risk {} outside 0..=100", p.adulteration_risk),
        });
    }
    if !(0.0..=1.0).contains(&p.confidence) {
        return Err(InferenceError::InvalidResponse {
            message: format!("confidence {} outside 0..=1", p.confidence),
        });
    }
    Ok(())
}

type PredictFn = dyn Fn(&[f64]) -> Result<Prediction, InferenceError> + Send + Sync;

/// Deterministic predictor for tests and local runs.
pub struct MockPredictor {
    predict_fn: Box<PredictFn>,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl MockPredictor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> Result<Prediction, InferenceError> + Send + Sync + 'static,
    {
        Self {
            predict_fn: Box::new(f),
            delay: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Reads metrics straight out of the features:
    /// `[fat, snf, ts, adulteration_risk]`, missing entries default to a
    /// typical cow-milk reading. A negative first feature simulates a failure.
    pub fn echo() -> Self {
        Self::new(|features| {
            let at = |i: usize, default: f64| features.get(i).copied().unwrap_or(default);
            let fat = at(0, 4.0);
            if fat < 0.0 {
                return Err(InferenceError::Request {
                    message: "simulated predictor failure".into(),
                });
            }
            Ok(Prediction {
                fat,
                snf: at(1, 8.5),
                ts: at(2, 12.5),
                milk_type: None,
                adulteration_risk: at(3, 10.0),
                confidence: 0.95,
                model_version: None,
            })
        })
    }

    /// Always fails.
    pub fn failing() -> Self {
        Self::new(|_| {
            Err(InferenceError::Request {
                message: "predictor unavailable".into(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(&self, features: &[f64]) -> Result<Prediction, InferenceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.predict_fn)(features)
    }
}
