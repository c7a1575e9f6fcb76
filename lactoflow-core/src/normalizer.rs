//! Sample normalizer: validates raw readings and turns them into canonical
//! pending samples.
//!
//! Rejections are reported as [`ValidationError`]s; the caller is expected to
//! negative-acknowledge the reading. Duplicate sample ids are rejected within a
//! bounded window of recently accepted ids.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::error::ValidationError;
use crate::types::{QualityMetrics, RawReading, Sample, SampleStatus};

/// Configuration for the sample normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Minimum number of spectral features per reading.
    pub min_features: usize,
    /// Maximum number of spectral features per reading.
    pub max_features: usize,
    /// Smallest accepted absorbance value.
    pub feature_min: f64,
    /// Largest accepted absorbance value.
    pub feature_max: f64,
    /// Maximum identifier length in bytes.
    pub max_id_len: usize,
    /// How far in the future a timestamp may be before it is rejected.
    pub max_future_skew_secs: i64,
    /// Number of recently accepted sample ids remembered for deduplication.
    pub dedup_window: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_features: 1,
            max_features: 4096,
            feature_min: -10.0,
            feature_max: 10.0,
            max_id_len: 128,
            max_future_skew_secs: 300,
            dedup_window: 10_000,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.min_features == 0 {
            errors.push("normalizer.min_features must be at least 1".to_string());
        }
        if self.min_features > self.max_features {
            errors.push("normalizer.min_features must not exceed max_features".to_string());
        }
        if self.feature_min >= self.feature_max {
            errors.push("normalizer.feature_min must be below feature_max".to_string());
        }
        if self.max_id_len == 0 {
            errors.push("normalizer.max_id_len must be at least 1".to_string());
        }
        if self.dedup_window == 0 {
            errors.push("normalizer.dedup_window must be at least 1".to_string());
        }
        errors
    }
}

/// Bounded FIFO set of recently seen ids.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Insert an id; returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    fn remove(&mut self, id: &str) {
        if self.members.remove(id) {
            self.order.retain(|existing| existing != id);
        }
    }
}

/// Validates and canonicalizes raw readings.
#[derive(Debug)]
pub struct SampleNormalizer {
    config: NormalizerConfig,
    recent: Mutex<RecentIds>,
}

impl SampleNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        let recent = Mutex::new(RecentIds::new(config.dedup_window.max(1)));
        Self { config, recent }
    }

    /// Validate a raw reading and produce a PENDING sample.
    ///
    /// The sample id is recorded in the dedup window only when every other
    /// check has passed.
    pub fn normalize(&self, raw: RawReading) -> Result<Sample, ValidationError> {
        let id = self.identifier("sampleId", raw.sample_id)?;
        let supplier_id = self.identifier("supplierId", raw.supplier_id)?;
        let route_id = self.identifier("routeId", raw.route_id)?;
        let batch_id = self.identifier("batchId", raw.batch_id)?;
        let device_id = self.identifier("deviceId", raw.device_id)?;

        let timestamp = raw.timestamp.ok_or_else(|| ValidationError::MissingField {
            field: "timestamp".into(),
        })?;
        let skew = timestamp - Utc::now();
        if skew > Duration::seconds(self.config.max_future_skew_secs) {
            return Err(ValidationError::FutureTimestamp {
                timestamp: timestamp.to_rfc3339(),
                skew_secs: skew.num_seconds(),
            });
        }

        let features = raw
            .spectral_features
            .ok_or_else(|| ValidationError::MissingField {
                field: "spectralFeatures".into(),
            })?;
        self.check_features(&features)?;

        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if !recent.insert(&id) {
                debug!(sample_id = %id, "Rejecting duplicate sample");
                return Err(ValidationError::Duplicate { sample_id: id });
            }
        }

        Ok(Sample {
            id,
            timestamp,
            device_id,
            supplier_id,
            route_id,
            batch_id,
            spectral_features: features,
            metrics: QualityMetrics::default(),
            status: SampleStatus::Pending,
            degraded_reason: None,
        })
    }

    /// Drop an id from the dedup window so a redelivery is accepted again.
    ///
    /// Used when a validated sample could not be enqueued.
    pub fn forget(&self, sample_id: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.remove(sample_id);
    }

    fn identifier(&self, field: &str, value: Option<String>) -> Result<String, ValidationError> {
        let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
        if value.is_empty() {
            return Err(ValidationError::MissingField {
                field: field.to_string(),
            });
        }
        if value.len() > self.config.max_id_len {
            return Err(ValidationError::InvalidIdentifier {
                field: field.to_string(),
                reason: format!("longer than {} bytes", self.config.max_id_len),
            });
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(ValidationError::InvalidIdentifier {
                field: field.to_string(),
                reason: format!("illegal character {bad:?}"),
            });
        }
        Ok(value)
    }

    fn check_features(&self, features: &[f64]) -> Result<(), ValidationError> {
        let count = features.len();
        if count < self.config.min_features || count > self.config.max_features {
            return Err(ValidationError::FeatureCount {
                count,
                min: self.config.min_features,
                max: self.config.max_features,
            });
        }
        for (index, &value) in features.iter().enumerate() {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteFeature { index });
            }
            if value < self.config.feature_min || value > self.config.feature_max {
                return Err(ValidationError::FeatureOutOfRange {
                    index,
                    value,
                    min: self.config.feature_min,
                    max: self.config.feature_max,
                });
            }
        }
        Ok(())
    }
}
