//! Explainability cache: write-once attribution vectors per
//! (sample, target, model version).
//!
//! `get_or_compute` is single-flight per key: concurrent callers for the same
//! key share one call to the external explainer. Failed computations leave the
//! key absent so the next request retries. Records are evicted after a
//! retention window, except while a caller still holds the record or an
//! initialization is in flight for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::ExplainError;

/// Metric an attribution vector explains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainTarget {
    Fat,
    Snf,
    Ts,
    Adulteration,
}

impl fmt::Display for ExplainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplainTarget::Fat => write!(f, "fat"),
            ExplainTarget::Snf => write!(f, "snf"),
            ExplainTarget::Ts => write!(f, "ts"),
            ExplainTarget::Adulteration => write!(f, "adulteration"),
        }
    }
}

/// Cache key: one record per (sample, target, model version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExplainKey {
    pub sample_id: String,
    pub target: ExplainTarget,
    pub model_version: String,
}

/// Immutable attribution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainabilityRecord {
    pub sample_id: String,
    pub target: ExplainTarget,
    pub model_version: String,
    /// Per-feature contribution scores, aligned with the spectral features.
    pub attributions: Vec<f64>,
    pub computed_at: DateTime<Utc>,
}

impl ExplainabilityRecord {
    /// The `n` features with the largest absolute contribution, as
    /// `(feature index, attribution)` pairs in descending order.
    pub fn top_features(&self, n: usize) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self.attributions.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(n);
        ranked
    }

    /// Sum of absolute attributions.
    pub fn total_attribution(&self) -> f64 {
        self.attributions.iter().map(|a| a.abs()).sum()
    }
}

/// Trait for the external attribution generator.
#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(
        &self,
        features: &[f64],
        target: ExplainTarget,
        model_version: &str,
    ) -> Result<Vec<f64>, ExplainError>;
}

/// Configuration for the explainability cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    /// Whether processed samples trigger background explanation.
    pub enabled: bool,
    /// Targets explained for every processed sample.
    pub targets: Vec<ExplainTarget>,
    /// Retention window for records and registered features.
    pub ttl_secs: u64,
    /// Soft cap on cached records; oldest unreferenced records go first.
    pub max_entries: usize,
    /// Per-call timeout for the explainer.
    pub timeout_ms: u64,
    /// How often the pipeline runs the eviction sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: vec![
                ExplainTarget::Fat,
                ExplainTarget::Ts,
                ExplainTarget::Adulteration,
            ],
            ttl_secs: 3600,
            max_entries: 10_000,
            timeout_ms: 5_000,
            sweep_interval_secs: 60,
        }
    }
}

impl ExplainConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.ttl_secs == 0 {
            errors.push("explain.ttl_secs must be positive".to_string());
        }
        if self.max_entries == 0 {
            errors.push("explain.max_entries must be at least 1".to_string());
        }
        if self.timeout_ms == 0 {
            errors.push("explain.timeout_ms must be positive".to_string());
        }
        if self.sweep_interval_secs == 0 {
            errors.push("explain.sweep_interval_secs must be positive".to_string());
        }
        errors
    }
}

struct Slot {
    cell: Arc<OnceCell<Arc<ExplainabilityRecord>>>,
    inserted_at: Instant,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            inserted_at: now,
        }
    }

    /// A slot is pinned while a caller holds its cell (initialization in
    /// flight) or a clone of its record.
    fn is_pinned(&self) -> bool {
        if Arc::strong_count(&self.cell) > 1 {
            return true;
        }
        self.cell
            .get()
            .map(|record| Arc::strong_count(record) > 1)
            .unwrap_or(false)
    }
}

struct RegisteredFeatures {
    features: Arc<[f64]>,
    registered_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplainStats {
    pub entries: usize,
    pub computations: u64,
    pub failures: u64,
    pub hits: u64,
    pub evictions: u64,
}

/// Read-mostly, single-flight cache of attribution records.
pub struct ExplainabilityCache {
    explainer: Arc<dyn Explainer>,
    config: ExplainConfig,
    slots: DashMap<ExplainKey, Slot>,
    features: DashMap<String, RegisteredFeatures>,
    computations: AtomicU64,
    failures: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl ExplainabilityCache {
    pub fn new(explainer: Arc<dyn Explainer>, config: ExplainConfig) -> Self {
        Self {
            explainer,
            config,
            slots: DashMap::new(),
            features: DashMap::new(),
            computations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    /// Record the spectral features of a processed sample so it can be
    /// explained later by id.
    pub fn register_features(&self, sample_id: &str, features: &[f64]) {
        self.features.insert(
            sample_id.to_string(),
            RegisteredFeatures {
                features: Arc::from(features),
                registered_at: Instant::now(),
            },
        );
    }

    /// Return the record for the exact key, computing it once if absent.
    pub async fn get_or_compute(
        &self,
        sample_id: &str,
        target: ExplainTarget,
        model_version: &str,
    ) -> Result<Arc<ExplainabilityRecord>, ExplainError> {
        let key = ExplainKey {
            sample_id: sample_id.to_string(),
            target,
            model_version: model_version.to_string(),
        };

        // Clone the cell out so no map shard lock is held across the await.
        let existing = self.slots.get(&key).map(|slot| slot.cell.clone());
        let cell = match existing {
            Some(cell) => cell,
            None => {
                // Only samples with retained features get a slot; lookups for
                // unknown ids must not occupy capacity.
                if !self.features.contains_key(sample_id) {
                    return Err(ExplainError::UnknownSample {
                        sample_id: key.sample_id,
                    });
                }
                self.slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(Instant::now()))
                    .cell
                    .clone()
            }
        };

        if let Some(record) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(record.clone());
        }

        let record = cell
            .get_or_try_init(|| self.compute(&key))
            .await
            .inspect_err(|e| {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sample_id = %key.sample_id,
                    target = %key.target,
                    error = %e,
                    "Explanation failed, leaving key absent"
                );
            })?;
        Ok(record.clone())
    }

    async fn compute(&self, key: &ExplainKey) -> Result<Arc<ExplainabilityRecord>, ExplainError> {
        let features = self
            .features
            .get(&key.sample_id)
            .map(|entry| entry.features.clone())
            .ok_or_else(|| ExplainError::UnknownSample {
                sample_id: key.sample_id.clone(),
            })?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let attributions = tokio::time::timeout(
            timeout,
            self.explainer
                .explain(&features, key.target, &key.model_version),
        )
        .await
        .map_err(|_| ExplainError::Timeout {
            timeout_ms: self.config.timeout_ms,
        })??;

        self.computations.fetch_add(1, Ordering::Relaxed);
        debug!(
            sample_id = %key.sample_id,
            target = %key.target,
            model_version = %key.model_version,
            "Explanation computed"
        );
        Ok(Arc::new(ExplainabilityRecord {
            sample_id: key.sample_id.clone(),
            target: key.target,
            model_version: key.model_version.clone(),
            attributions,
            computed_at: Utc::now(),
        }))
    }

    /// Look up an existing record for the exact key without computing.
    pub fn get(
        &self,
        sample_id: &str,
        target: ExplainTarget,
        model_version: &str,
    ) -> Option<Arc<ExplainabilityRecord>> {
        let key = ExplainKey {
            sample_id: sample_id.to_string(),
            target,
            model_version: model_version.to_string(),
        };
        self.slots
            .get(&key)
            .and_then(|slot| slot.cell.get().cloned())
    }

    /// Most recently computed record for a sample and target across model
    /// versions.
    pub fn latest(&self, sample_id: &str, target: ExplainTarget) -> Option<Arc<ExplainabilityRecord>> {
        self.slots
            .iter()
            .filter(|entry| entry.key().sample_id == sample_id && entry.key().target == target)
            .filter_map(|entry| entry.value().cell.get().cloned())
            .max_by_key(|record| record.computed_at)
    }

    /// Evict records and features older than the retention window.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// Eviction against an explicit clock reading.
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let mut evicted = 0usize;
        self.slots.retain(|_, slot| {
            let expired = now.saturating_duration_since(slot.inserted_at) >= ttl;
            if expired && !slot.is_pinned() {
                evicted += 1;
                false
            } else {
                true
            }
        });
        self.features
            .retain(|_, f| now.saturating_duration_since(f.registered_at) < ttl);

        evicted += self.enforce_capacity();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = self.slots.len(), "Explainability cache sweep");
        }
        evicted
    }

    /// Drop oldest unpinned records until the cache is within `max_entries`.
    fn enforce_capacity(&self) -> usize {
        let excess = self.slots.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return 0;
        }
        let mut candidates: Vec<(Instant, ExplainKey)> = self
            .slots
            .iter()
            .filter(|entry| !entry.value().is_pinned())
            .map(|entry| (entry.value().inserted_at, entry.key().clone()))
            .collect();
        candidates.sort_by_key(|(at, _)| *at);

        let mut removed = 0;
        for (_, key) in candidates.into_iter().take(excess) {
            if self
                .slots
                .remove_if(&key, |_, slot| !slot.is_pinned())
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> ExplainStats {
        ExplainStats {
            entries: self.slots.len(),
            computations: self.computations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Deterministic explainer for tests: attribution `i` is
/// `feature[i] * (i + 1) * weight(target)`.
pub struct MockExplainer {
    calls: AtomicU64,
    delay: Option<Duration>,
    fail: bool,
}

impl MockExplainer {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay: None,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExplainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Explainer for MockExplainer {
    async fn explain(
        &self,
        features: &[f64],
        target: ExplainTarget,
        _model_version: &str,
    ) -> Result<Vec<f64>, ExplainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ExplainError::Request {
                message: "explainer unavailable".into(),
            });
        }
        let weight = match target {
            ExplainTarget::Fat => 1.0,
            ExplainTarget::Snf => 0.5,
            ExplainTarget::Ts => 0.25,
            ExplainTarget::Adulteration => -1.0,
        };
        Ok(features
            .iter()
            .enumerate()
            .map(|(i, f)| f * (i + 1) as f64 * weight)
            .collect())
    }
}
