//! Hierarchical aggregator: rolling statistics per supplier, route, batch and
//! the global key.
//!
//! Each PROCESSED sample updates all four levels. Every key is guarded by its
//! own map shard lock, so updates to one key are serialized while different
//! keys proceed in parallel. Means and variances use Welford's algorithm.
//! Every update publishes a new immutable snapshot; a bounded history of past
//! snapshots per key serves point-in-time queries.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::types::{EntityKey, Level, Metric, Sample};

/// Welford running mean/variance with min and max.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the running mean.
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Sample variance (n - 1); zero with fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// One sample's contribution to a rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub sample_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<Metric, f64>,
}

/// Window bounds for one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Keep at most this many recent samples.
    pub max_samples: usize,
    /// Drop samples older than this, measured against the newest sample's
    /// timestamp.
    pub max_age_secs: Option<u64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_samples: 50,
            max_age_secs: None,
        }
    }
}

/// Bounded sliding window of recent samples.
///
/// Entries are shared: one sample's entry is referenced by the windows of all
/// four levels and by every snapshot that still covers it, so cloning a
/// window copies pointers only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingWindow {
    entries: VecDeque<Arc<WindowEntry>>,
}

impl RollingWindow {
    pub fn push(&mut self, entry: Arc<WindowEntry>, bounds: &WindowConfig) {
        let newest = entry.timestamp;
        self.entries.push_back(entry);
        while self.entries.len() > bounds.max_samples.max(1) {
            self.entries.pop_front();
        }
        if let Some(max_age) = bounds.max_age_secs {
            let cutoff = newest - Duration::seconds(max_age as i64);
            while self.entries.len() > 1
                && self
                    .entries
                    .front()
                    .is_some_and(|oldest| oldest.timestamp < cutoff)
            {
                self.entries.pop_front();
            }
        }
    }

    /// Values of `metric` in arrival order, oldest first.
    pub fn values(&self, metric: Metric) -> Vec<f64> {
        self.entries
            .iter()
            .filter_map(|e| e.values.get(&metric).copied())
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter().map(|entry| entry.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derived analytics for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    /// FAT stability score, see [`AggregateState::stability`].
    pub stability: f64,
    /// Running standard deviation of FAT.
    pub fat_std_dev: f64,
    /// Fraction of non-negative FAT step changes across the window.
    pub persistence: f64,
    /// Percentage of samples flagged as adulterated.
    pub adulteration_frequency: f64,
    /// Mean quality score.
    pub quality_index: f64,
}

/// Rolling state for one entity at one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub key: EntityKey,
    pub count: u64,
    pub stats: BTreeMap<Metric, RunningStats>,
    pub window: RollingWindow,
    pub first_update: DateTime<Utc>,
    /// Timestamp of the newest contributing sample.
    pub last_update: DateTime<Utc>,
    pub last_sample_id: String,
    /// Increments with every applied sample.
    pub version: u64,
}

impl AggregateState {
    fn new(key: EntityKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            count: 0,
            stats: BTreeMap::new(),
            window: RollingWindow::default(),
            first_update: at,
            last_update: at,
            last_sample_id: String::new(),
            version: 0,
        }
    }

    pub fn level(&self) -> Level {
        self.key.level
    }

    pub fn stats(&self, metric: Metric) -> Option<&RunningStats> {
        self.stats.get(&metric)
    }

    pub fn mean(&self, metric: Metric) -> Option<f64> {
        self.stats(metric).map(|s| s.mean)
    }

    pub fn std_dev(&self, metric: Metric) -> Option<f64> {
        self.stats(metric).map(|s| s.std_dev())
    }

    /// Steadiness of a metric over the window as `1 / (1 + σ)`: 1.0 for a
    /// constant series, 0.5 at one unit of standard deviation. `None` below
    /// two window values.
    pub fn stability(&self, metric: Metric) -> Option<f64> {
        let values = self.window.values(metric);
        if values.len() < 2 {
            return None;
        }
        let mut stats = RunningStats::default();
        for value in values {
            stats.push(value);
        }
        Some(1.0 / (1.0 + stats.std_dev()))
    }

    /// Fraction of non-negative step changes of a metric across the window.
    /// `None` below two window values.
    pub fn persistence(&self, metric: Metric) -> Option<f64> {
        let values = self.window.values(metric);
        if values.len() < 2 {
            return None;
        }
        let rising = values.windows(2).filter(|w| w[1] - w[0] >= 0.0).count();
        Some(rising as f64 / (values.len() - 1) as f64)
    }

    fn apply(&mut self, sample: &Sample, entry: &Arc<WindowEntry>, bounds: &WindowConfig) {
        for (metric, value) in &entry.values {
            self.stats.entry(*metric).or_default().push(*value);
        }
        self.window.push(entry.clone(), bounds);
        if self.count == 0 {
            self.first_update = sample.timestamp;
        }
        self.count += 1;
        self.version += 1;
        self.last_update = self.last_update.max(sample.timestamp);
        self.last_sample_id = sample.id.clone();
    }

    pub fn analytics(&self) -> Analytics {
        Analytics {
            stability: self.stability(Metric::Fat).unwrap_or(1.0),
            fat_std_dev: self.std_dev(Metric::Fat).unwrap_or(0.0),
            persistence: self.persistence(Metric::Fat).unwrap_or(1.0),
            adulteration_frequency: self.mean(Metric::AdulterationFlag).unwrap_or(0.0),
            quality_index: self.mean(Metric::QualityScore).unwrap_or(0.0),
        }
    }
}

/// Configuration for the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub supplier_window: WindowConfig,
    pub route_window: WindowConfig,
    pub batch_window: WindowConfig,
    pub global_window: WindowConfig,
    /// Past snapshots retained per key for point-in-time queries.
    pub history_depth: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            supplier_window: WindowConfig {
                max_samples: 50,
                max_age_secs: None,
            },
            route_window: WindowConfig {
                max_samples: 100,
                max_age_secs: None,
            },
            batch_window: WindowConfig {
                max_samples: 100,
                max_age_secs: None,
            },
            global_window: WindowConfig {
                max_samples: 200,
                max_age_secs: None,
            },
            history_depth: 16,
        }
    }
}

impl AggregationConfig {
    pub fn window(&self, level: Level) -> &WindowConfig {
        match level {
            Level::Route => &self.route_window,
            Level::Batch => &self.batch_window,
            Level::Global => &self.global_window,
            Level::Supplier | Level::Sample => &self.supplier_window,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for level in Level::AGGREGATE {
            let window = self.window(level);
            if window.max_samples < 2 {
                errors.push(format!(
                    "aggregation.{level}_window.max_samples must be at least 2"
                ));
            }
            if window.max_age_secs == Some(0) {
                errors.push(format!(
                    "aggregation.{level}_window.max_age_secs must be positive"
                ));
            }
        }
        errors
    }
}

struct KeyState {
    current: Arc<AggregateState>,
    history: VecDeque<Arc<AggregateState>>,
}

/// Maintains [`AggregateState`] for every entity at the four aggregate levels.
pub struct HierarchicalAggregator {
    config: AggregationConfig,
    states: DashMap<EntityKey, KeyState>,
    updates: AtomicU64,
}

impl HierarchicalAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            updates: AtomicU64::new(0),
        }
    }

    /// Apply a sample to all four levels.
    ///
    /// Returns the post-update snapshots in level order, or `None` without
    /// touching any level when the sample is not PROCESSED or lacks a core
    /// metric.
    pub fn update(&self, sample: &Sample) -> Option<Vec<Arc<AggregateState>>> {
        if !sample.is_processed() {
            debug!(sample_id = %sample.id, status = %sample.status, "Skipping aggregation");
            return None;
        }
        let values: BTreeMap<Metric, f64> = Metric::ALL
            .iter()
            .filter_map(|m| {
                sample
                    .metrics
                    .value(*m)
                    .filter(|v| v.is_finite())
                    .map(|v| (*m, v))
            })
            .collect();
        if [Metric::Fat, Metric::Snf, Metric::Ts]
            .iter()
            .any(|m| !values.contains_key(m))
        {
            debug!(sample_id = %sample.id, "Skipping aggregation, core metrics missing");
            return None;
        }

        debug!(sample_id = %sample.id, level = %Level::Sample, "Aggregating sample");
        let entry = Arc::new(WindowEntry {
            sample_id: sample.id.clone(),
            timestamp: sample.timestamp,
            values,
        });
        let snapshots = Level::AGGREGATE
            .iter()
            .map(|level| self.apply(sample.entity_key(*level), sample, &entry))
            .collect();
        self.updates.fetch_add(1, Ordering::Relaxed);
        Some(snapshots)
    }

    fn apply(
        &self,
        key: EntityKey,
        sample: &Sample,
        entry: &Arc<WindowEntry>,
    ) -> Arc<AggregateState> {
        let bounds = self.config.window(key.level);
        let mut slot = self.states.entry(key.clone()).or_insert_with(|| KeyState {
            current: Arc::new(AggregateState::new(key.clone(), sample.timestamp)),
            history: VecDeque::new(),
        });

        // Copy-on-write: statistics are copied, window entries are shared.
        let mut next = (*slot.current).clone();
        next.apply(sample, entry, bounds);
        let next = Arc::new(next);

        if self.config.history_depth > 0 && slot.current.count > 0 {
            let previous = slot.current.clone();
            slot.history.push_back(previous);
            while slot.history.len() > self.config.history_depth {
                slot.history.pop_front();
            }
        }
        slot.current = next.clone();
        debug!(
            level = %key.level,
            entity = %key.id,
            count = next.count,
            version = next.version,
            "Aggregate updated"
        );
        next
    }

    /// Current state of a key.
    pub fn get(&self, key: &EntityKey) -> Option<Arc<AggregateState>> {
        self.states.get(key).map(|slot| slot.current.clone())
    }

    /// State of a key as of `as_of`: the newest retained snapshot whose last
    /// contributing sample is not later than `as_of`. `None` means current.
    pub fn get_as_of(
        &self,
        key: &EntityKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Option<Arc<AggregateState>> {
        let slot = self.states.get(key)?;
        let Some(as_of) = as_of else {
            return Some(slot.current.clone());
        };
        std::iter::once(&slot.current)
            .chain(slot.history.iter().rev())
            .find(|state| state.last_update <= as_of)
            .cloned()
    }

    /// All keys at a level.
    pub fn keys(&self, level: Level) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .states
            .iter()
            .filter(|entry| entry.key().level == level)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Samples applied since construction.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MilkType, QualityMetrics, SampleStatus};

    fn sample(id: &str, supplier: &str, fat: f64, at: DateTime<Utc>) -> Sample {
        Sample {
            id: id.into(),
            timestamp: at,
            device_id: "dev".into(),
            supplier_id: supplier.into(),
            route_id: "route-1".into(),
            batch_id: "batch-1".into(),
            spectral_features: vec![fat],
            metrics: QualityMetrics {
                fat: Some(fat),
                snf: Some(8.5),
                ts: Some(12.5),
                milk_type: Some(MilkType::Cow),
                adulteration_risk: Some(10.0),
                is_adulterated: Some(false),
                quality_score: Some(7.0),
                ..Default::default()
            },
            status: SampleStatus::Processed,
            degraded_reason: None,
        }
    }

    #[test]
    fn test_running_stats_matches_direct_computation() {
        let values = [4.1, 3.9, 4.4, 5.0, 3.2, 4.0];
        let mut stats = RunningStats::default();
        values.iter().for_each(|v| stats.push(*v));

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert!((stats.mean - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-12);
        assert_eq!(stats.min, 3.2);
        assert_eq!(stats.max, 5.0);
    }

    #[test]
    fn test_running_stats_stable_with_large_offset() {
        let mut stats = RunningStats::default();
        for v in [1e9 + 4.0, 1e9 + 7.0, 1e9 + 13.0, 1e9 + 16.0] {
            stats.push(v);
        }
        assert!((stats.variance() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_value_has_zero_variance() {
        let mut stats = RunningStats::default();
        stats.push(3.0);
        assert_eq!(stats.variance(), 0.0);
        assert_eq!(stats.std_dev(), 0.0);
    }

    #[test]
    fn test_update_touches_all_four_levels() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let snapshots = agg.update(&sample("s1", "sup-1", 4.0, Utc::now())).unwrap();
        let levels: Vec<Level> = snapshots.iter().map(|s| s.level()).collect();
        assert_eq!(levels, Level::AGGREGATE.to_vec());
        assert_eq!(agg.len(), 4);
        assert_eq!(agg.get(&EntityKey::global()).unwrap().count, 1);
    }

    #[test]
    fn test_degraded_sample_updates_nothing() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let s = sample("s1", "sup-1", 4.0, Utc::now()).degraded(QualityMetrics::default(), "down");
        assert!(agg.update(&s).is_none());
        assert!(agg.is_empty());
    }

    #[test]
    fn test_shared_parents_accumulate() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let now = Utc::now();
        agg.update(&sample("s1", "sup-1", 4.0, now));
        agg.update(&sample("s2", "sup-2", 3.0, now));
        assert_eq!(agg.get(&EntityKey::new(Level::Supplier, "sup-1")).unwrap().count, 1);
        assert_eq!(agg.get(&EntityKey::new(Level::Route, "route-1")).unwrap().count, 2);
        assert_eq!(agg.keys(Level::Supplier).len(), 2);
    }

    #[test]
    fn test_window_bounded_by_count() {
        let config = AggregationConfig {
            supplier_window: WindowConfig {
                max_samples: 3,
                max_age_secs: None,
            },
            ..Default::default()
        };
        let agg = HierarchicalAggregator::new(config);
        let now = Utc::now();
        for (i, fat) in [1.0, 2.0, 3.0, 4.0, 5.0].iter().enumerate() {
            agg.update(&sample(&format!("s{i}"), "sup-1", *fat, now));
        }
        let state = agg.get(&EntityKey::new(Level::Supplier, "sup-1")).unwrap();
        assert_eq!(state.window.values(Metric::Fat), vec![3.0, 4.0, 5.0]);
        assert_eq!(state.count, 5);
        assert!((state.mean(Metric::Fat).unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_bounded_by_age() {
        let config = AggregationConfig {
            supplier_window: WindowConfig {
                max_samples: 100,
                max_age_secs: Some(60),
            },
            ..Default::default()
        };
        let agg = HierarchicalAggregator::new(config);
        let t0 = Utc::now() - Duration::minutes(10);
        agg.update(&sample("a", "sup-1", 1.0, t0));
        agg.update(&sample("b", "sup-1", 2.0, t0 + Duration::seconds(30)));
        agg.update(&sample("c", "sup-1", 3.0, t0 + Duration::seconds(120)));
        let state = agg.get(&EntityKey::new(Level::Supplier, "sup-1")).unwrap();
        assert_eq!(state.window.values(Metric::Fat), vec![3.0]);
    }

    #[test]
    fn test_as_of_returns_historical_snapshot() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let t0 = Utc::now() - Duration::hours(1);
        agg.update(&sample("a", "sup-1", 4.0, t0));
        agg.update(&sample("b", "sup-1", 2.0, t0 + Duration::minutes(10)));
        let key = EntityKey::new(Level::Supplier, "sup-1");

        let past = agg
            .get_as_of(&key, Some(t0 + Duration::minutes(5)))
            .unwrap();
        assert_eq!(past.count, 1);
        assert_eq!(past.mean(Metric::Fat), Some(4.0));

        let current = agg.get_as_of(&key, None).unwrap();
        assert_eq!(current.count, 2);
        assert!(agg.get_as_of(&key, Some(t0 - Duration::minutes(1))).is_none());
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let now = Utc::now();
        agg.update(&sample("a", "sup-1", 4.0, now));
        let key = EntityKey::new(Level::Supplier, "sup-1");
        let held = agg.get(&key).unwrap();
        agg.update(&sample("b", "sup-1", 2.0, now));
        assert_eq!(held.count, 1);
        assert_eq!(agg.get(&key).unwrap().count, 2);
    }

    #[test]
    fn test_window_entries_shared_across_levels_and_snapshots() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let now = Utc::now();
        agg.update(&sample("a", "sup-1", 4.0, now));
        let key = EntityKey::new(Level::Supplier, "sup-1");
        let held = agg.get(&key).unwrap();
        agg.update(&sample("b", "sup-1", 3.0, now));
        let current = agg.get(&key).unwrap();

        let first_held = held.window.entries().next().unwrap();
        let first_current = current.window.entries().next().unwrap();
        assert!(std::ptr::eq(first_held, first_current));

        let global = agg.get(&EntityKey::global()).unwrap();
        let newest_global = global.window.entries().last().unwrap();
        let newest_supplier = current.window.entries().last().unwrap();
        assert!(std::ptr::eq(newest_global, newest_supplier));
        assert_eq!(newest_global.sample_id, "b");
    }

    #[test]
    fn test_analytics() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let now = Utc::now();
        for (i, fat) in [4.0, 4.5, 4.2, 4.2].iter().enumerate() {
            let mut s = sample(&format!("s{i}"), "sup-1", *fat, now);
            s.metrics.is_adulterated = Some(i == 0);
            agg.update(&s);
        }
        let analytics = agg
            .get(&EntityKey::new(Level::Supplier, "sup-1"))
            .unwrap()
            .analytics();
        assert!((analytics.persistence - 2.0 / 3.0).abs() < 1e-12);
        assert!((analytics.adulteration_frequency - 25.0).abs() < 1e-12);
        assert!((analytics.quality_index - 7.0).abs() < 1e-12);
        assert!(analytics.fat_std_dev > 0.0);
        assert!(analytics.stability > 0.5 && analytics.stability < 1.0);
    }

    #[test]
    fn test_stability_and_persistence_need_two_values() {
        let agg = HierarchicalAggregator::new(AggregationConfig::default());
        let now = Utc::now();
        let key = EntityKey::new(Level::Supplier, "sup-1");

        agg.update(&sample("s0", "sup-1", 4.0, now));
        let state = agg.get(&key).unwrap();
        assert_eq!(state.stability(Metric::Fat), None);
        assert_eq!(state.persistence(Metric::Fat), None);
        assert_eq!(state.analytics().stability, 1.0);

        agg.update(&sample("s1", "sup-1", 4.0, now));
        let state = agg.get(&key).unwrap();
        assert_eq!(state.stability(Metric::Fat), Some(1.0));
        assert_eq!(state.persistence(Metric::Fat), Some(1.0));

        // Swings of two units: window standard deviation well above one.
        for (i, fat) in [2.0, 6.0, 2.0, 6.0].iter().enumerate() {
            agg.update(&sample(&format!("e{i}"), "sup-1", *fat, now));
        }
        let state = agg.get(&key).unwrap();
        assert!(state.stability(Metric::Fat).unwrap() < 0.5);
        assert!((state.persistence(Metric::Fat).unwrap() - 3.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AggregationConfig::default();
        assert!(config.validate().is_empty());
        config.batch_window.max_samples = 1;
        config.global_window.max_age_secs = Some(0);
        assert_eq!(config.validate().len(), 2);
    }
}
