//! Core data types shared across the pipeline: readings, samples, metrics,
//! hierarchy levels, entity keys and the severity ladder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::quality::{PriceEstimate, TrafficCards};

/// Raw reading as delivered by the transport, before validation.
///
/// Every field is optional so that missing fields are reported as
/// validation failures instead of deserialization errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    #[serde(default)]
    pub sample_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub supplier_id: Option<String>,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub spectral_features: Option<Vec<f64>>,
}

/// Processing status of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SampleStatus {
    /// Validated, awaiting inference.
    Pending,
    /// Inference succeeded; metrics are populated.
    Processed,
    /// Inference failed; metrics are null or fallback values.
    Degraded,
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleStatus::Pending => write!(f, "PENDING"),
            SampleStatus::Processed => write!(f, "PROCESSED"),
            SampleStatus::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Milk-type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilkType {
    Cow,
    Buffalo,
    Goat,
    Camel,
    Mixed,
    Almond,
    Oat,
    Soy,
    Unknown,
}

impl MilkType {
    /// Whether this is one of the animal milk types the dairy accepts.
    pub fn is_recognised(&self) -> bool {
        matches!(
            self,
            MilkType::Cow | MilkType::Buffalo | MilkType::Mixed | MilkType::Camel | MilkType::Goat
        )
    }
}

impl fmt::Display for MilkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MilkType::Cow => "cow",
            MilkType::Buffalo => "buffalo",
            MilkType::Goat => "goat",
            MilkType::Camel => "camel",
            MilkType::Mixed => "mixed",
            MilkType::Almond => "almond",
            MilkType::Oat => "oat",
            MilkType::Soy => "soy",
            MilkType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Scalar metrics tracked per sample and rolled up through the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Fat,
    Snf,
    Ts,
    AdulterationRisk,
    QualityScore,
    Price,
    /// 100.0 when the sample is flagged as adulterated, 0.0 otherwise.
    AdulterationFlag,
    /// 100.0 when the milk type is not a recognised animal milk, 0.0 otherwise.
    UnknownMilkType,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::Fat,
        Metric::Snf,
        Metric::Ts,
        Metric::AdulterationRisk,
        Metric::QualityScore,
        Metric::Price,
        Metric::AdulterationFlag,
        Metric::UnknownMilkType,
    ];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Fat => "fat",
            Metric::Snf => "snf",
            Metric::Ts => "ts",
            Metric::AdulterationRisk => "adulteration_risk",
            Metric::QualityScore => "quality_score",
            Metric::Price => "price",
            Metric::AdulterationFlag => "adulteration_flag",
            Metric::UnknownMilkType => "unknown_milk_type",
        };
        write!(f, "{name}")
    }
}

/// Level of the aggregation hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Sample,
    Supplier,
    Route,
    Batch,
    Global,
}

impl Level {
    /// Aggregate levels in their fixed update order.
    pub const AGGREGATE: [Level; 4] = [Level::Supplier, Level::Route, Level::Batch, Level::Global];
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Sample => "sample",
            Level::Supplier => "supplier",
            Level::Route => "route",
            Level::Batch => "batch",
            Level::Global => "global",
        };
        write!(f, "{name}")
    }
}

/// The single key used for the global level.
pub const GLOBAL_KEY: &str = "global";

/// Identifies one entity in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub level: Level,
    pub id: String,
}

impl EntityKey {
    pub fn new(level: Level, id: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(Level::Global, GLOBAL_KEY)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.id)
    }
}

/// Monotonic severity ladder for violations and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Metrics derived for one sample by the inference adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub fat: Option<f64>,
    pub snf: Option<f64>,
    pub ts: Option<f64>,
    pub milk_type: Option<MilkType>,
    pub adulteration_risk: Option<f64>,
    pub is_adulterated: Option<bool>,
    pub quality_score: Option<f64>,
    pub price: Option<PriceEstimate>,
    pub traffic_cards: Option<TrafficCards>,
    pub confidence: Option<f64>,
    pub model_version: Option<String>,
}

impl QualityMetrics {
    /// Scalar value of a metric, if known.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Fat => self.fat,
            Metric::Snf => self.snf,
            Metric::Ts => self.ts,
            Metric::AdulterationRisk => self.adulteration_risk,
            Metric::QualityScore => self.quality_score,
            Metric::Price => self.price.as_ref().map(|p| p.final_price),
            Metric::AdulterationFlag => self
                .is_adulterated
                .map(|flag| if flag { 100.0 } else { 0.0 }),
            Metric::UnknownMilkType => self
                .milk_type
                .map(|t| if t.is_recognised() { 0.0 } else { 100.0 }),
        }
    }
}

/// A validated sample. Immutable once accepted; inference produces a new
/// value rather than mutating the pending one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub supplier_id: String,
    pub route_id: String,
    pub batch_id: String,
    pub spectral_features: Vec<f64>,
    pub metrics: QualityMetrics,
    pub status: SampleStatus,
    /// Reason the sample was degraded, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl Sample {
    /// Key of this sample at the given hierarchy level.
    pub fn entity_key(&self, level: Level) -> EntityKey {
        match level {
            Level::Sample => EntityKey::new(level, self.id.clone()),
            Level::Supplier => EntityKey::new(level, self.supplier_id.clone()),
            Level::Route => EntityKey::new(level, self.route_id.clone()),
            Level::Batch => EntityKey::new(level, self.batch_id.clone()),
            Level::Global => EntityKey::global(),
        }
    }

    /// Transition to PROCESSED with the given metrics.
    pub fn processed(self, metrics: QualityMetrics) -> Self {
        Self {
            metrics,
            status: SampleStatus::Processed,
            degraded_reason: None,
            ..self
        }
    }

    /// Transition to DEGRADED with fallback metrics and a reason.
    pub fn degraded(self, metrics: QualityMetrics, reason: impl Into<String>) -> Self {
        Self {
            metrics,
            status: SampleStatus::Degraded,
            degraded_reason: Some(reason.into()),
            ..self
        }
    }

    pub fn is_processed(&self) -> bool {
        self.status == SampleStatus::Processed
    }
}
