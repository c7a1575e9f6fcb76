//! # Lactoflow Core
//!
//! Core library for the Lactoflow milk-quality engine.
//! Provides sample normalization, inference and explainability ports,
//! hierarchical aggregation, drift detection, alerting, recommendation
//! dispatch, sinks, configuration, and the pipeline that wires them together.

pub mod aggregator;
pub mod alerts;
pub mod config;
pub mod dispatch;
pub mod drift;
pub mod error;
pub mod explain;
pub mod inference;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod quality;
pub mod remote;
pub mod retry;
pub mod sinks;
pub mod types;

// Re-export commonly used types at the crate root.
pub use aggregator::{AggregateState, AggregationConfig, HierarchicalAggregator, RunningStats};
pub use alerts::{Alert, AlertConfig, AlertEngine, AlertFilter, AlertOutcome, AlertStatus};
pub use config::{EngineConfig, PipelineConfig, config_exists, default_rules, load_config};
pub use dispatch::{Advice, Advisor, ContextBundle, MockAdvisor, Recommendation};
pub use drift::{AlertRule, DriftDetector, RuleKind, SeverityMapping, Violation};
pub use error::{LactoflowError, Result};
pub use explain::{ExplainTarget, ExplainabilityCache, ExplainabilityRecord, Explainer, MockExplainer};
pub use inference::{InferenceAdapter, MockPredictor, Prediction, Predictor};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use normalizer::SampleNormalizer;
pub use pipeline::{EngineBuilder, IngestAck, NackReason, QualityEngine, ShutdownReport};
pub use remote::{HttpAdvisor, HttpExplainer, HttpPredictor, RemoteConfig};
pub use sinks::{EnrichedPayload, JsonlSink, MemorySink, PersistenceSink, Record, SyncSink};
pub use types::{EntityKey, Level, Metric, RawReading, Sample, SampleStatus, Severity};
