//! Error types for the Lactoflow engine.
//!
//! Uses `thiserror` for public API error types with one enum per pipeline stage:
//! validation, inference, explainability, persistence, advisory, alerting,
//! configuration, and the engine lifecycle. Every stage isolates its own faults,
//! so most of these surface as degraded-status fields or log lines rather than
//! as a terminated pipeline.

use std::path::PathBuf;

/// Top-level error type returned by the engine's public entry points
/// (`EngineBuilder::build`, `QualityEngine::acknowledge`, `QualityEngine::shutdown`).
#[derive(Debug, thiserror::Error)]
pub enum LactoflowError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Explainability error: {0}")]
    Explain(#[from] ExplainError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Advisory service error: {0}")]
    Advisory(#[from] AdvisoryError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Malformed or duplicate input, rejected at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid identifier for '{field}': {reason}")]
    InvalidIdentifier { field: String, reason: String },

    #[error("Spectral feature count {count} outside allowed range {min}..={max}")]
    FeatureCount { count: usize, min: usize, max: usize },

    #[error("Spectral feature at index {index} is not finite")]
    NonFiniteFeature { index: usize },

    #[error("Spectral feature at index {index} = {value} outside {min}..={max}")]
    FeatureOutOfRange {
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Timestamp {timestamp} is {skew_secs}s in the future")]
    FutureTimestamp { timestamp: String, skew_secs: i64 },

    #[error("Duplicate sample id: {sample_id}")]
    Duplicate { sample_id: String },
}

/// Failures of the external prediction interface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("Prediction request failed: {message}")]
    Request { message: String },

    #[error("Prediction timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Prediction response invalid: {message}")]
    InvalidResponse { message: String },
}

/// Failures of the external attribution generator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExplainError {
    #[error("Explainer request failed: {message}")]
    Request { message: String },

    #[error("Explainer timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("No features recorded for sample {sample_id}")]
    UnknownSample { sample_id: String },
}

/// Failures writing to a persistence or downstream sync sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    #[error("Sink '{sink}' write failed: {message}")]
    WriteFailed { sink: String, message: String },

    #[error("Sink '{sink}' timed out after {timeout_ms}ms")]
    Timeout { sink: String, timeout_ms: u64 },

    #[error("Sink '{sink}' rejected payload with status {status}")]
    Rejected { sink: String, status: u16 },
}

/// Failures of the external advisory (recommendation) service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdvisoryError {
    #[error("Advisory request failed: {message}")]
    Request { message: String },

    #[error("Advisory request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Advisory response could not be parsed: {message}")]
    ResponseParse { message: String },
}

/// Errors from operator-driven alert transitions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertError {
    #[error("Alert not found: {id}")]
    NotFound { id: String },

    #[error("Invalid alert transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the engine lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Worker queue is full")]
    QueueFull,

    #[error("Engine has already been shut down")]
    AlreadyShutDown,
}

/// A type alias for results using the top-level `LactoflowError`.
pub type Result<T> = std::result::Result<T, LactoflowError>;
