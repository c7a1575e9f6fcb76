//! Drift and anomaly detection.
//!
//! The detector is stateless: it reads a sample or an aggregate snapshot and
//! returns the violations of the configured rules. Persistence is measured
//! from the rolling window itself, so no per-entity counters are kept here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::aggregator::AggregateState;
use crate::types::{EntityKey, Level, Metric, Sample, Severity};

/// Which statistic an absolute bound is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    /// Trailing window values (the instantaneous metric).
    #[default]
    Value,
    /// The running mean of the aggregate.
    Mean,
    /// Window stability score `1 / (1 + σ)`, in `(0, 1]`.
    Stability,
    /// Fraction of non-negative step changes across the window.
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Falling,
    Rising,
}

/// Threshold function of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Metric outside `[min, max]`.
    Absolute {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        statistic: Statistic,
    },
    /// Metric more than `std_devs` standard deviations from the baseline
    /// formed by the window values preceding the violating run.
    Deviation {
        std_devs: f64,
        #[serde(default = "default_min_baseline")]
        min_baseline: usize,
    },
    /// Net change across the last `span` values beyond `min_change`.
    Trend {
        direction: Direction,
        min_change: f64,
        span: usize,
    },
    /// Least-squares slope per sample across the last `span` values.
    Slope { max_abs_slope: f64, span: usize },
}

fn default_min_baseline() -> usize {
    5
}

/// Escalation step of a severity mapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityTier {
    /// Minimum `(measured - threshold) / threshold`.
    #[serde(default)]
    pub min_excess_ratio: f64,
    /// Minimum number of consecutive violating observations.
    #[serde(default)]
    pub min_persistence: usize,
    pub severity: Severity,
}

/// Maps how far and how long a threshold was exceeded to a severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityMapping {
    pub base: Severity,
    #[serde(default)]
    pub tiers: Vec<SeverityTier>,
}

impl SeverityMapping {
    pub fn fixed(base: Severity) -> Self {
        Self {
            base,
            tiers: Vec::new(),
        }
    }

    pub fn classify(&self, excess_ratio: f64, persistence: usize) -> Severity {
        self.tiers
            .iter()
            .filter(|t| excess_ratio >= t.min_excess_ratio && persistence >= t.min_persistence)
            .map(|t| t.severity)
            .fold(self.base, Severity::max)
    }
}

/// A threshold policy applied to one metric at one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub level: Level,
    pub metric: Metric,
    pub kind: RuleKind,
    /// Consecutive violating observations required before a violation is
    /// declared.
    #[serde(default = "default_min_consecutive")]
    pub min_consecutive: usize,
    /// Samples an aggregate must have absorbed before the rule applies.
    #[serde(default)]
    pub min_samples: u64,
    pub severity: SeverityMapping,
    /// Overrides `alerts.cooldown_secs` for this rule.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

fn default_min_consecutive() -> usize {
    1
}

impl AlertRule {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let at = format!("rules.{}", self.id);
        if self.id.trim().is_empty() {
            errors.push("rules: every rule needs a non-empty id".to_string());
        }
        if self.min_consecutive == 0 {
            errors.push(format!("{at}.min_consecutive must be at least 1"));
        }
        match &self.kind {
            RuleKind::Absolute {
                min,
                max,
                statistic,
            } => {
                if min.is_none() && max.is_none() {
                    errors.push(format!("{at}: absolute rule needs min or max"));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        errors.push(format!("{at}: min must not exceed max"));
                    }
                }
                if self.level == Level::Sample && *statistic != Statistic::Value {
                    errors.push(format!("{at}: sample-level rules only check the value"));
                }
            }
            RuleKind::Deviation {
                std_devs,
                min_baseline,
            } => {
                if *std_devs <= 0.0 {
                    errors.push(format!("{at}.std_devs must be positive"));
                }
                if *min_baseline < 2 {
                    errors.push(format!("{at}.min_baseline must be at least 2"));
                }
            }
            RuleKind::Trend {
                min_change, span, ..
            } => {
                if *min_change <= 0.0 {
                    errors.push(format!("{at}.min_change must be positive"));
                }
                if *span < 2 {
                    errors.push(format!("{at}.span must be at least 2"));
                }
            }
            RuleKind::Slope {
                max_abs_slope,
                span,
            } => {
                if *max_abs_slope <= 0.0 {
                    errors.push(format!("{at}.max_abs_slope must be positive"));
                }
                if *span < 2 {
                    errors.push(format!("{at}.span must be at least 2"));
                }
            }
        }
        if self.level == Level::Sample {
            if !matches!(self.kind, RuleKind::Absolute { .. }) {
                errors.push(format!("{at}: sample-level rules must be absolute"));
            }
            if self.min_consecutive > 1 || self.min_samples > 1 {
                errors.push(format!("{at}: sample-level rules see one value"));
            }
        }
        if self
            .severity
            .tiers
            .windows(2)
            .any(|w| w[1].severity < w[0].severity)
        {
            errors.push(format!("{at}.severity.tiers must be non-decreasing"));
        }
        if self.severity.tiers.iter().any(|t| t.severity < self.severity.base) {
            errors.push(format!("{at}.severity.tiers must not fall below base"));
        }
        errors
    }
}

/// Validate a rule set, including id uniqueness.
pub fn validate_rules(rules: &[AlertRule]) -> Vec<String> {
    let mut errors: Vec<String> = rules.iter().flat_map(|r| r.validate()).collect();
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id.as_str()) {
            errors.push(format!("rules: duplicate rule id '{}'", rule.id));
        }
    }
    errors
}

/// A detected rule violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub entity: EntityKey,
    pub metric: Metric,
    pub measured: f64,
    pub threshold: f64,
    pub excess_ratio: f64,
    pub persistence: usize,
    pub severity: Severity,
    /// Sample that triggered the evaluation.
    pub sample_id: String,
    /// Event time of that sample.
    pub observed_at: DateTime<Utc>,
    /// Aggregate version the evaluation read, if any.
    pub aggregate_version: Option<u64>,
}

/// What a rule was evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Sample(&'a Sample),
    Aggregate(&'a AggregateState),
}

struct Finding {
    measured: f64,
    threshold: f64,
    excess_ratio: f64,
    persistence: usize,
}

/// Evaluates rules against samples and aggregate snapshots.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    rules: Arc<Vec<AlertRule>>,
}

impl DriftDetector {
    pub fn new(rules: Arc<Vec<AlertRule>>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Evaluate every rule against a processed sample and the snapshots its
    /// aggregate update produced.
    pub fn evaluate(&self, sample: &Sample, snapshots: &[Arc<AggregateState>]) -> Vec<Violation> {
        let mut violations = Vec::new();
        for rule in self.rules.iter() {
            let subject = if rule.level == Level::Sample {
                Some(Subject::Sample(sample))
            } else {
                snapshots
                    .iter()
                    .find(|s| s.level() == rule.level)
                    .map(|s| Subject::Aggregate(s))
            };
            if let Some(violation) =
                subject.and_then(|subject| evaluate_rule(rule, subject, sample))
            {
                debug!(
                    rule = %violation.rule_id,
                    entity = %violation.entity,
                    measured = violation.measured,
                    severity = %violation.severity,
                    "Rule violated"
                );
                violations.push(violation);
            }
        }
        violations
    }
}

/// Evaluate one rule against one subject. `trigger` is the sample whose
/// arrival prompted the evaluation.
pub fn evaluate_rule(rule: &AlertRule, subject: Subject<'_>, trigger: &Sample) -> Option<Violation> {
    let (entity, values, state) = match subject {
        Subject::Sample(sample) => (
            sample.entity_key(Level::Sample),
            vec![sample.metrics.value(rule.metric)?],
            None,
        ),
        Subject::Aggregate(state) => {
            if state.count < rule.min_samples {
                return None;
            }
            (
                state.key.clone(),
                state.window.values(rule.metric),
                Some(state),
            )
        }
    };

    let finding = match &rule.kind {
        RuleKind::Absolute {
            min,
            max,
            statistic: Statistic::Value,
        } => absolute(&values, *min, *max),
        RuleKind::Absolute {
            min,
            max,
            statistic,
        } => {
            let measured = aggregate_statistic(state?, *statistic, rule.metric)?;
            bound_excess(measured, *min, *max).map(|(threshold, excess_ratio)| Finding {
                measured,
                threshold,
                excess_ratio,
                persistence: 1,
            })
        }
        RuleKind::Deviation {
            std_devs,
            min_baseline,
        } => deviation(&values, *std_devs, *min_baseline, rule.min_consecutive),
        RuleKind::Trend {
            direction,
            min_change,
            span,
        } => trend(&values, *direction, *min_change, *span),
        RuleKind::Slope {
            max_abs_slope,
            span,
        } => slope(&values, *max_abs_slope, *span),
    }?;

    if finding.persistence < rule.min_consecutive {
        return None;
    }

    Some(Violation {
        rule_id: rule.id.clone(),
        entity,
        metric: rule.metric,
        measured: finding.measured,
        threshold: finding.threshold,
        excess_ratio: finding.excess_ratio,
        persistence: finding.persistence,
        severity: rule
            .severity
            .classify(finding.excess_ratio, finding.persistence),
        sample_id: trigger.id.clone(),
        observed_at: trigger.timestamp,
        aggregate_version: state.map(|s| s.version),
    })
}

fn aggregate_statistic(state: &AggregateState, statistic: Statistic, metric: Metric) -> Option<f64> {
    match statistic {
        Statistic::Value => state.window.values(metric).last().copied(),
        Statistic::Mean => state.mean(metric),
        Statistic::Stability => state.stability(metric),
        Statistic::Persistence => state.persistence(metric),
    }
}

/// Relative excess of `value` over a bound; `None` when within bounds.
fn bound_excess(value: f64, min: Option<f64>, max: Option<f64>) -> Option<(f64, f64)> {
    if let Some(max) = max {
        if value > max {
            return Some((max, relative(value - max, max)));
        }
    }
    if let Some(min) = min {
        if value < min {
            return Some((min, relative(min - value, min)));
        }
    }
    None
}

fn relative(excess: f64, threshold: f64) -> f64 {
    if threshold.abs() > f64::EPSILON {
        excess / threshold.abs()
    } else {
        excess
    }
}

/// Number of trailing positions (newest first) for which `holds` is true.
fn trailing_run(len: usize, holds: impl Fn(usize) -> bool) -> usize {
    (0..len).rev().take_while(|&end| holds(end)).count()
}

fn absolute(values: &[f64], min: Option<f64>, max: Option<f64>) -> Option<Finding> {
    let last = *values.last()?;
    let (threshold, excess_ratio) = bound_excess(last, min, max)?;
    let persistence = trailing_run(values.len(), |i| bound_excess(values[i], min, max).is_some());
    Some(Finding {
        measured: last,
        threshold,
        excess_ratio,
        persistence,
    })
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Deviation of `value` from a baseline, as a ratio beyond the allowed band.
/// `None` when within the band. A flat baseline treats any difference as
/// deviation.
fn deviation_excess(value: f64, mean: f64, std: f64, std_devs: f64) -> Option<(f64, f64)> {
    let distance = (value - mean).abs();
    let band = std_devs * std;
    if std <= f64::EPSILON {
        if distance > f64::EPSILON * mean.abs().max(1.0) {
            return Some((band, relative(distance, mean)));
        }
        return None;
    }
    (distance > band).then(|| (band, (distance - band) / band))
}

fn deviation(
    values: &[f64],
    std_devs: f64,
    min_baseline: usize,
    min_consecutive: usize,
) -> Option<Finding> {
    let n = values.len();
    let run = min_consecutive.max(1);
    if n < min_baseline + run {
        return None;
    }

    // Longest trailing run that deviates from the values preceding it.
    let mut best: Option<Finding> = None;
    for len in run..=(n - min_baseline) {
        let (baseline, tail) = values.split_at(n - len);
        let (mean, std) = mean_std(baseline);
        let excesses: Option<Vec<(f64, f64)>> = tail
            .iter()
            .map(|v| deviation_excess(*v, mean, std, std_devs))
            .collect();
        let Some(excesses) = excesses else {
            break;
        };
        let excess_ratio = excesses
            .iter()
            .map(|(_, ratio)| *ratio)
            .fold(f64::INFINITY, f64::min);
        let threshold = excesses.last().map(|(band, _)| *band).unwrap_or(0.0);
        best = Some(Finding {
            measured: values[n - 1],
            threshold,
            excess_ratio,
            persistence: len,
        });
    }
    best
}

fn trend(values: &[f64], direction: Direction, min_change: f64, span: usize) -> Option<Finding> {
    let change_ending_at = |end: usize| -> Option<f64> {
        if end + 1 < span {
            return None;
        }
        let delta = values[end] - values[end + 1 - span];
        let signed = match direction {
            Direction::Falling => -delta,
            Direction::Rising => delta,
        };
        (signed > min_change).then_some(signed)
    };
    let last = values.len().checked_sub(1)?;
    let change = change_ending_at(last)?;
    Some(Finding {
        measured: values[last],
        threshold: min_change,
        excess_ratio: (change - min_change) / min_change,
        persistence: trailing_run(values.len(), |end| change_ending_at(end).is_some()),
    })
}

/// Least-squares slope of `values` against their index.
pub fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });
    num / den
}

fn slope(values: &[f64], max_abs_slope: f64, span: usize) -> Option<Finding> {
    let slope_ending_at = |end: usize| -> Option<f64> {
        if end + 1 < span {
            return None;
        }
        let s = least_squares_slope(&values[end + 1 - span..=end]);
        (s.abs() > max_abs_slope).then_some(s)
    };
    let last = values.len().checked_sub(1)?;
    let s = slope_ending_at(last)?;
    Some(Finding {
        measured: s,
        threshold: max_abs_slope,
        excess_ratio: (s.abs() - max_abs_slope) / max_abs_slope,
        persistence: trailing_run(values.len(), |end| slope_ending_at(end).is_some()),
    })
}
