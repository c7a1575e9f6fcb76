//! Alert engine: deduplicated, severity-classified, stateful alerts.
//!
//! Lifecycle per (rule, entity): `NONE -> OPEN -> (ACKNOWLEDGED) -> RESOLVED`.
//! The active index maps each pair to its single live alert; creation goes
//! through the index entry, so two workers reporting the same pair serialize
//! on that entry and only one alert is ever opened. Lock order is always
//! active index first, then the alert table.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::Recommendation;
use crate::drift::{AlertRule, Violation};
use crate::error::AlertError;
use crate::types::{EntityKey, Level, Metric, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Open => write!(f, "OPEN"),
            AlertStatus::Acknowledged => write!(f, "ACKNOWLEDGED"),
            AlertStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// A stateful alert for one (rule, entity) lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub entity: EntityKey,
    pub metric: Metric,
    pub severity: Severity,
    pub status: AlertStatus,
    pub opened_at: DateTime<Utc>,
    pub last_triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Latest measured value that violated the rule.
    pub measured: f64,
    pub threshold: f64,
    /// Sample that last triggered this alert.
    pub sample_id: String,
    /// Aggregate version read when the alert last triggered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_version: Option<u64>,
    pub trigger_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
}

impl Alert {
    fn open(violation: &Violation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: violation.rule_id.clone(),
            entity: violation.entity.clone(),
            metric: violation.metric,
            severity: violation.severity,
            status: AlertStatus::Open,
            opened_at: violation.observed_at,
            last_triggered_at: violation.observed_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            measured: violation.measured,
            threshold: violation.threshold,
            sample_id: violation.sample_id.clone(),
            aggregate_version: violation.aggregate_version,
            trigger_count: 1,
            recommendation: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, AlertStatus::Open | AlertStatus::Acknowledged)
    }
}

/// Result of reporting a violation to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    /// A new alert was opened.
    Opened(Alert),
    /// The live alert's severity was raised.
    Escalated { alert: Alert, previous: Severity },
    /// The live alert absorbed the violation; no new alert was created.
    DuplicateAlertSuppressed { alert_id: String },
}

impl AlertOutcome {
    /// The alert to forward for a recommendation, if any.
    pub fn dispatchable(&self) -> Option<&Alert> {
        match self {
            AlertOutcome::Opened(alert) | AlertOutcome::Escalated { alert, .. } => Some(alert),
            AlertOutcome::DuplicateAlertSuppressed { .. } => None,
        }
    }
}

/// Query filter for alerts; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub min_severity: Option<Severity>,
    pub rule_id: Option<String>,
    pub level: Option<Level>,
    pub entity: Option<EntityKey>,
    /// Only alerts triggered at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl AlertFilter {
    pub fn open() -> Self {
        Self {
            status: Some(AlertStatus::Open),
            ..Default::default()
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.status.is_none_or(|s| alert.status == s)
            && self.min_severity.is_none_or(|s| alert.severity >= s)
            && self.rule_id.as_ref().is_none_or(|r| &alert.rule_id == r)
            && self.level.is_none_or(|l| alert.entity.level == l)
            && self.entity.as_ref().is_none_or(|e| &alert.entity == e)
            && self.since.is_none_or(|t| alert.last_triggered_at >= t)
    }
}

/// Configuration for the alert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Violation-free period after which a live alert resolves.
    pub cooldown_secs: u64,
    /// Interval of the periodic resolution sweep.
    pub sweep_interval_ms: u64,
    /// Resolved alerts kept for queries; oldest are dropped first.
    pub max_resolved_retained: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 900,
            sweep_interval_ms: 1_000,
            max_resolved_retained: 10_000,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.cooldown_secs == 0 {
            errors.push("alerts.cooldown_secs must be positive".to_string());
        }
        if self.sweep_interval_ms == 0 {
            errors.push("alerts.sweep_interval_ms must be positive".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    rule_id: String,
    entity: EntityKey,
}

/// Newest event time seen and the wall-clock instant it was observed.
#[derive(Debug, Clone, Copy)]
struct Watermark {
    event_time: Option<DateTime<Utc>>,
    observed_at: Instant,
}

/// Owns every alert and enforces one live alert per (rule, entity).
pub struct AlertEngine {
    config: AlertConfig,
    cooldowns: HashMap<String, Duration>,
    active: DashMap<AlertKey, String>,
    alerts: DashMap<String, Alert>,
    watermark: Mutex<Watermark>,
}

impl AlertEngine {
    pub fn new(config: AlertConfig, rules: &[AlertRule]) -> Self {
        let cooldowns = rules
            .iter()
            .filter_map(|r| {
                r.cooldown_secs
                    .map(|secs| (r.id.clone(), Duration::seconds(secs as i64)))
            })
            .collect();
        Self {
            config,
            cooldowns,
            active: DashMap::new(),
            alerts: DashMap::new(),
            watermark: Mutex::new(Watermark {
                event_time: None,
                observed_at: Instant::now(),
            }),
        }
    }

    fn cooldown(&self, rule_id: &str) -> Duration {
        self.cooldowns
            .get(rule_id)
            .copied()
            .unwrap_or_else(|| Duration::seconds(self.config.cooldown_secs as i64))
    }

    /// Report a violation: open, escalate, or suppress.
    pub fn record(&self, violation: &Violation) -> AlertOutcome {
        let key = AlertKey {
            rule_id: violation.rule_id.clone(),
            entity: violation.entity.clone(),
        };
        match self.active.entry(key) {
            Entry::Occupied(entry) => {
                let alert_id = entry.get().clone();
                let Some(mut alert) = self.alerts.get_mut(&alert_id) else {
                    // Index points at a pruned alert; start a fresh lifecycle.
                    let alert = Alert::open(violation);
                    self.alerts.insert(alert.id.clone(), alert.clone());
                    *entry.into_ref() = alert.id.clone();
                    return AlertOutcome::Opened(alert);
                };
                alert.last_triggered_at = alert.last_triggered_at.max(violation.observed_at);
                alert.trigger_count += 1;
                alert.measured = violation.measured;
                alert.threshold = violation.threshold;
                alert.sample_id = violation.sample_id.clone();
                alert.aggregate_version = violation.aggregate_version;
                if violation.severity > alert.severity {
                    let previous = alert.severity;
                    alert.severity = violation.severity;
                    info!(
                        alert_id = %alert.id,
                        rule = %alert.rule_id,
                        entity = %alert.entity,
                        from = %previous,
                        to = %alert.severity,
                        "Alert escalated"
                    );
                    AlertOutcome::Escalated {
                        alert: alert.clone(),
                        previous,
                    }
                } else {
                    debug!(alert_id = %alert.id, rule = %alert.rule_id, "Duplicate alert suppressed");
                    AlertOutcome::DuplicateAlertSuppressed { alert_id }
                }
            }
            Entry::Vacant(entry) => {
                let alert = Alert::open(violation);
                self.alerts.insert(alert.id.clone(), alert.clone());
                entry.insert(alert.id.clone());
                info!(
                    alert_id = %alert.id,
                    rule = %alert.rule_id,
                    entity = %alert.entity,
                    severity = %alert.severity,
                    "Alert opened"
                );
                AlertOutcome::Opened(alert)
            }
        }
    }

    /// Advance the event-time watermark.
    pub fn observe(&self, event_time: DateTime<Utc>) {
        let mut mark = self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        if mark.event_time.is_none_or(|t| event_time > t) {
            mark.event_time = Some(event_time);
            mark.observed_at = Instant::now();
        }
    }

    /// Current event time: the watermark plus wall time elapsed since it last
    /// advanced. `None` before any sample is observed.
    pub fn event_now(&self) -> Option<DateTime<Utc>> {
        let mark = *self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = Duration::from_std(mark.observed_at.elapsed()).unwrap_or_else(|_| Duration::zero());
        mark.event_time.map(|t| t + elapsed)
    }

    /// Resolve live alerts whose cooldown has elapsed at event time `now`.
    pub fn resolve_expired(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut resolved = Vec::new();
        self.active.retain(|key, alert_id| {
            let Some(mut alert) = self.alerts.get_mut(alert_id) else {
                return false;
            };
            if now - alert.last_triggered_at < self.cooldown(&key.rule_id) {
                return true;
            }
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
            info!(
                alert_id = %alert.id,
                rule = %alert.rule_id,
                entity = %alert.entity,
                "Alert resolved"
            );
            resolved.push(alert.clone());
            false
        });
        if !resolved.is_empty() {
            self.prune_resolved();
        }
        resolved
    }

    /// Resolution sweep at the current event time.
    pub fn sweep(&self) -> Vec<Alert> {
        match self.event_now() {
            Some(now) => self.resolve_expired(now),
            None => Vec::new(),
        }
    }

    fn prune_resolved(&self) {
        let mut resolved: Vec<(DateTime<Utc>, String)> = self
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Resolved)
            .map(|a| (a.resolved_at.unwrap_or(a.last_triggered_at), a.id.clone()))
            .collect();
        let excess = resolved.len().saturating_sub(self.config.max_resolved_retained);
        if excess == 0 {
            return;
        }
        resolved.sort();
        for (_, id) in resolved.into_iter().take(excess) {
            self.alerts
                .remove_if(&id, |_, a| a.status == AlertStatus::Resolved);
        }
    }

    /// Operator acknowledgement: OPEN -> ACKNOWLEDGED.
    pub fn acknowledge(&self, alert_id: &str, operator: &str) -> Result<Alert, AlertError> {
        let mut alert = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| AlertError::NotFound {
                id: alert_id.to_string(),
            })?;
        if alert.status != AlertStatus::Open {
            return Err(AlertError::InvalidTransition {
                from: alert.status.to_string(),
                to: AlertStatus::Acknowledged.to_string(),
            });
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(Utc::now());
        alert.acknowledged_by = Some(operator.to_string());
        info!(alert_id = %alert.id, operator, "Alert acknowledged");
        Ok(alert.clone())
    }

    /// Attach a recommendation. Returns false if the alert no longer exists.
    pub fn attach_recommendation(&self, alert_id: &str, recommendation: Recommendation) -> bool {
        match self.alerts.get_mut(alert_id) {
            Some(mut alert) => {
                alert.recommendation = Some(recommendation);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        self.alerts.get(alert_id).map(|a| a.clone())
    }

    /// Alerts matching `filter`, oldest first.
    pub fn get_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .map(|a| a.clone())
            .collect();
        alerts.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Number of live (OPEN or ACKNOWLEDGED) alerts.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }
}
