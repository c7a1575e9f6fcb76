//! Configuration system for Lactoflow.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment -> overrides.
//! Configuration is loaded from `~/.config/lactoflow/config.toml` and/or
//! `.lactoflow/config.toml` in the workspace directory. It is read once at
//! startup and shared read-only; changing policy means building a new engine.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::aggregator::AggregationConfig;
use crate::alerts::AlertConfig;
use crate::dispatch::DispatchConfig;
use crate::drift::{
    AlertRule, RuleKind, SeverityMapping, SeverityTier, Statistic, validate_rules,
};
use crate::error::ConfigError;
use crate::explain::ExplainConfig;
use crate::inference::InferenceConfig;
use crate::normalizer::NormalizerConfig;
use crate::quality::QualityConfig;
use crate::remote::RemoteConfig;
use crate::sinks::SinkConfig;
use crate::types::{Level, Metric, Severity};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub normalizer: NormalizerConfig,
    pub inference: InferenceConfig,
    pub quality: QualityConfig,
    pub explain: ExplainConfig,
    pub aggregation: AggregationConfig,
    /// Alert rules. Empty means the built-in rule set.
    pub rules: Vec<AlertRule>,
    pub alerts: AlertConfig,
    pub dispatch: DispatchConfig,
    pub sinks: SinkConfig,
    pub pipeline: PipelineConfig,
    pub remote: RemoteConfig,
}

/// Worker pool and lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker tasks; samples are partitioned across them by supplier.
    pub workers: usize,
    /// Pending samples per worker before ingestion is refused.
    pub queue_capacity: usize,
    /// Default drain budget for graceful shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1_024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.workers == 0 {
            errors.push("pipeline.workers must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("pipeline.queue_capacity must be at least 1".to_string());
        }
        errors
    }
}

impl EngineConfig {
    /// Configured rules, or the built-in set when none are configured.
    pub fn effective_rules(&self) -> Vec<AlertRule> {
        if self.rules.is_empty() {
            default_rules()
        } else {
            self.rules.clone()
        }
    }

    /// Every problem found across all sections.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.normalizer.validate());
        errors.extend(self.inference.validate());
        errors.extend(self.quality.validate());
        errors.extend(self.explain.validate());
        errors.extend(self.aggregation.validate());
        errors.extend(validate_rules(&self.effective_rules()));
        errors.extend(self.alerts.validate());
        errors.extend(self.dispatch.validate());
        errors.extend(self.sinks.validate());
        errors.extend(self.pipeline.validate());
        errors.extend(self.remote.validate());
        errors
    }

    /// `Err` with every problem joined when the configuration is invalid.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: errors.join("; "),
            })
        }
    }
}

/// Load configuration from defaults, config files, environment and overrides.
///
/// Environment variables use the `LACTOFLOW_` prefix with `__` for nesting,
/// e.g. `LACTOFLOW_PIPELINE__WORKERS=8`. `overrides` is a partial tree merged
/// last.
pub fn load_config(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&toml::Table>,
) -> Result<EngineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    // User-level config
    if let Some(dirs) = directories::ProjectDirs::from("dev", "lactoflow", "lactoflow") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".lactoflow").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("LACTOFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(dirs) = directories::ProjectDirs::from("dev", "lactoflow", "lactoflow") {
        if dirs.config_dir().join("config.toml").exists() {
            return true;
        }
    }
    workspace.is_some_and(|ws| ws.join(".lactoflow").join("config.toml").exists())
}

fn rule(
    id: &str,
    description: &str,
    level: Level,
    metric: Metric,
    kind: RuleKind,
    severity: SeverityMapping,
) -> AlertRule {
    AlertRule {
        id: id.to_string(),
        description: description.to_string(),
        level,
        metric,
        kind,
        min_consecutive: 1,
        min_samples: 0,
        severity,
        cooldown_secs: None,
    }
}

fn below(min: f64, statistic: Statistic) -> RuleKind {
    RuleKind::Absolute {
        min: Some(min),
        max: None,
        statistic,
    }
}

fn above(max: f64, statistic: Statistic) -> RuleKind {
    RuleKind::Absolute {
        min: None,
        max: Some(max),
        statistic,
    }
}

/// Built-in rule set used when no rules are configured.
pub fn default_rules() -> Vec<AlertRule> {
    use Statistic::{Mean, Persistence, Stability, Value};
    let fixed = SeverityMapping::fixed;
    vec![
        rule(
            "critical_adulteration",
            "Sample flagged as adulterated (risk above quality.adulteration_threshold)",
            Level::Sample,
            Metric::AdulterationFlag,
            above(0.0, Value),
            fixed(Severity::High),
        ),
        rule(
            "low_fat",
            "FAT below 2.5",
            Level::Sample,
            Metric::Fat,
            below(2.5, Value),
            fixed(Severity::Medium),
        ),
        rule(
            "low_snf",
            "SNF below 8.0",
            Level::Sample,
            Metric::Snf,
            below(8.0, Value),
            fixed(Severity::Medium),
        ),
        rule(
            "low_ts",
            "TS below 11.5",
            Level::Sample,
            Metric::Ts,
            below(11.5, Value),
            fixed(Severity::Medium),
        ),
        rule(
            "unknown_milk_type",
            "Milk type not recognised",
            Level::Sample,
            Metric::UnknownMilkType,
            above(0.0, Value),
            fixed(Severity::Low),
        ),
        rule(
            "route_quality_low",
            "Route mean quality score below 6.0",
            Level::Route,
            Metric::QualityScore,
            below(6.0, Mean),
            fixed(Severity::Medium),
        ),
        rule(
            "batch_adulteration_rate_high",
            "More than 30% of batch samples flagged as adulterated",
            Level::Batch,
            Metric::AdulterationFlag,
            above(30.0, Mean),
            fixed(Severity::High),
        ),
        AlertRule {
            min_samples: 5,
            ..rule(
                "supplier_stability_drop",
                "Supplier FAT erratic: window stability score below 0.5",
                Level::Supplier,
                Metric::Fat,
                below(0.5, Stability),
                fixed(Severity::Low),
            )
        },
        AlertRule {
            min_samples: 5,
            ..rule(
                "supplier_persistence_low",
                "Supplier FAT falling: fewer than 40% of window steps hold or rise",
                Level::Supplier,
                Metric::Fat,
                below(0.4, Persistence),
                fixed(Severity::Low),
            )
        },
        AlertRule {
            min_consecutive: 3,
            ..rule(
                "supplier_fat_drift",
                "Supplier FAT more than 3 sigma from its rolling baseline",
                Level::Supplier,
                Metric::Fat,
                RuleKind::Deviation {
                    std_devs: 3.0,
                    min_baseline: 10,
                },
                SeverityMapping {
                    base: Severity::Medium,
                    tiers: vec![SeverityTier {
                        min_excess_ratio: 1.0,
                        min_persistence: 0,
                        severity: Severity::High,
                    }],
                },
            )
        },
    ]
}
