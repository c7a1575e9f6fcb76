//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use lactoflow_core::EngineConfig;
use lactoflow_core::drift::RuleKind;
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            input,
            mock,
            workers,
            report,
        } => {
            let mut overrides = toml::Table::new();
            if let Some(workers) = workers {
                let mut pipeline = toml::Table::new();
                pipeline.insert("workers".into(), toml::Value::Integer(workers as i64));
                overrides.insert("pipeline".into(), toml::Value::Table(pipeline));
            }
            let config = load(workspace, config_file, Some(&overrides))?;
            crate::run::run(
                config,
                crate::run::RunOptions {
                    input,
                    mock,
                    report,
                },
            )
            .await
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Rules => {
            let config = load(workspace, config_file, None)?;
            print_rules(&config);
            Ok(())
        }
    }
}

fn load(
    workspace: &Path,
    config_file: Option<&Path>,
    overrides: Option<&toml::Table>,
) -> anyhow::Result<EngineConfig> {
    lactoflow_core::load_config(Some(workspace), config_file, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".lactoflow");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = EngineConfig {
                rules: lactoflow_core::default_rules(),
                ..Default::default()
            };
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Check => {
            if !lactoflow_core::config_exists(Some(workspace)) && config_file.is_none() {
                println!("No configuration file found; checking built-in defaults.");
            }
            let config = load(workspace, config_file, None)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!(
                    "Configuration OK ({} rules, {} workers).",
                    config.effective_rules().len(),
                    config.pipeline.workers
                );
                Ok(())
            } else {
                for problem in &problems {
                    println!("  - {problem}");
                }
                anyhow::bail!("{} configuration problem(s)", problems.len())
            }
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file, None)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn print_rules(config: &EngineConfig) {
    let rules = config.effective_rules();
    if config.rules.is_empty() {
        println!("Built-in rule set ({} rules):", rules.len());
    } else {
        println!("Configured rules ({}):", rules.len());
    }
    for rule in &rules {
        let kind = match &rule.kind {
            RuleKind::Absolute { min, max, statistic } => {
                let bounds = match (min, max) {
                    (Some(lo), Some(hi)) => format!("outside [{lo}, {hi}]"),
                    (Some(lo), None) => format!("< {lo}"),
                    (None, Some(hi)) => format!("> {hi}"),
                    (None, None) => "unbounded".to_string(),
                };
                format!("{statistic:?} {bounds}")
            }
            RuleKind::Deviation { std_devs, .. } => format!("deviates > {std_devs} sigma"),
            RuleKind::Trend {
                direction,
                min_change,
                span,
            } => format!("{direction:?} by > {min_change} over {span}"),
            RuleKind::Slope {
                max_abs_slope,
                span,
            } => format!("|slope| > {max_abs_slope} over {span}"),
        };
        let kind = if rule.min_samples > 0 {
            format!("{kind} after {}", rule.min_samples)
        } else {
            kind
        };
        println!(
            "  {:<32} {:<8} {:<18} {:<28} x{} => {}",
            rule.id,
            rule.level.to_string(),
            rule.metric.to_string(),
            kind,
            rule.min_consecutive,
            rule.severity.base
        );
    }
}
