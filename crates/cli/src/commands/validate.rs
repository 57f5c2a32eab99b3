//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{Capability, RideBlueprint};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    device_count: usize,
    duration_minutes: f64,
    connect_timeout_secs: f64,
    bind_address: String,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    device_count: blueprint.devices.len(),
                    duration_minutes: blueprint.ride.duration_minutes,
                    connect_timeout_secs: blueprint.ride.connect_timeout_secs,
                    bind_address: blueprint.server.bind_address(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Non-fatal issues
fn collect_warnings(blueprint: &RideBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    for capability in Capability::ALL {
        let count = blueprint
            .devices
            .iter()
            .filter(|d| d.capability == capability)
            .count();
        if count > 1 {
            warnings.push(format!(
                "{count} devices report {capability}; their readings will interleave"
            ));
        }
    }

    if blueprint.recorder.is_none() {
        warnings.push("No recorder configured - the ride will not be saved".to_string());
    }

    if blueprint.ride.connect_timeout_secs > blueprint.ride.duration_limit_secs() {
        warnings.push("connect_timeout_secs is longer than the ride itself".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Devices: {}", summary.device_count);
            println!("  Duration: {} min", summary.duration_minutes);
            println!("  Connect timeout: {}s", summary.connect_timeout_secs);
            println!("  Viewers: ws://{}", summary.bind_address);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
