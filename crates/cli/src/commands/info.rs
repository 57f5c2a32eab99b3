//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{RideBlueprint, SimulationConfig, TimeBase};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

use super::load_blueprint;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    ride: RideInfo,
    devices: Vec<DeviceInfo>,
    reconnect: ReconnectInfo,
    server: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    recorder_dir: Option<String>,
}

#[derive(Serialize)]
struct RideInfo {
    duration_minutes: f64,
    duration_limit_secs: f64,
    connect_timeout_secs: f64,
    time_base: TimeBase,
}

#[derive(Serialize)]
struct DeviceInfo {
    address: String,
    capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Metric keys this device is expected to report
    metrics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<SimulationConfig>,
}

#[derive(Serialize)]
struct ReconnectInfo {
    max_attempts: u32,
    backoff_secs: f64,
}

#[derive(Serialize)]
struct ServerInfo {
    url: String,
    replay_chunk_size: usize,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    let blueprint = load_blueprint(&args.config)?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

/// Keys a device of this capability reports; a trainer reports three.
fn reported_metrics(capability: contracts::Capability) -> Vec<String> {
    match capability {
        contracts::Capability::Power => ["power", "speed", "cadence"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        other => vec![other.metric_key().to_string()],
    }
}

fn build_config_info(blueprint: &RideBlueprint, args: &InfoArgs) -> ConfigInfo {
    let devices = blueprint
        .devices
        .iter()
        .map(|d| DeviceInfo {
            address: d.address.to_string(),
            capability: d.capability.to_string(),
            name: d.name.clone(),
            metrics: reported_metrics(d.capability),
            simulation: if args.simulation {
                d.simulation.clone()
            } else {
                None
            },
        })
        .collect();

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        ride: RideInfo {
            duration_minutes: blueprint.ride.duration_minutes,
            duration_limit_secs: blueprint.ride.duration_limit_secs(),
            connect_timeout_secs: blueprint.ride.connect_timeout_secs,
            time_base: blueprint.ride.time_base,
        },
        devices,
        reconnect: ReconnectInfo {
            max_attempts: blueprint.reconnect.max_attempts,
            backoff_secs: blueprint.reconnect.backoff_secs,
        },
        server: ServerInfo {
            url: format!("ws://{}", blueprint.server.bind_address()),
            replay_chunk_size: blueprint.server.replay_chunk_size,
        },
        recorder_dir: blueprint.recorder.as_ref().map(|r| r.output_dir.clone()),
    }
}

fn print_config_info(blueprint: &RideBlueprint, args: &InfoArgs) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                Pedal Relay Configuration                     ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("Ride");
    println!("   ├─ Version: {:?}", blueprint.version);
    println!("   ├─ Duration: {} min", blueprint.ride.duration_minutes);
    println!("   ├─ Connect timeout: {}s", blueprint.ride.connect_timeout_secs);
    println!("   └─ Time base: {:?}", blueprint.ride.time_base);

    println!("\nDevices ({})", blueprint.devices.len());
    for (i, device) in blueprint.devices.iter().enumerate() {
        let is_last = i == blueprint.devices.len() - 1;
        let prefix = if is_last { "└─" } else { "├─" };
        let child_prefix = if is_last { "   " } else { "│  " };

        let label = device.name.as_deref().unwrap_or(device.address.as_str());
        println!("   {} {} ({})", prefix, label, device.capability);
        println!("   {}  ├─ Address: {}", child_prefix, device.address);
        println!(
            "   {}  └─ Reports: {}",
            child_prefix,
            reported_metrics(device.capability).join(", ")
        );

        if args.simulation {
            if let Some(sim) = &device.simulation {
                println!(
                    "   {}     simulated: appear after {}s, drop after {:?} readings, refuse {} reconnects{}",
                    child_prefix,
                    sim.appear_after_secs,
                    sim.drop_after_readings,
                    sim.refuse_reconnects,
                    if sim.never_appears { ", never appears" } else { "" }
                );
            }
        }
    }

    println!("\nReconnect");
    println!("   ├─ Max attempts: {}", blueprint.reconnect.max_attempts);
    println!("   └─ Backoff: {}s", blueprint.reconnect.backoff_secs);

    println!("\nViewers");
    println!("   ├─ URL: ws://{}", blueprint.server.bind_address());
    println!("   └─ Replay chunk: {} samples", blueprint.server.replay_chunk_size);

    if let Some(recorder) = &blueprint.recorder {
        println!("\nRecorder");
        println!("   └─ Output: {}", recorder.output_dir);
    }

    println!();
}
