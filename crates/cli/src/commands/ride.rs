//! `ride` command implementation.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::RideArgs;
use crate::pipeline::{RideConfig, RideRunner};

use super::load_blueprint;

/// Execute the `ride` command
pub async fn run_ride(args: &RideArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    let mut blueprint = load_blueprint(&args.config)?;

    if let Some(minutes) = args.minutes {
        info!(minutes, "Overriding ride duration from CLI");
        blueprint.ride.duration_minutes = minutes;
        config_loader::ConfigLoader::validate(&blueprint).context("Invalid --minutes override")?;
    }

    info!(
        devices = blueprint.devices.len(),
        duration_min = blueprint.ride.duration_minutes,
        timeout_secs = blueprint.ride.connect_timeout_secs,
        simulate = args.simulate,
        "Configuration loaded"
    );

    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint);
        return Ok(());
    }

    let record_dir = args
        .record
        .clone()
        .or_else(|| blueprint.recorder.as_ref().map(|r| r.output_dir.clone().into()));

    let config = RideConfig {
        bind: args.bind.clone().unwrap_or_else(|| blueprint.server.bind_address()),
        blueprint,
        simulate: args.simulate,
        record_dir,
        ride_name: args.name.clone(),
        buffer_size: args.buffer_size,
        metrics_port: (args.metrics_port != 0).then_some(args.metrics_port),
    };

    let stats = RideRunner::new(config).run(shutdown_signal()).await?;
    stats.print_summary();

    info!("pedal-relay finished");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &contracts::RideBlueprint) {
    println!("\n=== Configuration Summary ===\n");
    println!("Ride:");
    println!("  Duration: {} min", blueprint.ride.duration_minutes);
    println!("  Connect timeout: {}s", blueprint.ride.connect_timeout_secs);
    println!("  Time base: {:?}", blueprint.ride.time_base);
    println!("\nDevices ({}):", blueprint.devices.len());
    for device in &blueprint.devices {
        match &device.name {
            Some(name) => println!("  - {} ({}) - {}", name, device.address, device.capability),
            None => println!("  - {} - {}", device.address, device.capability),
        }
    }
    println!(
        "\nReconnect: {} attempts, {}s apart",
        blueprint.reconnect.max_attempts, blueprint.reconnect.backoff_secs
    );
    println!("Viewers: ws://{}", blueprint.server.bind_address());
    if let Some(recorder) = &blueprint.recorder {
        println!("Recording to: {}", recorder.output_dir);
    }
    println!();
}
