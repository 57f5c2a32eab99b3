//! `watch` command implementation.

use anyhow::Result;
use contracts::MetricKey;
use reconciler::{ChartUpdate, ClientExit, Reconciler, ReconcilerConfig, ViewerClient};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::WatchArgs;
use crate::error::CliError;

/// Execute the `watch` command
pub async fn run_watch(args: &WatchArgs) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop_tx.send_replace(true);
        }
    });

    let client = ViewerClient::new(args.url.clone());
    let mut reconciler = Reconciler::new(ReconcilerConfig::default());
    let mut failures = 0u32;

    loop {
        info!(url = %client.url(), "Connecting to relay");
        let replays_before = reconciler.stats().replays;
        match client.run(&mut reconciler, stop_rx.clone(), print_updates).await {
            Ok(ClientExit::Closed) => {
                info!("Relay closed the stream; ride over");
                break;
            }
            Ok(ClientExit::Shutdown) => break,
            Err(e) => {
                // A session that got as far as a replay counts as a success
                if reconciler.stats().replays > replays_before {
                    failures = 0;
                }
                failures += 1;
                warn!(error = %e, failures, "Viewer disconnected");
                if args.max_retries > 0 && failures >= args.max_retries {
                    return Err(CliError::RetriesExhausted {
                        url: args.url.clone(),
                        attempts: failures,
                    }
                    .into());
                }
            }
        }

        let mut stop = stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.retry_secs)) => {}
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }

    let stats = reconciler.stats();
    info!(
        applied = stats.applied,
        merged = stats.merged,
        out_of_window = stats.out_of_window,
        replays = stats.replays,
        "Viewer finished"
    );
    Ok(())
}

fn print_updates(reconciler: &Reconciler, updates: &[ChartUpdate]) {
    for update in updates {
        match update {
            ChartUpdate::Redraw => {
                let counts: Vec<String> = MetricKey::ALL
                    .iter()
                    .filter_map(|key| {
                        reconciler
                            .series(*key)
                            .map(|series| format!("{} {} points", key, series.len()))
                    })
                    .collect();
                println!("replayed: {}", counts.join(", "));
            }
            ChartUpdate::Point {
                key,
                elapsed,
                value,
                ..
            } => {
                println!(
                    "{:>7.1}s  {} {:.*} {}",
                    elapsed,
                    key,
                    key.precision() as usize,
                    value,
                    key.unit()
                );
            }
        }
    }
}
