use anyhow::Result;
use std::time::Duration;

use roster_sync::config::Config;
use roster_sync::error::SyncErrorTrait;

use super::run::print_report;
use super::{build_runner, init_metrics, publish_metrics};

/// Run a sync every `interval` until Ctrl-C
///
/// Ctrl-C during a run lets that run finish before exiting. A failed run is
/// logged and the next tick tries again.
pub async fn watch(config: Config, interval: Duration) -> Result<()> {
    init_metrics(&config);
    let runner = build_runner(&config).await?;

    tracing::info!(interval_secs = interval.as_secs(), "Watching roster");

    let runs = runner
        .watch(interval, ctrl_c(), |outcome| {
            publish_metrics(&config);
            match outcome {
                Ok(report) => print_report(&report),
                Err(e) => tracing::error!(
                    category = e.category().as_str(),
                    error = %e,
                    "Sync run failed; retrying next interval"
                ),
            }
        })
        .await;

    println!("Stopped after {runs} runs.");
    Ok(())
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl-C, stopping after the current run"),
        Err(e) => {
            // Without a signal handler the loop can only be killed
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
