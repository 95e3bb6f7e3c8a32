//! C8: periodic timer that tears down deployments past their expiration.
//! Grounded on `shuttle-gateway/src/worker.rs`'s long-lived background
//! task pattern: spawned once at process init, runs until the shutdown
//! signal fires.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::runtime::RuntimeAdapter;
use crate::store::StateStore;
use crate::teardown;

/// Runs until `shutdown` is cancelled. One bad row must not halt the
/// reaper: errors tearing down an individual deployment are logged and
/// the loop continues with the next one.
pub async fn run(
    store: Arc<dyn StateStore>,
    runtime: RuntimeAdapter,
    config: Config,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.reaper_interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("reaper shutting down");
                return;
            }
            _ = ticker.tick() => {
                tick(&store, &runtime, &config).await;
            }
        }
    }
}

async fn tick(store: &Arc<dyn StateStore>, runtime: &RuntimeAdapter, config: &Config) {
    let expired = match store.list_expired_live().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "failed to query expired deployments");
            return;
        }
    };

    for deployment in expired {
        let slug = deployment.slug.clone();
        if let Err(err) = teardown::teardown(store, runtime, config, &deployment).await {
            error!(slug = %slug, error = %err, "reaper failed to tear down expired deployment");
        } else {
            info!(slug = %slug, "reaped expired deployment");
        }
    }
}
