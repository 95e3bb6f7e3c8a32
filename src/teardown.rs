//! C7: the single idempotent teardown sequence, used by both explicit
//! delete and the expiration reaper. Grounded on
//! `other_examples/…self-hosted-paas…scheduler.rs`'s `Job::Delete`
//! handling and `shuttle-gateway/src/project.rs`'s `Project::destroy`.

use std::sync::Arc;

use tokio::fs;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::Error;
use crate::model::Deployment;
use crate::runtime::RuntimeAdapter;
use crate::store::StateStore;

/// Steps 1-2 and 4 are fatal on failure; step 3 (log removal) never is,
/// since a leftover log file does not affect functional correctness.
/// Because the row delete is last, any earlier failure leaves the row
/// intact so the caller (or the reaper, on its next tick) can retry.
#[instrument(skip(store, runtime, config, deployment), fields(slug = %deployment.slug))]
pub async fn teardown(
    store: &Arc<dyn StateStore>,
    runtime: &RuntimeAdapter,
    config: &Config,
    deployment: &Deployment,
) -> Result<(), Error> {
    runtime.stop_and_remove(&deployment.slug.container_name()).await?;

    let asset_dir = config.asset_root.join(&deployment.slug.0);
    if let Err(err) = fs::remove_dir_all(&asset_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(Error::source(crate::error::ErrorKind::Internal, err));
        }
    }

    let log_path = config.log_root.join(format!("{}.log", deployment.slug.0));
    if let Err(err) = fs::remove_file(&log_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(slug = %deployment.slug, error = %err, "failed to remove per-deployment log file (non-fatal)");
        }
    }

    store.delete(&deployment.id).await?;

    Ok(())
}
