//! Process bootstrap: load configuration, connect to the container
//! runtime and state store, run the startup reconciliation pass, and keep
//! the expiration reaper alive until shutdown. The HTTP handler layer
//! that calls into [`DispatchSurface`] is an external collaborator (spec
//! §1) and is not wired up here.

use std::io;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use corvus::config::{Args, Config};
use corvus::dispatch::{self, DispatchSurface};
use corvus::pipeline::PipelineContext;
use corvus::runtime::RuntimeAdapter;
use corvus::store::{Sqlite, StateStore};

#[tokio::main]
async fn main() -> io::Result<()> {
    corvus::logging::init();

    let args = Args::parse();
    let config = Config::from(&args);

    for dir in [&config.asset_root, &config.log_root, &config.temp_root] {
        std::fs::create_dir_all(dir)?;
    }

    let runtime = RuntimeAdapter::connect()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    runtime
        .ping()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    info!("container runtime reachable");

    let store: Arc<dyn StateStore> = Arc::new(
        Sqlite::new(&args.state_db_path)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
    );

    let ctx = Arc::new(PipelineContext {
        store: Arc::clone(&store),
        runtime: runtime.clone(),
        config: config.clone(),
    });

    dispatch::reconcile_on_startup(&ctx).await;

    let dispatch = DispatchSurface::new(Arc::clone(&ctx));
    let existing = dispatch.list().await.unwrap_or_default();
    info!(count = existing.len(), "dispatch surface ready");

    let shutdown = CancellationToken::new();
    let reaper_handle = tokio::spawn(corvus::reaper::run(
        Arc::clone(&store),
        runtime.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();
    let _ = reaper_handle.await;

    Ok(())
}
