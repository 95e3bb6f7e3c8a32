//! C6: the per-deployment driver. One invocation per create or redeploy,
//! running as an independent task rooted at process lifetime rather than
//! at the triggering HTTP request's scope — a request-scoped cancellation
//! would abort the pipeline the instant the handler returns.
//!
//! Per-slug concurrent redeploys are deliberately not serialized here
//! (see DESIGN.md "Open Question decisions"); the teacher's `TaskRouter`
//! in `worker.rs` is the documented alternative a future revision could
//! adopt if this needs tightening.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{error, info, instrument};

use crate::build;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::logging::PipelineLog;
use crate::model::{Deployment, DeploymentId, SourceSpec, Status};
use crate::publisher;
use crate::runtime::RuntimeAdapter;
use crate::stager;
use crate::store::StateStore;

/// Where the pipeline gets its source content from.
pub enum SourceInput {
    /// Path to the uploaded archive; removed by `cleanup` on every exit
    /// path, not just on successful extraction.
    Zip { archive_path: PathBuf },
    Git,
}

pub struct PipelineContext {
    pub store: Arc<dyn StateStore>,
    pub runtime: RuntimeAdapter,
    pub config: Config,
}

/// Drives one full create-or-redeploy run for `deployment`. Owns the
/// working directory and any uploaded archive; both are removed on every
/// exit path.
#[instrument(skip(ctx, deployment, source), fields(slug = %deployment.slug, id = %deployment.id))]
pub async fn run(ctx: Arc<PipelineContext>, deployment: Deployment, source: SourceInput) {
    let slug = deployment.slug.clone();
    let mut log = PipelineLog::open(&ctx.config.log_root, &slug.0).await;

    // Re-write status explicitly to handle the redeploy case, where a
    // prior run may have left `live` or `failed`.
    if let Err(err) = ctx.store.update_status(&deployment.id, Status::Deploying).await {
        log.error(&format!("failed to set status to deploying: {err}")).await;
    }

    let workdir = ctx.config.temp_root.join(format!("corvus-build-{}", deployment.id));
    let archive_path = match &source {
        SourceInput::Zip { archive_path } => Some(archive_path.clone()),
        SourceInput::Git => None,
    };

    let result = run_inner(&ctx, &deployment, &workdir, source, &mut log).await;

    if let Err(err) = &result {
        fail(&ctx, &deployment.id, &slug.0, err, &mut log).await;
    }

    cleanup(&workdir, archive_path.as_deref(), &mut log).await;
}

async fn run_inner(
    ctx: &PipelineContext,
    deployment: &Deployment,
    workdir: &PathBuf,
    source: SourceInput,
    log: &mut PipelineLog,
) -> Result<(), Error> {
    match &deployment.source {
        SourceSpec::Zip => {
            let SourceInput::Zip { archive_path } = source else {
                return Err(Error::custom(ErrorKind::InvalidRequest, "zip deployment missing upload"));
            };
            log.info("staging zip archive").await;
            stager::stage_zip(&archive_path, workdir)?;
        }
        SourceSpec::Git { repo_url, branch } => {
            stager::stage_git(repo_url, branch, workdir, log).await?;
        }
    }

    if build::should_run(&deployment.build_command) {
        log.info(&format!("running build command: {}", deployment.build_command)).await;
        let log_path = ctx.config.log_root.join(format!("{}.log", deployment.slug.0));
        let sink = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;

        build::run_build(
            &ctx.runtime,
            &deployment.slug,
            workdir,
            &deployment.build_command,
            &deployment.env_vars,
            &ctx.config.build_image,
            sink,
        )
        .await?;
        log.info("build succeeded").await;
    }

    log.info("publishing build output").await;
    let outcome = publisher::publish(
        &ctx.runtime,
        &deployment.slug,
        workdir,
        &deployment.output_subdir,
        &ctx.config.asset_root,
        &ctx.config.serve_image,
        &ctx.config.base_domain,
        &ctx.config.network_name,
    )
    .await?;

    mark_live(ctx, deployment, &outcome.container_id, log).await
}

/// Zip-on-disk redeploy: the original upload is gone but the asset
/// directory survives from the prior run. Skips staging/build/copy and
/// replaces the container directly against the existing assets.
#[instrument(skip(ctx, deployment), fields(slug = %deployment.slug, id = %deployment.id))]
pub async fn run_zip_on_disk_redeploy(ctx: Arc<PipelineContext>, deployment: Deployment) {
    let slug = deployment.slug.clone();
    let mut log = PipelineLog::open(&ctx.config.log_root, &slug.0).await;

    if let Err(err) = ctx.store.update_status(&deployment.id, Status::Deploying).await {
        log.error(&format!("failed to set status to deploying: {err}")).await;
    }

    let result = async {
        let outcome = publisher::republish_existing_assets(
            &ctx.runtime,
            &deployment.slug,
            &ctx.config.asset_root,
            &ctx.config.serve_image,
            &ctx.config.base_domain,
            &ctx.config.network_name,
        )
        .await?;

        mark_live(&ctx, &deployment, &outcome.container_id, &mut log).await
    }
    .await;

    if let Err(err) = &result {
        fail(&ctx, &deployment.id, &slug.0, err, &mut log).await;
    }
}

async fn mark_live(
    ctx: &PipelineContext,
    deployment: &Deployment,
    container_id: &str,
    log: &mut PipelineLog,
) -> Result<(), Error> {
    match ctx.store.update_status(&deployment.id, Status::Live).await {
        Ok(()) => {
            log.info(&format!("live (container {container_id})")).await;
            Ok(())
        }
        Err(err) => {
            // The site is actually live; a stale status row is less
            // harmful than a false-negative teardown, so we do not tear
            // the container down here.
            log.error(&format!(
                "container {container_id} is running but the status update failed: {err}"
            ))
            .await;
            error!(slug = %deployment.slug, container_id, "inconsistency: live container, stale status row");
            Err(Error::kind(ErrorKind::InconsistencyWarning))
        }
    }
}

async fn fail(ctx: &PipelineContext, id: &DeploymentId, slug: &str, err: &Error, log: &mut PipelineLog) {
    if err.error_kind() == ErrorKind::InconsistencyWarning {
        // Already logged by mark_live; does not transition to failed.
        return;
    }

    log.error(&format!("deployment failed: {err}")).await;
    if err.error_kind() == ErrorKind::BuildFailed {
        if let Some(code) = err.exit_code() {
            log.error(&format!("build command exited with code {code}")).await;
        }
    }

    if let Err(update_err) = ctx.store.update_status(id, Status::Failed).await {
        error!(slug, error = %update_err, "failed to record failure status");
    }
}

/// Removes the working directory and, for zip deploys, the uploaded
/// archive. Runs on every exit path from `run`, success or failure, so a
/// rejected upload (e.g. a zip-slip archive) never leaks into `tempRoot`.
async fn cleanup(workdir: &PathBuf, archive_path: Option<&Path>, log: &mut PipelineLog) {
    if workdir.exists() {
        if let Err(err) = fs::remove_dir_all(workdir).await {
            log.error(&format!("failed to remove working directory: {err}")).await;
        }
    }

    if let Some(archive_path) = archive_path {
        if let Err(err) = fs::remove_file(archive_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                log.error(&format!("failed to remove uploaded archive: {err}")).await;
            }
        }
    }

    info!("pipeline run finished");
}
