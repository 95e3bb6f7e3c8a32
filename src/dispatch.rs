//! C9: the boundary between the core and the HTTP layer (out of scope
//! here; see spec §1). Every operation either returns immediately after
//! a row write plus a task launch, or propagates a synchronous store
//! error — dispatch never blocks on a pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::error::Error;
use crate::model::{Deployment, DeploymentId, SourceSpec, Status};
use crate::pipeline::{self, PipelineContext, SourceInput};
use crate::store::StateStore;

#[derive(Clone)]
pub struct DispatchSurface {
    ctx: Arc<PipelineContext>,
}

impl DispatchSurface {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        &self.ctx.store
    }

    #[instrument(skip(self, deployment), fields(slug = %deployment.slug))]
    pub async fn create_from_zip(
        &self,
        deployment: Deployment,
        archive_path: PathBuf,
    ) -> Result<Deployment, Error> {
        self.store().insert(&deployment).await?;

        let ctx = Arc::clone(&self.ctx);
        let spawned = deployment.clone();
        tokio::spawn(async move {
            pipeline::run(ctx, spawned, SourceInput::Zip { archive_path }).await;
        });

        Ok(deployment)
    }

    #[instrument(skip(self, deployment), fields(slug = %deployment.slug))]
    pub async fn create_from_git(&self, deployment: Deployment) -> Result<Deployment, Error> {
        self.store().insert(&deployment).await?;

        let ctx = Arc::clone(&self.ctx);
        let spawned = deployment.clone();
        tokio::spawn(async move {
            pipeline::run(ctx, spawned, SourceInput::Git).await;
        });

        Ok(deployment)
    }

    /// Dispatches to the git or zip-on-disk redeploy flavor based on the
    /// row's source kind. Returns the row as fetched before dispatch;
    /// subsequent status changes are observed through later `Get` calls,
    /// per spec §4.9.
    #[instrument(skip(self))]
    pub async fn redeploy(&self, id: &DeploymentId) -> Result<Deployment, Error> {
        let deployment = self.store().get(id).await?;

        match &deployment.source {
            SourceSpec::Git { .. } => {
                let ctx = Arc::clone(&self.ctx);
                let spawned = deployment.clone();
                tokio::spawn(async move {
                    pipeline::run(ctx, spawned, SourceInput::Git).await;
                });
            }
            SourceSpec::Zip => {
                let ctx = Arc::clone(&self.ctx);
                let spawned = deployment.clone();
                tokio::spawn(async move {
                    pipeline::run_zip_on_disk_redeploy(ctx, spawned).await;
                });
            }
        }

        Ok(deployment)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &DeploymentId) -> Result<(), Error> {
        let deployment = self.store().get(id).await?;
        crate::teardown::teardown(self.store(), &self.ctx.runtime, &self.ctx.config, &deployment).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &DeploymentId) -> Result<Deployment, Error> {
        self.store().get(id).await
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Deployment>, Error> {
        self.store().list().await
    }
}

/// Startup reconciliation pass (SPEC_FULL.md §B): for every `live` row,
/// verify the serving container actually exists and is running. If not,
/// mark the row `failed` so a crash-induced inconsistency doesn't linger
/// silently until the next redeploy or delete.
pub async fn reconcile_on_startup(ctx: &PipelineContext) {
    let rows = match ctx.store.list().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "reconciliation: failed to list deployments");
            return;
        }
    };

    for deployment in rows.into_iter().filter(|d| d.status == Status::Live) {
        match ctx.runtime.is_running(&deployment.slug.container_name()).await {
            Ok(true) => {}
            Ok(false) => {
                info!(slug = %deployment.slug, "reconciliation: live row has no running container, marking failed");
                if let Err(err) = ctx.store.update_status(&deployment.id, Status::Failed).await {
                    error!(slug = %deployment.slug, error = %err, "reconciliation: failed to update status");
                }
            }
            Err(err) => {
                error!(slug = %deployment.slug, error = %err, "reconciliation: failed to inspect container");
            }
        }
    }
}
