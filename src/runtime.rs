//! C2: the sole component that speaks to the container runtime. Grounded
//! on `shuttle-gateway/src/project.rs`'s container-config construction and
//! the image-pull/label patterns in the pack's `wafflemaker` and
//! `self-hosted-paas` examples.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, Mount, MountTypeEnum, NetworkingConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, ErrorKind};
use crate::model::{EnvVars, Slug};

impl From<DockerError> for Error {
    fn from(err: DockerError) -> Self {
        Error::source(ErrorKind::RuntimeError, err)
    }
}

const STOP_GRACE_SECONDS: i64 = 10;
const PING_DEADLINE: Duration = Duration::from_secs(5);

pub struct ServerSpec {
    pub slug: Slug,
    pub host_asset_dir: std::path::PathBuf,
    pub image: String,
    pub base_domain: String,
    pub network_name: String,
}

pub struct BuildSpec {
    pub slug: Slug,
    pub host_workdir: std::path::PathBuf,
    pub image: String,
    pub command: String,
    pub env: EnvVars,
    pub uid: u32,
    pub gid: u32,
}

/// Wraps a local `bollard::Docker` handle. Safe for concurrent use: every
/// method takes `&self` and bollard's client is itself `Clone`/`Sync`.
#[derive(Clone)]
pub struct RuntimeAdapter {
    docker: Docker,
}

impl RuntimeAdapter {
    pub fn connect() -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::source(ErrorKind::RuntimeUnreachable, e))?;
        Ok(Self { docker })
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<(), Error> {
        tokio::time::timeout(PING_DEADLINE, self.docker.ping())
            .await
            .map_err(|_| Error::custom(ErrorKind::RuntimeUnreachable, "docker ping timed out"))?
            .map_err(|e| Error::source(ErrorKind::RuntimeUnreachable, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn pull_image_if_missing(&self, image: &str) -> Result<(), Error> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_ref(image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        // Drain to completion: the pull protocol does not guarantee the
        // image is committed to the local store until the stream ends.
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| Error::source(ErrorKind::ImagePullError, e))?;
            if let Some(status) = progress.status {
                debug!(image, status, "pull progress");
            }
        }

        Ok(())
    }

    #[instrument(skip(self, spec), fields(slug = %spec.slug))]
    pub async fn create_and_start_server(&self, spec: ServerSpec) -> Result<String, Error> {
        self.pull_image_if_missing(&spec.image).await?;

        let name = spec.slug.container_name();
        let mut labels = HashMap::new();
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            format!("traefik.http.routers.{}.rule", spec.slug.0),
            format!("Host(`{}.{}`)", spec.slug.0, spec.base_domain),
        );
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", spec.slug.0),
            "80".to_string(),
        );

        let mut networking_config = HashMap::new();
        networking_config.insert(
            spec.network_name.clone(),
            EndpointSettings {
                ..Default::default()
            },
        );

        let host_dir = spec
            .host_asset_dir
            .to_str()
            .ok_or_else(|| Error::custom(ErrorKind::ContainerCreateError, "non-UTF8 asset path"))?
            .to_string();

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                mounts: Some(vec![Mount {
                    target: Some("/usr/share/nginx/html".to_string()),
                    source: Some(host_dir),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            // Attached at create time, not after start, so the proxy never
            // observes the container before it is network-reachable.
            networking_config: Some(NetworkingConfig {
                endpoints_config: networking_config,
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), ..Default::default() }), config)
            .await
            .map_err(|e| Error::source(ErrorKind::ContainerCreateError, e))?;

        if let Err(err) = self.docker.start_container::<String>(&response.id, None).await {
            // Created but never started: remove it rather than leaving a
            // dangling `deploy-<slug>` container behind for the next
            // publish attempt to trip over.
            if let Err(cleanup_err) = self
                .docker
                .remove_container(&response.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await
            {
                warn!(container_id = %response.id, error = %cleanup_err, "failed to remove container that failed to start");
            }
            return Err(Error::source(ErrorKind::ContainerStartError, err));
        }

        info!(slug = %spec.slug, container_id = %response.id, "serving container started");
        Ok(response.id)
    }

    /// Runs the build command in an ephemeral container, demultiplexing
    /// stdout+stderr in chronological order into `sink`, and returns the
    /// exit code. The container is always removed, even on error.
    #[instrument(skip(self, spec, sink), fields(slug = %spec.slug))]
    pub async fn run_build_container<W>(
        &self,
        spec: BuildSpec,
        mut sink: W,
    ) -> Result<i64, Error>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.pull_image_if_missing(&spec.image).await?;

        let name = spec.slug.build_container_name();
        let host_dir = spec
            .host_workdir
            .to_str()
            .ok_or_else(|| Error::custom(ErrorKind::ContainerCreateError, "non-UTF8 workdir path"))?
            .to_string();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), spec.command.clone()]),
            working_dir: Some("/workspace".to_string()),
            env: Some(spec.env.as_key_equals_value()),
            user: Some(format!("{}:{}", spec.uid, spec.gid)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                mounts: Some(vec![Mount {
                    target: Some("/workspace".to_string()),
                    source: Some(host_dir),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                }]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_result = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), ..Default::default() }), config)
            .await
            .map_err(|e| Error::source(ErrorKind::ContainerCreateError, e));

        let container_id = match create_result {
            Ok(response) => response.id,
            Err(err) => return Err(err),
        };

        // From here on, the container is always removed regardless of the
        // outcome of the steps below.
        let run_result = self.drive_build_container(&container_id, &mut sink).await;

        if let Err(err) = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id = %container_id, error = %err, "failed to remove build container");
        }

        run_result
    }

    async fn drive_build_container<W>(&self, container_id: &str, sink: &mut W) -> Result<i64, Error>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| Error::source(ErrorKind::ContainerStartError, e))?;

        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut wait_stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        // Drain logs concurrently with the wait so a chatty build never
        // backpressures the daemon's internal buffer.
        let drain = async {
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(output) => {
                        let bytes = output.into_bytes();
                        if sink.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = sink.flush().await;
        };

        let wait = async {
            wait_stream
                .next()
                .await
                .transpose()
                .map_err(|e| Error::source(ErrorKind::RuntimeError, e))
        };

        let (_, wait_result) = tokio::join!(drain, wait);

        let exit_code = wait_result?.map(|r| r.status_code).unwrap_or(0);
        Ok(exit_code)
    }

    /// Looks up a container by exact name (the runtime's name filter
    /// matches substrings, so an exact-match pass is required afterward to
    /// avoid touching a neighbor slug's container).
    #[instrument(skip(self))]
    pub async fn stop_and_remove(&self, name: &str) -> Result<(), Error> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::source(ErrorKind::RuntimeError, e))?;

        let exact = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
                .unwrap_or(false)
        });

        let Some(container) = exact else {
            // Desired state already satisfied.
            return Ok(());
        };
        let id = container.id.unwrap_or_default();

        if let Err(err) = self
            .docker
            .stop_container(&id, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
            .await
        {
            if !matches!(err, DockerError::DockerResponseServerError { status_code, .. } if status_code == 304 || status_code == 404)
            {
                return Err(Error::source(ErrorKind::RuntimeError, err));
            }
        }

        if let Err(err) = self
            .docker
            .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
        {
            if !matches!(err, DockerError::DockerResponseServerError { status_code, .. } if status_code == 404) {
                return Err(Error::source(ErrorKind::RuntimeError, err));
            }
        }

        Ok(())
    }

    /// True if a container named exactly `name` exists and is running.
    pub async fn is_running(&self, name: &str) -> Result<bool, Error> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::source(ErrorKind::RuntimeError, e))?;

        Ok(containers.into_iter().any(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
                .unwrap_or(false)
        }))
    }

    pub fn uid_gid_of_current_process() -> (u32, u32) {
        (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
    }
}

fn split_image_ref(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_image_ref_with_tag() {
        assert_eq!(split_image_ref("nginx:1.25-alpine"), ("nginx".to_string(), "1.25-alpine".to_string()));
    }

    #[test]
    fn splits_image_ref_without_tag() {
        assert_eq!(split_image_ref("nginx"), ("nginx".to_string(), "latest".to_string()));
    }

    #[test]
    fn splits_image_ref_with_registry_port_but_no_tag() {
        assert_eq!(
            split_image_ref("registry.local:5000/nginx"),
            ("registry.local:5000/nginx".to_string(), "latest".to_string())
        );
    }
}
