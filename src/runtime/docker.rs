//! Docker Engine implementation of [`ContainerRuntime`] over `bollard`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::{ContainerInfo, ContainerRef, ContainerRequest, ContainerRuntime};
use crate::error::RuntimeError;

/// Local Docker daemon reached through its default socket.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub async fn connect_local() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Unreachable {
            reason: e.to_string(),
        })?;
        docker.ping().await.map_err(|e| RuntimeError::Unreachable {
            reason: format!("ping failed: {e}"),
        })?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Anything that is not an HTTP response from the daemon means it could
/// not be reached at all.
fn map_error(operation: &'static str, target: &str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError { status_code, message } => {
            RuntimeError::Operation {
                operation,
                target: target.to_string(),
                reason: format!("HTTP {status_code}: {message}"),
            }
        }
        other => RuntimeError::Unreachable {
            reason: format!("{operation} {target}: {other}"),
        },
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
/// Digest references are pulled whole, with no tag.
fn split_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        // A colon inside a registry host:port is not a tag separator.
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (image, Some("latest")),
    }
}

fn container_body(request: &ContainerRequest) -> ContainerCreateBody {
    let some_vec = |v: &Vec<String>| if v.is_empty() { None } else { Some(v.clone()) };

    ContainerCreateBody {
        image: Some(request.image.clone()),
        cmd: some_vec(&request.command),
        env: some_vec(&request.env),
        user: request.user.clone(),
        working_dir: request.working_dir.clone(),
        labels: Some(
            request
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        ),
        network_disabled: Some(request.network_disabled),
        host_config: Some(HostConfig {
            binds: some_vec(&request.binds),
            network_mode: request.network_disabled.then(|| "none".to_string()),
            readonly_rootfs: Some(request.read_only_rootfs),
            tmpfs: if request.tmpfs.is_empty() {
                None
            } else {
                Some(
                    request
                        .tmpfs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            },
            cap_drop: some_vec(&request.cap_drop),
            security_opt: some_vec(&request.security_opt),
            nano_cpus: request.nano_cpus,
            memory: request.memory_bytes,
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, request: &ContainerRequest) -> Result<String, RuntimeError> {
        let created = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&request.name)
                        .build(),
                ),
                container_body(request),
            )
            .await
            .map_err(|e| {
                // Create only 404s on a missing image.
                if is_not_found(&e) {
                    RuntimeError::ImageNotFound {
                        image: request.image.clone(),
                    }
                } else {
                    map_error("create_container", &request.name, e)
                }
            })?;

        if let Err(e) = self
            .docker
            .start_container(&request.name, None::<StartContainerOptions>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &request.name,
                    Some(RemoveContainerOptionsBuilder::new().force(true).build()),
                )
                .await;
            return Err(map_error("start_container", &request.name, e));
        }

        debug!(container = %request.name, id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerNotFound {
                        container: name.to_string(),
                    }
                } else {
                    map_error("inspect_container", name, e)
                }
            })?;
        let running = response
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        Ok(ContainerInfo { running })
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(grace_secs).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::ContainerNotFound {
                container: name.to_string(),
            }),
            Err(e) => Err(map_error("stop_container", name, e)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(force)
                        .v(true)
                        .build(),
                ),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerNotFound {
                        container: name.to_string(),
                    }
                } else {
                    map_error("remove_container", name, e)
                }
            })
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRef>, RuntimeError> {
        let filters = HashMap::from([("label".to_string(), vec![label_filter.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| map_error("list_containers", label_filter, e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let running = summary
                    .state
                    .as_ref()
                    .is_some_and(|state| state.to_string() == "running");
                let name = summary.names.and_then(|names| names.into_iter().next())?;
                Some(ContainerRef {
                    name: name.trim_start_matches('/').to_string(),
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    running,
                })
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_reference(image);
        info!(image = %image, "Pulling image");
        let mut options = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        self.docker
            .create_image(Some(options.build()), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                warn!(image = %image, error = %e, "Image pull failed");
                map_error("pull_image", image, e)
            })?;
        Ok(())
    }

    fn stream_logs<'a>(
        &'a self,
        name: &str,
        follow: bool,
    ) -> BoxStream<'a, Result<Vec<u8>, RuntimeError>> {
        let target = name.to_string();
        self.docker
            .logs(
                name,
                Some(
                    LogsOptionsBuilder::new()
                        .follow(follow)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .map(move |chunk| match chunk {
                Ok(output) => Ok(output.into_bytes().to_vec()),
                Err(e) if is_not_found(&e) => Err(RuntimeError::ContainerNotFound {
                    container: target.clone(),
                }),
                Err(e) => Err(map_error("logs", &target, e)),
            })
            .boxed()
    }
}
