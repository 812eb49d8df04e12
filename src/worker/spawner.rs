//! Sandbox Spawner: provisions one isolated container per worker.
//!
//! The isolation policy is applied here on every spawn and cannot be
//! loosened through [`WorkerSpec`]:
//! - no network
//! - dedicated workspace and socket directories, bind-mounted at fixed paths
//! - process runs as the host's UID:GID
//! - all capabilities dropped, `no-new-privileges`
//! - `/tmp` is a size-capped `noexec,nosuid` tmpfs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{RuntimeError, SpawnError};
use crate::runtime::{ContainerRequest, ContainerRuntime, MANAGED_LABEL, WORKER_ID_LABEL};
use crate::worker::model::{WorkerId, WorkerSpec};
use crate::worker::watchdog;

/// Where the workspace directory is mounted inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// Environment variable carrying the optional agent prompt.
pub const AGENT_PROMPT_ENV: &str = "AULE_AGENT_PROMPT";
/// Label keys with this prefix are owned by the engine.
const RESERVED_LABEL_PREFIX: &str = "aule.";

/// Host-side directories of one worker, all derived from its ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDirs {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub socket_dir: PathBuf,
}

impl WorkerDirs {
    pub fn for_worker(base: &Path, id: WorkerId) -> Self {
        let root = base.join(id.to_string());
        Self {
            workspace: root.join("workspace"),
            socket_dir: root.join("sock"),
            root,
        }
    }

    /// Host path of the worker's watchdog socket.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(watchdog::SOCKET_FILE)
    }

    async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.workspace).await?;
        tokio::fs::create_dir_all(&self.socket_dir).await?;
        restrict_permissions(&self.socket_dir).await;
        Ok(())
    }

    /// Remove all host state of the worker. Missing directories are fine.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Owner-only access to the socket directory. Failure is not fatal.
async fn restrict_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await {
        debug!(path = %dir.display(), error = %e, "chmod on socket dir ignored");
    }
}

/// `uid:gid` of the running process.
pub fn host_identity() -> String {
    format!(
        "{}:{}",
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw()
    )
}

/// Build the runtime request for a worker. Pure: every input is explicit.
pub fn sandbox_request(
    id: WorkerId,
    spec: &WorkerSpec,
    dirs: &WorkerDirs,
    config: &SandboxConfig,
    identity: &str,
) -> ContainerRequest {
    let image = if spec.image.trim().is_empty() {
        config.default_image.clone()
    } else {
        spec.image.clone()
    };

    let mut env: BTreeMap<String, String> = spec.env.clone();
    env.insert(
        watchdog::SOCKET_ENV.to_string(),
        watchdog::container_socket_path(),
    );
    if let Some(prompt) = &spec.agent_prompt {
        env.insert(AGENT_PROMPT_ENV.to_string(), prompt.clone());
    }

    let mut binds = vec![
        format!("{}:{CONTAINER_WORKSPACE}:rw", dirs.workspace.display()),
        format!(
            "{}:{}:rw",
            dirs.socket_dir.display(),
            watchdog::CONTAINER_SOCKET_DIR
        ),
    ];
    binds.extend(spec.mounts.iter().map(|m| m.to_bind_string()));

    let mut labels: BTreeMap<String, String> = spec
        .tags
        .iter()
        .filter(|(key, _)| !key.starts_with(RESERVED_LABEL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(WORKER_ID_LABEL.to_string(), id.to_string());

    ContainerRequest {
        name: id.container_name(),
        image,
        command: spec.command.clone(),
        env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
        binds,
        labels,
        user: Some(identity.to_string()),
        tmpfs: BTreeMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}", config.tmpfs_size),
        )]),
        network_disabled: true,
        read_only_rootfs: spec.read_only_rootfs,
        nano_cpus: spec.resources.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
        memory_bytes: spec
            .resources
            .memory_mb
            .map(|mb| (mb as i64).saturating_mul(1024 * 1024)),
        working_dir: Some(CONTAINER_WORKSPACE.to_string()),
        cap_drop: vec!["ALL".to_string()],
        security_opt: vec!["no-new-privileges".to_string()],
    }
}

pub struct SandboxSpawner {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    identity: String,
}

impl SandboxSpawner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            identity: host_identity(),
        }
    }

    pub fn dirs(&self, id: WorkerId) -> WorkerDirs {
        WorkerDirs::for_worker(&self.config.workers_dir, id)
    }

    /// Spawn a worker under a freshly generated ID.
    pub async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerId, SpawnError> {
        let id = WorkerId::new();
        self.spawn_with_id(id, spec).await?;
        Ok(id)
    }

    /// Spawn a worker under an ID the caller already recorded.
    ///
    /// On failure no host directories and no container are left behind.
    pub async fn spawn_with_id(&self, id: WorkerId, spec: &WorkerSpec) -> Result<(), SpawnError> {
        let dirs = self.dirs(id);
        dirs.create().await.map_err(|e| SpawnError::Workspace {
            worker_id: id,
            reason: e.to_string(),
        })?;

        let request = sandbox_request(id, spec, &dirs, &self.config, &self.identity);
        match self.create_with_pull(id, &request).await {
            Ok(handle) => {
                debug!(worker_id = %id, handle = %handle, "Container handle assigned");
                info!(worker_id = %id, image = %request.image, "Worker container started");
                Ok(())
            }
            Err(e) => {
                self.cleanup_failed_spawn(id, &dirs).await;
                Err(e)
            }
        }
    }

    /// Create the container, pulling the image and retrying exactly once if
    /// it is missing locally.
    async fn create_with_pull(
        &self,
        id: WorkerId,
        request: &ContainerRequest,
    ) -> Result<String, SpawnError> {
        let container_error = |e: RuntimeError| SpawnError::Container {
            worker_id: id,
            reason: e.to_string(),
        };

        match self.runtime.create_and_start(request).await {
            Ok(handle) => Ok(handle),
            Err(RuntimeError::ImageNotFound { image }) => {
                info!(worker_id = %id, image = %image, "Image missing locally, pulling");
                self.runtime
                    .pull_image(&image)
                    .await
                    .map_err(|e| SpawnError::ImagePull {
                        worker_id: id,
                        image: image.clone(),
                        reason: e.to_string(),
                    })?;
                self.runtime
                    .create_and_start(request)
                    .await
                    .map_err(container_error)
            }
            Err(e) => Err(container_error(e)),
        }
    }

    async fn cleanup_failed_spawn(&self, id: WorkerId, dirs: &WorkerDirs) {
        match self.runtime.remove(&id.container_name(), true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(worker_id = %id, error = %e, "Container cleanup after failed spawn"),
        }
        if let Err(e) = dirs.remove().await {
            warn!(worker_id = %id, error = %e, "Directory cleanup after failed spawn");
        }
    }
}
