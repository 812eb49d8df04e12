//! Container Runtime Gateway.
//!
//! The engine only talks to containers through [`ContainerRuntime`]. The
//! production implementation is [`DockerRuntime`]; tests plug in fakes.

mod docker;

pub use docker::DockerRuntime;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RuntimeError;
use crate::worker::model::WorkerId;

/// Label present on every container this process creates.
pub const MANAGED_LABEL: &str = "aule.managed";
/// Label carrying the worker ID, for reverse lookup without a side index.
pub const WORKER_ID_LABEL: &str = "aule.worker_id";

/// `key=value` filter matching every managed container.
pub fn managed_label_filter() -> String {
    format!("{MANAGED_LABEL}=true")
}

/// Everything needed to create one container. Built by the spawner, so
/// every security setting is already decided by the time it gets here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `host:container:mode` bind strings.
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// `uid:gid`.
    pub user: Option<String>,
    /// Mount point to mount options.
    pub tmpfs: BTreeMap<String, String>,
    pub network_disabled: bool,
    pub read_only_rootfs: bool,
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub working_dir: Option<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
}

/// Run state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub running: bool,
}

/// A container returned by [`ContainerRuntime::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// `false` for created, paused, exited and dead containers.
    pub running: bool,
}

impl ContainerRef {
    /// Worker this container belongs to, from its label or else its name.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.labels
            .get(WORKER_ID_LABEL)
            .and_then(|id| id.parse().ok())
            .or_else(|| WorkerId::from_container_name(&self.name))
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Returns the runtime's native handle,
    /// which never leaves the spawner.
    ///
    /// Fails with [`RuntimeError::ImageNotFound`] when the image is not
    /// present locally.
    async fn create_and_start(&self, request: &ContainerRequest) -> Result<String, RuntimeError>;

    /// Fails with [`RuntimeError::ContainerNotFound`] for unknown names.
    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Stop with a grace period before the runtime kills the process.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Fails with [`RuntimeError::ContainerNotFound`] for unknown names.
    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    /// All containers, running or not, matching a `key=value` label filter.
    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRef>, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Combined stdout/stderr of a container. With `follow` the stream stays
    /// open for new output until the container stops.
    fn stream_logs<'a>(
        &'a self,
        name: &str,
        follow: bool,
    ) -> BoxStream<'a, Result<Vec<u8>, RuntimeError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_from_label_or_name() {
        let id = WorkerId::new();
        let labelled = ContainerRef {
            name: "/renamed".to_string(),
            labels: BTreeMap::from([(WORKER_ID_LABEL.to_string(), id.to_string())]),
            running: true,
        };
        assert_eq!(labelled.worker_id(), Some(id));

        let named = ContainerRef {
            name: format!("/{}", id.container_name()),
            labels: BTreeMap::new(),
            running: false,
        };
        assert_eq!(named.worker_id(), Some(id));

        let foreign = ContainerRef {
            name: "/postgres".to_string(),
            labels: BTreeMap::new(),
            running: false,
        };
        assert_eq!(foreign.worker_id(), None);
    }

    #[test]
    fn managed_filter() {
        assert_eq!(managed_label_filter(), "aule.managed=true");
    }
}
