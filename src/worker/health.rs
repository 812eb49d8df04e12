//! Health Prober: runtime state, then socket reachability, then the
//! worker's own verdict.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::ContainerRuntime;
use crate::worker::model::{HealthStatus, WorkerId};
use crate::worker::spawner::WorkerDirs;
use crate::worker::watchdog;

/// Result of one probe. `error` is set when the runtime itself failed.
#[derive(Debug, Clone)]
pub struct HealthReading {
    pub status: HealthStatus,
    pub error: Option<RuntimeError>,
}

impl HealthReading {
    fn status(status: HealthStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

pub struct HealthProber {
    runtime: Arc<dyn ContainerRuntime>,
    workers_dir: PathBuf,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        workers_dir: PathBuf,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            workers_dir,
            probe_timeout,
        }
    }

    /// Probe a worker once. All tiers together finish within the probe
    /// timeout; the socket step only gets what the inspect step left.
    pub async fn check(&self, id: WorkerId) -> HealthReading {
        let deadline = Instant::now() + self.probe_timeout;
        let container = id.container_name();
        let inspected =
            match tokio::time::timeout_at(deadline, self.runtime.inspect(&container)).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Unreachable {
                    reason: format!("inspect {container} timed out"),
                }),
            };

        match inspected {
            Err(e) if e.is_not_found() => return HealthReading::status(HealthStatus::Exited),
            Err(e) => {
                return HealthReading {
                    status: HealthStatus::Unknown,
                    error: Some(e),
                };
            }
            Ok(info) if !info.running => return HealthReading::status(HealthStatus::Exited),
            Ok(_) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(worker_id = %id, "Probe budget spent on inspect");
            return HealthReading::status(HealthStatus::Starting);
        }
        let socket = WorkerDirs::for_worker(&self.workers_dir, id).socket_path();
        match watchdog::health(&socket, remaining).await {
            Ok(response) if response.ok => HealthReading::status(HealthStatus::Healthy),
            Ok(response) => {
                debug!(worker_id = %id, message = ?response.message, "Worker reported unhealthy");
                HealthReading::status(HealthStatus::Unhealthy)
            }
            // Alive but not serving yet.
            Err(e) => {
                debug!(worker_id = %id, error = %e, "Watchdog not answering");
                HealthReading::status(HealthStatus::Starting)
            }
        }
    }

    /// Like [`HealthProber::check`], without the error detail.
    pub async fn health_check(&self, id: WorkerId) -> HealthStatus {
        self.check(id).await.status
    }
}
