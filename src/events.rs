//! Lifecycle events, fanned out to any number of listeners.
//!
//! Emission never blocks and never fails the lifecycle that reports it: a
//! lagging receiver loses old events, and no receivers at all is fine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::worker::model::{HealthStatus, JobId, TaskKind, WorkerId};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobQueued {
        job_id: JobId,
        task: TaskKind,
    },
    Spawned {
        job_id: JobId,
        worker_id: WorkerId,
    },
    HealthChanged {
        job_id: JobId,
        worker_id: WorkerId,
        from: HealthStatus,
        to: HealthStatus,
    },
    Dispatching {
        job_id: JobId,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<WorkerId>,
    },
    Completed {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        error: String,
        /// Tail of the worker's output, when one was captured.
        #[serde(skip_serializing_if = "Option::is_none")]
        log_tail: Option<String>,
    },
    TornDown {
        job_id: JobId,
        worker_id: WorkerId,
    },
    Reaped {
        container: String,
        reason: String,
    },
    ProvidersUpdated {
        llm: String,
        image: String,
    },
}

impl LifecycleEvent {
    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobQueued { job_id, .. }
            | Self::Spawned { job_id, .. }
            | Self::HealthChanged { job_id, .. }
            | Self::Dispatching { job_id, .. }
            | Self::Completed { job_id }
            | Self::Failed { job_id, .. }
            | Self::TornDown { job_id, .. } => Some(*job_id),
            Self::Reaped { .. } | Self::ProvidersUpdated { .. } => None,
        }
    }

    fn log(&self) {
        match self {
            Self::JobQueued { job_id, task } => info!(job_id = %job_id, task = %task, "Job queued"),
            Self::Spawned { job_id, worker_id } => {
                info!(job_id = %job_id, worker_id = %worker_id, "Worker spawned")
            }
            Self::HealthChanged {
                job_id,
                worker_id,
                from,
                to,
            } => info!(job_id = %job_id, worker_id = %worker_id, from = %from, to = %to, "Health changed"),
            Self::Dispatching { job_id, .. } => info!(job_id = %job_id, "Dispatching task"),
            Self::Completed { job_id } => info!(job_id = %job_id, "Job completed"),
            Self::Failed { job_id, error, .. } => warn!(job_id = %job_id, error = %error, "Job failed"),
            Self::TornDown { job_id, worker_id } => {
                info!(job_id = %job_id, worker_id = %worker_id, "Worker torn down")
            }
            Self::Reaped { container, reason } => {
                info!(container = %container, reason = %reason, "Container reaped")
            }
            Self::ProvidersUpdated { llm, image } => {
                info!(llm = %llm, image = %image, "Providers updated")
            }
        }
    }
}

/// Broadcast bus for [`LifecycleEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Log and broadcast an event.
    pub fn emit(&self, event: LifecycleEvent) {
        event.log();
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`. Lag shows up as `Err` items.
    pub fn stream(&self) -> BroadcastStream<LifecycleEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
