//! Startup reconciliation ("zombie reaping").
//!
//! Runs once, before the scheduler takes work, and makes persisted state
//! agree with what the container runtime actually has:
//!
//! - `running` jobs were interrupted by the restart and are failed
//! - managed containers with no live worker row (or whose job was
//!   interrupted) are removed along with their host directories
//! - non-exited worker rows with no container left are marked `exited`
//!
//! Any runtime or database error aborts the pass. A second pass right after
//! a successful one changes nothing.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{JobError, ReconcileError, RuntimeError};
use crate::events::{EventBus, LifecycleEvent};
use crate::runtime::{ContainerRef, ContainerRuntime, managed_label_filter};
use crate::store::Database;
use crate::worker::model::{HealthStatus, JobStatus, WorkerId};
use crate::worker::spawner::WorkerDirs;

const REAP_STOP_GRACE: Duration = Duration::from_secs(2);

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub jobs_interrupted: usize,
    pub containers_reaped: usize,
    pub workers_exited: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct StartupReconciler {
    db: Arc<dyn Database>,
    runtime: Arc<dyn ContainerRuntime>,
    workers_dir: PathBuf,
    events: EventBus,
}

impl StartupReconciler {
    pub fn new(
        db: Arc<dyn Database>,
        runtime: Arc<dyn ContainerRuntime>,
        workers_dir: PathBuf,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            runtime,
            workers_dir,
            events,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        let containers = self.runtime.list(&managed_label_filter()).await?;
        let active = self.db.list_active_workers().await?;

        let mut interrupted: HashSet<WorkerId> = HashSet::new();
        for mut job in self.db.list_jobs_by_status(JobStatus::Running).await? {
            let error = JobError::Interrupted {
                job_id: job.id,
                reason: "process restarted while the job was running".to_string(),
            };
            if let Some(worker_id) = job.worker_id {
                interrupted.insert(worker_id);
            }
            job.fail(error.to_string());
            self.db.save_job(&job).await?;
            self.events.emit(LifecycleEvent::Failed {
                job_id: job.id,
                error: error.to_string(),
                log_tail: None,
            });
            report.jobs_interrupted += 1;
        }

        let live_rows: HashSet<WorkerId> = active
            .iter()
            .map(|worker| worker.id)
            .filter(|id| !interrupted.contains(id))
            .collect();

        let mut kept: HashSet<WorkerId> = HashSet::new();
        for container in &containers {
            match container.worker_id() {
                Some(id) if live_rows.contains(&id) && container.running => {
                    kept.insert(id);
                }
                // Nothing restarts a stopped worker; its row is marked exited below.
                Some(id) if live_rows.contains(&id) => {
                    self.reap(container, Some(id), "worker container not running")
                        .await?;
                    report.containers_reaped += 1;
                }
                Some(id) if interrupted.contains(&id) => {
                    self.reap(container, Some(id), "job interrupted by restart")
                        .await?;
                    report.containers_reaped += 1;
                }
                id => {
                    self.reap(container, id, "no live worker record").await?;
                    report.containers_reaped += 1;
                }
            }
        }

        for worker in &active {
            if kept.contains(&worker.id) {
                continue;
            }
            self.db
                .update_worker_status(worker.id, HealthStatus::Exited)
                .await?;
            self.remove_dirs(worker.id).await;
            info!(worker_id = %worker.id, previous = %worker.status, "Marked stale worker exited");
            report.workers_exited += 1;
        }

        if report.is_noop() {
            info!("Reconciliation found nothing to clean up");
        } else {
            info!(
                jobs_interrupted = report.jobs_interrupted,
                containers_reaped = report.containers_reaped,
                workers_exited = report.workers_exited,
                "Reconciliation complete"
            );
        }
        Ok(report)
    }

    async fn reap(
        &self,
        container: &ContainerRef,
        worker_id: Option<WorkerId>,
        reason: &str,
    ) -> Result<(), RuntimeError> {
        warn!(container = %container.name, reason, "Reaping orphaned container");
        match self.runtime.stop(&container.name, REAP_STOP_GRACE).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e @ RuntimeError::Unreachable { .. }) => return Err(e),
            Err(e) => warn!(container = %container.name, error = %e, "Stop failed, forcing removal"),
        }
        match self.runtime.remove(&container.name, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Some(id) = worker_id {
            self.remove_dirs(id).await;
        }
        self.events.emit(LifecycleEvent::Reaped {
            container: container.name.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn remove_dirs(&self, id: WorkerId) {
        if let Err(e) = WorkerDirs::for_worker(&self.workers_dir, id).remove().await {
            warn!(worker_id = %id, error = %e, "Failed to remove worker host directories");
        }
    }
}
