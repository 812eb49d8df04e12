//! Worker Lifecycle: drives one job through
//! `Pending → Spawning → AwaitingHealthy → Dispatching → Completed | Failed`.
//!
//! Backend tasks (text, image) skip the sandbox phases and go straight from
//! `Pending` to `Dispatching`. Every terminal phase runs the same teardown:
//! the container and host directories go away, the job row gets its final
//! status, the worker row is marked `exited`, and an event is emitted. The
//! caller releases the concurrency slot once [`WorkerLifecycle::run_job`]
//! returns.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{AuleConfig, HealthConfig};
use crate::error::{JobError, RuntimeError};
use crate::events::{EventBus, LifecycleEvent};
use crate::llm::{self, ImageProvider, LlmProvider};
use crate::runtime::ContainerRuntime;
use crate::settings::ProviderSettings;
use crate::store::Database;
use crate::worker::health::HealthProber;
use crate::worker::model::{HealthStatus, Job, TaskKind, Worker, WorkerId};
use crate::worker::providers::{ProviderPair, ProviderRegistry};
use crate::worker::spawner::{SandboxSpawner, WorkerDirs};
use crate::worker::state::{JobRun, LifecyclePhase};
use crate::worker::watchdog;

/// Bytes of worker output attached to a failed health-wait.
const LOG_TAIL_BYTES: usize = 4096;
/// Bound on collecting that tail.
const LOG_TAIL_TIMEOUT: Duration = Duration::from_secs(1);
/// Grace period between stop and kill at teardown.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A failed run: the error persisted on the job, plus diagnostics.
struct Failure {
    error: JobError,
    log_tail: Option<String>,
}

impl From<JobError> for Failure {
    fn from(error: JobError) -> Self {
        Self {
            error,
            log_tail: None,
        }
    }
}

impl From<crate::error::DatabaseError> for Failure {
    fn from(e: crate::error::DatabaseError) -> Self {
        JobError::Persistence(e).into()
    }
}

/// Resolves once cancellation is requested. Pending forever if the sender
/// goes away without requesting it.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|requested| *requested).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn note_teardown_error(job: &mut Job, message: &str) {
    if let Some(metadata) = job.metadata.as_object_mut() {
        metadata.insert(
            "teardown_error".to_string(),
            serde_json::Value::String(message.to_string()),
        );
    }
}

pub struct WorkerLifecycle {
    db: Arc<dyn Database>,
    runtime: Arc<dyn ContainerRuntime>,
    spawner: SandboxSpawner,
    prober: HealthProber,
    providers: ProviderRegistry,
    events: EventBus,
    health: HealthConfig,
    task_timeout: Duration,
    workers_dir: PathBuf,
}

impl WorkerLifecycle {
    pub fn new(
        db: Arc<dyn Database>,
        runtime: Arc<dyn ContainerRuntime>,
        providers: ProviderPair,
        events: EventBus,
        config: &AuleConfig,
    ) -> Self {
        Self {
            spawner: SandboxSpawner::new(Arc::clone(&runtime), config.sandbox.clone()),
            prober: HealthProber::new(
                Arc::clone(&runtime),
                config.sandbox.workers_dir.clone(),
                config.health.probe_timeout,
            ),
            db,
            runtime,
            providers: ProviderRegistry::new(providers),
            events,
            health: config.health.clone(),
            task_timeout: config.scheduler.task_timeout,
            workers_dir: config.sandbox.workers_dir.clone(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// The provider pair a dispatch starting now would use.
    pub fn providers(&self) -> Arc<ProviderPair> {
        self.providers.snapshot()
    }

    /// Atomically swap both backends. In-flight dispatches keep the pair
    /// they started with.
    pub fn update_providers(&self, llm: Arc<dyn LlmProvider>, image: Arc<dyn ImageProvider>) {
        let event = LifecycleEvent::ProvidersUpdated {
            llm: llm.name().to_string(),
            image: image.name().to_string(),
        };
        self.providers.replace(ProviderPair::new(llm, image));
        self.events.emit(event);
    }

    /// Rebuild and swap providers on every settings change. A factory
    /// failure keeps the current pair.
    pub fn watch_settings(
        self: &Arc<Self>,
        mut settings: watch::Receiver<ProviderSettings>,
    ) -> JoinHandle<()> {
        let lifecycle: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while settings.changed().await.is_ok() {
                let next = settings.borrow_and_update().clone();
                let Some(lifecycle) = lifecycle.upgrade() else {
                    break;
                };
                let built = llm::create_llm_provider(&next.llm)
                    .and_then(|llm| Ok((llm, llm::create_image_provider(&next.image)?)));
                match built {
                    Ok((llm, image)) => lifecycle.update_providers(llm, image),
                    Err(e) => warn!(error = %e, "Provider settings rejected, keeping current providers"),
                }
            }
            debug!("Settings watcher stopped");
        })
    }

    /// Output of a worker's container, following new output.
    pub fn worker_logs(&self, id: WorkerId) -> BoxStream<'_, Result<Vec<u8>, RuntimeError>> {
        self.runtime.stream_logs(&id.container_name(), true)
    }

    /// Fail a job that never left the queue. No worker exists yet, so there
    /// is nothing to tear down.
    pub async fn fail_pending(&self, mut job: Job, error: JobError) -> Result<Job, JobError> {
        let mut run = JobRun::new(job.id);
        if let Err(e) = run.transition_to(LifecyclePhase::Failed, Some(error.to_string())) {
            warn!(job_id = %job.id, error = %e, "Unexpected phase transition");
        }
        job.fail(error.to_string());
        self.db.save_job(&job).await?;
        self.events.emit(LifecycleEvent::Failed {
            job_id: job.id,
            error: error.to_string(),
            log_tail: None,
        });
        Ok(job)
    }

    /// Run a job to a terminal status. The returned job is what was
    /// persisted. `Err` only when that final write itself failed.
    pub async fn run_job(
        &self,
        mut job: Job,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Job, JobError> {
        let mut run = JobRun::new(job.id);
        let mut worker_id = None;

        let outcome = if job.task.needs_sandbox() {
            self.run_sandboxed(&mut job, &mut run, &mut worker_id, &mut cancel)
                .await
        } else {
            self.run_backend(&mut job, &mut run, &mut cancel).await
        };

        self.finish(job, run, worker_id, outcome).await
    }

    fn advance(&self, run: &mut JobRun, phase: LifecyclePhase) {
        if let Err(e) = run.transition_to(phase, None) {
            warn!(job_id = %run.job_id, error = %e, "Unexpected phase transition");
        }
        debug!(job_id = %run.job_id, phase = %phase, "Phase changed");
    }

    fn cancellation(job: &Job, phase: LifecyclePhase) -> Failure {
        JobError::Cancelled {
            job_id: job.id,
            phase: phase.describe().to_string(),
        }
        .into()
    }

    async fn run_sandboxed(
        &self,
        job: &mut Job,
        run: &mut JobRun,
        worker_id: &mut Option<WorkerId>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, Failure> {
        if *cancel.borrow() {
            return Err(Self::cancellation(job, LifecyclePhase::Pending));
        }

        let id = WorkerId::new();
        *worker_id = Some(id);
        self.advance(run, LifecyclePhase::Spawning);

        // Rows first, so a crash mid-spawn leaves a record the reconciler
        // can match the container against.
        self.db.save_worker(&Worker::new(id, job.spec.clone())).await?;
        job.mark_running(Some(id));
        self.db.save_job(job).await?;

        self.spawner
            .spawn_with_id(id, &job.spec)
            .await
            .map_err(JobError::from)?;
        self.events.emit(LifecycleEvent::Spawned {
            job_id: job.id,
            worker_id: id,
        });

        self.advance(run, LifecyclePhase::AwaitingHealthy);
        if *cancel.borrow() {
            return Err(Self::cancellation(job, LifecyclePhase::AwaitingHealthy));
        }
        self.await_healthy(job, id, cancel).await?;

        self.advance(run, LifecyclePhase::Dispatching);
        self.events.emit(LifecycleEvent::Dispatching {
            job_id: job.id,
            worker_id: Some(id),
        });

        let prompt = job.spec.agent_prompt.clone().unwrap_or_default();
        let socket = WorkerDirs::for_worker(&self.workers_dir, id).socket_path();
        let response = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return Err(Self::cancellation(job, LifecyclePhase::Dispatching));
            }
            response = watchdog::execute(&socket, &prompt, self.task_timeout) => response,
        };

        match response {
            Ok(response) if response.ok => Ok(response.output.unwrap_or_default()),
            Ok(response) => Err(JobError::TaskExecution {
                job_id: job.id,
                reason: response
                    .message
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            }
            .into()),
            Err(e) => Err(JobError::TaskExecution {
                job_id: job.id,
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Poll the prober until the worker is healthy, it exits, the bound
    /// elapses, or the job is cancelled.
    async fn await_healthy(
        &self,
        job: &Job,
        id: WorkerId,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Failure> {
        let deadline = Instant::now() + self.health.timeout;
        let mut last = HealthStatus::Unknown;

        loop {
            let reading = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return Err(Self::cancellation(job, LifecyclePhase::AwaitingHealthy));
                }
                reading = self.prober.check(id) => reading,
            };

            if let Some(e) = &reading.error {
                warn!(job_id = %job.id, worker_id = %id, error = %e, "Health probe could not reach runtime");
            }
            if reading.status != last {
                self.events.emit(LifecycleEvent::HealthChanged {
                    job_id: job.id,
                    worker_id: id,
                    from: last,
                    to: reading.status,
                });
                // Teardown records `exited` after the job row is final.
                if reading.status != HealthStatus::Exited {
                    self.db.update_worker_status(id, reading.status).await?;
                }
                last = reading.status;
            }

            match reading.status {
                HealthStatus::Healthy => return Ok(()),
                HealthStatus::Exited => {
                    return Err(Failure {
                        error: JobError::WorkerExited { worker_id: id },
                        log_tail: self.log_tail(id).await,
                    });
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Failure {
                    error: JobError::HealthTimeout {
                        worker_id: id,
                        timeout: self.health.timeout,
                    },
                    log_tail: self.log_tail(id).await,
                });
            }

            let pause = self.health.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return Err(Self::cancellation(job, LifecyclePhase::AwaitingHealthy));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn run_backend(
        &self,
        job: &mut Job,
        run: &mut JobRun,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, Failure> {
        if *cancel.borrow() {
            return Err(Self::cancellation(job, LifecyclePhase::Pending));
        }

        self.advance(run, LifecyclePhase::Dispatching);
        job.mark_running(None);
        self.db.save_job(job).await?;
        self.events.emit(LifecycleEvent::Dispatching {
            job_id: job.id,
            worker_id: None,
        });

        let Some(prompt) = job.spec.agent_prompt.clone() else {
            return Err(JobError::TaskExecution {
                job_id: job.id,
                reason: "job has no prompt".to_string(),
            }
            .into());
        };

        // One pair for the whole dispatch.
        let providers = self.providers.snapshot();
        let task = job.task;
        let generate = async move {
            match task {
                TaskKind::Image => providers
                    .image
                    .generate(&prompt)
                    .await
                    .map(|image| image.into_result()),
                TaskKind::Text | TaskKind::Agent => providers.llm.generate(&prompt).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return Err(Self::cancellation(job, LifecyclePhase::Dispatching));
            }
            outcome = tokio::time::timeout(self.task_timeout, generate) => outcome,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(JobError::TaskExecution {
                job_id: job.id,
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(JobError::TaskExecution {
                job_id: job.id,
                reason: format!("timed out after {:?}", self.task_timeout),
            }
            .into()),
        }
    }

    /// Terminal transition and teardown. Runs on every exit path.
    async fn finish(
        &self,
        mut job: Job,
        mut run: JobRun,
        worker_id: Option<WorkerId>,
        outcome: Result<String, Failure>,
    ) -> Result<Job, JobError> {
        let terminal = if outcome.is_ok() {
            LifecyclePhase::Completed
        } else {
            LifecyclePhase::Failed
        };
        self.advance(&mut run, terminal);

        if let Some(id) = worker_id {
            if let Err(e) = self.remove_container(id).await {
                // The row goes to `exited` anyway; the next startup
                // reconciliation reaps the container as an orphan.
                error!(job_id = %job.id, worker_id = %id, error = %e, "Container removal failed");
                note_teardown_error(&mut job, &e.to_string());
            }
            if let Err(e) = WorkerDirs::for_worker(&self.workers_dir, id).remove().await {
                warn!(job_id = %job.id, worker_id = %id, error = %e, "Host directory removal failed");
                note_teardown_error(&mut job, &e.to_string());
            }
        }

        let (event, log_tail) = match outcome {
            Ok(result) => {
                job.complete(result);
                (LifecycleEvent::Completed { job_id: job.id }, None)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                job.fail(message.clone());
                (
                    LifecycleEvent::Failed {
                        job_id: job.id,
                        error: message,
                        log_tail: failure.log_tail.clone(),
                    },
                    failure.log_tail,
                )
            }
        };
        if let Some(tail) = &log_tail {
            debug!(job_id = %job.id, bytes = tail.len(), "Captured worker log tail");
        }

        let saved = self.db.save_job(&job).await;
        let marked = match worker_id {
            Some(id) => match self.db.update_worker_status(id, HealthStatus::Exited).await {
                // The row was never written if the very first save failed.
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
            None => Ok(()),
        };

        self.events.emit(event);
        if let Some(id) = worker_id {
            self.events.emit(LifecycleEvent::TornDown {
                job_id: job.id,
                worker_id: id,
            });
        }

        saved?;
        marked?;
        info!(
            job_id = %job.id,
            status = %job.status,
            path = ?run.path(),
            "Job finished"
        );
        Ok(job)
    }

    async fn remove_container(&self, id: WorkerId) -> Result<(), RuntimeError> {
        let name = id.container_name();
        match self.runtime.stop(&name, STOP_GRACE).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => debug!(worker_id = %id, error = %e, "Stop failed, forcing removal"),
        }
        match self.runtime.remove(&name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The last few KiB of a worker's output. Best effort.
    async fn log_tail(&self, id: WorkerId) -> Option<String> {
        let name = id.container_name();
        let collect = async {
            let mut stream = self.runtime.stream_logs(&name, false);
            let mut tail: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        tail.extend_from_slice(&bytes);
                        if tail.len() > LOG_TAIL_BYTES {
                            tail.drain(..tail.len() - LOG_TAIL_BYTES);
                        }
                    }
                    Err(e) => {
                        debug!(worker_id = %id, error = %e, "Log tail unavailable");
                        break;
                    }
                }
            }
            tail
        };
        let tail = tokio::time::timeout(LOG_TAIL_TIMEOUT, collect)
            .await
            .ok()?;
        if tail.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&tail).into_owned())
        }
    }
}
