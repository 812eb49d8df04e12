//! Job Scheduler: FIFO admission under a global concurrency ceiling.
//!
//! `submit` persists a `pending` job and enqueues it. A single dispatch loop
//! takes jobs in submission order, waits for a slot, and hands each job to
//! the [`WorkerLifecycle`] on its own task. The slot is held until the job's
//! terminal state has been written.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, JobError};
use crate::events::LifecycleEvent;
use crate::worker::lifecycle::WorkerLifecycle;
use crate::worker::model::{Job, JobId, JobStatus, TaskKind, WorkerSpec};
use crate::worker::state::LifecyclePhase;

struct SlotCounters {
    in_use: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Counting resource bounding how many jobs run at once.
///
/// Waiters are served in the order they started waiting.
#[derive(Clone)]
pub struct ConcurrencySlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<SlotCounters>,
}

impl ConcurrencySlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(SlotCounters {
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    pub async fn acquire(&self) -> Result<SlotPermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        let now = self.counters.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(SlotPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots held right now.
    pub fn in_use(&self) -> usize {
        self.counters.in_use.load(Ordering::SeqCst)
    }

    /// Highest `in_use` ever observed.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }
}

/// A held slot. Dropping it releases the slot, exactly once.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct QueuedJob {
    job: Job,
    cancel: watch::Receiver<bool>,
}

type CancelMap = Arc<std::sync::Mutex<HashMap<JobId, watch::Sender<bool>>>>;

fn lock(map: &CancelMap) -> std::sync::MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct JobScheduler {
    lifecycle: Arc<WorkerLifecycle>,
    slots: ConcurrencySlots,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedJob>>>,
    cancels: CancelMap,
    shutdown_tx: watch::Sender<bool>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(lifecycle: Arc<WorkerLifecycle>, max_concurrent_jobs: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            lifecycle,
            slots: ConcurrencySlots::new(max_concurrent_jobs.max(1)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cancels: Arc::new(std::sync::Mutex::new(HashMap::new())),
            shutdown_tx,
            dispatch_handle: Mutex::new(None),
        }
    }

    pub fn slots(&self) -> &ConcurrencySlots {
        &self.slots
    }

    /// Record a new `pending` job and queue it. Returns without waiting for
    /// a slot.
    pub async fn submit(&self, spec: WorkerSpec, task: TaskKind) -> Result<JobId, JobError> {
        let job = Job::new(spec, task);
        self.lifecycle.db().save_job(&job).await?;
        Ok(self.enqueue(job))
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, DatabaseError> {
        self.lifecycle.db().get_job(id).await
    }

    /// Re-queue jobs persisted as `pending`, oldest first. The in-memory
    /// queue does not survive a restart; call this after reconciliation and
    /// before accepting new submissions.
    pub async fn resume_pending(&self) -> Result<usize, DatabaseError> {
        let pending = self
            .lifecycle
            .db()
            .list_jobs_by_status(JobStatus::Pending)
            .await?;
        let mut resumed = 0;
        for job in pending {
            if lock(&self.cancels).contains_key(&job.id) {
                continue;
            }
            self.enqueue(job);
            resumed += 1;
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed pending jobs");
        }
        Ok(resumed)
    }

    fn enqueue(&self, job: Job) -> JobId {
        let id = job.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        lock(&self.cancels).insert(id, cancel_tx);
        self.lifecycle.events().emit(LifecycleEvent::JobQueued {
            job_id: id,
            task: job.task,
        });
        if self
            .queue_tx
            .send(QueuedJob {
                job,
                cancel: cancel_rx,
            })
            .is_err()
        {
            // The row stays `pending` and is picked up on the next start.
            warn!(job_id = %id, "Dispatch loop stopped, job left pending");
            lock(&self.cancels).remove(&id);
        }
        id
    }

    /// Request cancellation. Returns `false` if the job is not tracked
    /// (unknown, or already finished).
    pub fn cancel(&self, id: JobId) -> bool {
        match lock(&self.cancels).get(&id) {
            Some(tx) => {
                tx.send_replace(true);
                info!(job_id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Start the dispatch loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let Some(queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("Dispatch loop already started");
            return;
        };
        let dispatcher = Dispatcher {
            lifecycle: Arc::clone(&self.lifecycle),
            slots: self.slots.clone(),
            cancels: Arc::clone(&self.cancels),
        };
        let handle = tokio::spawn(dispatcher.run(queue_rx, self.shutdown_tx.subscribe()));
        *self.dispatch_handle.lock().await = Some(handle);
        info!(max_concurrent_jobs = self.slots.capacity(), "Job scheduler started");
    }

    /// Stop taking work, cancel every running job, and wait for their
    /// teardown. Jobs still waiting in the queue stay `pending`.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for tx in lock(&self.cancels).values() {
            tx.send_replace(true);
        }
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch loop panicked");
            }
        }
        info!("Job scheduler stopped");
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|requested| *requested).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct Dispatcher {
    lifecycle: Arc<WorkerLifecycle>,
    slots: ConcurrencySlots,
    cancels: CancelMap,
}

impl Dispatcher {
    async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<QueuedJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();

        'dispatch: loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'dispatch,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task panicked");
                    }
                    continue 'dispatch;
                }
                next = queue.recv() => next,
            };
            let Some(QueuedJob { job, mut cancel }) = next else {
                break 'dispatch;
            };

            debug!(job_id = %job.id, free = self.slots.available(), "Waiting for a slot");
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'dispatch,
                _ = cancel_requested(&mut cancel) => {
                    self.fail_queued(job).await;
                    continue 'dispatch;
                }
                permit = self.slots.acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Concurrency slots closed");
                    break 'dispatch;
                }
            };

            let lifecycle = Arc::clone(&self.lifecycle);
            let cancels = Arc::clone(&self.cancels);
            in_flight.spawn(async move {
                let job_id = job.id;
                match lifecycle.run_job(job, cancel).await {
                    Ok(job) => debug!(job_id = %job_id, status = %job.status, "Job task done"),
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to persist final job state"),
                }
                drop(permit);
                lock(&cancels).remove(&job_id);
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        debug!("Dispatch loop stopped");
    }

    async fn fail_queued(&self, job: Job) {
        let job_id = job.id;
        let error = JobError::Cancelled {
            job_id,
            phase: LifecyclePhase::Pending.describe().to_string(),
        };
        if let Err(e) = self.lifecycle.fail_pending(job, error).await {
            error!(job_id = %job_id, error = %e, "Failed to persist cancelled job");
        }
        lock(&self.cancels).remove(&job_id);
    }
}
