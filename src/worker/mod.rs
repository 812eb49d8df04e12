//! Worker system: sandboxed workers and the jobs that run on them.
//!
//! Core components:
//! - `model`: WorkerSpec, Worker, Job and their IDs and statuses
//! - `state`: lifecycle phase machine (Pending → … → Completed/Failed)
//! - `spawner`: turns a spec into an isolated container
//! - `health`: three-tier liveness probe
//! - `watchdog`: framing and client for the per-worker socket
//! - `providers`: hot-swappable LLM / image backends
//! - `lifecycle`: per-job orchestrator and teardown
//! - `scheduler`: FIFO admission under the concurrency ceiling
//! - `reconciler`: startup zombie reaping

pub mod health;
pub mod lifecycle;
pub mod model;
pub mod providers;
pub mod reconciler;
pub mod scheduler;
pub mod spawner;
pub mod state;
pub mod watchdog;

pub use health::{HealthProber, HealthReading};
pub use lifecycle::WorkerLifecycle;
pub use model::{
    BindMount, HealthStatus, Job, JobId, JobStatus, ResourceLimits, TaskKind, Worker, WorkerId,
    WorkerSpec,
};
pub use providers::{ProviderPair, ProviderRegistry};
pub use reconciler::{ReconcileReport, StartupReconciler};
pub use scheduler::{ConcurrencySlots, JobScheduler, SlotPermit};
pub use spawner::{SandboxSpawner, WorkerDirs};
pub use state::{JobRun, LifecyclePhase};
