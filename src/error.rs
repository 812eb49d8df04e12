//! Error types for Aule.

use std::time::Duration;

use crate::worker::model::{JobId, WorkerId};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors reported by the container runtime gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container runtime unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Container {container} not found")]
    ContainerNotFound { container: String },

    #[error("Image {image} not present locally")]
    ImageNotFound { image: String },

    #[error("Runtime operation {operation} on {target} failed: {reason}")]
    Operation {
        operation: &'static str,
        target: String,
        reason: String,
    },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound { .. })
    }
}

/// Provisioning failures. Always terminal for the job.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Worker {worker_id}: failed to prepare host directories: {reason}")]
    Workspace { worker_id: WorkerId, reason: String },

    #[error("Worker {worker_id}: failed to pull image {image}: {reason}")]
    ImagePull {
        worker_id: WorkerId,
        image: String,
        reason: String,
    },

    #[error("Worker {worker_id}: container create/start failed: {reason}")]
    Container { worker_id: WorkerId, reason: String },
}

/// Failures talking to a worker over its private socket.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("Watchdog socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watchdog frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Watchdog protocol error: {0}")]
    Protocol(String),

    #[error("Watchdog did not answer within {0:?}")]
    Timeout(Duration),
}

/// LLM / image provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },
}

/// Job-level failures. The `Display` output is what gets persisted on the job row.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Worker {worker_id} did not become healthy within {timeout:?}")]
    HealthTimeout { worker_id: WorkerId, timeout: Duration },

    #[error("Worker {worker_id} exited before becoming healthy")]
    WorkerExited { worker_id: WorkerId },

    #[error("Job {job_id} task execution failed: {reason}")]
    TaskExecution { job_id: JobId, reason: String },

    #[error("Job {job_id} cancelled while {phase}")]
    Cancelled { job_id: JobId, phase: String },

    #[error("Job {job_id} interrupted: {reason}")]
    Interrupted { job_id: JobId, reason: String },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Startup reconciliation failures. These abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Runtime error during reconciliation: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Database error during reconciliation: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
