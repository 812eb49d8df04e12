//! `Database` trait: the single async persistence interface.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::worker::model::{HealthStatus, Job, JobId, JobStatus, Worker, WorkerId};

/// Backend-agnostic persistence for workers, jobs and settings.
///
/// Saves are upserts keyed by ID: saving the same ID twice overwrites the
/// mutable fields and never duplicates rows. Lookups of absent IDs fail with
/// [`DatabaseError::NotFound`].
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    async fn save_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    async fn get_worker(&self, id: WorkerId) -> Result<Worker, DatabaseError>;

    /// All worker rows, oldest first. Exited rows are kept for audit.
    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    /// Workers whose status is not `exited`.
    async fn list_active_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    async fn update_worker_status(
        &self,
        id: WorkerId,
        status: HealthStatus,
    ) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: JobId) -> Result<Job, DatabaseError>;

    /// All jobs in submission order.
    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs with the given status in submission order.
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;
}
