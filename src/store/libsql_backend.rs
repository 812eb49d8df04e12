//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::worker::model::{HealthStatus, Job, JobId, JobStatus, Worker, WorkerId, WorkerSpec};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_workers(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn query_jobs(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339, so text order is time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_column<T>(row: &libsql::Row, idx: i32, column: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row
        .get(idx)
        .map_err(|e| DatabaseError::Query(format!("read {column}: {e}")))?;
    raw.parse()
        .map_err(|e: T::Err| DatabaseError::Serialization(format!("{column} '{raw}': {e}")))
}

fn json_column<T>(row: &libsql::Row, idx: i32, column: &str) -> Result<T, DatabaseError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let raw: String = row
        .get(idx)
        .map_err(|e| DatabaseError::Query(format!("read {column}: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn time_column(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    row.get::<String>(idx)
        .map(|s| parse_datetime(&s))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    Ok(Worker {
        id: parse_column(row, 0, "workers.id")?,
        spec: json_column::<WorkerSpec>(row, 1, "workers.spec")?,
        status: parse_column(row, 2, "workers.status")?,
        created_at: time_column(row, 3),
        updated_at: time_column(row, 4),
        metadata: json_column(row, 5, "workers.metadata").unwrap_or(serde_json::json!({})),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let worker_id: Option<String> = row.get(4).ok();
    let worker_id = match worker_id {
        Some(raw) => Some(raw.parse::<WorkerId>().map_err(|e| {
            DatabaseError::Serialization(format!("jobs.worker_id '{raw}': {e}"))
        })?),
        None => None,
    };

    Ok(Job {
        id: parse_column(row, 0, "jobs.id")?,
        spec: json_column::<WorkerSpec>(row, 1, "jobs.spec")?,
        task: parse_column(row, 2, "jobs.task")?,
        status: parse_column(row, 3, "jobs.status")?,
        worker_id,
        result: row.get(5).ok(),
        error: row.get(6).ok(),
        created_at: time_column(row, 7),
        updated_at: time_column(row, 8),
        metadata: json_column(row, 9, "jobs.metadata").unwrap_or(serde_json::json!({})),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const WORKER_COLUMNS: &str = "id, spec, status, created_at, updated_at, metadata";

const JOB_COLUMNS: &str =
    "id, spec, task, status, worker_id, result, error, created_at, updated_at, metadata";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn save_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workers (id, spec, status, created_at, updated_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                    spec = excluded.spec,
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    metadata = excluded.metadata",
                params![
                    worker.id.to_string(),
                    to_json(&worker.spec)?,
                    worker.status.as_str(),
                    timestamp(&worker.created_at),
                    timestamp(&worker.updated_at),
                    to_json(&worker.metadata)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_worker: {e}")))?;

        debug!(worker_id = %worker.id, status = %worker.status, "Worker saved");
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Worker, DatabaseError> {
        self.query_workers(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![id.to_string()],
            "get_worker",
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "worker".to_string(),
            id: id.to_string(),
        })
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        self.query_workers(
            &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at ASC, rowid ASC"),
            (),
            "list_workers",
        )
        .await
    }

    async fn list_active_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        self.query_workers(
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers WHERE status != ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![HealthStatus::Exited.as_str()],
            "list_active_workers",
        )
        .await
    }

    async fn update_worker_status(
        &self,
        id: WorkerId,
        status: HealthStatus,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), timestamp(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_worker_status: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "worker".to_string(),
                id: id.to_string(),
            });
        }
        debug!(worker_id = %id, status = %status, "Worker status updated");
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let worker_id = job.worker_id.map(|id| id.to_string());
        self.conn()
            .execute(
                "INSERT INTO jobs (id, spec, task, status, worker_id, result, error,
                                   created_at, updated_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (id) DO UPDATE SET
                    spec = excluded.spec,
                    task = excluded.task,
                    status = excluded.status,
                    worker_id = excluded.worker_id,
                    result = excluded.result,
                    error = excluded.error,
                    updated_at = excluded.updated_at,
                    metadata = excluded.metadata",
                params![
                    job.id.to_string(),
                    to_json(&job.spec)?,
                    job.task.as_str(),
                    job.status.as_str(),
                    opt_text(worker_id.as_deref()),
                    opt_text(job.result.as_deref()),
                    opt_text(job.error.as_deref()),
                    timestamp(&job.created_at),
                    timestamp(&job.updated_at),
                    to_json(&job.metadata)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_job: {e}")))?;

        debug!(job_id = %job.id, status = %job.status, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Job, DatabaseError> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
            "get_job",
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, rowid ASC"),
            (),
            "list_jobs",
        )
        .await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![status.as_str()],
            "list_jobs_by_status",
        )
        .await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| DatabaseError::Serialization(format!("setting {key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, to_json(value)?, timestamp(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::model::{BindMount, TaskKind};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn spec() -> WorkerSpec {
        WorkerSpec::new("aule-worker:latest")
            .with_env("MODE", "test")
            .with_mount(BindMount::read_only("/data", "/data"))
            .with_prompt("hello")
    }

    // ── Worker tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn save_and_get_worker() {
        let db = test_db().await;
        let worker = Worker::new(WorkerId::new(), spec());
        db.save_worker(&worker).await.unwrap();

        let fetched = db.get_worker(worker.id).await.unwrap();
        assert_eq!(fetched.id, worker.id);
        assert_eq!(fetched.spec, worker.spec);
        assert_eq!(fetched.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn save_worker_is_an_upsert() {
        let db = test_db().await;
        let mut worker = Worker::new(WorkerId::new(), spec());
        db.save_worker(&worker).await.unwrap();
        worker.status = HealthStatus::Healthy;
        db.save_worker(&worker).await.unwrap();

        let all = db.list_workers().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn missing_worker_is_not_found() {
        let db = test_db().await;
        let err = db.get_worker(WorkerId::new()).await.unwrap_err();
        assert!(err.is_not_found());
        let err = db
            .update_worker_status(WorkerId::new(), HealthStatus::Exited)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn active_workers_exclude_exited() {
        let db = test_db().await;
        let live = Worker::new(WorkerId::new(), spec());
        let dead = Worker::new(WorkerId::new(), spec());
        db.save_worker(&live).await.unwrap();
        db.save_worker(&dead).await.unwrap();
        db.update_worker_status(dead.id, HealthStatus::Exited)
            .await
            .unwrap();

        let active = db.list_active_workers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
        assert_eq!(db.list_workers().await.unwrap().len(), 2);
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn job_round_trip_with_worker() {
        let db = test_db().await;
        let mut job = Job::new(spec(), TaskKind::Agent);
        db.save_job(&job).await.unwrap();
        assert_eq!(db.get_job(job.id).await.unwrap().worker_id, None);

        let worker_id = WorkerId::new();
        job.mark_running(Some(worker_id));
        db.save_job(&job).await.unwrap();
        let fetched = db.get_job(job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.worker_id, Some(worker_id));

        job.fail("boom");
        db.save_job(&job).await.unwrap();
        let fetched = db.get_job(job.id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
        assert_eq!(db.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn jobs_listed_in_submission_order() {
        let db = test_db().await;
        let first = Job::new(spec(), TaskKind::Text);
        let second = Job::new(spec(), TaskKind::Image);
        db.save_job(&first).await.unwrap();
        db.save_job(&second).await.unwrap();

        let pending = db.list_jobs_by_status(JobStatus::Pending).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(pending[1].task, TaskKind::Image);
        assert!(db
            .list_jobs_by_status(JobStatus::Running)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let db = test_db().await;
        assert!(db.get_job(JobId::new()).await.unwrap_err().is_not_found());
    }

    // ── Settings tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn settings_round_trip() {
        let db = test_db().await;
        assert!(db.get_setting("providers").await.unwrap().is_none());

        db.set_setting("providers", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        db.set_setting("providers", &serde_json::json!({"v": 2}))
            .await
            .unwrap();
        let value = db.get_setting("providers").await.unwrap().unwrap();
        assert_eq!(value["v"], 2);
    }

    #[tokio::test]
    async fn local_file_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("aule.db");
        let job = Job::new(spec(), TaskKind::Agent);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.save_job(&job).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_job(job.id).await.unwrap().id, job.id);
    }
}
