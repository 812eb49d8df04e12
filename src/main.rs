use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use aule::config::AuleConfig;
use aule::events::EventBus;
use aule::llm::{self, ImageConfig, LlmConfig};
use aule::runtime::{ContainerRuntime, DockerRuntime};
use aule::settings::{ProviderSettings, SettingsStore};
use aule::store::{Database, LibSqlBackend};
use aule::worker::{
    JobId, JobScheduler, ProviderPair, StartupReconciler, TaskKind, WorkerLifecycle, WorkerSpec,
};

/// One line of stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Submit {
        #[serde(default)]
        spec: WorkerSpec,
        #[serde(default)]
        task: TaskKind,
    },
    Cancel {
        job_id: JobId,
    },
    Status {
        job_id: JobId,
    },
    Providers {
        llm: LlmConfig,
        image: ImageConfig,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AuleConfig::from_env().context("invalid configuration")?;

    eprintln!("Aule v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workers: {}", config.sandbox.workers_dir.display());
    eprintln!("   Max concurrent jobs: {}", config.scheduler.max_concurrent_jobs);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Container runtime ────────────────────────────────────────────────
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect_local()
            .await
            .context("container runtime unavailable")?,
    );

    tokio::fs::create_dir_all(&config.sandbox.workers_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create workers directory {}",
                config.sandbox.workers_dir.display()
            )
        })?;

    let events = EventBus::new();

    // ── Startup reconciliation: nothing runs until this passes ───────────
    let report = StartupReconciler::new(
        Arc::clone(&db),
        Arc::clone(&runtime),
        config.sandbox.workers_dir.clone(),
        events.clone(),
    )
    .run()
    .await
    .context("startup reconciliation failed")?;
    eprintln!(
        "   Reconciled: {} interrupted jobs, {} containers reaped, {} workers exited",
        report.jobs_interrupted, report.containers_reaped, report.workers_exited
    );

    // ── Providers and settings ───────────────────────────────────────────
    let settings = SettingsStore::load(Arc::clone(&db), ProviderSettings::from_config(&config))
        .await
        .context("failed to load provider settings")?;
    let current = settings.current();
    let providers = ProviderPair::new(
        llm::create_llm_provider(&current.llm)?,
        llm::create_image_provider(&current.image)?,
    );

    let lifecycle = Arc::new(WorkerLifecycle::new(
        Arc::clone(&db),
        Arc::clone(&runtime),
        providers,
        events.clone(),
        &config,
    ));
    let _settings_handle = lifecycle.watch_settings(settings.subscribe());

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(JobScheduler::new(
        Arc::clone(&lifecycle),
        config.scheduler.max_concurrent_jobs,
    ));
    scheduler.start().await;
    let resumed = scheduler.resume_pending().await?;
    if resumed > 0 {
        eprintln!("   Resumed {} pending jobs", resumed);
    }

    eprintln!("   Reading JSON commands from stdin. Ctrl-C to stop.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Command>(&line) {
                    Ok(command) => handle(command, &scheduler, &settings).await,
                    Err(e) => eprintln!("invalid command: {e}"),
                }
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

async fn handle(command: Command, scheduler: &JobScheduler, settings: &SettingsStore) {
    match command {
        Command::Submit { spec, task } => match scheduler.submit(spec, task).await {
            Ok(job_id) => println!("{}", serde_json::json!({ "job_id": job_id })),
            Err(e) => eprintln!("submit failed: {e}"),
        },
        Command::Cancel { job_id } => {
            let cancelled = scheduler.cancel(job_id);
            println!("{}", serde_json::json!({ "job_id": job_id, "cancelled": cancelled }));
        }
        Command::Status { job_id } => match scheduler.get_job(job_id).await {
            Ok(job) => match serde_json::to_string(&job) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to encode job: {e}"),
            },
            Err(e) => eprintln!("status failed: {e}"),
        },
        Command::Providers { llm, image } => {
            if let Err(e) = settings.update(ProviderSettings { llm, image }).await {
                eprintln!("settings update failed: {e}");
            }
        }
    }
}
