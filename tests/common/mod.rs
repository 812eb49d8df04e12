//! Shared test doubles: an in-memory container runtime whose "containers"
//! answer the real watchdog protocol on their socket, and stub providers.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use aule::config::AuleConfig;
use aule::error::{ProviderError, RuntimeError};
use aule::events::EventBus;
use aule::llm::{GeneratedImage, ImageProvider, LlmProvider};
use aule::runtime::{ContainerInfo, ContainerRef, ContainerRequest, ContainerRuntime};
use aule::store::{Database, LibSqlBackend};
use aule::worker::watchdog::{self, WatchdogRequest, WatchdogResponse};
use aule::worker::{Job, JobId, JobScheduler, ProviderPair, WorkerLifecycle};

/// Maximum time any wait in a test may take before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const FAKE_LOG: &str = "worker booting\nfatal: no config\n";

/// How fake containers behave.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    /// The first create reports the image missing; after a pull it works.
    pub image_missing: bool,
    /// Every create fails.
    pub fail_create: bool,
    /// The runtime cannot be reached at all.
    pub unreachable: bool,
    /// The watchdog socket is never opened.
    pub never_healthy: bool,
    /// The watchdog answers health with `ok: false`.
    pub unhealthy: bool,
    /// The container stops right after start (socket still served).
    pub exits_immediately: bool,
    /// `execute` answers with an error.
    pub execute_fails: bool,
    /// Delay before answering `execute`.
    pub execute_delay: Option<Duration>,
    /// Delay before `inspect` answers.
    pub inspect_delay: Option<Duration>,
}

struct FakeContainer {
    labels: BTreeMap<String, String>,
    running: bool,
    server: Option<JoinHandle<()>>,
}

impl Drop for FakeContainer {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    behavior: Mutex<Behavior>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    pulled: Mutex<HashSet<String>>,
    requests: Mutex<Vec<ContainerRequest>>,
    pub creates: AtomicUsize,
    pub pulls: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Default::default()
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn behavior(&self) -> Behavior {
        *self.behavior.lock().unwrap()
    }

    /// Names of every container the runtime still knows about.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    pub fn requests(&self) -> Vec<ContainerRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Put a container in place as if an earlier process had created it.
    pub fn insert_container(&self, name: &str, labels: BTreeMap<String, String>, running: bool) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                labels,
                running,
                server: None,
            },
        );
    }

    fn not_found(name: &str) -> RuntimeError {
        RuntimeError::ContainerNotFound {
            container: name.to_string(),
        }
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.behavior().unreachable {
            return Err(RuntimeError::Unreachable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Host side of the `/run/aule` bind in a request.
fn socket_dir(request: &ContainerRequest) -> Option<PathBuf> {
    let suffix = format!(":{}:rw", watchdog::CONTAINER_SOCKET_DIR);
    request
        .binds
        .iter()
        .find_map(|bind| bind.strip_suffix(&suffix))
        .map(PathBuf::from)
}

fn serve_watchdog(listener: UnixListener, behavior: Behavior) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = watchdog::serve_connection(&mut stream, move |request| async move {
                    match request {
                        WatchdogRequest::Health if behavior.unhealthy => {
                            WatchdogResponse::error("dependencies missing")
                        }
                        WatchdogRequest::Health => WatchdogResponse::ok(),
                        WatchdogRequest::Execute { prompt } => {
                            if let Some(delay) = behavior.execute_delay {
                                tokio::time::sleep(delay).await;
                            }
                            if behavior.execute_fails {
                                WatchdogResponse::error("agent crashed")
                            } else {
                                WatchdogResponse::with_output(format!("done: {prompt}"))
                            }
                        }
                    }
                })
                .await;
            });
        }
    })
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(&self, request: &ContainerRequest) -> Result<String, RuntimeError> {
        self.check_reachable()?;
        let behavior = self.behavior();
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if behavior.image_missing && !self.pulled.lock().unwrap().contains(&request.image) {
            return Err(RuntimeError::ImageNotFound {
                image: request.image.clone(),
            });
        }
        if behavior.fail_create {
            return Err(RuntimeError::Operation {
                operation: "create",
                target: request.name.clone(),
                reason: "no space left on device".to_string(),
            });
        }

        let server = if behavior.never_healthy {
            None
        } else {
            let dir = socket_dir(request).ok_or_else(|| RuntimeError::Operation {
                operation: "create",
                target: request.name.clone(),
                reason: "no socket bind".to_string(),
            })?;
            let listener = UnixListener::bind(dir.join(watchdog::SOCKET_FILE)).map_err(|e| {
                RuntimeError::Operation {
                    operation: "create",
                    target: request.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            Some(serve_watchdog(listener, behavior))
        };

        let mut containers = self.containers.lock().unwrap();
        containers.insert(
            request.name.clone(),
            FakeContainer {
                labels: request.labels.clone(),
                running: !behavior.exits_immediately,
                server,
            },
        );
        let running = containers.values().filter(|c| c.running).count();
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        Ok(format!("fake-{}", request.name))
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        self.check_reachable()?;
        if let Some(delay) = self.behavior().inspect_delay {
            tokio::time::sleep(delay).await;
        }
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| ContainerInfo { running: c.running })
            .ok_or_else(|| Self::not_found(name))
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::not_found(name))?;
        container.running = false;
        if let Some(server) = container.server.take() {
            server.abort();
        }
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.containers
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRef>, RuntimeError> {
        self.check_reachable()?;
        let (key, value) = label_filter.split_once('=').unwrap_or((label_filter, ""));
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .iter()
            .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(name, c)| ContainerRef {
                name: name.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.pulled.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    fn stream_logs<'a>(
        &'a self,
        name: &str,
        _follow: bool,
    ) -> BoxStream<'a, Result<Vec<u8>, RuntimeError>> {
        let chunk = if self.has_container(name) {
            Ok(FAKE_LOG.as_bytes().to_vec())
        } else {
            Err(Self::not_found(name))
        };
        stream::iter(vec![chunk]).boxed()
    }
}

// ── Providers ───────────────────────────────────────────────────────────

/// Answers `"{name}: {prompt}"`.
pub struct StubLlm {
    pub name: &'static str,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn name(&self) -> &str {
        self.name
    }
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        Ok(format!("{}: {prompt}", self.name))
    }
}

/// Answers with a URL naming the provider.
pub struct StubImage {
    pub name: &'static str,
}

#[async_trait]
impl ImageProvider for StubImage {
    fn name(&self) -> &str {
        self.name
    }
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn generate(&self, _prompt: &str) -> Result<GeneratedImage, ProviderError> {
        Ok(GeneratedImage::Url {
            url: format!("https://images.test/{}.png", self.name),
        })
    }
}

/// Holds every call until `gate` is notified.
pub struct GatedLlm {
    pub name: &'static str,
    pub gate: Arc<Notify>,
    pub entered: Arc<Notify>,
}

#[async_trait]
impl LlmProvider for GatedLlm {
    fn name(&self) -> &str {
        self.name
    }
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(format!("{}: {prompt}", self.name))
    }
}

pub fn stub_pair(tag: &'static str) -> ProviderPair {
    let (llm, image) = match tag {
        "v2" => ("v2-llm", "v2-image"),
        _ => ("v1-llm", "v1-image"),
    };
    ProviderPair::new(
        Arc::new(StubLlm { name: llm }),
        Arc::new(StubImage { name: image }),
    )
}

// ── Harness ─────────────────────────────────────────────────────────────

/// Defaults with short timeouts and a private workers directory.
pub fn test_config(workers_dir: &Path, max_concurrent_jobs: usize) -> AuleConfig {
    let mut config = AuleConfig::from_lookup(|_| None).unwrap();
    config.sandbox.workers_dir = workers_dir.to_path_buf();
    config.scheduler.max_concurrent_jobs = max_concurrent_jobs;
    config.scheduler.task_timeout = Duration::from_secs(5);
    config.health.timeout = Duration::from_secs(5);
    config.health.poll_interval = Duration::from_millis(20);
    config.health.probe_timeout = Duration::from_millis(200);
    config
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: AuleConfig,
    pub db: Arc<dyn Database>,
    pub runtime: Arc<FakeRuntime>,
    pub events: EventBus,
    pub lifecycle: Arc<WorkerLifecycle>,
    pub scheduler: Arc<JobScheduler>,
}

impl Harness {
    pub async fn new(max_concurrent_jobs: usize, behavior: Behavior) -> Self {
        Self::with(max_concurrent_jobs, behavior, |_| {}).await
    }

    /// Like [`Harness::new`], with a chance to adjust the config first.
    pub async fn with(
        max_concurrent_jobs: usize,
        behavior: Behavior,
        adjust: impl FnOnce(&mut AuleConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), max_concurrent_jobs);
        adjust(&mut config);

        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runtime = Arc::new(FakeRuntime::new(behavior));
        let events = EventBus::new();
        let runtime_dyn: Arc<dyn ContainerRuntime> = runtime.clone();
        let lifecycle = Arc::new(WorkerLifecycle::new(
            Arc::clone(&db),
            runtime_dyn,
            stub_pair("v1"),
            events.clone(),
            &config,
        ));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&lifecycle),
            config.scheduler.max_concurrent_jobs,
        ));
        Self {
            dir,
            config,
            db,
            runtime,
            events,
            lifecycle,
            scheduler,
        }
    }

    pub fn workers_dir(&self) -> &Path {
        &self.config.sandbox.workers_dir
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.db.get_job(id).await.unwrap()
    }

    /// Wait until the job row is terminal.
    pub async fn wait_terminal(&self, id: JobId) -> Job {
        let db = Arc::clone(&self.db);
        wait_for(move || {
            let db = Arc::clone(&db);
            async move { db.get_job(id).await.ok().filter(|job| job.status.is_terminal()) }
        })
        .await
    }
}

/// Poll `probe` until it yields `Some`, failing the test after [`TEST_TIMEOUT`].
pub async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Poll a synchronous condition.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    wait_for(|| {
        let done = condition();
        async move { done.then_some(()) }
    })
    .await
}
