//! Configuration types, resolved from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::{ImageConfig, LlmConfig, ProviderBackend};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct AuleConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub health: HealthConfig,
    pub llm: LlmConfig,
    pub image: ImageConfig,
}

/// Admission control settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs holding a concurrency slot at once.
    pub max_concurrent_jobs: usize,
    /// Upper bound on a single dispatch.
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            task_timeout: Duration::from_secs(600),
        }
    }
}

/// Sandbox provisioning settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base directory under which per-worker host directories are created.
    pub workers_dir: PathBuf,
    /// Image used when a spec leaves `image` empty.
    pub default_image: String,
    /// Size cap of the in-container `/tmp` tmpfs (docker syntax, e.g. `64m`).
    pub tmpfs_size: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workers_dir: PathBuf::from("./data/workers"),
            default_image: "aule-worker:latest".to_string(),
            tmpfs_size: "64m".to_string(),
        }
    }
}

/// Health-wait settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How long a worker may take to report healthy.
    pub timeout: Duration,
    /// Delay between probes.
    pub poll_interval: Duration,
    /// Bound on a single watchdog probe. Kept sub-second.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

impl AuleConfig {
    /// Resolve configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Testable core of [`AuleConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_concurrent_jobs: usize = parse_or(&lookup, "AULE_MAX_CONCURRENT_JOBS", 10)?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AULE_MAX_CONCURRENT_JOBS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let scheduler = SchedulerConfig {
            max_concurrent_jobs,
            task_timeout: Duration::from_secs(parse_or(&lookup, "AULE_TASK_TIMEOUT_SECS", 600)?),
        };

        let sandbox = SandboxConfig {
            workers_dir: lookup("AULE_WORKERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/workers")),
            default_image: lookup("AULE_WORKER_IMAGE")
                .unwrap_or_else(|| "aule-worker:latest".to_string()),
            tmpfs_size: lookup("AULE_TMPFS_SIZE").unwrap_or_else(|| "64m".to_string()),
        };

        let probe_timeout_ms: u64 = parse_or(&lookup, "AULE_PROBE_TIMEOUT_MS", 500)?;
        if probe_timeout_ms >= 1000 {
            return Err(ConfigError::InvalidValue {
                key: "AULE_PROBE_TIMEOUT_MS".to_string(),
                message: "probe timeout must stay below one second".to_string(),
            });
        }
        let health = HealthConfig {
            timeout: Duration::from_secs(parse_or(&lookup, "AULE_HEALTH_TIMEOUT_SECS", 60)?),
            poll_interval: Duration::from_millis(parse_or(&lookup, "AULE_HEALTH_POLL_MS", 2000)?),
            probe_timeout: Duration::from_millis(probe_timeout_ms),
        };

        let llm_backend: ProviderBackend = parse_or(&lookup, "AULE_LLM_BACKEND", ProviderBackend::Local)?;
        let llm = LlmConfig {
            backend: llm_backend,
            base_url: lookup("AULE_LLM_URL").unwrap_or_else(|| match llm_backend {
                ProviderBackend::Local => "http://127.0.0.1:11434".to_string(),
                ProviderBackend::Remote => "https://api.openai.com".to_string(),
            }),
            model: lookup("AULE_LLM_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
            api_key: lookup("AULE_LLM_API_KEY").map(secrecy::SecretString::from),
            request_timeout: Duration::from_secs(parse_or(&lookup, "AULE_LLM_TIMEOUT_SECS", 120)?),
        };

        let image_backend: ProviderBackend =
            parse_or(&lookup, "AULE_IMAGE_BACKEND", ProviderBackend::Local)?;
        let image = ImageConfig {
            backend: image_backend,
            base_url: lookup("AULE_IMAGE_URL").unwrap_or_else(|| match image_backend {
                ProviderBackend::Local => "http://127.0.0.1:8188".to_string(),
                ProviderBackend::Remote => "https://api.openai.com".to_string(),
            }),
            model: lookup("AULE_IMAGE_MODEL").unwrap_or_else(|| "sdxl".to_string()),
            api_key: lookup("AULE_IMAGE_API_KEY").map(secrecy::SecretString::from),
            poll_interval: Duration::from_millis(parse_or(&lookup, "AULE_IMAGE_POLL_MS", 1000)?),
            job_timeout: Duration::from_secs(parse_or(&lookup, "AULE_IMAGE_TIMEOUT_SECS", 300)?),
        };

        Ok(Self {
            db_path: lookup("AULE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/aule.db")),
            scheduler,
            sandbox,
            health,
            llm,
            image,
        })
    }
}

/// Parse `key` if present, otherwise return `default`.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}
