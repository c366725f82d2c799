use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BatchError, Result};

pub const DEFAULT_SESSION_URL: &str = "https://ws-uv.canfar.net/skaha/v0/session";
pub const DEFAULT_IMAGE_URL: &str = "https://ws-uv.canfar.net/skaha/v0/image";
pub const DEFAULT_TASK_IMAGE: &str = "images.canfar.net/srcnet/sofia-task:latest";

/// Which [`JobBackend`](crate::backend::JobBackend) implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Rest,
    Session,
}

/// Connection settings for the SKAHA session API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub session_url: String,
    pub image_url: String,
    /// CADC proxy certificate (PEM, certificate and key).
    pub certificate: Option<PathBuf>,
    /// Bearer token; only the session client uses it.
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Rest,
            session_url: DEFAULT_SESSION_URL.to_string(),
            image_url: DEFAULT_IMAGE_URL.to_string(),
            certificate: default_certificate(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

/// `$CADC_CERTIFICATE`, falling back to `$HOME/.ssl/cadcproxy.pem`.
fn default_certificate() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CADC_CERTIFICATE") {
        return Some(PathBuf::from(path));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| Path::new(&home).join(".ssl").join("cadcproxy.pem"))
}

/// Batch configuration file (TOML).
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Remote working directory under the `/arc/` mount.
    pub vos_dir: String,
    /// Data cube in remote storage, or a local file when `stage_image` is set.
    pub image_file: String,
    /// Local directory holding one `*.par` file per subregion.
    pub parameter_file_dir: PathBuf,
    /// Local directory profile logs are copied back into.
    pub logs_dir: PathBuf,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_ram_gib")]
    pub ram_gib: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_task_image")]
    pub task_image: String,
    #[serde(default)]
    pub fail_fast: bool,
    /// `image_file` is a local cube to copy into `vos_dir` before submitting.
    #[serde(default)]
    pub stage_image: bool,
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_consecutive_query_failures: Option<u32>,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_cores() -> u32 {
    8
}

fn default_ram_gib() -> u32 {
    32
}

fn default_max_concurrency() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_task_image() -> String {
    DEFAULT_TASK_IMAGE.to_string()
}

impl BatchConfig {
    /// Read and validate a batch configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BatchError::Config(format!(
                "configuration file does not exist: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BatchConfig =
            toml::from_str(content).map_err(|e| BatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vos_dir.trim().is_empty() {
            return Err(BatchError::Config("vos_dir must not be empty".to_string()));
        }
        if self.image_file.trim().is_empty() {
            return Err(BatchError::Config("image_file must not be empty".to_string()));
        }
        if self.cores == 0 {
            return Err(BatchError::Config("cores must be positive".to_string()));
        }
        if self.ram_gib == 0 {
            return Err(BatchError::Config("ram_gib must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(BatchError::Config(
                "max_concurrency must be positive".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(BatchError::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_consecutive_query_failures: self.max_consecutive_query_failures,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.max_concurrency,
            controller: self.controller(),
            fail_fast: self.fail_fast,
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Polling behaviour of a single job lifecycle controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    /// Give up with `BackendUnavailable` after this many failed status
    /// queries in a row. `None` retries forever.
    pub max_consecutive_query_failures: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_consecutive_query_failures: None,
        }
    }
}

impl ControllerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub controller: ControllerConfig,
    /// Cancel the rest of the batch after the first failed job.
    pub fail_fast: bool,
    /// Per-job deadline; expiry cancels the job and kills its session.
    pub job_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            controller: ControllerConfig::default(),
            fail_fast: false,
            job_timeout: None,
        }
    }
}
