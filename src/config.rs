//! TOML configuration for testpilot.
//!
//! A layered configuration model with sensible defaults, an environment
//! variable override for the config file path, and a standard filesystem
//! location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TESTPILOT_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/testpilot/testpilot.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the testpilot process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl RunnerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded testpilot configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `TESTPILOT_CONFIG` environment variable.
    /// 2. `/etc/testpilot/testpilot.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTPILOT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file holding runs, the message table and leases.
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/testpilot.db"),
            pool_size: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Message transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix for queue names and lease keys (`<prefix>_env_<id>`,
    /// `<prefix>_env_processing_<id>`, ...).
    pub prefix: String,
    /// TTL of the per-environment partition lease. Refreshed by heartbeats.
    pub env_lease_ttl_secs: u64,
    /// A claimed message whose heartbeat is older than this is delivered again.
    pub redeliver_after_secs: u64,
    /// Idle sleep between poll cycles that found nothing.
    pub poll_interval_ms: u64,
    /// Delay before a message whose processing errored is served again.
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "test_runner".to_string(),
            env_lease_ttl_secs: 1800,
            redeliver_after_secs: 14_400,
            poll_interval_ms: 1000,
            retry_delay_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn env_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.env_lease_ttl_secs)
    }

    pub fn redeliver_after(&self) -> Duration {
        Duration::from_secs(self.redeliver_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent queue consumers in this process.
    pub count: usize,
    /// How often long-running stages renew their lease and heartbeat.
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            heartbeat_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Test-run pipeline settings and the external test commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// TTL of the per-run lease taken by every phase handler.
    pub run_lease_ttl_secs: u64,
    /// Upper bound on waiting for a contended run lease (0 = non-blocking).
    pub run_lease_wait_ms: u64,
    /// Shell used to run command templates.
    pub shell: String,
    /// MFTF command template; `{filter}` is replaced by the test filter.
    pub mftf_command: String,
    /// Playwright command template; `{filter}` is replaced by the test filter.
    pub playwright_command: String,
    /// Per-run scratch directories live under here.
    pub work_dir: PathBuf,
    /// Run summaries are written here.
    pub report_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_lease_ttl_secs: 3600,
            run_lease_wait_ms: 0,
            shell: "/bin/sh".to_string(),
            mftf_command: "vendor/bin/mftf run:test {filter}".to_string(),
            playwright_command: "npx playwright test {filter}".to_string(),
            work_dir: PathBuf::from("var/test-runs"),
            report_dir: PathBuf::from("var/test-reports"),
        }
    }
}

impl PipelineConfig {
    pub fn run_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.run_lease_ttl_secs)
    }

    pub fn run_lease_wait(&self) -> Duration {
        Duration::from_millis(self.run_lease_wait_ms)
    }
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Job lease TTL; also the hard cap on a single job's runtime.
    pub lease_ttl_secs: u64,
    /// Shell used to run job commands.
    pub shell: String,
    /// Scheduler loop tick.
    pub tick_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 3600,
            shell: "/bin/sh".to_string(),
            tick_secs: 10,
        }
    }
}

impl CronConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Incoming-webhook URL; Slack is skipped when unset.
    pub slack_webhook_url: Option<String>,
    /// sendmail-compatible command reading a full message on stdin.
    pub sendmail_command: String,
    /// Upper bound on one sendmail invocation; the process is killed after it.
    pub sendmail_timeout_secs: u64,
    /// `From:` address for emails.
    pub from_address: String,
    /// Public base URL used to build links to runs.
    pub base_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: None,
            sendmail_command: "/usr/sbin/sendmail -t -i".to_string(),
            sendmail_timeout_secs: 60,
            from_address: "testpilot@localhost".to_string(),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl NotificationConfig {
    pub fn sendmail_timeout(&self) -> Duration {
        Duration::from_secs(self.sendmail_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
