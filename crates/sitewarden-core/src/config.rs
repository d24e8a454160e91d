use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8470;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Floor for the stuck-job threshold; anything lower would reap healthy runs.
pub const MIN_STUCK_THRESHOLD_SECS: u64 = 180;

/// Top-level config (sitewarden.toml + SITEWARDEN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitewardenConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webcron: WebcronConfig,
    #[serde(default)]
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Task runner tuning.
///
/// Every runner invocation is short-lived, so these values bound a single
/// cron tick rather than a long-running service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone cron expressions are authored in (e.g. "Europe/Athens").
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Hard cap for a single handler invocation, and the base of the
    /// runner's wall-clock budget.
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,
    /// Share of `max_execution_secs` the runner loop may spend (1-100).
    #[serde(default = "default_execution_bias_percent")]
    pub execution_bias_percent: u8,
    /// A job RUNNING for longer than this is considered abandoned.
    /// Never lower than [`MIN_STUCK_THRESHOLD_SECS`].
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// How long a runner waits for the job-selection lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Lifetime of a held lock row; lets a crashed holder's lock lapse.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Upper bound of the random delay before the first lock attempt.
    #[serde(default = "default_lock_jitter_ms")]
    pub lock_jitter_ms: u64,
    /// Pause between polls when `--loop` is set and nothing is due.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// The loop stops once less than this much budget remains.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_execution_secs: default_max_execution_secs(),
            execution_bias_percent: default_execution_bias_percent(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_jitter_ms: default_lock_jitter_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            safety_margin_secs: default_safety_margin_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs.max(1))
    }

    /// Wall-clock budget for one runner invocation.
    pub fn time_budget(&self) -> Duration {
        let bias = u64::from(self.execution_bias_percent.clamp(1, 100));
        Duration::from_millis(self.max_execution().as_millis() as u64 * bias / 100)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs.max(MIN_STUCK_THRESHOLD_SECS))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }
}

/// Web-triggered cron (`GET /cron`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebcronConfig {
    /// Shared secret expected in `?key=`. `None` leaves the endpoint open,
    /// which is only sensible on a loopback bind.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_log_dir")]
    pub directory: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_max_execution_secs() -> u64 {
    60
}
fn default_execution_bias_percent() -> u8 {
    75
}
fn default_stuck_threshold_secs() -> u64 {
    600
}
fn default_lock_timeout_secs() -> u64 {
    5
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_lock_jitter_ms() -> u64 {
    250
}
fn default_idle_sleep_ms() -> u64 {
    2_000
}
fn default_safety_margin_secs() -> u64 {
    5
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_db_path() -> String {
    format!("{}/.sitewarden/sitewarden.db", home_dir())
}
fn default_log_dir() -> String {
    format!("{}/.sitewarden/logs", home_dir())
}

impl SitewardenConfig {
    /// Load config from a TOML file with SITEWARDEN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SITEWARDEN_SCHEDULER__MAX_EXECUTION_SECS=120`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading configuration");

        let config: SitewardenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SITEWARDEN_").split("__"))
            .extract()
            .map_err(|e| crate::error::SitewardenError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/.sitewarden/sitewarden.toml", home_dir())
}
