use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const ENV_PREFIX: &str = "CADENCE_";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
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

/// Tuning knobs for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on job executions running at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// A run still going after this many seconds is recorded as an error.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// `lastError` is cut to this many characters before it is stored.
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    /// Longest the loop sleeps without re-reading the wall clock.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Fire jobs that came due while the process was down once at startup.
    /// When false they are re-armed from the current time instead.
    #[serde(default = "bool_true")]
    pub catch_up_missed: bool,
    /// Run records kept per job.
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
}

impl SchedulerConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout_secs: default_run_timeout_secs(),
            max_error_chars: default_max_error_chars(),
            poll_interval_secs: default_poll_interval_secs(),
            catch_up_missed: true,
            run_history_limit: default_run_history_limit(),
        }
    }
}

/// Where job payloads are sent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// HTTP endpoint of the action runtime. Unset means every run fails with
    /// "no action runtime configured".
    pub endpoint: Option<String>,
    /// Optional bearer token sent with each request.
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Run `payload.command` through `sh -c` before forwarding the message.
    #[serde(default = "bool_true")]
    pub allow_commands: bool,
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            allow_commands: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_concurrent_runs() -> usize {
    8
}
fn default_run_timeout_secs() -> u64 {
    300
}
fn default_max_error_chars() -> usize {
    2_000
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_run_history_limit() -> usize {
    50
}
fn default_request_timeout_secs() -> u64 {
    330
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `CADENCE_SCHEDULER__RUN_TIMEOUT_SECS=60`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
