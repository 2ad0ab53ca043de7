//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Read an environment variable and parse it, falling back to `default`
/// when the variable is unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    parse_or(key, std::env::var(key).ok(), default)
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring malformed configuration value");
                default
            }
        },
        None => default,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `CALC_LOG_DIR`: directory for daily-rolling log files. Logs go to
/// stderr only when unset. Read on its own so logging can start before
/// the rest of the configuration is parsed.
pub fn log_dir_from_env() -> Option<PathBuf> {
    env_string("CALC_LOG_DIR").map(PathBuf::from)
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// Path of the libSQL database file (`:memory:` keeps everything in RAM).
    pub db_path: String,
    /// Number of in-process worker agents started with the server.
    pub local_workers: usize,
    /// Shared secret remote workers present as a bearer token. The worker
    /// routes are open when unset.
    pub worker_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_path: "./data/calc.db".to_string(),
            local_workers: 4,
            worker_token: None,
        }
    }
}

impl ServerConfig {
    /// Build from `CALC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = match env_string("CALC_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "CALC_BIND_ADDR".to_string(),
                message: format!("{raw:?}: {e}"),
            })?,
            None => defaults.bind_addr,
        };

        Ok(Self {
            bind_addr,
            db_path: env_string("CALC_DB_PATH").unwrap_or(defaults.db_path),
            local_workers: env_or("CALC_LOCAL_WORKERS", defaults.local_workers),
            worker_token: env_string("CALC_WORKER_TOKEN"),
        })
    }
}

/// Scheduler, sweeper and event bus tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Assignment deadline = operator delay * this multiplier.
    pub timeout_multiplier: u32,
    /// Floor for assignment deadlines so zero-delay operators still get time to report.
    pub min_assignment_timeout: Duration,
    /// Workers silent for longer than this become unavailable.
    pub liveness_threshold: Duration,
    /// How often the timeout and liveness sweeps run.
    pub sweep_interval: Duration,
    /// Per-subscriber event buffer before the oldest events are dropped.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_multiplier: 3,
            min_assignment_timeout: Duration::from_millis(1000),
            liveness_threshold: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            event_buffer: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_multiplier: env_or("CALC_TIMEOUT_MULTIPLIER", defaults.timeout_multiplier)
                .max(1),
            min_assignment_timeout: Duration::from_millis(env_or(
                "CALC_MIN_ASSIGNMENT_TIMEOUT_MS",
                defaults.min_assignment_timeout.as_millis() as u64,
            )),
            liveness_threshold: Duration::from_secs(env_or(
                "CALC_LIVENESS_THRESHOLD_SECS",
                defaults.liveness_threshold.as_secs(),
            )),
            sweep_interval: Duration::from_millis(
                env_or(
                    "CALC_SWEEP_INTERVAL_MS",
                    defaults.sweep_interval.as_millis() as u64,
                )
                .max(10),
            ),
            event_buffer: env_or("CALC_EVENT_BUFFER", defaults.event_buffer).max(1),
        }
    }

    /// Deadline length for an assignment whose operator costs `delay`.
    pub fn assignment_timeout(&self, delay: Duration) -> Duration {
        delay
            .saturating_mul(self.timeout_multiplier)
            .max(self.min_assignment_timeout)
    }
}

/// Worker agent configuration (shared by the in-process pool and `calc-worker`).
#[derive(Debug, Clone)]
pub struct WorkerAgentConfig {
    /// Base URL of the orchestrator, used by remote workers.
    pub server_url: String,
    /// Worker id (or id prefix when several agents run in one process).
    pub worker_id: Option<String>,
    /// Number of agents to run.
    pub worker_count: usize,
    /// Bearer token for the orchestrator's worker routes.
    pub worker_token: Option<String>,
    pub heartbeat_interval: Duration,
    /// Base sleep between polls when nothing is ready.
    pub poll_backoff: Duration,
}

impl Default for WorkerAgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            worker_id: None,
            worker_count: 1,
            worker_token: None,
            heartbeat_interval: Duration::from_millis(1000),
            poll_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerAgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env_string("CALC_SERVER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.server_url),
            worker_id: env_string("CALC_WORKER_ID"),
            worker_count: env_or("CALC_WORKER_COUNT", defaults.worker_count).max(1),
            worker_token: env_string("CALC_WORKER_TOKEN"),
            heartbeat_interval: Duration::from_millis(
                env_or(
                    "CALC_HEARTBEAT_INTERVAL_MS",
                    defaults.heartbeat_interval.as_millis() as u64,
                )
                .max(10),
            ),
            poll_backoff: Duration::from_millis(
                env_or("CALC_POLL_BACKOFF_MS", defaults.poll_backoff.as_millis() as u64).max(1),
            ),
        }
    }
}
