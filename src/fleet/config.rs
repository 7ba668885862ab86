//! Configuration resolution for the fleet subsystem.
//!
//! Every tunable follows a three-tier priority:
//!
//! 1. **Parameter** - explicitly set on [`FleetConfig`] by the embedding code
//! 2. **Environment Variable** - value from a `FLEET_*` variable
//! 3. **Default** - built-in default value
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_CONNECT_TIMEOUT` | 30s | TCP connect + SSH handshake timeout |
//! | `FLEET_COMMAND_TIMEOUT` | 30s | Default command execution timeout |
//! | `FLEET_DNS_TIMEOUT` | 5s | DNS resolution timeout for diagnostics |
//! | `FLEET_POOL_MAX_SESSIONS` | 10 | Sessions per target |
//! | `FLEET_POOL_ACQUIRE_TIMEOUT` | 30s | Wait for a free session |
//! | `FLEET_POOL_IDLE_TIMEOUT` | 300s | Idle time before a session is evicted |
//! | `FLEET_POOL_SWEEP_INTERVAL` | 60s | Idle sweep period |
//! | `FLEET_MAX_DIAGNOSTIC_CONNECTIONS` | 10 | Concurrent connection tests |
//! | `FLEET_CONFIG_CACHE_TTL` | 60s | Decrypted connection config cache TTL |
//! | `FLEET_QUEUE_CONCURRENCY` | 5 | Collection workers |
//! | `FLEET_JOB_ATTEMPTS` | 3 | Attempts per collection job |
//! | `FLEET_JOB_BACKOFF_MS` | 5000ms | Base retry delay, doubled per attempt |
//! | `FLEET_FAILURE_THRESHOLD` | 10 | Consecutive failures before auto-disable |
//! | `FLEET_FAILURE_TTL` | 86400s | Failure counter expiry |
//! | `FLEET_LATEST_METRICS_TTL` | 3600s | Latest snapshot cache TTL |
//! | `FLEET_AGGREGATE_METRICS_TTL` | 60s | Fleet aggregate cache TTL |
//! | `FLEET_METRICS_TIMEOUT` | 30s | Metrics script timeout |
//! | `FLEET_DEFAULT_METRICS_INTERVAL` | 300s | Interval used when a target has none |
//! | `FLEET_COMPRESSION` | true | Enable zlib compression |

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default TCP connect + handshake timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

pub(crate) const DEFAULT_DNS_TIMEOUT_SECS: u64 = 5;

pub(crate) const DEFAULT_POOL_MAX_SESSIONS: usize = 10;

pub(crate) const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Sessions idle for longer than this are closed by the sweeper (5 minutes)
pub(crate) const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 300;

pub(crate) const DEFAULT_POOL_SWEEP_INTERVAL_SECS: u64 = 60;

pub(crate) const DEFAULT_MAX_DIAGNOSTIC_CONNECTIONS: usize = 10;

pub(crate) const DEFAULT_CONFIG_CACHE_TTL_SECS: u64 = 60;

pub(crate) const DEFAULT_QUEUE_CONCURRENCY: usize = 5;

pub(crate) const DEFAULT_JOB_ATTEMPTS: u32 = 3;

pub(crate) const DEFAULT_JOB_BACKOFF_MS: u64 = 5000;

/// Consecutive collection failures before metrics are switched off
pub(crate) const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Failure counters expire after 24 hours without a new failure
pub(crate) const DEFAULT_FAILURE_TTL_SECS: u64 = 24 * 60 * 60;

pub(crate) const DEFAULT_LATEST_METRICS_TTL_SECS: u64 = 60 * 60;

pub(crate) const DEFAULT_AGGREGATE_METRICS_TTL_SECS: u64 = 60;

pub(crate) const DEFAULT_METRICS_TIMEOUT_SECS: u64 = 30;

pub(crate) const DEFAULT_METRICS_INTERVAL_SECS: u64 = 300;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "FLEET_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "FLEET_COMMAND_TIMEOUT";
pub(crate) const DNS_TIMEOUT_ENV_VAR: &str = "FLEET_DNS_TIMEOUT";
pub(crate) const POOL_MAX_SESSIONS_ENV_VAR: &str = "FLEET_POOL_MAX_SESSIONS";
pub(crate) const POOL_ACQUIRE_TIMEOUT_ENV_VAR: &str = "FLEET_POOL_ACQUIRE_TIMEOUT";
pub(crate) const POOL_IDLE_TIMEOUT_ENV_VAR: &str = "FLEET_POOL_IDLE_TIMEOUT";
pub(crate) const POOL_SWEEP_INTERVAL_ENV_VAR: &str = "FLEET_POOL_SWEEP_INTERVAL";
pub(crate) const MAX_DIAGNOSTIC_CONNECTIONS_ENV_VAR: &str = "FLEET_MAX_DIAGNOSTIC_CONNECTIONS";
pub(crate) const CONFIG_CACHE_TTL_ENV_VAR: &str = "FLEET_CONFIG_CACHE_TTL";
pub(crate) const QUEUE_CONCURRENCY_ENV_VAR: &str = "FLEET_QUEUE_CONCURRENCY";
pub(crate) const JOB_ATTEMPTS_ENV_VAR: &str = "FLEET_JOB_ATTEMPTS";
pub(crate) const JOB_BACKOFF_MS_ENV_VAR: &str = "FLEET_JOB_BACKOFF_MS";
pub(crate) const FAILURE_THRESHOLD_ENV_VAR: &str = "FLEET_FAILURE_THRESHOLD";
pub(crate) const FAILURE_TTL_ENV_VAR: &str = "FLEET_FAILURE_TTL";
pub(crate) const LATEST_METRICS_TTL_ENV_VAR: &str = "FLEET_LATEST_METRICS_TTL";
pub(crate) const AGGREGATE_METRICS_TTL_ENV_VAR: &str = "FLEET_AGGREGATE_METRICS_TTL";
pub(crate) const METRICS_TIMEOUT_ENV_VAR: &str = "FLEET_METRICS_TIMEOUT";
pub(crate) const DEFAULT_METRICS_INTERVAL_ENV_VAR: &str = "FLEET_DEFAULT_METRICS_INTERVAL";
pub(crate) const COMPRESSION_ENV_VAR: &str = "FLEET_COMPRESSION";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// Unparseable environment values are ignored.
pub(crate) fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

fn resolve_secs(env_var: &str, default_secs: u64) -> Duration {
    Duration::from_secs(resolve(None, env_var, default_secs))
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// All tunables of the fleet subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub dns_timeout: Duration,
    pub pool_max_sessions: usize,
    pub pool_acquire_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_sweep_interval: Duration,
    pub max_diagnostic_connections: usize,
    pub config_cache_ttl: Duration,
    pub queue_concurrency: usize,
    pub job_attempts: u32,
    pub job_backoff: Duration,
    pub failure_threshold: u32,
    pub failure_ttl: Duration,
    pub latest_metrics_ttl: Duration,
    pub aggregate_metrics_ttl: Duration,
    pub metrics_timeout: Duration,
    pub default_metrics_interval: Duration,
    pub compression: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            dns_timeout: Duration::from_secs(DEFAULT_DNS_TIMEOUT_SECS),
            pool_max_sessions: DEFAULT_POOL_MAX_SESSIONS,
            pool_acquire_timeout: Duration::from_secs(DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS),
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            pool_sweep_interval: Duration::from_secs(DEFAULT_POOL_SWEEP_INTERVAL_SECS),
            max_diagnostic_connections: DEFAULT_MAX_DIAGNOSTIC_CONNECTIONS,
            config_cache_ttl: Duration::from_secs(DEFAULT_CONFIG_CACHE_TTL_SECS),
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            job_attempts: DEFAULT_JOB_ATTEMPTS,
            job_backoff: Duration::from_millis(DEFAULT_JOB_BACKOFF_MS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_ttl: Duration::from_secs(DEFAULT_FAILURE_TTL_SECS),
            latest_metrics_ttl: Duration::from_secs(DEFAULT_LATEST_METRICS_TTL_SECS),
            aggregate_metrics_ttl: Duration::from_secs(DEFAULT_AGGREGATE_METRICS_TTL_SECS),
            metrics_timeout: Duration::from_secs(DEFAULT_METRICS_TIMEOUT_SECS),
            default_metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            compression: true,
        }
    }
}

impl FleetConfig {
    /// Build a configuration from `FLEET_*` environment variables, falling
    /// back to defaults for anything unset or invalid.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_secs(CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: resolve_secs(COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS),
            dns_timeout: resolve_secs(DNS_TIMEOUT_ENV_VAR, DEFAULT_DNS_TIMEOUT_SECS),
            pool_max_sessions: resolve(None, POOL_MAX_SESSIONS_ENV_VAR, DEFAULT_POOL_MAX_SESSIONS)
                .max(1),
            pool_acquire_timeout: resolve_secs(
                POOL_ACQUIRE_TIMEOUT_ENV_VAR,
                DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS,
            ),
            pool_idle_timeout: resolve_secs(
                POOL_IDLE_TIMEOUT_ENV_VAR,
                DEFAULT_POOL_IDLE_TIMEOUT_SECS,
            ),
            pool_sweep_interval: resolve_secs(
                POOL_SWEEP_INTERVAL_ENV_VAR,
                DEFAULT_POOL_SWEEP_INTERVAL_SECS,
            )
            .max(Duration::from_secs(1)),
            max_diagnostic_connections: resolve(
                None,
                MAX_DIAGNOSTIC_CONNECTIONS_ENV_VAR,
                DEFAULT_MAX_DIAGNOSTIC_CONNECTIONS,
            )
            .max(1),
            config_cache_ttl: resolve_secs(CONFIG_CACHE_TTL_ENV_VAR, DEFAULT_CONFIG_CACHE_TTL_SECS),
            queue_concurrency: resolve(None, QUEUE_CONCURRENCY_ENV_VAR, DEFAULT_QUEUE_CONCURRENCY)
                .max(1),
            job_attempts: resolve(None, JOB_ATTEMPTS_ENV_VAR, DEFAULT_JOB_ATTEMPTS).max(1),
            job_backoff: Duration::from_millis(resolve(
                None,
                JOB_BACKOFF_MS_ENV_VAR,
                DEFAULT_JOB_BACKOFF_MS,
            )),
            failure_threshold: resolve(None, FAILURE_THRESHOLD_ENV_VAR, DEFAULT_FAILURE_THRESHOLD)
                .max(1),
            failure_ttl: resolve_secs(FAILURE_TTL_ENV_VAR, DEFAULT_FAILURE_TTL_SECS),
            latest_metrics_ttl: resolve_secs(
                LATEST_METRICS_TTL_ENV_VAR,
                DEFAULT_LATEST_METRICS_TTL_SECS,
            ),
            aggregate_metrics_ttl: resolve_secs(
                AGGREGATE_METRICS_TTL_ENV_VAR,
                DEFAULT_AGGREGATE_METRICS_TTL_SECS,
            ),
            metrics_timeout: resolve_secs(METRICS_TIMEOUT_ENV_VAR, DEFAULT_METRICS_TIMEOUT_SECS),
            default_metrics_interval: resolve_secs(
                DEFAULT_METRICS_INTERVAL_ENV_VAR,
                DEFAULT_METRICS_INTERVAL_SECS,
            )
            .max(Duration::from_secs(1)),
            compression: resolve_compression(None),
        }
    }
}
