//! Serializable data model shared by the fleet components and MCP tools.
//!
//! Timestamps are RFC3339 strings so every type can derive `JsonSchema`
//! without extra schemars features.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Operating system family of a managed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    #[default]
    Linux,
    Windows,
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformType::Linux => write!(f, "linux"),
            PlatformType::Windows => write!(f, "windows"),
        }
    }
}

/// How a target authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
    KeyWithPassphrase,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Password => write!(f, "password"),
            AuthKind::Key => write!(f, "key"),
            AuthKind::KeyWithPassphrase => write!(f, "key+passphrase"),
        }
    }
}

/// Host key verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostKeyPolicy {
    /// Key must match one of the stored fingerprints.
    StrictPinned,
    /// Trust on first use: remember the first key seen.
    #[default]
    Tofu,
    /// Skip verification entirely.
    Disabled,
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::StrictPinned => write!(f, "STRICT_PINNED"),
            HostKeyPolicy::Tofu => write!(f, "TOFU"),
            HostKeyPolicy::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// Privilege escalation configured for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeMode {
    #[default]
    None,
    /// `sudo -n` works without a password.
    SudoPasswordless,
    /// `sudo -S` with a password fed on stdin.
    SudoPassword,
}

fn default_port() -> u16 {
    22
}

fn default_threshold() -> f64 {
    90.0
}

/// Target record as provided by the persistence collaborator.
///
/// Secrets are stored encrypted; `encrypted_secret` holds either the password
/// or the private key depending on `auth_kind`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TargetRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub encrypted_secret: String,
    #[serde(default)]
    pub encrypted_passphrase: Option<String>,
    #[serde(default)]
    pub platform: PlatformType,
    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default)]
    pub metrics_interval_secs: Option<u64>,
    #[serde(default = "default_threshold")]
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub alert_cpu_threshold: f64,
    #[serde(default = "default_threshold")]
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub alert_ram_threshold: f64,
    #[serde(default = "default_threshold")]
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub alert_disk_threshold: f64,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub known_fingerprints: Vec<String>,
    #[serde(default)]
    pub privilege_mode: PrivilegeMode,
    #[serde(default)]
    pub encrypted_sudo_password: Option<String>,
    /// Why metrics were last switched off automatically, if they were.
    #[serde(default)]
    pub metrics_disabled_reason: Option<String>,
}

/// One metrics collection result, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricsSnapshot {
    pub target_id: String,
    pub collected_at: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cpu_usage_percent: f64,
    pub cpu_cores: u32,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub memory_available_mb: u64,
    pub memory_usage_percent: f64,
    pub swap_total_mb: u64,
    pub swap_used_mb: u64,
    pub swap_usage_percent: f64,
    pub disk_total_gb: u64,
    pub disk_used_gb: u64,
    pub disk_free_gb: u64,
    pub disk_usage_percent: f64,
    pub uptime_seconds: u64,
    pub process_count: u32,
    pub os_name: String,
    pub kernel_version: String,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl MetricsSnapshot {
    /// Zeroed snapshot recording a failed collection attempt.
    pub fn failed(target_id: impl Into<String>, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            collected_at: chrono::Utc::now().to_rfc3339(),
            success: false,
            latency_ms,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Cross-target summary of the latest snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FleetAggregate {
    pub target_count: usize,
    pub reporting_count: usize,
    pub failing_count: usize,
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub avg_cpu_usage_percent: f64,
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub avg_memory_usage_percent: f64,
    #[schemars(schema_with = "crate::fleet::schema::percent")]
    pub avg_disk_usage_percent: f64,
    pub total_network_rx_bytes: u64,
    pub total_network_tx_bytes: u64,
    pub computed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HostKeyMismatch,
    HostKeyTrusted,
    ThresholdBreach,
    MetricsAutoDisabled,
}

/// Event handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FleetEvent {
    pub target_id: String,
    pub kind: EventKind,
    pub severity: EventSeverity,
    pub message: String,
    pub created_at: String,
}

impl FleetEvent {
    pub fn new(
        target_id: impl Into<String>,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            kind,
            severity,
            message: message.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Outcome of a single diagnostic stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed { error: String },
    Skipped { reason: String },
}

impl StageStatus {
    pub fn failed(error: impl Into<String>) -> Self {
        StageStatus::Failed {
            error: error.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StageStatus::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, StageStatus::Passed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DnsResult {
    #[serde(flatten)]
    pub status: StageStatus,
    pub elapsed_ms: u64,
    pub addresses: Vec<String>,
}

/// TCP connect plus SSH protocol handshake.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TcpResult {
    #[serde(flatten)]
    pub status: StageStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostKeyResult {
    #[serde(flatten)]
    pub status: StageStatus,
    pub policy: HostKeyPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Whether the presented key matched a stored fingerprint.
    pub matched: bool,
    /// Whether the key was persisted during this test (TOFU).
    pub newly_trusted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthResult {
    #[serde(flatten)]
    pub status: StageStatus,
    pub elapsed_ms: u64,
    pub method: AuthKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PrivilegeResult {
    #[serde(flatten)]
    pub status: StageStatus,
    pub elapsed_ms: u64,
    pub mode: PrivilegeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub command: String,
    #[serde(flatten)]
    pub status: StageStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Structured outcome of a connection diagnostic.
///
/// Stages that were never reached are `None`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionTestResult {
    pub target_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub tested_at: String,
    pub dns: DnsResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_verification: Option<HostKeyResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege_test: Option<PrivilegeResult>,
    pub command_execution: Vec<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_username: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Result of running one command through the executor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Retry,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Scheduled => write!(f, "scheduled"),
            TriggerKind::Manual => write!(f, "manual"),
            TriggerKind::Retry => write!(f, "retry"),
        }
    }
}

/// One repeatable schedule, as reported in queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RepeatableSchedule {
    pub target_id: String,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub interval_secs: u64,
    pub next_run_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub delayed: usize,
    pub paused: bool,
    pub repeatable: Vec<RepeatableSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TargetPoolStats {
    pub target_id: String,
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max: usize,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub commands_executed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub in_use: usize,
    pub idle: usize,
    pub targets: Vec<TargetPoolStats>,
}
