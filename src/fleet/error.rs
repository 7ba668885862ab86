//! Error taxonomy and transport error classification.
//!
//! [`FleetError`] is the single error type flowing through the pool, executor,
//! collector and queue. Transport failures coming out of russh or the socket
//! layer are plain strings; they are classified into a [`TransportErrorKind`]
//! by matching lower-cased message fragments against the pattern tables below.
//!
//! # Classification Strategy
//!
//! 1. **Authentication Failures (NOT retryable)**: credential or permission
//!    problems that will not resolve by retrying.
//! 2. **Connection Errors (retryable)**: refused, reset, timed out, unreachable.
//! 3. **Unknown Errors**: retried unless they look like SSH protocol errors.
//!
//! Authentication patterns take precedence over connection patterns, so
//! "timeout during authentication failed" is never retried.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

const REFUSED_ERRORS: &[&str] = &["connection refused", "econnrefused"];

const TIMEOUT_ERRORS: &[&str] = &["timed out", "timeout", "etimedout"];

const HOST_NOT_FOUND_ERRORS: &[&str] = &[
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "nodename nor servname",
    "temporary failure in name resolution",
    "enotfound",
    "no addresses",
];

const RESET_ERRORS: &[&str] = &[
    "connection reset",
    "econnreset",
    "broken pipe",
    "connection aborted",
];

const KEEPALIVE_ERRORS: &[&str] = &["keepalive", "inactivity", "disconnected", "channel closed"];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "keepalive",
];

/// Operator-facing category of a transport level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Refused,
    TimedOut,
    HostNotFound,
    Reset,
    KeepaliveLost,
    AuthFailed,
    Other,
}

impl TransportErrorKind {
    /// Short explanation suitable for showing to an operator.
    pub fn describe(self) -> &'static str {
        match self {
            TransportErrorKind::Refused => "connection refused (is sshd running on that port?)",
            TransportErrorKind::TimedOut => "connection timed out (host unreachable or filtered)",
            TransportErrorKind::HostNotFound => "host not found (DNS resolution failed)",
            TransportErrorKind::Reset => "connection reset by the remote host",
            TransportErrorKind::KeepaliveLost => "connection lost (keepalive timeout)",
            TransportErrorKind::AuthFailed => "authentication failed (check credentials)",
            TransportErrorKind::Other => "SSH transport error",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Errors produced by the fleet subsystem.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("Command rejected: {0}")]
    Validation(String),

    #[error("Network error ({kind}): {message}")]
    Network {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Privilege escalation failed: {0}")]
    Privilege(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Session pool exhausted for target {target_id} after waiting {waited_secs}s")]
    PoolExhausted { target_id: String, waited_secs: u64 },

    #[error("Target {0} no longer exists")]
    TargetGone(String),

    #[error("Target {0} not found")]
    TargetNotFound(String),

    #[error("A connection test is already in progress for target {0}")]
    TestInProgress(String),

    #[error("Host key mismatch for target {target_id}: got {observed} (possible MITM)")]
    HostKeyMismatch { target_id: String, observed: String },

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Metrics collection is not supported for {0} targets")]
    UnsupportedPlatform(String),

    #[error("Metrics disabled for target {target_id} after {failures} consecutive failures")]
    CircuitOpen { target_id: String, failures: u32 },

    #[error("Repository error: {0}")]
    Repository(String),
}

impl FleetError {
    /// Build a network or auth error from a raw transport message.
    pub fn from_transport(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_transport_error(&message) {
            TransportErrorKind::AuthFailed => FleetError::Auth(message),
            kind => FleetError::Network { kind, message },
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        FleetError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Whether a scheduled job failing with this error should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Network { message, .. } => is_retryable_error(message),
            FleetError::Timeout { .. } | FleetError::PoolExhausted { .. } => true,
            FleetError::Protocol(message) | FleetError::Repository(message) => {
                is_retryable_error(message)
            }
            FleetError::Validation(_)
            | FleetError::Auth(_)
            | FleetError::Privilege(_)
            | FleetError::TargetGone(_)
            | FleetError::TargetNotFound(_)
            | FleetError::TestInProgress(_)
            | FleetError::HostKeyMismatch { .. }
            | FleetError::Credential(_)
            | FleetError::UnsupportedPlatform(_)
            | FleetError::CircuitOpen { .. } => false,
        }
    }
}

/// Classify a transport error message into an operator-facing category.
///
/// Authentication patterns are checked first, then host resolution (a DNS
/// failure message often also mentions "temporary failure"), then the
/// socket-level categories.
pub fn classify_transport_error(error: &str) -> TransportErrorKind {
    let error_lower = error.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| error_lower.contains(p));

    if matches(AUTH_ERRORS) {
        TransportErrorKind::AuthFailed
    } else if matches(HOST_NOT_FOUND_ERRORS) {
        TransportErrorKind::HostNotFound
    } else if matches(REFUSED_ERRORS) {
        TransportErrorKind::Refused
    } else if matches(RESET_ERRORS) {
        TransportErrorKind::Reset
    } else if matches(KEEPALIVE_ERRORS) {
        TransportErrorKind::KeepaliveLost
    } else if matches(TIMEOUT_ERRORS) {
        TransportErrorKind::TimedOut
    } else {
        TransportErrorKind::Other
    }
}

/// Determines if an error message describes a transient failure.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    // Authentication failures are NOT retryable (checked first for priority)
    for auth_err in AUTH_ERRORS {
        if error_lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if error_lower.contains(retryable_err) {
            return true;
        }
    }

    // Unknown errors are retried unless they look like SSH protocol errors
    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
