//! Command execution over a borrowed session.
//!
//! Every command is validated before it leaves the process, bounded by a hard
//! timeout, and its output is sanitized on every path, including successful
//! runs and timeouts.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::fleet::error::FleetError;
use crate::fleet::pool::Session;
use crate::fleet::sanitize::sanitize_output;
use crate::fleet::transport::RawOutput;
use crate::fleet::types::CommandOutcome;
use crate::fleet::validator::validate;

/// Extra time granted to the transport before the outer timeout fires.
const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Sanitized output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs validated commands with a timeout and output sanitization.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `command` and return its sanitized output.
    ///
    /// Rejected commands fail with [`FleetError::Validation`] without touching
    /// the session. A timeout is not an error: the output collected so far is
    /// returned with `timed_out` set, and the remote process may keep running.
    pub async fn try_run(
        &self,
        session: &Session,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, FleetError> {
        let verdict = validate(command);
        if !verdict.valid {
            let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
            warn!(
                "Rejected command for target {}: {}",
                session.target_id(),
                reason
            );
            return Err(FleetError::Validation(reason));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        session.record_command();

        let exec = session.connection().exec(command, stdin, timeout);
        let raw = match tokio::time::timeout(timeout + HARD_TIMEOUT_GRACE, exec).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Transport for target {} did not return within {:?}",
                    session.target_id(),
                    timeout
                );
                RawOutput {
                    timed_out: true,
                    ..Default::default()
                }
            }
        };
        let timed_out = raw.timed_out;
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            "Command on {} finished in {}ms (exit {:?}, timed out: {})",
            session.target_id(),
            duration_ms,
            raw.exit_code,
            timed_out
        );

        Ok(CommandOutput {
            stdout: sanitize_output(&raw.stdout).into_owned(),
            stderr: sanitize_output(&raw.stderr).into_owned(),
            exit_code: raw.exit_code.map(|code| code as i32),
            timed_out,
            duration_ms,
        })
    }

    /// Run `command` and fold every outcome into a [`CommandOutcome`].
    pub async fn run(
        &self,
        session: &Session,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<&[u8]>,
    ) -> CommandOutcome {
        let started = Instant::now();
        let effective_timeout = timeout.unwrap_or(self.default_timeout);

        match self.try_run(session, command, timeout, stdin).await {
            Ok(output) => outcome_from_output(output, effective_timeout),
            Err(e) => CommandOutcome {
                success: false,
                output: None,
                error: Some(sanitize_output(&e.to_string()).into_owned()),
                exit_code: None,
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }
}

pub(crate) fn outcome_from_output(output: CommandOutput, timeout: Duration) -> CommandOutcome {
    let success = output.succeeded();
    let error = if output.timed_out {
        Some(format!("Command timed out after {}s", timeout.as_secs()))
    } else if !success {
        let stderr = output.stderr.trim();
        Some(if stderr.is_empty() {
            format!("Command exited with status {:?}", output.exit_code)
        } else {
            stderr.to_string()
        })
    } else {
        None
    };

    CommandOutcome {
        success,
        output: (!output.stdout.is_empty()).then_some(output.stdout),
        error,
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        duration_ms: output.duration_ms,
    }
}
