//! Staged connection diagnostics.
//!
//! A test walks the same steps as opening a pooled session, but reports each
//! one separately so an operator can see where a connection breaks:
//!
//! 1. **DNS** - resolve the host within the DNS timeout
//! 2. **TCP** - TCP connect plus SSH handshake
//! 3. **Host key** - policy check before any credential is sent
//! 4. **Authentication** - password or key
//! 5. **Privilege** - `sudo` probe, if the target has privilege escalation
//! 6. **Commands** - `whoami`, `uname -a` and caller supplied commands
//!
//! Failures in stages 1 to 4 stop the test. Stage failures are part of the
//! returned [`ConnectionTestResult`]; only a concurrent test of the same target
//! and an unknown target are errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::fleet::connection::{ConnectionConfig, ConnectionConfigResolver, SudoConfig};
use crate::fleet::error::FleetError;
use crate::fleet::executor::CommandExecutor;
use crate::fleet::pool::Session;
use crate::fleet::transport::{
    Dialer, HostKeyVerdict, PendingConnection, RemoteConnection, authenticate_within,
    verify_host_key,
};
use crate::fleet::types::{
    AuthResult, CommandResult, ConnectionTestResult, DnsResult, EventKind, EventSeverity,
    FleetEvent, HostKeyResult, PrivilegeResult, StageStatus, TcpResult,
};

/// Commands every test runs after authentication.
const DEFAULT_DIAGNOSTIC_COMMANDS: [&str; 2] = ["whoami", "uname -a"];

const PASSWORDLESS_SUDO_PROBE: &str = "sudo -n whoami";
const PASSWORD_SUDO_PROBE: &str = "sudo -S -p '' whoami";

/// Marks a target as under test until dropped.
struct TestGuard {
    in_flight: Arc<DashMap<String, Instant>>,
    target_id: String,
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.target_id);
    }
}

/// Runs staged diagnostics, one at a time per target.
pub struct ConnectionTester {
    resolver: Arc<ConnectionConfigResolver>,
    dialer: Arc<dyn Dialer>,
    executor: CommandExecutor,
    in_flight: Arc<DashMap<String, Instant>>,
    diagnostic_slots: Arc<Semaphore>,
    dns_timeout: Duration,
}

impl ConnectionTester {
    pub fn new(
        resolver: Arc<ConnectionConfigResolver>,
        dialer: Arc<dyn Dialer>,
        executor: CommandExecutor,
        max_diagnostic_connections: usize,
        dns_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            dialer,
            executor,
            in_flight: Arc::new(DashMap::new()),
            diagnostic_slots: Arc::new(Semaphore::new(max_diagnostic_connections.max(1))),
            dns_timeout,
        }
    }

    pub fn is_testing(&self, target_id: &str) -> bool {
        self.in_flight.contains_key(target_id)
    }

    fn try_lock(&self, target_id: &str) -> Result<TestGuard, FleetError> {
        match self.in_flight.entry(target_id.to_string()) {
            Entry::Occupied(_) => Err(FleetError::TestInProgress(target_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(TestGuard {
                    in_flight: self.in_flight.clone(),
                    target_id: target_id.to_string(),
                })
            }
        }
    }

    /// Run a full diagnostic against `target_id`.
    ///
    /// `extra_commands` run after the default commands; each one is validated
    /// first and a rejected command is reported as a failed command result.
    pub async fn test_connection(
        &self,
        target_id: &str,
        extra_commands: &[String],
    ) -> Result<ConnectionTestResult, FleetError> {
        let _guard = self.try_lock(target_id)?;

        // Diagnostics always run against the current record
        self.resolver.invalidate(target_id);
        let mut run = TestRun::new(target_id);
        let config = match self.resolver.resolve(target_id).await {
            Ok(config) => config,
            Err(FleetError::TargetNotFound(id)) => return Err(FleetError::TargetNotFound(id)),
            Err(e) => {
                run.result.dns.status = StageStatus::skipped("connection config unavailable");
                run.error(e.to_string());
                return Ok(self.finish(run, None).await);
            }
        };

        let _slot = self
            .diagnostic_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FleetError::Protocol("diagnostics are shut down".to_string()))?;

        info!("Testing connection to {}", config.address());
        let connection = self.run_stages(&config, extra_commands, &mut run).await;
        Ok(self.finish(run, connection).await)
    }

    /// Walk the stages, returning the authenticated connection if one was
    /// opened so the caller can close it.
    async fn run_stages(
        &self,
        config: &ConnectionConfig,
        extra_commands: &[String],
        run: &mut TestRun,
    ) -> Option<Arc<dyn RemoteConnection>> {
        let addrs = self.dns_stage(config, run).await?;
        let pending = self.tcp_stage(config, addrs, run).await?;
        let pending = self.host_key_stage(config, pending, run).await?;
        let connection = self.auth_stage(config, pending, run).await?;

        let session = Session::standalone(&config.target_id, connection.clone());
        self.privilege_stage(config, &session, run).await;
        self.command_stage(&session, extra_commands, run).await;
        Some(connection)
    }

    async fn dns_stage(
        &self,
        config: &ConnectionConfig,
        run: &mut TestRun,
    ) -> Option<Vec<std::net::SocketAddr>> {
        let started = Instant::now();
        let resolved =
            tokio::time::timeout(self.dns_timeout, self.dialer.resolve(&config.host, config.port))
                .await
                .unwrap_or_else(|_| {
                    Err(FleetError::timeout(
                        format!("DNS resolution of {}", config.host),
                        self.dns_timeout.as_secs(),
                    ))
                });
        run.result.dns.elapsed_ms = elapsed_ms(started);

        match resolved {
            Ok(addrs) => {
                run.result.dns.addresses = addrs.iter().map(|a| a.ip().to_string()).collect();
                run.result.dns.status = StageStatus::Passed;
                Some(addrs)
            }
            Err(e) => {
                run.result.dns.status = StageStatus::failed(e.to_string());
                run.error(format!("DNS resolution failed: {}", e));
                None
            }
        }
    }

    async fn tcp_stage(
        &self,
        config: &ConnectionConfig,
        addrs: Vec<std::net::SocketAddr>,
        run: &mut TestRun,
    ) -> Option<Box<dyn PendingConnection>> {
        let started = Instant::now();
        let mut last_error = None;
        for addr in addrs {
            match self.dialer.handshake(addr, config.timeout).await {
                Ok(pending) => {
                    run.result.tcp = Some(TcpResult {
                        status: StageStatus::Passed,
                        elapsed_ms: elapsed_ms(started),
                        address: Some(addr.to_string()),
                    });
                    return Some(pending);
                }
                Err(e) => {
                    debug!("Handshake with {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("no addresses for {}", config.host));
        run.result.tcp = Some(TcpResult {
            status: StageStatus::failed(&message),
            elapsed_ms: elapsed_ms(started),
            address: None,
        });
        run.error(format!("TCP connection failed: {}", message));
        None
    }

    async fn host_key_stage(
        &self,
        config: &ConnectionConfig,
        pending: Box<dyn PendingConnection>,
        run: &mut TestRun,
    ) -> Option<Box<dyn PendingConnection>> {
        let observed = pending.host_key();
        let verdict = verify_host_key(
            config.host_key.policy,
            &config.host_key.known_fingerprints,
            observed.as_ref(),
        );
        let mut stage = HostKeyResult {
            status: StageStatus::Passed,
            policy: config.host_key.policy,
            fingerprint: observed.as_ref().map(|k| k.fingerprint.clone()),
            algorithm: observed.as_ref().map(|k| k.algorithm.clone()),
            matched: verdict == HostKeyVerdict::Matched,
            newly_trusted: false,
        };

        match verdict {
            HostKeyVerdict::Matched => {}
            HostKeyVerdict::TrustOnFirstUse => {
                let fingerprint = stage.fingerprint.clone().unwrap_or_default();
                match self
                    .resolver
                    .trust_host_key(&config.target_id, &fingerprint)
                    .await
                {
                    Ok(()) => {
                        stage.newly_trusted = true;
                        self.record_event(FleetEvent::new(
                            &config.target_id,
                            EventKind::HostKeyTrusted,
                            EventSeverity::Info,
                            format!("Trusted host key {} on first use", fingerprint),
                        ))
                        .await;
                    }
                    Err(e) => warn!("Failed to persist host key for {}: {}", config.target_id, e),
                }
                run.warning(format!(
                    "Host key {} accepted on first use; verify it out of band",
                    fingerprint
                ));
            }
            HostKeyVerdict::Skipped => {
                stage.status = StageStatus::skipped("host key verification disabled");
                run.warning("Host key verification is disabled for this target");
            }
            HostKeyVerdict::Mismatch | HostKeyVerdict::Missing => {
                let observed = stage
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| "no host key".to_string());
                let message = format!(
                    "Host key {} does not match any trusted fingerprint (possible MITM)",
                    observed
                );
                warn!("{} for target {}", message, config.target_id);
                self.record_event(FleetEvent::new(
                    &config.target_id,
                    EventKind::HostKeyMismatch,
                    EventSeverity::Critical,
                    message.clone(),
                ))
                .await;
                stage.status = StageStatus::failed(&message);
                run.result.host_key_verification = Some(stage);
                run.error(message);
                pending.abort().await;
                return None;
            }
        }

        run.result.host_key_verification = Some(stage);
        Some(pending)
    }

    async fn auth_stage(
        &self,
        config: &ConnectionConfig,
        pending: Box<dyn PendingConnection>,
        run: &mut TestRun,
    ) -> Option<Arc<dyn RemoteConnection>> {
        let started = Instant::now();
        let result = authenticate_within(pending, config).await;
        let mut stage = AuthResult {
            status: StageStatus::Passed,
            elapsed_ms: elapsed_ms(started),
            method: config.auth.kind(),
        };

        match result {
            Ok(connection) => {
                run.result.authentication = Some(stage);
                Some(connection)
            }
            Err(e) => {
                stage.status = StageStatus::failed(e.to_string());
                run.result.authentication = Some(stage);
                run.error(format!("Authentication failed: {}", e));
                None
            }
        }
    }

    async fn privilege_stage(&self, config: &ConnectionConfig, session: &Session, run: &mut TestRun) {
        let (command, stdin) = match &config.sudo {
            SudoConfig::Disabled => return,
            SudoConfig::Passwordless => (PASSWORDLESS_SUDO_PROBE, None),
            SudoConfig::WithPassword(password) => {
                (PASSWORD_SUDO_PROBE, Some(format!("{}\n", password)))
            }
        };

        let started = Instant::now();
        let outcome = self
            .executor
            .run(session, command, None, stdin.as_deref().map(str::as_bytes))
            .await;
        let user = outcome
            .output
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let status = if outcome.success && user.as_deref() == Some("root") {
            StageStatus::Passed
        } else {
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("sudo ran as {}", user.as_deref().unwrap_or("nobody")));
            run.warning(format!("Privilege escalation failed: {}", reason));
            StageStatus::failed(reason)
        };

        run.result.privilege_test = Some(PrivilegeResult {
            status,
            elapsed_ms: elapsed_ms(started),
            mode: config.sudo.mode(),
            effective_user: user,
        });
    }

    async fn command_stage(&self, session: &Session, extra_commands: &[String], run: &mut TestRun) {
        let commands = DEFAULT_DIAGNOSTIC_COMMANDS
            .iter()
            .map(|c| c.to_string())
            .chain(extra_commands.iter().cloned());

        for command in commands {
            let started = Instant::now();
            let result = self.executor.try_run(session, &command, None, None).await;
            let mut entry = CommandResult {
                command: command.clone(),
                status: StageStatus::Passed,
                elapsed_ms: elapsed_ms(started),
                exit_code: None,
                output: None,
            };

            match result {
                Ok(output) => {
                    entry.exit_code = output.exit_code;
                    if output.succeeded() {
                        let trimmed = output.stdout.trim();
                        match command.as_str() {
                            "whoami" => run.result.detected_username = Some(trimmed.to_string()),
                            "uname -a" => run.result.detected_os = Some(trimmed.to_string()),
                            _ => {}
                        }
                    } else {
                        let reason = if output.timed_out {
                            "timed out".to_string()
                        } else {
                            format!("exited with status {:?}", output.exit_code)
                        };
                        entry.status = StageStatus::failed(&reason);
                        run.warning(format!("Command '{}' {}", command, reason));
                    }
                    entry.output = Some(output.stdout);
                }
                Err(FleetError::Validation(reason)) => {
                    entry.status = StageStatus::failed(&reason);
                    run.error(format!("Command '{}' rejected: {}", command, reason));
                }
                Err(e) => {
                    entry.status = StageStatus::failed(e.to_string());
                    run.error(format!("Protocol error running '{}': {}", command, e));
                }
            }
            run.result.command_execution.push(entry);
        }
    }

    async fn finish(
        &self,
        run: TestRun,
        connection: Option<Arc<dyn RemoteConnection>>,
    ) -> ConnectionTestResult {
        if let Some(connection) = connection {
            connection.close().await;
        }

        let mut result = run.result;
        result.latency_ms = elapsed_ms(run.started);
        result.success = result.errors.is_empty()
            && result
                .authentication
                .as_ref()
                .is_some_and(|a| a.status.is_passed());

        if result.success {
            info!(
                "Connection test for {} passed in {}ms",
                result.target_id, result.latency_ms
            );
        } else {
            warn!(
                "Connection test for {} failed: {}",
                result.target_id,
                result.errors.join("; ")
            );
        }

        if let Err(e) = self.resolver.repository().save_test_result(&result).await {
            warn!("Failed to persist test result for {}: {}", result.target_id, e);
        }
        result
    }

    async fn record_event(&self, event: FleetEvent) {
        let target_id = event.target_id.clone();
        if let Err(e) = self.resolver.repository().record_event(event).await {
            warn!("Failed to record event for {}: {}", target_id, e);
        }
    }
}

/// Mutable state of one test while stages run.
struct TestRun {
    started: Instant,
    result: ConnectionTestResult,
}

impl TestRun {
    fn new(target_id: &str) -> Self {
        Self {
            started: Instant::now(),
            result: ConnectionTestResult {
                target_id: target_id.to_string(),
                success: false,
                latency_ms: 0,
                tested_at: chrono::Utc::now().to_rfc3339(),
                dns: DnsResult {
                    status: StageStatus::skipped("not started"),
                    elapsed_ms: 0,
                    addresses: Vec::new(),
                },
                tcp: None,
                host_key_verification: None,
                authentication: None,
                privilege_test: None,
                command_execution: Vec::new(),
                detected_os: None,
                detected_username: None,
                errors: Vec::new(),
                warnings: Vec::new(),
            },
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.result.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.result.warnings.push(message.into());
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
