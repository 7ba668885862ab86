//! Wiring of the fleet subsystem and its administrative operations.
//!
//! [`FleetService`] owns one instance of every collaborator: the config
//! resolver, the session pool, the connection tester, the metrics pipeline
//! and the scheduling queue. The MCP tools and the binaries talk to the
//! fleet exclusively through it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::fleet::cache::MetricsCache;
use crate::fleet::client::SshDialer;
use crate::fleet::collector::MetricsCollector;
use crate::fleet::config::FleetConfig;
use crate::fleet::connection::ConnectionConfigResolver;
use crate::fleet::credentials::{CredentialDecryptor, PassthroughDecryptor};
use crate::fleet::error::FleetError;
use crate::fleet::executor::{CommandExecutor, outcome_from_output};
use crate::fleet::failure::FailureTracker;
use crate::fleet::pool::SessionPool;
use crate::fleet::queue::{QueueSettings, SchedulingQueue};
use crate::fleet::repository::{InMemoryRepository, TargetRepository};
use crate::fleet::tester::ConnectionTester;
use crate::fleet::transport::Dialer;
use crate::fleet::types::{
    CommandOutcome, ConnectionTestResult, FleetAggregate, MetricsSnapshot, PoolStats, QueueStats,
};
use crate::fleet::validator::validate;
use crate::fleet::worker::MetricsJobHandler;

/// Environment variable naming the JSON target inventory
pub(crate) const TARGETS_FILE_ENV_VAR: &str = "FLEET_TARGETS_FILE";

/// Shortest accepted metrics interval
pub(crate) const MIN_METRICS_INTERVAL_SECS: u64 = 30;

pub struct FleetService {
    config: FleetConfig,
    repo: Arc<dyn TargetRepository>,
    resolver: Arc<ConnectionConfigResolver>,
    pool: Arc<SessionPool>,
    executor: CommandExecutor,
    tester: ConnectionTester,
    collector: Arc<MetricsCollector>,
    cache: Arc<MetricsCache>,
    failures: Arc<FailureTracker>,
    queue: Arc<SchedulingQueue>,
}

impl FleetService {
    /// Build a service that opens real SSH connections.
    pub fn new(
        config: FleetConfig,
        repo: Arc<dyn TargetRepository>,
        decryptor: Arc<dyn CredentialDecryptor>,
    ) -> Self {
        let pool_dialer = Arc::new(SshDialer::new(config.compression));
        let diagnostic_dialer = Arc::new(SshDialer::one_shot(config.compression));
        Self::with_dialers(config, repo, decryptor, pool_dialer, diagnostic_dialer)
    }

    /// Build a service over explicit dialers, one for pooled sessions and one
    /// for diagnostics.
    pub fn with_dialers(
        config: FleetConfig,
        repo: Arc<dyn TargetRepository>,
        decryptor: Arc<dyn CredentialDecryptor>,
        pool_dialer: Arc<dyn Dialer>,
        diagnostic_dialer: Arc<dyn Dialer>,
    ) -> Self {
        let resolver = Arc::new(ConnectionConfigResolver::new(
            repo.clone(),
            decryptor,
            config.config_cache_ttl,
            config.connect_timeout,
        ));
        let pool = Arc::new(SessionPool::new(resolver.clone(), pool_dialer, &config));
        let executor = CommandExecutor::new(config.command_timeout);
        let tester = ConnectionTester::new(
            resolver.clone(),
            diagnostic_dialer,
            executor.clone(),
            config.max_diagnostic_connections,
            config.dns_timeout,
        );
        let cache = Arc::new(MetricsCache::new(
            repo.clone(),
            config.latest_metrics_ttl,
            config.aggregate_metrics_ttl,
        ));
        let collector = Arc::new(MetricsCollector::new(
            repo.clone(),
            pool.clone(),
            executor.clone(),
            cache.clone(),
            config.metrics_timeout,
        ));
        let failures = Arc::new(FailureTracker::new(
            config.failure_threshold,
            config.failure_ttl,
        ));
        let handler = Arc::new(MetricsJobHandler::new(
            repo.clone(),
            collector.clone(),
            failures.clone(),
            cache.clone(),
        ));
        let queue = Arc::new(SchedulingQueue::new(
            handler,
            QueueSettings {
                concurrency: config.queue_concurrency,
                attempts: config.job_attempts,
                backoff: config.job_backoff,
            },
        ));

        Self {
            config,
            repo,
            resolver,
            pool,
            executor,
            tester,
            collector,
            cache,
            failures,
            queue,
        }
    }

    /// Build a service from `FLEET_*` environment variables.
    ///
    /// Targets are loaded from the JSON file named by `FLEET_TARGETS_FILE`;
    /// without it the fleet starts empty. Secrets are read as plain text.
    pub async fn from_env() -> Result<Self, FleetError> {
        let config = FleetConfig::from_env();
        let repo = match std::env::var(TARGETS_FILE_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => {
                let repo = InMemoryRepository::from_json_file(path.trim()).await?;
                info!("Loaded target inventory from {}", path.trim());
                repo
            }
            _ => {
                warn!(
                    "{} not set, starting with an empty inventory",
                    TARGETS_FILE_ENV_VAR
                );
                InMemoryRepository::new()
            }
        };
        Ok(Self::new(
            config,
            Arc::new(repo),
            Arc::new(PassthroughDecryptor),
        ))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    fn interval_for(&self, interval_secs: Option<u64>) -> Duration {
        interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_metrics_interval)
    }

    /// Start background work and arm a schedule for every metrics-enabled
    /// target.
    ///
    /// Returns the number of schedules armed.
    pub async fn start(&self) -> Result<usize, FleetError> {
        self.pool.start_sweeper();
        self.queue.start();

        let targets = self.repo.list_metrics_enabled().await?;
        for target in &targets {
            self.queue
                .schedule(&target.id, self.interval_for(target.metrics_interval_secs));
        }
        info!(
            "Fleet service started, {} target(s) scheduled for metrics",
            targets.len()
        );
        Ok(targets.len())
    }

    /// Stop the queue and close every pooled session.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.pool.shutdown().await;
        info!("Fleet service stopped");
    }

    /// Run the staged connection diagnostic for `target_id`.
    pub async fn test_connection(
        &self,
        target_id: &str,
        extra_commands: &[String],
    ) -> Result<ConnectionTestResult, FleetError> {
        self.tester.test_connection(target_id, extra_commands).await
    }

    /// Run one command on a pooled session.
    ///
    /// Rejected commands fail before a session is borrowed. A session that
    /// failed at the transport level is discarded rather than returned to the
    /// pool.
    pub async fn execute(
        &self,
        target_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, FleetError> {
        let verdict = validate(command);
        if !verdict.valid {
            let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
            warn!("Rejected command for target {}: {}", target_id, reason);
            return Err(FleetError::Validation(reason));
        }

        let session = self.pool.acquire(target_id).await?;
        let effective_timeout = timeout.unwrap_or(self.executor.default_timeout());

        match self.executor.try_run(&session, command, timeout, None).await {
            Ok(output) => {
                session.release();
                Ok(outcome_from_output(output, effective_timeout))
            }
            Err(e @ FleetError::Validation(_)) => {
                session.release();
                Err(e)
            }
            Err(e) => {
                session.discard().await;
                Err(e)
            }
        }
    }

    /// Collect metrics for `target_id` right away, bypassing the queue.
    pub async fn collect_now(&self, target_id: &str) -> Result<MetricsSnapshot, FleetError> {
        let snapshot = self.collector.collect(target_id).await?;
        self.failures.reset(target_id);
        Ok(snapshot)
    }

    /// Queue a manual collection for `target_id`.
    pub async fn trigger(&self, target_id: &str) -> Result<(), FleetError> {
        if self.repo.get_target(target_id).await?.is_none() {
            return Err(FleetError::TargetNotFound(target_id.to_string()));
        }
        self.queue.enqueue(target_id);
        Ok(())
    }

    /// Queue a manual collection for every metrics-enabled target.
    pub async fn trigger_all(&self) -> Result<usize, FleetError> {
        let targets = self.repo.list_metrics_enabled().await?;
        for target in &targets {
            self.queue.enqueue(&target.id);
        }
        info!("Triggered metrics collection for {} target(s)", targets.len());
        Ok(targets.len())
    }

    /// Change the metrics interval of `target_id` and re-arm its schedule
    /// when metrics are enabled.
    pub async fn set_metrics_interval(
        &self,
        target_id: &str,
        interval_secs: u64,
    ) -> Result<(), FleetError> {
        if interval_secs < MIN_METRICS_INTERVAL_SECS {
            return Err(FleetError::Validation(format!(
                "metrics interval must be at least {}s, got {}s",
                MIN_METRICS_INTERVAL_SECS, interval_secs
            )));
        }

        self.repo
            .set_metrics_interval(target_id, interval_secs)
            .await?;
        let enabled = self
            .repo
            .get_target(target_id)
            .await?
            .is_some_and(|t| t.metrics_enabled);
        if enabled {
            self.queue
                .schedule(target_id, Duration::from_secs(interval_secs));
        }
        Ok(())
    }

    /// Switch metrics collection on or off for `target_id`.
    ///
    /// Enabling clears the failure counter and arms a schedule; disabling
    /// removes the schedule.
    pub async fn set_metrics_enabled(&self, target_id: &str, enabled: bool) -> Result<(), FleetError> {
        self.repo
            .set_metrics_enabled(target_id, enabled, None)
            .await?;

        if enabled {
            self.failures.reset(target_id);
            let interval = self
                .repo
                .get_target(target_id)
                .await?
                .and_then(|t| t.metrics_interval_secs);
            self.queue.schedule(target_id, self.interval_for(interval));
        } else {
            self.queue.unschedule(target_id);
            self.cache.invalidate_target(target_id).await;
        }
        self.cache.invalidate_aggregate().await;
        info!(
            "Metrics collection {} for {}",
            if enabled { "enabled" } else { "disabled" },
            target_id
        );
        Ok(())
    }

    /// Drop the cached connection config of `target_id`.
    pub fn invalidate_config(&self, target_id: &str) {
        self.pool.invalidate_config(target_id);
    }

    /// Close every pooled session of `target_id`.
    pub async fn close_sessions(&self, target_id: &str) -> usize {
        self.pool.close_target(target_id).await
    }

    /// Forget cached credentials and sessions after a target's secrets
    /// changed.
    pub async fn credentials_changed(&self, target_id: &str) -> usize {
        self.resolver.invalidate(target_id);
        self.pool.close_target(target_id).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn pause_queue(&self) {
        self.queue.pause();
    }

    pub fn resume_queue(&self) {
        self.queue.resume();
    }

    pub fn clean_queue(&self) -> usize {
        self.queue.clean()
    }

    pub async fn latest_metrics(&self, target_id: &str) -> Result<Option<MetricsSnapshot>, FleetError> {
        self.cache.latest(target_id).await
    }

    pub async fn fleet_overview(&self) -> Result<FleetAggregate, FleetError> {
        self.cache.aggregate().await
    }
}
