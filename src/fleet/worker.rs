//! Queue job handler: collect metrics and drive the circuit breaker.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::fleet::cache::MetricsCache;
use crate::fleet::collector::MetricsCollector;
use crate::fleet::error::FleetError;
use crate::fleet::failure::FailureTracker;
use crate::fleet::queue::{Job, JobHandler, JobOutcome};
use crate::fleet::repository::TargetRepository;
use crate::fleet::types::{EventKind, EventSeverity, FleetEvent};

/// Collects metrics for each job and switches metrics off for targets that
/// keep failing.
pub struct MetricsJobHandler {
    repo: Arc<dyn TargetRepository>,
    collector: Arc<MetricsCollector>,
    failures: Arc<FailureTracker>,
    cache: Arc<MetricsCache>,
}

impl MetricsJobHandler {
    pub fn new(
        repo: Arc<dyn TargetRepository>,
        collector: Arc<MetricsCollector>,
        failures: Arc<FailureTracker>,
        cache: Arc<MetricsCache>,
    ) -> Self {
        Self {
            repo,
            collector,
            failures,
            cache,
        }
    }

    /// Count a failure and trip the breaker at the threshold.
    async fn on_failure(&self, target_id: &str, error: FleetError) -> FleetError {
        let count = self.failures.record_failure(target_id);
        if !self.failures.should_trip(count) {
            debug!(
                "Collection failure {}/{} for {}",
                count,
                self.failures.threshold(),
                target_id
            );
            return error;
        }

        let reason = format!(
            "Disabled after {} consecutive collection failures; last error: {}",
            count, error
        );
        if let Err(e) = self
            .repo
            .set_metrics_enabled(target_id, false, Some(reason.clone()))
            .await
        {
            warn!("Failed to disable metrics for {}: {}", target_id, e);
        }
        self.failures.reset(target_id);
        self.cache.invalidate_target(target_id).await;

        error!("Metrics collection disabled for {}: {}", target_id, reason);
        let event = FleetEvent::new(
            target_id,
            EventKind::MetricsAutoDisabled,
            EventSeverity::Critical,
            reason,
        );
        if let Err(e) = self.repo.record_event(event).await {
            warn!("Failed to record auto-disable event for {}: {}", target_id, e);
        }

        FleetError::CircuitOpen {
            target_id: target_id.to_string(),
            failures: count,
        }
    }
}

#[async_trait]
impl JobHandler for MetricsJobHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, FleetError> {
        let target = match self.repo.get_target(&job.target_id).await? {
            Some(target) => target,
            None => return Ok(JobOutcome::Skipped("target no longer exists".to_string())),
        };
        if !target.metrics_enabled {
            return Ok(JobOutcome::Skipped("metrics disabled".to_string()));
        }

        match self.collector.collect(&job.target_id).await {
            Ok(_) => {
                self.failures.reset(&job.target_id);
                Ok(JobOutcome::Completed)
            }
            Err(FleetError::TargetGone(_)) => {
                Ok(JobOutcome::Skipped("target deleted during collection".to_string()))
            }
            Err(e) => Err(self.on_failure(&job.target_id, e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fleet::config::FleetConfig;
    use crate::fleet::connection::ConnectionConfigResolver;
    use crate::fleet::credentials::PassthroughDecryptor;
    use crate::fleet::executor::CommandExecutor;
    use crate::fleet::pool::SessionPool;
    use crate::fleet::repository::InMemoryRepository;
    use crate::fleet::testing::{FakeDialer, metrics_target, target};
    use crate::fleet::types::TriggerKind;

    struct Harness {
        repo: Arc<InMemoryRepository>,
        failures: Arc<FailureTracker>,
        handler: MetricsJobHandler,
    }

    fn harness(dialer: &FakeDialer, repo: Arc<InMemoryRepository>, threshold: u32) -> Harness {
        let config = FleetConfig::default();
        let resolver = Arc::new(ConnectionConfigResolver::new(
            repo.clone(),
            Arc::new(PassthroughDecryptor),
            config.config_cache_ttl,
            config.connect_timeout,
        ));
        let pool = Arc::new(SessionPool::new(resolver, Arc::new(dialer.clone()), &config));
        let cache = Arc::new(MetricsCache::new(
            repo.clone(),
            config.latest_metrics_ttl,
            config.aggregate_metrics_ttl,
        ));
        let collector = Arc::new(MetricsCollector::new(
            repo.clone(),
            pool,
            CommandExecutor::new(config.command_timeout),
            cache.clone(),
            config.metrics_timeout,
        ));
        let failures = Arc::new(FailureTracker::new(threshold, Duration::from_secs(3600)));
        let handler = MetricsJobHandler::new(repo.clone(), collector, failures.clone(), cache);
        Harness {
            repo,
            failures,
            handler,
        }
    }

    fn job(target_id: &str) -> Job {
        Job::new(target_id, TriggerKind::Scheduled)
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let dialer = FakeDialer::new();
        let repo = Arc::new(InMemoryRepository::with_targets([metrics_target("web-1")]));
        let h = harness(&dialer, repo, 10);
        h.failures.record_failure("web-1");
        h.failures.record_failure("web-1");

        let outcome = h.handler.handle(&job("web-1")).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(h.failures.count("web-1"), 0);
    }

    #[tokio::test]
    async fn test_disabled_target_is_skipped() {
        let dialer = FakeDialer::new();
        let repo = Arc::new(InMemoryRepository::with_targets([target("web-1")]));
        let h = harness(&dialer, repo, 10);

        let outcome = h.handler.handle(&job("web-1")).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert_eq!(dialer.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_missing_target_is_skipped() {
        let dialer = FakeDialer::new();
        let h = harness(&dialer, Arc::new(InMemoryRepository::new()), 10);

        let outcome = h.handler.handle(&job("ghost")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_failure_increments_counter() {
        let dialer = FakeDialer::new().respond_error("vmstat", "Connection reset by peer");
        let repo = Arc::new(InMemoryRepository::with_targets([metrics_target("web-1")]));
        let h = harness(&dialer, repo, 10);

        let err = h.handler.handle(&job("web-1")).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.failures.count("web-1"), 1);
    }

    #[tokio::test]
    async fn test_threshold_disables_metrics() {
        let dialer = FakeDialer::new().respond_error("vmstat", "Connection reset by peer");
        let repo = Arc::new(InMemoryRepository::with_targets([metrics_target("web-1")]));
        let h = harness(&dialer, repo, 10);

        for _ in 0..9 {
            let err = h.handler.handle(&job("web-1")).await.unwrap_err();
            assert!(!matches!(err, FleetError::CircuitOpen { .. }));
        }
        let err = h.handler.handle(&job("web-1")).await.unwrap_err();
        assert!(matches!(err, FleetError::CircuitOpen { failures: 10, .. }));
        assert!(!err.is_retryable());

        let stored = h.repo.get_target("web-1").await.unwrap().unwrap();
        assert!(!stored.metrics_enabled);
        assert!(stored.metrics_disabled_reason.unwrap().contains("10 consecutive"));
        assert!(
            h.repo
                .events()
                .iter()
                .any(|e| e.kind == EventKind::MetricsAutoDisabled)
        );

        // Next run sees the disabled flag
        let outcome = h.handler.handle(&job("web-1")).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
    }
}
