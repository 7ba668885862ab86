//! Short-lived cache of latest snapshots and the fleet aggregate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::fleet::error::FleetError;
use crate::fleet::repository::TargetRepository;
use crate::fleet::types::{FleetAggregate, MetricsSnapshot};

struct Cached<T> {
    value: T,
    stored_at: Instant,
}

impl<T> Cached<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

/// Latest snapshot per target plus a cross-target aggregate, both with TTLs.
///
/// Every snapshot write drops the aggregate. Misses read through to the
/// repository.
pub struct MetricsCache {
    repo: Arc<dyn TargetRepository>,
    latest: DashMap<String, Cached<MetricsSnapshot>>,
    aggregate: RwLock<Option<Cached<FleetAggregate>>>,
    latest_ttl: Duration,
    aggregate_ttl: Duration,
}

impl MetricsCache {
    pub fn new(repo: Arc<dyn TargetRepository>, latest_ttl: Duration, aggregate_ttl: Duration) -> Self {
        Self {
            repo,
            latest: DashMap::new(),
            aggregate: RwLock::new(None),
            latest_ttl,
            aggregate_ttl,
        }
    }

    /// Remember `snapshot` as the target's latest and drop the aggregate.
    pub async fn store(&self, snapshot: MetricsSnapshot) {
        self.latest
            .insert(snapshot.target_id.clone(), Cached::new(snapshot));
        self.invalidate_aggregate().await;
    }

    pub async fn latest(&self, target_id: &str) -> Result<Option<MetricsSnapshot>, FleetError> {
        if let Some(entry) = self.latest.get(target_id)
            && entry.is_fresh(self.latest_ttl)
        {
            return Ok(Some(entry.value.clone()));
        }

        let snapshot = self.repo.latest_snapshot(target_id).await?;
        match &snapshot {
            Some(found) => {
                self.latest
                    .insert(target_id.to_string(), Cached::new(found.clone()));
            }
            None => {
                self.latest.remove(target_id);
            }
        }
        Ok(snapshot)
    }

    pub async fn aggregate(&self) -> Result<FleetAggregate, FleetError> {
        if let Some(cached) = self.aggregate.read().await.as_ref()
            && cached.is_fresh(self.aggregate_ttl)
        {
            return Ok(cached.value.clone());
        }

        let target_count = self.repo.list_targets().await?.len();
        let snapshots = self.repo.latest_snapshots().await?;
        let aggregate = compute_aggregate(target_count, &snapshots);
        debug!(
            "Recomputed fleet aggregate over {} snapshots",
            snapshots.len()
        );

        *self.aggregate.write().await = Some(Cached::new(aggregate.clone()));
        Ok(aggregate)
    }

    /// Forget everything cached for one target.
    pub async fn invalidate_target(&self, target_id: &str) {
        self.latest.remove(target_id);
        self.invalidate_aggregate().await;
    }

    pub async fn invalidate_aggregate(&self) {
        *self.aggregate.write().await = None;
    }
}

/// Averages over successful snapshots; failed ones only count as failing.
pub(crate) fn compute_aggregate(target_count: usize, snapshots: &[MetricsSnapshot]) -> FleetAggregate {
    let reporting: Vec<&MetricsSnapshot> = snapshots.iter().filter(|s| s.success).collect();
    let failing_count = snapshots.len() - reporting.len();

    let average = |field: fn(&MetricsSnapshot) -> f64| {
        if reporting.is_empty() {
            0.0
        } else {
            reporting.iter().map(|s| field(s)).sum::<f64>() / reporting.len() as f64
        }
    };

    FleetAggregate {
        target_count,
        reporting_count: reporting.len(),
        failing_count,
        avg_cpu_usage_percent: average(|s| s.cpu_usage_percent),
        avg_memory_usage_percent: average(|s| s.memory_usage_percent),
        avg_disk_usage_percent: average(|s| s.disk_usage_percent),
        total_network_rx_bytes: reporting.iter().map(|s| s.network_rx_bytes).sum(),
        total_network_tx_bytes: reporting.iter().map(|s| s.network_tx_bytes).sum(),
        computed_at: chrono::Utc::now().to_rfc3339(),
    }
}
