//! Persistence collaborator.
//!
//! [`TargetRepository`] is the narrow interface the fleet components use to
//! read target records and write results. [`InMemoryRepository`] backs the
//! standalone binaries and the tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::fleet::error::FleetError;
use crate::fleet::types::{ConnectionTestResult, FleetEvent, MetricsSnapshot, TargetRecord};

/// Snapshots kept per target by the in-memory repository.
pub(crate) const SNAPSHOT_HISTORY_LIMIT: usize = 288;

/// Test results kept per target by the in-memory repository.
const TEST_HISTORY_LIMIT: usize = 20;

/// Target and result persistence.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn get_target(&self, target_id: &str) -> Result<Option<TargetRecord>, FleetError>;

    async fn list_targets(&self) -> Result<Vec<TargetRecord>, FleetError>;

    /// Targets with metrics collection switched on.
    async fn list_metrics_enabled(&self) -> Result<Vec<TargetRecord>, FleetError>;

    /// Switch metrics collection on or off. `reason` is recorded when
    /// switching off and cleared when switching on.
    async fn set_metrics_enabled(
        &self,
        target_id: &str,
        enabled: bool,
        reason: Option<String>,
    ) -> Result<(), FleetError>;

    async fn set_metrics_interval(&self, target_id: &str, interval_secs: u64)
    -> Result<(), FleetError>;

    /// Persist a snapshot. Fails with [`FleetError::TargetGone`] when the
    /// target record no longer exists.
    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<(), FleetError>;

    async fn latest_snapshot(&self, target_id: &str) -> Result<Option<MetricsSnapshot>, FleetError>;

    /// Latest snapshot of every target that has one.
    async fn latest_snapshots(&self) -> Result<Vec<MetricsSnapshot>, FleetError>;

    async fn save_test_result(&self, result: &ConnectionTestResult) -> Result<(), FleetError>;

    async fn record_event(&self, event: FleetEvent) -> Result<(), FleetError>;

    /// Add a fingerprint to the target's trusted host keys.
    async fn trust_host_key(&self, target_id: &str, fingerprint: &str) -> Result<(), FleetError>;
}

/// DashMap-backed repository.
///
/// Keeps a bounded snapshot history per target and every recorded event.
#[derive(Default)]
pub struct InMemoryRepository {
    targets: DashMap<String, TargetRecord>,
    snapshots: DashMap<String, VecDeque<MetricsSnapshot>>,
    test_results: DashMap<String, VecDeque<ConnectionTestResult>>,
    events: Mutex<Vec<FleetEvent>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: impl IntoIterator<Item = TargetRecord>) -> Self {
        let repo = Self::new();
        for target in targets {
            repo.upsert_target(target);
        }
        repo
    }

    /// Load an inventory file containing a JSON array of target records.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Repository(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let targets: Vec<TargetRecord> = serde_json::from_str(&raw).map_err(|e| {
            FleetError::Repository(format!("Invalid inventory {}: {}", path.display(), e))
        })?;
        info!("Loaded {} target(s) from {}", targets.len(), path.display());
        Ok(Self::with_targets(targets))
    }

    pub fn upsert_target(&self, target: TargetRecord) {
        self.targets.insert(target.id.clone(), target);
    }

    /// Delete a target together with its history.
    pub fn remove_target(&self, target_id: &str) -> Option<TargetRecord> {
        self.snapshots.remove(target_id);
        self.test_results.remove(target_id);
        self.targets.remove(target_id).map(|(_, target)| target)
    }

    /// Snapshot history of a target, oldest first.
    pub fn snapshots(&self, target_id: &str) -> Vec<MetricsSnapshot> {
        self.snapshots
            .get(target_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn test_results(&self, target_id: &str) -> Vec<ConnectionTestResult> {
        self.test_results
            .get(target_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn with_target_mut<R>(
        &self,
        target_id: &str,
        f: impl FnOnce(&mut TargetRecord) -> R,
    ) -> Result<R, FleetError> {
        let mut target = self
            .targets
            .get_mut(target_id)
            .ok_or_else(|| FleetError::TargetNotFound(target_id.to_string()))?;
        Ok(f(&mut target))
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T, limit: usize) {
    if history.len() >= limit {
        history.pop_front();
    }
    history.push_back(item);
}

#[async_trait]
impl TargetRepository for InMemoryRepository {
    async fn get_target(&self, target_id: &str) -> Result<Option<TargetRecord>, FleetError> {
        Ok(self.targets.get(target_id).map(|t| t.value().clone()))
    }

    async fn list_targets(&self) -> Result<Vec<TargetRecord>, FleetError> {
        let mut targets: Vec<TargetRecord> =
            self.targets.iter().map(|t| t.value().clone()).collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(targets)
    }

    async fn list_metrics_enabled(&self) -> Result<Vec<TargetRecord>, FleetError> {
        let mut targets: Vec<TargetRecord> = self
            .targets
            .iter()
            .filter(|t| t.metrics_enabled)
            .map(|t| t.value().clone())
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(targets)
    }

    async fn set_metrics_enabled(
        &self,
        target_id: &str,
        enabled: bool,
        reason: Option<String>,
    ) -> Result<(), FleetError> {
        self.with_target_mut(target_id, |target| {
            target.metrics_enabled = enabled;
            target.metrics_disabled_reason = if enabled { None } else { reason };
        })
    }

    async fn set_metrics_interval(
        &self,
        target_id: &str,
        interval_secs: u64,
    ) -> Result<(), FleetError> {
        self.with_target_mut(target_id, |target| {
            target.metrics_interval_secs = Some(interval_secs);
        })
    }

    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<(), FleetError> {
        if !self.targets.contains_key(&snapshot.target_id) {
            return Err(FleetError::TargetGone(snapshot.target_id.clone()));
        }
        let mut history = self.snapshots.entry(snapshot.target_id.clone()).or_default();
        push_bounded(&mut history, snapshot.clone(), SNAPSHOT_HISTORY_LIMIT);
        debug!(
            "Stored snapshot for {} (success: {})",
            snapshot.target_id, snapshot.success
        );
        Ok(())
    }

    async fn latest_snapshot(&self, target_id: &str) -> Result<Option<MetricsSnapshot>, FleetError> {
        Ok(self
            .snapshots
            .get(target_id)
            .and_then(|history| history.back().cloned()))
    }

    async fn latest_snapshots(&self) -> Result<Vec<MetricsSnapshot>, FleetError> {
        let mut latest: Vec<MetricsSnapshot> = self
            .snapshots
            .iter()
            .filter_map(|history| history.back().cloned())
            .collect();
        latest.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        Ok(latest)
    }

    async fn save_test_result(&self, result: &ConnectionTestResult) -> Result<(), FleetError> {
        let mut history = self.test_results.entry(result.target_id.clone()).or_default();
        push_bounded(&mut history, result.clone(), TEST_HISTORY_LIMIT);
        Ok(())
    }

    async fn record_event(&self, event: FleetEvent) -> Result<(), FleetError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| FleetError::Repository("event log lock poisoned".to_string()))?;
        events.push(event);
        Ok(())
    }

    async fn trust_host_key(&self, target_id: &str, fingerprint: &str) -> Result<(), FleetError> {
        self.with_target_mut(target_id, |target| {
            if !target.known_fingerprints.iter().any(|f| f == fingerprint) {
                target.known_fingerprints.push(fingerprint.to_string());
            }
        })
    }
}
