//! System metrics collection for Linux targets.
//!
//! ## Collection Flow
//!
//! 1. **Borrow**: one session is taken from the [`SessionPool`]
//! 2. **Script**: [`LINUX_METRICS_SCRIPT`] runs in a single round trip and
//!    prints one line per metric group
//! 3. **Parse**: lines are read positionally into a [`MetricsSnapshot`]
//! 4. **Persist**: the snapshot is saved, cached, and checked against the
//!    target's alert thresholds
//!
//! Failed attempts are persisted too, as zeroed snapshots carrying the error,
//! unless the target record has been deleted in the meantime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::fleet::cache::MetricsCache;
use crate::fleet::error::FleetError;
use crate::fleet::executor::CommandExecutor;
use crate::fleet::pool::SessionPool;
use crate::fleet::repository::TargetRepository;
use crate::fleet::types::{
    EventKind, EventSeverity, FleetEvent, MetricsSnapshot, PlatformType, TargetRecord,
};

/// Batched metrics script. Output lines, in order:
///
/// | # | Content |
/// |---|---------|
/// | 1 | CPU usage percent (100 - idle) |
/// | 2 | Core count |
/// | 3 | Load averages 1/5/15 |
/// | 4 | Memory total/used/free/available MB |
/// | 5 | Swap total/used MB |
/// | 6 | Disk total/used/free GB and use percent, non-tmpfs filesystems |
/// | 7 | Uptime seconds |
/// | 8 | Process count |
/// | 9 | OS pretty name |
/// | 10 | Kernel version |
/// | 11 | Network rx/tx bytes, summed over non-loopback interfaces |
pub const LINUX_METRICS_SCRIPT: &str = concat!(
    "vmstat 1 2 | tail -1 | awk '{print 100-$15}'\n",
    "nproc\n",
    "awk '{print $1, $2, $3}' /proc/loadavg\n",
    "free -m | awk '/^Mem:/ {print $2, $3, $4, $7}'\n",
    "free -m | awk '/^Swap:/ {print $2, $3}'\n",
    "df -B1G -x tmpfs -x devtmpfs --total 2>/dev/null | awk '/^total/ {print $2, $3, $4, $5}'\n",
    "awk '{print int($1)}' /proc/uptime\n",
    "ps -e --no-headers | wc -l\n",
    "grep '^PRETTY_NAME=' /etc/os-release 2>/dev/null | cut -d= -f2- | tr -d '\"'\n",
    "uname -r\n",
    "awk 'NR>2 {sub(/:/, \" \"); if ($1 != \"lo\") {rx+=$2; tx+=$10}} END {print rx+0, tx+0}' /proc/net/dev\n",
);

/// Parse the output of [`LINUX_METRICS_SCRIPT`].
///
/// Parsing is positional: a command that prints nothing shifts every later
/// line. Unparseable numbers default to 0.
// TODO: emit `key=value` pairs from the script so a missing tool cannot shift later fields.
pub fn parse_metrics_output(target_id: &str, output: &str, latency_ms: u64) -> MetricsSnapshot {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let line = |index: usize| lines.get(index).copied().unwrap_or("");
    let field = |index: usize, position: usize| line(index).split_whitespace().nth(position);

    let memory_total_mb = parse_u64(field(3, 0));
    let memory_used_mb = parse_u64(field(3, 1));
    let swap_total_mb = parse_u64(field(4, 0));
    let swap_used_mb = parse_u64(field(4, 1));

    MetricsSnapshot {
        target_id: target_id.to_string(),
        collected_at: chrono::Utc::now().to_rfc3339(),
        success: true,
        latency_ms,
        error: None,
        cpu_usage_percent: parse_f64(field(0, 0)),
        cpu_cores: parse_u64(field(1, 0)) as u32,
        load_avg_1: parse_f64(field(2, 0)),
        load_avg_5: parse_f64(field(2, 1)),
        load_avg_15: parse_f64(field(2, 2)),
        memory_total_mb,
        memory_used_mb,
        memory_free_mb: parse_u64(field(3, 2)),
        memory_available_mb: parse_u64(field(3, 3)),
        memory_usage_percent: percent_of(memory_used_mb, memory_total_mb),
        swap_total_mb,
        swap_used_mb,
        swap_usage_percent: percent_of(swap_used_mb, swap_total_mb),
        disk_total_gb: parse_u64(field(5, 0)),
        disk_used_gb: parse_u64(field(5, 1)),
        disk_free_gb: parse_u64(field(5, 2)),
        disk_usage_percent: parse_f64(field(5, 3).map(|p| p.trim_end_matches('%'))),
        uptime_seconds: parse_u64(field(6, 0)),
        process_count: parse_u64(field(7, 0)) as u32,
        os_name: line(8).to_string(),
        kernel_version: line(9).to_string(),
        network_rx_bytes: parse_u64(field(10, 0)),
        network_tx_bytes: parse_u64(field(10, 1)),
    }
}

fn parse_f64(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Integers may come back as `3600.52` from some tools; the fraction is dropped.
fn parse_u64(value: Option<&str>) -> u64 {
    let Some(value) = value else {
        return 0;
    };
    value
        .parse::<u64>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64)
        })
        .unwrap_or(0)
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Alert thresholds exceeded by `snapshot`, formatted for an event message.
pub(crate) fn threshold_breaches(target: &TargetRecord, snapshot: &MetricsSnapshot) -> Vec<String> {
    [
        ("CPU", snapshot.cpu_usage_percent, target.alert_cpu_threshold),
        ("RAM", snapshot.memory_usage_percent, target.alert_ram_threshold),
        ("Disk", snapshot.disk_usage_percent, target.alert_disk_threshold),
    ]
    .into_iter()
    .filter(|(_, value, threshold)| value > threshold)
    .map(|(name, value, threshold)| format!("{} {:.1}% > {:.1}%", name, value, threshold))
    .collect()
}

/// Runs the metrics script against one target and records the outcome.
pub struct MetricsCollector {
    repo: Arc<dyn TargetRepository>,
    pool: Arc<SessionPool>,
    executor: CommandExecutor,
    cache: Arc<MetricsCache>,
    timeout: Duration,
}

impl MetricsCollector {
    pub fn new(
        repo: Arc<dyn TargetRepository>,
        pool: Arc<SessionPool>,
        executor: CommandExecutor,
        cache: Arc<MetricsCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            pool,
            executor,
            cache,
            timeout,
        }
    }

    /// Collect, persist and cache one snapshot.
    ///
    /// On failure a failed snapshot is persisted when the target still exists,
    /// and the original error is returned either way.
    pub async fn collect(&self, target_id: &str) -> Result<MetricsSnapshot, FleetError> {
        let target = self
            .repo
            .get_target(target_id)
            .await?
            .ok_or_else(|| FleetError::TargetGone(target_id.to_string()))?;

        if target.platform != PlatformType::Linux {
            return Err(FleetError::UnsupportedPlatform(target.platform.to_string()));
        }

        let started = Instant::now();
        match self.run_script(target_id, started).await {
            Ok(snapshot) => {
                self.repo.save_snapshot(&snapshot).await?;
                self.cache.store(snapshot.clone()).await;
                self.check_thresholds(&target, &snapshot).await;
                info!(
                    "Collected metrics for {} in {}ms (cpu {:.1}%, mem {:.1}%, disk {:.1}%)",
                    target_id,
                    snapshot.latency_ms,
                    snapshot.cpu_usage_percent,
                    snapshot.memory_usage_percent,
                    snapshot.disk_usage_percent
                );
                Ok(snapshot)
            }
            Err(e) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.record_failure(target_id, latency_ms, &e).await;
                Err(e)
            }
        }
    }

    async fn run_script(
        &self,
        target_id: &str,
        started: Instant,
    ) -> Result<MetricsSnapshot, FleetError> {
        let session = self.pool.acquire(target_id).await?;

        let output = match self
            .executor
            .try_run(&session, LINUX_METRICS_SCRIPT, Some(self.timeout), None)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                session.discard().await;
                return Err(e);
            }
        };
        session.release();

        if output.timed_out {
            return Err(FleetError::timeout(
                "metrics collection",
                self.timeout.as_secs(),
            ));
        }

        if output.stdout.trim().is_empty() {
            let stderr = output.stderr.trim();
            return Err(FleetError::Protocol(format!(
                "metrics script produced no output (exit {:?}){}{}",
                output.exit_code,
                if stderr.is_empty() { "" } else { ": " },
                stderr
            )));
        }

        if output.exit_code != Some(0) {
            debug!(
                "Metrics script on {} exited with {:?}, parsing partial output",
                target_id, output.exit_code
            );
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(parse_metrics_output(target_id, &output.stdout, latency_ms))
    }

    async fn record_failure(&self, target_id: &str, latency_ms: u64, error: &FleetError) {
        match self.repo.get_target(target_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(
                    "Target {} was deleted during collection, not persisting failure",
                    target_id
                );
                return;
            }
            Err(e) => {
                warn!("Failed to look up target {}: {}", target_id, e);
                return;
            }
        }

        let snapshot = MetricsSnapshot::failed(target_id, latency_ms, error.to_string());
        match self.repo.save_snapshot(&snapshot).await {
            Ok(()) => self.cache.store(snapshot).await,
            Err(e) => warn!("Failed to persist failed snapshot for {}: {}", target_id, e),
        }
    }

    async fn check_thresholds(&self, target: &TargetRecord, snapshot: &MetricsSnapshot) {
        let breaches = threshold_breaches(target, snapshot);
        if breaches.is_empty() {
            return;
        }

        let message = format!("Threshold breach on {}: {}", target.id, breaches.join(", "));
        warn!("{}", message);
        let event = FleetEvent::new(
            &target.id,
            EventKind::ThresholdBreach,
            EventSeverity::Warning,
            message,
        );
        if let Err(e) = self.repo.record_event(event).await {
            warn!("Failed to record threshold event for {}: {}", target.id, e);
        }
    }
}
