//! MCP Fleet Commands implementation.
//!
//! Administrative tools over a shared [`FleetService`]:
//!
//! - `fleet_test_connection`: Staged connection diagnostic
//! - `fleet_execute`: Run one command on a pooled session
//! - `fleet_collect_now` / `fleet_trigger` / `fleet_trigger_all`: Metrics collection
//! - `fleet_set_metrics_interval` / `fleet_set_metrics_enabled`: Scheduling
//! - `fleet_latest_metrics` / `fleet_overview`: Cached metrics
//! - `fleet_queue_stats` / `fleet_pause_queue` / `fleet_resume_queue` / `fleet_clean_queue`
//! - `fleet_pool_stats` / `fleet_close_sessions` / `fleet_invalidate_config`

use std::sync::Arc;
use std::time::Duration;

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::{info, warn};

use crate::fleet::error::FleetError;
use crate::fleet::service::FleetService;
use crate::fleet::types::{
    CommandOutcome, ConnectionTestResult, FleetAggregate, MetricsSnapshot, PoolStats, QueueStats,
};

fn tool_error(operation: &str, target_id: Option<&str>, e: FleetError) -> String {
    match target_id {
        Some(id) => warn!("{} failed for {}: {}", operation, id, e),
        None => warn!("{} failed: {}", operation, e),
    }
    e.to_string()
}

/// MCP Fleet Commands tool implementation.
///
/// Cheap to clone; every MCP session gets its own instance over the same
/// service.
#[derive(Clone)]
pub struct McpFleetCommands {
    service: Arc<FleetService>,
}

impl McpFleetCommands {
    pub fn new(service: Arc<FleetService>) -> Self {
        Self { service }
    }
}

#[Tools]
impl McpFleetCommands {
    /// Run a staged connection diagnostic against a target.
    ///
    /// Stages: DNS, TCP, host key, authentication, privilege escalation, then
    /// `whoami`, `uname -a` and any extra commands. Stage failures are reported
    /// in the result; only an unknown target or a test already running for the
    /// same target fail the call.
    async fn fleet_test_connection(
        &self,
        /// Target ID from the inventory
        target_id: String,
        /// Extra commands to run after the default ones (each one is validated first)
        commands: Option<Vec<String>>,
    ) -> Result<StructuredContent<ConnectionTestResult>, String> {
        let commands = commands.unwrap_or_default();
        info!("Testing connection to {}", target_id);
        self.service
            .test_connection(&target_id, &commands)
            .await
            .map(StructuredContent)
            .map_err(|e| tool_error("Connection test", Some(&target_id), e))
    }

    /// Execute a command on a target over a pooled session.
    ///
    /// Commands containing null bytes, backticks or a destructive pattern
    /// (fork bombs, `rm -rf /`, disk formatting, shutdown) are refused before
    /// anything is sent. Secrets in the output are redacted.
    async fn fleet_execute(
        &self,
        /// Target ID from the inventory
        target_id: String,
        /// Shell command to execute on the target
        command: String,
        /// Command execution timeout in seconds (default: 30, env: FLEET_COMMAND_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<CommandOutcome>, String> {
        self.service
            .execute(&target_id, &command, timeout_secs.map(Duration::from_secs))
            .await
            .map(StructuredContent)
            .map_err(|e| tool_error("Command", Some(&target_id), e))
    }

    /// Collect metrics from a target right away and return the snapshot.
    async fn fleet_collect_now(
        &self,
        /// Target ID from the inventory
        target_id: String,
    ) -> Result<StructuredContent<MetricsSnapshot>, String> {
        self.service
            .collect_now(&target_id)
            .await
            .map(StructuredContent)
            .map_err(|e| tool_error("Metrics collection", Some(&target_id), e))
    }

    /// Queue a manual metrics collection for a target, ahead of scheduled ones.
    async fn fleet_trigger(
        &self,
        /// Target ID from the inventory
        target_id: String,
    ) -> Result<Text<String>, String> {
        self.service
            .trigger(&target_id)
            .await
            .map_err(|e| tool_error("Trigger", Some(&target_id), e))?;
        Ok(Text(format!("Metrics collection queued for {}", target_id)))
    }

    /// Queue a manual metrics collection for every metrics-enabled target.
    async fn fleet_trigger_all(&self) -> Result<Text<String>, String> {
        let count = self
            .service
            .trigger_all()
            .await
            .map_err(|e| tool_error("Trigger all", None, e))?;
        Ok(Text(format!("Metrics collection queued for {} target(s)", count)))
    }

    /// Change how often metrics are collected from a target.
    ///
    /// The schedule is re-armed immediately when metrics are enabled.
    async fn fleet_set_metrics_interval(
        &self,
        /// Target ID from the inventory
        target_id: String,
        /// Collection interval in seconds (minimum 30)
        interval_secs: u64,
    ) -> Result<Text<String>, String> {
        self.service
            .set_metrics_interval(&target_id, interval_secs)
            .await
            .map_err(|e| tool_error("Interval change", Some(&target_id), e))?;
        Ok(Text(format!(
            "Metrics interval for {} set to {}s",
            target_id, interval_secs
        )))
    }

    /// Switch scheduled metrics collection on or off for a target.
    ///
    /// Enabling also clears the consecutive failure counter, so a target that
    /// was switched off automatically gets a fresh start.
    async fn fleet_set_metrics_enabled(
        &self,
        /// Target ID from the inventory
        target_id: String,
        /// true to enable, false to disable
        enabled: bool,
    ) -> Result<Text<String>, String> {
        self.service
            .set_metrics_enabled(&target_id, enabled)
            .await
            .map_err(|e| tool_error("Metrics toggle", Some(&target_id), e))?;
        Ok(Text(format!(
            "Metrics collection {} for {}",
            if enabled { "enabled" } else { "disabled" },
            target_id
        )))
    }

    /// Latest metrics snapshot of a target, served from cache when fresh.
    async fn fleet_latest_metrics(
        &self,
        /// Target ID from the inventory
        target_id: String,
    ) -> Result<StructuredContent<MetricsSnapshot>, String> {
        match self.service.latest_metrics(&target_id).await {
            Ok(Some(snapshot)) => Ok(StructuredContent(snapshot)),
            Ok(None) => Err(format!("No metrics collected yet for {}", target_id)),
            Err(e) => Err(tool_error("Latest metrics", Some(&target_id), e)),
        }
    }

    /// Fleet-wide averages and totals over the latest snapshots.
    async fn fleet_overview(&self) -> Result<StructuredContent<FleetAggregate>, String> {
        self.service
            .fleet_overview()
            .await
            .map(StructuredContent)
            .map_err(|e| tool_error("Fleet overview", None, e))
    }

    /// Collection queue statistics, including every repeatable schedule.
    async fn fleet_queue_stats(&self) -> StructuredContent<QueueStats> {
        StructuredContent(self.service.queue_stats())
    }

    /// Stop handing jobs to workers. Schedules keep firing and jobs wait.
    async fn fleet_pause_queue(&self) -> Text<String> {
        self.service.pause_queue();
        Text("Collection queue paused".to_string())
    }

    async fn fleet_resume_queue(&self) -> Text<String> {
        self.service.resume_queue();
        Text("Collection queue resumed".to_string())
    }

    /// Drop all waiting jobs and reset the completed and failed counters.
    async fn fleet_clean_queue(&self) -> Text<String> {
        let dropped = self.service.clean_queue();
        Text(format!(
            "Collection queue cleaned, {} waiting job(s) dropped",
            dropped
        ))
    }

    /// Session pool statistics per target.
    async fn fleet_pool_stats(&self) -> StructuredContent<PoolStats> {
        StructuredContent(self.service.pool_stats())
    }

    /// Close every pooled session of a target, including borrowed ones.
    async fn fleet_close_sessions(
        &self,
        /// Target ID from the inventory
        target_id: String,
    ) -> Text<String> {
        let closed = self.service.close_sessions(&target_id).await;
        Text(format!("Closed {} session(s) for {}", closed, target_id))
    }

    /// Drop the cached connection settings of a target.
    ///
    /// Use after changing a target's host, credentials or host-key policy.
    async fn fleet_invalidate_config(
        &self,
        /// Target ID from the inventory
        target_id: String,
        /// Also close the target's pooled sessions (default: false)
        close_sessions: Option<bool>,
    ) -> Text<String> {
        if close_sessions.unwrap_or(false) {
            let closed = self.service.credentials_changed(&target_id).await;
            Text(format!(
                "Connection settings for {} invalidated, {} session(s) closed",
                target_id, closed
            ))
        } else {
            self.service.invalidate_config(&target_id);
            Text(format!("Connection settings for {} invalidated", target_id))
        }
    }
}
