//! Rolling restart orchestrator.
//!
//! Single-writer state machine: exactly one run may hold the active slot,
//! all per-node work is sequential, and status readers only ever see
//! consistent snapshots. Each node goes through the same sub-machine
//! (maintenance, drain, restart over SSH, health wait) and any node placed
//! into maintenance mode is reverted before the run terminates, on every
//! path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerApi;
use crate::config::RestartSettings;
use crate::error::{AdminError, Result};
use crate::events::{EventBus, RestartEvent};
use crate::health::{ClusterValidator, ValidationVerdict};
use crate::ssh::{CommandRunner, ExecOptions};
use crate::topology::{BrokerNode, ClusterTopology};

const SERVICE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE_KILL_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(45);
const BROKER_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const POST_STOP_PAUSE: Duration = Duration::from_secs(3);
const POST_KILL_PAUSE: Duration = Duration::from_secs(2);
const POST_START_PAUSE: Duration = Duration::from_secs(10);

/// Fixed stop/start cost charged per node in the dry-run estimate.
const PER_NODE_FIXED_COST: Duration = Duration::from_secs(60);

/// Orchestrator phase, shared by run state and per-node transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPhase {
    Idle,
    Preparing,
    Maintenance,
    Draining,
    Restarting,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl RestartPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestartPhase::Completed | RestartPhase::Failed | RestartPhase::Cancelled
        )
    }

    /// `isActive` holds exactly while the phase is neither idle nor terminal.
    pub fn is_active(self) -> bool {
        !matches!(self, RestartPhase::Idle) && !self.is_terminal()
    }

    pub fn description(self) -> &'static str {
        match self {
            RestartPhase::Idle => "No rolling restart in progress",
            RestartPhase::Preparing => "Entering maintenance mode",
            RestartPhase::Maintenance => "Node held in maintenance mode",
            RestartPhase::Draining => "Waiting for client connections to drain",
            RestartPhase::Restarting => "Restarting broker service",
            RestartPhase::Validating => "Waiting for node health",
            RestartPhase::Completed => "Rolling restart completed",
            RestartPhase::Failed => "Rolling restart failed",
            RestartPhase::Cancelled => "Rolling restart cancelled",
        }
    }
}

/// Run progress counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartProgress {
    pub total: u64,
    pub completed: u64,
    pub current: Option<String>,
}

/// The orchestrator's single mutable record. Readers clone a snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub phase: RestartPhase,
    pub is_active: bool,
    /// Identifier of the current (or last) run
    pub run_id: Option<Uuid>,
    pub node_index: u64,
    pub progress: RestartProgress,
    pub current_node_connections: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub cancel_requested: bool,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            phase: RestartPhase::Idle,
            is_active: false,
            run_id: None,
            node_index: 0,
            progress: RestartProgress::default(),
            current_node_connections: None,
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            cancel_requested: false,
        }
    }
}

/// One phase transition inside a node record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub phase: RestartPhase,
    pub at: DateTime<Utc>,
}

/// Append-only per-node event log, kept in memory for status and history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRestartRecord {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub phases: Vec<PhaseTransition>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub error: Option<String>,
}

/// Options accepted by `start`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartOptions {
    pub dry_run: bool,
    pub force: bool,
    pub skip_validation: bool,
    pub reason: Option<String>,
}

impl RestartOptions {
    /// `force` is honored only together with `skipValidation` (dual-key).
    pub fn bypasses_validation(&self) -> bool {
        self.force && self.skip_validation
    }
}

/// Planned sequence returned by a dry run. No state is touched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunReport {
    pub dry_run: bool,
    pub nodes: Vec<String>,
    pub estimated_duration: String,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal summary of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub nodes_completed: u64,
    pub total_nodes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Result of a `start` call that passed admission.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StartReport {
    DryRun(DryRunReport),
    Finished(RunSummary),
}

/// Releases the active slot on every exit path, including early returns.
struct ActiveSlot<'a>(&'a AtomicBool);

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
        gauge!("rolling_restart_active", 0.0);
    }
}

/// The rolling restart state machine.
pub struct RestartOrchestrator {
    broker: Arc<dyn BrokerApi>,
    runner: Arc<dyn CommandRunner>,
    validator: Arc<ClusterValidator>,
    topology: Arc<ClusterTopology>,
    settings: RestartSettings,
    service_name: String,
    state: RwLock<OrchestratorState>,
    records: RwLock<Vec<NodeRestartRecord>>,
    active: AtomicBool,
    cancel: AtomicBool,
    events: EventBus,
}

impl RestartOrchestrator {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        runner: Arc<dyn CommandRunner>,
        validator: Arc<ClusterValidator>,
        topology: Arc<ClusterTopology>,
        settings: RestartSettings,
        service_name: String,
    ) -> Self {
        Self {
            broker,
            runner,
            validator,
            topology,
            settings,
            service_name,
            state: RwLock::new(OrchestratorState::default()),
            records: RwLock::new(Vec::new()),
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            events: EventBus::default(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Consistent snapshot of the run state.
    pub async fn snapshot(&self) -> OrchestratorState {
        self.state.read().await.clone()
    }

    /// Per-node records accumulated by this process.
    pub async fn history(&self) -> Vec<NodeRestartRecord> {
        self.records.read().await.clone()
    }

    /// Admission preview without touching any state.
    pub async fn validate_only(&self) -> ValidationVerdict {
        self.validator.restart_admission().await
    }

    /// Request cancellation of the in-flight run.
    ///
    /// Returns immediately; the run observes the flag at the next phase
    /// boundary or poll tick. In-flight SSH/HTTP calls are not interrupted.
    pub async fn cancel(&self) -> Result<()> {
        if !self.is_active() {
            return Err(AdminError::NotActive);
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.state.write().await.cancel_requested = true;
        info!("Rolling restart cancellation requested");
        Ok(())
    }

    /// Run a rolling restart (or plan one, with `dry_run`).
    ///
    /// The call returns when the run reaches a terminal phase; status reads
    /// happen concurrently from other tasks.
    pub async fn start(&self, options: RestartOptions) -> Result<StartReport> {
        if self.is_active() {
            return Err(AdminError::AlreadyActive);
        }
        if !self.settings.enable_rolling_restart {
            return Err(AdminError::Disabled);
        }

        if options.bypasses_validation() {
            warn!(
                reason = options.reason.as_deref().unwrap_or("none given"),
                "Skipping cluster validation (force + skipValidation)"
            );
        } else {
            let verdict = self.validator.restart_admission().await;
            if !verdict.can_restart {
                return Err(AdminError::Admission {
                    reasons: verdict.reasons,
                });
            }
        }

        let nodes: Vec<BrokerNode> = self
            .topology
            .nodes_in_restart_order()
            .into_iter()
            .cloned()
            .collect();

        if options.dry_run {
            return Ok(StartReport::DryRun(self.dry_run_report(&nodes)));
        }

        // Acquire the active slot; the loser of a race fails fast.
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AdminError::AlreadyActive);
        }
        let _slot = ActiveSlot(&self.active);

        self.cancel.store(false, Ordering::SeqCst);
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = nodes.len() as u64;
        {
            let mut state = self.state.write().await;
            *state = OrchestratorState {
                phase: RestartPhase::Preparing,
                is_active: true,
                run_id: Some(run_id),
                started_at: Some(started_at),
                progress: RestartProgress {
                    total,
                    completed: 0,
                    current: None,
                },
                ..OrchestratorState::default()
            };
        }

        counter!("rolling_restarts_started_total", 1);
        gauge!("rolling_restart_active", 1.0);
        info!(
            run_id = %run_id,
            total_nodes = total,
            reason = options.reason.as_deref().unwrap_or("none given"),
            "Rolling restart started"
        );
        self.events.emit(RestartEvent::Started {
            total_nodes: total,
            started_at,
        });

        let summary = self.run(run_id, &nodes, started_at).await;
        Ok(StartReport::Finished(summary))
    }

    async fn run(
        &self,
        run_id: Uuid,
        nodes: &[BrokerNode],
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let total = nodes.len() as u64;
        let mut completed = 0u64;

        for (index, node) in nodes.iter().enumerate() {
            if self.cancel_requested() {
                return self
                    .finish_cancelled(run_id, None, completed, total, started_at)
                    .await;
            }

            {
                let mut state = self.state.write().await;
                state.node_index = index as u64;
                state.progress.current = Some(node.name.clone());
            }

            match self.restart_node(node).await {
                Ok(()) => {
                    completed += 1;
                    {
                        let mut state = self.state.write().await;
                        state.progress.completed = completed;
                        state.progress.current = None;
                    }
                    counter!("rolling_restart_nodes_restarted_total", 1);
                    self.events.emit(RestartEvent::Progress {
                        completed,
                        total,
                        node: node.name.clone(),
                    });
                    info!(node = %node.name, completed, total, "Node restarted");

                    if index + 1 < nodes.len() {
                        if self.cancel_requested() {
                            return self
                                .finish_cancelled(run_id, None, completed, total, started_at)
                                .await;
                        }
                        sleep(self.settings.timeouts.inter_node()).await;
                    }
                }
                Err(AdminError::Cancelled) => {
                    return self
                        .finish_cancelled(
                            run_id,
                            Some(node.name.clone()),
                            completed,
                            total,
                            started_at,
                        )
                        .await;
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(node = %node.name, error = %message, "Node restart failed, aborting run");
                    let completed_at = Utc::now();
                    {
                        let mut state = self.state.write().await;
                        state.phase = RestartPhase::Failed;
                        state.is_active = false;
                        state.errors.push(message.clone());
                        state.completed_at = Some(completed_at);
                        state.progress.current = None;
                        state.current_node_connections = None;
                    }
                    counter!("rolling_restarts_failed_total", 1);
                    self.events.emit(RestartEvent::Failed {
                        error: message.clone(),
                    });
                    return RunSummary {
                        run_id,
                        outcome: RunOutcome::Failed,
                        nodes_completed: completed,
                        total_nodes: total,
                        error: Some(message),
                        started_at,
                        completed_at,
                    };
                }
            }
        }

        let completed_at = Utc::now();
        {
            let mut state = self.state.write().await;
            state.phase = RestartPhase::Completed;
            state.is_active = false;
            state.completed_at = Some(completed_at);
            state.progress.current = None;
        }
        counter!("rolling_restarts_completed_total", 1);
        info!(total, "Rolling restart completed");
        self.events.emit(RestartEvent::Completed { completed_at });

        RunSummary {
            run_id,
            outcome: RunOutcome::Completed,
            nodes_completed: completed,
            total_nodes: total,
            error: None,
            started_at,
            completed_at,
        }
    }

    async fn finish_cancelled(
        &self,
        run_id: Uuid,
        node: Option<String>,
        completed: u64,
        total: u64,
        started_at: DateTime<Utc>,
    ) -> RunSummary {
        let completed_at = Utc::now();
        {
            let mut state = self.state.write().await;
            state.phase = RestartPhase::Cancelled;
            state.is_active = false;
            state.completed_at = Some(completed_at);
            state.progress.current = None;
            state.current_node_connections = None;
        }
        counter!("rolling_restarts_cancelled_total", 1);
        info!(nodes_completed = completed, "Rolling restart cancelled");
        self.events.emit(RestartEvent::Cancelled { node });

        RunSummary {
            run_id,
            outcome: RunOutcome::Cancelled,
            nodes_completed: completed,
            total_nodes: total,
            error: None,
            started_at,
            completed_at,
        }
    }

    /// The per-node sub-machine.
    ///
    /// Any node that entered maintenance mode leaves it before this
    /// function returns, whether the node succeeded, failed, or the run
    /// was cancelled mid-node.
    async fn restart_node(&self, node: &BrokerNode) -> Result<()> {
        let node_timer = Instant::now();
        self.open_record(node).await;

        self.enter_phase(RestartPhase::Preparing, node).await;
        match self
            .broker
            .set_maintenance_mode(node, true, "Rolling restart")
            .await
        {
            Ok(ack) => {
                if let Some(warning) = ack.warning {
                    warn!(node = %node.name, %warning, "Maintenance mode degraded");
                }
            }
            Err(e) => {
                let err = AdminError::NodeOperation(format!(
                    "failed to enter maintenance mode on {}: {}",
                    node.name, e
                ));
                self.close_record(node, node_timer, Some(err.to_string()))
                    .await;
                return Err(err);
            }
        }

        let result = self.node_phases(node).await;

        match result {
            Ok(()) => {
                match self
                    .broker
                    .set_maintenance_mode(node, false, "Rolling restart completed")
                    .await
                {
                    Ok(ack) => {
                        if let Some(warning) = ack.warning {
                            warn!(node = %node.name, %warning, "Maintenance mode degraded");
                        }
                    }
                    Err(e) => {
                        // Health already validated; record and keep going.
                        warn!(node = %node.name, error = %e, "Failed to leave maintenance mode");
                        self.state.write().await.errors.push(format!(
                            "node {}: failed to leave maintenance mode: {}",
                            node.name, e
                        ));
                    }
                }
                self.close_record(node, node_timer, None).await;
                Ok(())
            }
            Err(original) => {
                // Cleanup invariant: revert maintenance before re-raising.
                if let Err(cleanup_err) = self
                    .broker
                    .set_maintenance_mode(node, false, "cleanup")
                    .await
                {
                    warn!(
                        node = %node.name,
                        error = %cleanup_err,
                        "Maintenance cleanup failed after node error"
                    );
                }
                self.close_record(node, node_timer, Some(original.to_string()))
                    .await;
                Err(original)
            }
        }
    }

    async fn node_phases(&self, node: &BrokerNode) -> Result<()> {
        self.ensure_not_cancelled()?;
        self.enter_phase(RestartPhase::Draining, node).await;
        self.drain_connections(node).await?;

        self.ensure_not_cancelled()?;
        self.enter_phase(RestartPhase::Restarting, node).await;
        self.restart_service(node).await?;

        self.ensure_not_cancelled()?;
        self.enter_phase(RestartPhase::Validating, node).await;
        self.wait_for_health(node).await?;

        // Idle stabilization before the node counts as done.
        sleep(self.settings.timeouts.post_restart_validation()).await;
        Ok(())
    }

    /// Wait for client connections to drain, bounded by the drain budget.
    ///
    /// This step never fails the restart: clients must tolerate abrupt
    /// disconnects anyway, and blocking on long-lived consumers would stall
    /// the run indefinitely.
    async fn drain_connections(&self, node: &BrokerNode) -> Result<()> {
        let budget = self.settings.timeouts.connection_drain();
        let interval = self.settings.timeouts.connection_drain_check();
        let deadline = Instant::now() + budget;

        while Instant::now() < deadline {
            if self.cancel_requested() {
                self.set_draining_count(None).await;
                return Err(AdminError::Cancelled);
            }
            match self.broker.connection_count(&node.id).await {
                Err(e) => {
                    // Transient observation failure: proceed as if drained.
                    warn!(
                        node = %node.name,
                        error = %e,
                        "Connection observation failed, proceeding"
                    );
                    self.set_draining_count(None).await;
                    return Ok(());
                }
                Ok(0) => {
                    debug!(node = %node.name, "Connections drained");
                    self.set_draining_count(None).await;
                    return Ok(());
                }
                Ok(count) => {
                    debug!(node = %node.name, connections = count, "Waiting for drain");
                    self.set_draining_count(Some(count)).await;
                }
            }
            sleep(interval).await;
        }

        let final_count = self.broker.connection_count(&node.id).await.unwrap_or(0);
        self.set_draining_count(None).await;

        if final_count > 0 {
            warn!(
                node = %node.name,
                connections = final_count,
                "Drain budget elapsed with connections still open"
            );
            if self.settings.force_close_connections_after_drain {
                if final_count <= self.settings.force_close_max_connections {
                    match self
                        .broker
                        .force_close_node_connections(&node.id, final_count)
                        .await
                    {
                        Ok(report) => info!(
                            node = %node.name,
                            closed = report.closed,
                            remaining = report.remaining,
                            "Force-closed leftover connections"
                        ),
                        Err(e) => warn!(
                            node = %node.name,
                            error = %e,
                            "Force-close failed, proceeding with restart"
                        ),
                    }
                } else {
                    warn!(
                        node = %node.name,
                        connections = final_count,
                        cap = self.settings.force_close_max_connections,
                        "Too many connections to force-close safely"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop-then-start over SSH with fixed settle pauses.
    async fn restart_service(&self, node: &BrokerNode) -> Result<()> {
        let service = self.service_name.clone();

        let observed = self.service_state(node).await?;
        info!(node = %node.name, state = %observed, "Service state before stop");

        if let Err(e) = self
            .runner
            .execute(
                node,
                &format!("systemctl stop {}", service),
                ExecOptions::sudo(SERVICE_STOP_TIMEOUT),
            )
            .await
        {
            // A refused stop is recoverable as long as the kill below lands.
            warn!(node = %node.name, error = %e, "systemctl stop failed");
        }
        sleep(POST_STOP_PAUSE).await;

        if self.is_service_active(node).await? {
            warn!(node = %node.name, "Service still active after stop, killing");
            self.runner
                .execute(
                    node,
                    &format!("systemctl kill {}", service),
                    ExecOptions::sudo(SERVICE_KILL_TIMEOUT),
                )
                .await
                .map_err(|e| {
                    AdminError::NodeOperation(format!(
                        "failed to kill {} on {}: {}",
                        service, node.name, e
                    ))
                })?;
            sleep(POST_KILL_PAUSE).await;
        }

        self.runner
            .execute(
                node,
                &format!("systemctl start {}", service),
                ExecOptions::sudo(SERVICE_START_TIMEOUT),
            )
            .await
            .map_err(|e| {
                AdminError::NodeOperation(format!(
                    "failed to start {} on {}: {}",
                    service, node.name, e
                ))
            })?;
        sleep(POST_START_PAUSE).await;

        if !self.is_service_active(node).await? {
            return Err(AdminError::NodeOperation(format!(
                "{} did not become active on {} after start",
                service, node.name
            )));
        }

        // Best-effort broker-level probe; the HTTP health wait below is
        // authoritative.
        if let Err(e) = self
            .runner
            .execute(
                node,
                "rabbitmqctl node_health_check",
                ExecOptions::sudo(BROKER_PROBE_TIMEOUT),
            )
            .await
        {
            warn!(
                node = %node.name,
                error = %e,
                "rabbitmqctl health check failed, relying on HTTP health wait"
            );
        }

        Ok(())
    }

    async fn service_state(&self, node: &BrokerNode) -> Result<String> {
        let command = format!("systemctl is-active {}", self.service_name);
        match self
            .runner
            .execute(node, &command, ExecOptions::plain(SERVICE_CHECK_TIMEOUT))
            .await
        {
            Ok(output) => Ok(output),
            // is-active exits non-zero for every state but "active"
            Err(AdminError::CommandFailed { output, .. }) => {
                if output.is_empty() {
                    Ok("inactive".to_string())
                } else {
                    Ok(output)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn is_service_active(&self, node: &BrokerNode) -> Result<bool> {
        Ok(self.service_state(node).await?.trim() == "active")
    }

    /// Poll node health until it reports healthy or the startup budget
    /// elapses. Individual poll failures are tolerated: right after start
    /// the management API may still answer 5xx for a running process.
    async fn wait_for_health(&self, node: &BrokerNode) -> Result<()> {
        let budget = self.settings.timeouts.node_startup();
        let interval = self.settings.timeouts.health_check_interval();
        let deadline = Instant::now() + budget;

        while Instant::now() < deadline {
            self.ensure_not_cancelled()?;
            match self.broker.check_node_health(node).await {
                Ok(health) if health.is_healthy => {
                    info!(node = %node.name, "Node healthy after restart");
                    return Ok(());
                }
                Ok(health) => {
                    debug!(node = %node.name, issues = ?health.issues, "Node not yet healthy");
                }
                Err(e) => {
                    debug!(node = %node.name, error = %e, "Health poll failed, retrying");
                }
            }
            sleep(interval).await;
        }

        Err(AdminError::NodeOperation(format!(
            "Node {} failed to become healthy within {}s",
            node.name,
            budget.as_secs()
        )))
    }

    fn dry_run_report(&self, nodes: &[BrokerNode]) -> DryRunReport {
        let timeouts = &self.settings.timeouts;
        let per_node = timeouts.connection_drain()
            + timeouts.node_startup()
            + timeouts.post_restart_validation()
            + timeouts.inter_node()
            + PER_NODE_FIXED_COST;
        let total = per_node * nodes.len() as u32;
        let minutes = (total.as_secs() + 59) / 60;

        DryRunReport {
            dry_run: true,
            nodes: nodes.iter().map(|n| n.name.clone()).collect(),
            estimated_duration: format!("{} minutes", minutes),
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel_requested() {
            Err(AdminError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn enter_phase(&self, phase: RestartPhase, node: &BrokerNode) {
        self.state.write().await.phase = phase;
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.node == node.name && r.completed_at.is_none())
        {
            record.phases.push(PhaseTransition {
                phase,
                at: Utc::now(),
            });
        }
        drop(records);
        self.events.emit(RestartEvent::PhaseChange {
            phase,
            node: Some(node.name.clone()),
        });
    }

    async fn set_draining_count(&self, count: Option<u64>) {
        self.state.write().await.current_node_connections = count;
    }

    async fn open_record(&self, node: &BrokerNode) {
        self.records.write().await.push(NodeRestartRecord {
            node: node.name.clone(),
            started_at: Utc::now(),
            phases: Vec::new(),
            completed_at: None,
            duration_seconds: None,
            error: None,
        });
    }

    async fn close_record(&self, node: &BrokerNode, timer: Instant, error: Option<String>) {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.node == node.name && r.completed_at.is_none())
        {
            record.completed_at = Some(Utc::now());
            record.duration_seconds = Some(timer.elapsed().as_secs());
            record.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_activity_mapping() {
        assert!(!RestartPhase::Idle.is_active());
        assert!(!RestartPhase::Completed.is_active());
        assert!(!RestartPhase::Failed.is_active());
        assert!(!RestartPhase::Cancelled.is_active());
        assert!(RestartPhase::Preparing.is_active());
        assert!(RestartPhase::Draining.is_active());
        assert!(RestartPhase::Restarting.is_active());
        assert!(RestartPhase::Validating.is_active());
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RestartPhase::Draining).unwrap(),
            "\"draining\""
        );
        assert_eq!(
            serde_json::to_string(&RestartPhase::Idle).unwrap(),
            "\"idle\""
        );
    }

    #[test]
    fn test_dual_key_force_semantics() {
        let force_only = RestartOptions {
            force: true,
            ..Default::default()
        };
        assert!(!force_only.bypasses_validation());

        let both = RestartOptions {
            force: true,
            skip_validation: true,
            ..Default::default()
        };
        assert!(both.bypasses_validation());

        let skip_only = RestartOptions {
            skip_validation: true,
            ..Default::default()
        };
        assert!(!skip_only.bypasses_validation());
    }

    #[test]
    fn test_every_phase_has_a_description() {
        for phase in [
            RestartPhase::Idle,
            RestartPhase::Preparing,
            RestartPhase::Maintenance,
            RestartPhase::Draining,
            RestartPhase::Restarting,
            RestartPhase::Validating,
            RestartPhase::Completed,
            RestartPhase::Failed,
            RestartPhase::Cancelled,
        ] {
            assert!(!phase.description().is_empty());
        }
    }
}
