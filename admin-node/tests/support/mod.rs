//! Shared test doubles: recording fakes for the broker API and the SSH
//! command runner, plus topology and settings builders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use admin_node::broker::{
    Alarm, BrokerApi, ConnectionInfo, ConnectivityProbe, ForceCloseReport, MaintenanceAck,
    NodeInfo, QueueInfo,
};
use admin_node::config::{RestartSettings, TimeoutSettings};
use admin_node::error::{AdminError, Result};
use admin_node::events::RestartEvent;
use admin_node::health::{ClusterValidator, NodeHealth};
use admin_node::orchestrator::RestartOrchestrator;
use admin_node::ssh::{CommandRunner, ExecOptions};
use admin_node::topology::{BrokerNode, ClusterTopology};

/// Topology with nodes named a, b, c, ... in ascending configOrder.
pub fn topology_of(count: usize) -> ClusterTopology {
    let names = ["a", "b", "c", "d", "e"];
    ClusterTopology {
        cluster_name: "test-cluster".to_string(),
        version: Some("1".to_string()),
        restart_config: None,
        nodes: (0..count)
            .map(|i| BrokerNode {
                id: format!("rabbit@{}", names[i]),
                name: names[i].to_string(),
                host_ip: Some(format!("10.0.0.{}", i + 1)),
                hostname: None,
                port: 5672,
                management_port: 15672,
                ssh_port: 22,
                config_order: (i + 1) as i64,
            })
            .collect(),
    }
}

/// Millisecond-scale budgets so loop tests finish quickly.
pub fn fast_settings() -> RestartSettings {
    RestartSettings {
        enable_rolling_restart: true,
        require_all_nodes_healthy: true,
        allow_restart_with_partitions: false,
        force_close_connections_after_drain: false,
        force_close_max_connections: 10,
        timeouts: TimeoutSettings {
            connection_drain_ms: 200,
            connection_drain_check_ms: 10,
            post_restart_validation_ms: 10,
            inter_node_ms: 10,
            node_startup_ms: 200,
            health_check_interval_ms: 10,
            api_timeout_ms: 1_000,
        },
    }
}

type Script<T> = Mutex<HashMap<String, VecDeque<std::result::Result<T, String>>>>;

/// Recording fake of the broker management API.
///
/// Health checks and connection counts are scripted per node; an exhausted
/// script repeats its last value. With no script a node is healthy with
/// zero connections.
#[derive(Default)]
pub struct MockBroker {
    pub calls: Mutex<Vec<String>>,
    health: Script<bool>,
    counts: Script<u64>,
    maintenance: Mutex<HashMap<String, bool>>,
}

impl MockBroker {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script `check_node_health` results for a node (by name).
    pub fn script_health(&self, node: &str, script: Vec<std::result::Result<bool, String>>) {
        self.health
            .lock()
            .unwrap()
            .insert(node.to_string(), script.into());
    }

    /// Script `connection_count` results for a node (by id).
    pub fn script_counts(&self, node_id: &str, script: Vec<std::result::Result<u64, String>>) {
        self.counts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), script.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn in_maintenance(&self, node: &str) -> bool {
        self.maintenance
            .lock()
            .unwrap()
            .get(node)
            .copied()
            .unwrap_or(false)
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn next<T: Clone>(script: &Script<T>, key: &str) -> Option<std::result::Result<T, String>> {
        let mut scripts = script.lock().unwrap();
        let entries = scripts.get_mut(key)?;
        if entries.len() > 1 {
            entries.pop_front()
        } else {
            entries.front().cloned()
        }
    }
}

fn healthy_report() -> NodeHealth {
    NodeHealth {
        running: true,
        memory_percent: 20,
        disk_free_gb: 50,
        fd_percent: 5,
        partitions: vec![],
        alarms: vec![],
        is_healthy: true,
        issues: vec![],
        last_check: Utc::now(),
    }
}

fn unhealthy_report() -> NodeHealth {
    NodeHealth {
        issues: vec!["management API not ready".to_string()],
        is_healthy: false,
        ..healthy_report()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn node_info(&self, node: &BrokerNode) -> Result<NodeInfo> {
        self.log(format!("node_info:{}", node.name));
        Ok(NodeInfo {
            name: node.id.clone(),
            running: true,
            mem_used: 20,
            mem_limit: 100,
            disk_free: 50 << 30,
            fd_used: 5,
            fd_total: 100,
            ..Default::default()
        })
    }

    async fn alarms(&self) -> Result<Vec<Alarm>> {
        Ok(vec![])
    }

    async fn partitions(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(HashMap::new())
    }

    async fn connections(&self, _node: Option<&str>) -> Result<Vec<ConnectionInfo>> {
        Ok(vec![])
    }

    async fn connection_count(&self, node: &str) -> Result<u64> {
        self.log(format!("count:{}", node));
        match Self::next(&self.counts, node) {
            None => Ok(0),
            Some(Ok(count)) => Ok(count),
            Some(Err(message)) => Err(AdminError::BrokerApi(message)),
        }
    }

    async fn close_connection(&self, name: &str, _reason: &str) -> Result<()> {
        self.log(format!("close:{}", name));
        Ok(())
    }

    async fn force_close_node_connections(
        &self,
        node: &str,
        max_to_close: u64,
    ) -> Result<ForceCloseReport> {
        self.log(format!("force_close:{}:{}", node, max_to_close));
        Ok(ForceCloseReport {
            closed: max_to_close,
            remaining: 0,
        })
    }

    async fn set_maintenance_mode(
        &self,
        node: &BrokerNode,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck> {
        self.log(format!(
            "maintenance:{}:{}:{}",
            node.name,
            if enabled { "on" } else { "off" },
            reason
        ));
        self.maintenance
            .lock()
            .unwrap()
            .insert(node.name.clone(), enabled);
        Ok(MaintenanceAck {
            node: node.name.clone(),
            enabled,
            warning: None,
        })
    }

    async fn check_node_health(&self, node: &BrokerNode) -> Result<NodeHealth> {
        self.log(format!("health:{}", node.name));
        match Self::next(&self.health, &node.name) {
            None | Some(Ok(true)) => Ok(healthy_report()),
            Some(Ok(false)) => Ok(unhealthy_report()),
            Some(Err(message)) => Err(AdminError::Unreachable(message)),
        }
    }

    async fn queues(&self, _node: Option<&str>) -> Result<Vec<QueueInfo>> {
        Ok(vec![])
    }

    async fn test_connectivity(&self) -> Result<Vec<ConnectivityProbe>> {
        Ok(vec![])
    }
}

/// Recording fake of the SSH executor with a tiny service state machine:
/// stop/kill deactivate, start activates, is-active reports accordingly.
#[derive(Default)]
pub struct MockRunner {
    pub calls: Mutex<Vec<String>>,
    active: Mutex<HashMap<String, bool>>,
    fail_start: Mutex<HashSet<String>>,
}

impl MockRunner {
    pub fn obedient() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `systemctl start` fail on the named node.
    pub fn fail_start_on(&self, node: &str) {
        self.fail_start.lock().unwrap().insert(node.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn execute(
        &self,
        node: &BrokerNode,
        command: &str,
        _options: ExecOptions,
    ) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", node.name, command));
        let name = node.name.clone();

        if command.starts_with("systemctl is-active") {
            let is_active = *self.active.lock().unwrap().entry(name).or_insert(true);
            if is_active {
                Ok("active".to_string())
            } else {
                Err(AdminError::CommandFailed {
                    command: command.to_string(),
                    exit_status: 3,
                    output: "inactive".to_string(),
                })
            }
        } else if command.starts_with("systemctl stop") || command.starts_with("systemctl kill") {
            self.active.lock().unwrap().insert(name, false);
            Ok(String::new())
        } else if command.starts_with("systemctl start") {
            if self.fail_start.lock().unwrap().contains(&name) {
                return Err(AdminError::CommandFailed {
                    command: command.to_string(),
                    exit_status: 1,
                    output: "Job for rabbitmq-server.service failed".to_string(),
                });
            }
            self.active.lock().unwrap().insert(name, true);
            Ok(String::new())
        } else if command.starts_with("rabbitmqctl") {
            Ok("Health check passed".to_string())
        } else {
            Ok("ok".to_string())
        }
    }

    async fn dispose_all(&self) {}
}

/// Wire an orchestrator over the fakes.
pub fn build_orchestrator(
    broker: Arc<MockBroker>,
    runner: Arc<MockRunner>,
    topology: ClusterTopology,
    settings: RestartSettings,
) -> Arc<RestartOrchestrator> {
    let topology = Arc::new(topology);
    let broker_api: Arc<dyn BrokerApi> = broker;
    let validator = Arc::new(ClusterValidator::new(
        broker_api.clone(),
        Arc::clone(&topology),
        settings.clone(),
    ));
    Arc::new(RestartOrchestrator::new(
        broker_api,
        runner,
        validator,
        topology,
        settings,
        "rabbitmq-server".to_string(),
    ))
}

/// Compact label for event-order assertions.
pub fn event_label(event: &RestartEvent) -> String {
    match event {
        RestartEvent::Started { total_nodes, .. } => format!("started:{}", total_nodes),
        RestartEvent::PhaseChange { phase, node } => format!(
            "phase:{}:{}",
            serde_json::to_string(phase).unwrap().trim_matches('"'),
            node.clone().unwrap_or_default()
        ),
        RestartEvent::Progress {
            completed,
            total,
            node,
        } => format!("progress:{}/{}:{}", completed, total, node),
        RestartEvent::Completed { .. } => "completed".to_string(),
        RestartEvent::Failed { error } => format!("failed:{}", error),
        RestartEvent::Cancelled { .. } => "cancelled".to_string(),
    }
}
