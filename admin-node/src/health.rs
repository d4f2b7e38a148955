//! Node health derivation and cluster-level validation.
//!
//! [`HealthEvaluator::evaluate`] is a pure function from raw broker
//! counters to a health verdict; [`ClusterValidator`] composes it across
//! the topology and produces the admission verdict that gates a rolling
//! restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::{Alarm, BrokerApi, NodeInfo};
use crate::config::RestartSettings;
use crate::topology::ClusterTopology;

/// Memory usage above this percentage disqualifies a node.
pub const MEMORY_PERCENT_LIMIT: u64 = 90;
/// Nodes need at least this much free disk, in GiB.
pub const MIN_DISK_FREE_GB: u64 = 1;
/// File descriptor usage above this percentage disqualifies a node.
pub const FD_PERCENT_LIMIT: u64 = 95;

/// Alarm kinds that block a rolling restart outright.
pub const CRITICAL_ALARM_KINDS: [&str; 3] =
    ["memory_alarm", "disk_alarm", "file_descriptor_alarm"];

/// Derived health for one node. Ephemeral; recomputed on every check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub running: bool,
    pub memory_percent: u64,
    pub disk_free_gb: u64,
    pub fd_percent: u64,
    pub partitions: Vec<String>,
    pub alarms: Vec<Alarm>,
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub last_check: DateTime<Utc>,
}

/// Pure evaluation of raw node counters against the health thresholds.
pub struct HealthEvaluator;

impl HealthEvaluator {
    pub fn evaluate(info: &NodeInfo, alarms: &[Alarm]) -> NodeHealth {
        let memory_percent = percent(info.mem_used, info.mem_limit);
        let disk_free_gb = info.disk_free >> 30;
        let fd_percent = percent(info.fd_used, info.fd_total);

        let node_alarms: Vec<Alarm> = alarms
            .iter()
            .filter(|a| a.node == info.name)
            .cloned()
            .collect();

        // Issues mirror the checks, in the order they are made.
        let mut issues = Vec::new();
        if !info.running {
            issues.push("node is not running".to_string());
        }
        if !info.partitions.is_empty() {
            issues.push(format!(
                "network partitions reported: {}",
                info.partitions.join(", ")
            ));
        }
        if !node_alarms.is_empty() {
            let kinds: Vec<&str> = node_alarms.iter().map(|a| a.alarm.as_str()).collect();
            issues.push(format!("active alarms: {}", kinds.join(", ")));
        }
        if memory_percent > MEMORY_PERCENT_LIMIT {
            issues.push(format!(
                "memory usage at {}% (limit {}%)",
                memory_percent, MEMORY_PERCENT_LIMIT
            ));
        }
        if disk_free_gb < MIN_DISK_FREE_GB {
            issues.push(format!(
                "disk free below {}GB ({}GB available)",
                MIN_DISK_FREE_GB, disk_free_gb
            ));
        }
        if fd_percent > FD_PERCENT_LIMIT {
            issues.push(format!(
                "file descriptor usage at {}% (limit {}%)",
                fd_percent, FD_PERCENT_LIMIT
            ));
        }

        NodeHealth {
            running: info.running,
            memory_percent,
            disk_free_gb,
            fd_percent,
            partitions: info.partitions.clone(),
            alarms: node_alarms,
            is_healthy: issues.is_empty(),
            issues,
            last_check: Utc::now(),
        }
    }

    /// The subset of alarms that disqualifies the whole cluster.
    pub fn critical_alarms(alarms: &[Alarm]) -> Vec<&Alarm> {
        alarms
            .iter()
            .filter(|a| CRITICAL_ALARM_KINDS.contains(&a.alarm.as_str()))
            .collect()
    }
}

fn percent(used: u64, limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    (used as f64 / limit as f64 * 100.0).round() as u64
}

/// Health summary for one node inside a cluster report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<NodeHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cluster-wide roll-up produced by [`ClusterValidator::cluster_health`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealthReport {
    pub healthy: bool,
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub all_nodes_healthy: bool,
    /// Aggregated issues: per-node, then alarms, then partitions
    pub issues: Vec<String>,
    pub nodes: Vec<NodeHealthSummary>,
    pub checked_at: DateTime<Utc>,
    #[serde(skip)]
    node_issues: Vec<String>,
    #[serde(skip)]
    alarm_issues: Vec<String>,
    #[serde(skip)]
    partition_issues: Vec<String>,
}

/// Admission verdict for a rolling restart request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub can_restart: bool,
    pub reasons: Vec<String>,
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub all_nodes_healthy: bool,
}

/// Composes the broker client and health evaluator across the topology.
pub struct ClusterValidator {
    broker: Arc<dyn BrokerApi>,
    topology: Arc<ClusterTopology>,
    settings: RestartSettings,
}

impl ClusterValidator {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        topology: Arc<ClusterTopology>,
        settings: RestartSettings,
    ) -> Self {
        Self {
            broker,
            topology,
            settings,
        }
    }

    /// Check every topology node and aggregate the cluster verdict.
    ///
    /// Per-node failures become issues rather than errors so a single
    /// unreachable management port still yields a usable report.
    pub async fn cluster_health(&self) -> ClusterHealthReport {
        let mut node_issues = Vec::new();
        let mut alarm_issues = Vec::new();
        let mut partition_issues = Vec::new();
        let mut nodes = Vec::new();
        let mut healthy_nodes = 0u64;

        for node in self.topology.nodes_in_restart_order() {
            match self.broker.check_node_health(node).await {
                Ok(health) => {
                    if health.is_healthy {
                        healthy_nodes += 1;
                    } else {
                        node_issues.push(format!("{}: {}", node.name, health.issues.join(", ")));
                    }
                    nodes.push(NodeHealthSummary {
                        name: node.name.clone(),
                        health: Some(health),
                        error: None,
                    });
                }
                Err(e) => {
                    node_issues.push(format!(
                        "cannot reach management API for {}: {}",
                        node.name, e
                    ));
                    nodes.push(NodeHealthSummary {
                        name: node.name.clone(),
                        health: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        match self.broker.alarms().await {
            Ok(alarms) => {
                let critical = HealthEvaluator::critical_alarms(&alarms);
                if !critical.is_empty() {
                    let listed: Vec<String> = critical
                        .iter()
                        .map(|a| format!("{} on {}", a.alarm, a.node))
                        .collect();
                    alarm_issues.push(format!("Critical alarms: {}", listed.join(", ")));
                }
            }
            Err(e) => alarm_issues.push(format!("cannot fetch cluster alarms: {}", e)),
        }

        match self.broker.partitions().await {
            Ok(partitions) if !partitions.is_empty() => {
                let mut listed: Vec<String> = partitions
                    .iter()
                    .map(|(node, peers)| format!("{} -> [{}]", node, peers.join(", ")))
                    .collect();
                listed.sort();
                partition_issues.push(format!(
                    "Network partitions detected: {}",
                    listed.join("; ")
                ));
            }
            Ok(_) => {}
            Err(e) => partition_issues.push(format!("cannot fetch partition state: {}", e)),
        }

        let total_nodes = self.topology.node_count() as u64;
        let all_nodes_healthy = healthy_nodes == total_nodes;
        let mut issues = node_issues.clone();
        issues.extend(alarm_issues.iter().cloned());
        issues.extend(partition_issues.iter().cloned());

        ClusterHealthReport {
            healthy: issues.is_empty(),
            total_nodes,
            healthy_nodes,
            all_nodes_healthy,
            issues,
            nodes,
            checked_at: Utc::now(),
            node_issues,
            alarm_issues,
            partition_issues,
        }
    }

    /// The stricter admission check for starting a rolling restart.
    pub async fn restart_admission(&self) -> ValidationVerdict {
        let report = self.cluster_health().await;
        let mut reasons = Vec::new();

        if !self.settings.enable_rolling_restart {
            reasons.push("Rolling restart is disabled by configuration".to_string());
        }
        if report.total_nodes < 2 {
            reasons.push(format!(
                "cluster must have at least 2 nodes for a rolling restart, found {}",
                report.total_nodes
            ));
        }
        if self.settings.require_all_nodes_healthy {
            reasons.extend(report.node_issues.iter().cloned());
        } else if !report.node_issues.is_empty() {
            warn!(
                issues = ?report.node_issues,
                "Unhealthy nodes tolerated by configuration"
            );
        }
        reasons.extend(report.alarm_issues.iter().cloned());
        if self.settings.allow_restart_with_partitions {
            if !report.partition_issues.is_empty() {
                warn!(
                    issues = ?report.partition_issues,
                    "Partitions tolerated by configuration"
                );
            }
        } else {
            reasons.extend(report.partition_issues.iter().cloned());
        }

        ValidationVerdict {
            can_restart: reasons.is_empty(),
            reasons,
            total_nodes: report.total_nodes,
            healthy_nodes: report.healthy_nodes,
            all_nodes_healthy: report.all_nodes_healthy,
        }
    }
}
