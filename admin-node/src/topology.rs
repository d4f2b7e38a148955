//! Cluster topology model.
//!
//! The topology file is YAML maintained by operators. Nodes carry a
//! `configOrder` integer that defines the global restart sequence; the
//! orchestrator always walks nodes in ascending order of that field.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdminError, Result};

/// One broker node as declared in the topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerNode {
    /// Stable node identifier (the broker's node name, e.g. `rabbit@mq-01`)
    pub id: String,
    /// Human-readable name, unique within the cluster
    pub name: String,
    /// Host IP address; `hostname` may be used instead
    #[serde(default)]
    pub host_ip: Option<String>,
    /// Hostname; at least one of `hostIp`/`hostname` is required
    #[serde(default)]
    pub hostname: Option<String>,
    /// Broker protocol port
    pub port: u16,
    /// Management HTTP API port
    pub management_port: u16,
    /// SSH port for the control channel
    pub ssh_port: u16,
    /// Restart sequence position, globally unique, ascending
    pub config_order: i64,
}

impl BrokerNode {
    /// The address commands and management calls are dialed against.
    pub fn host(&self) -> &str {
        self.host_ip
            .as_deref()
            .or(self.hostname.as_deref())
            .unwrap_or_default()
    }

    /// Base URL of this node's own management API.
    pub fn management_base_url(&self) -> String {
        format!("http://{}:{}", self.host(), self.management_port)
    }
}

/// Per-topology restart defaults, both in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartDefaults {
    #[serde(default)]
    pub node_startup_timeout: Option<u64>,
    #[serde(default)]
    pub health_check_interval: Option<u64>,
}

/// The full cluster topology as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub cluster_name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub nodes: Vec<BrokerNode>,
    #[serde(default)]
    pub restart_config: Option<RestartDefaults>,
}

impl ClusterTopology {
    /// Load and validate a topology from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AdminError::Topology(format!(
                "cannot read topology file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a topology from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let topology: ClusterTopology = serde_yaml::from_str(raw)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Validate operator input: required fields, uniqueness, port ranges.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(AdminError::Topology("clusterName is required".to_string()));
        }
        if self.nodes.is_empty() {
            return Err(AdminError::Topology(
                "topology must declare at least one node".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut orders = HashSet::new();

        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(AdminError::Topology("node id is required".to_string()));
            }
            if node.name.trim().is_empty() {
                return Err(AdminError::Topology(format!(
                    "node {} is missing a name",
                    node.id
                )));
            }
            if node.host().is_empty() {
                return Err(AdminError::Topology(format!(
                    "node {} needs hostIp or hostname",
                    node.name
                )));
            }
            for (label, port) in [
                ("port", node.port),
                ("managementPort", node.management_port),
                ("sshPort", node.ssh_port),
            ] {
                if port == 0 {
                    return Err(AdminError::Topology(format!(
                        "node {}: {} must be in 1..65535",
                        node.name, label
                    )));
                }
            }
            if !ids.insert(node.id.as_str()) {
                return Err(AdminError::Topology(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            if !names.insert(node.name.as_str()) {
                return Err(AdminError::Topology(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
            if !orders.insert(node.config_order) {
                return Err(AdminError::Topology(format!(
                    "duplicate configOrder {} on node {}",
                    node.config_order, node.name
                )));
            }
        }
        Ok(())
    }

    /// Nodes in restart sequence: ascending `configOrder`.
    pub fn nodes_in_restart_order(&self) -> Vec<&BrokerNode> {
        let mut nodes: Vec<&BrokerNode> = self.nodes.iter().collect();
        nodes.sort_by_key(|n| n.config_order);
        nodes
    }

    /// Look up a node by its stable id.
    pub fn node_by_id(&self, id: &str) -> Option<&BrokerNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
clusterName: mq-prod
version: "1"
nodes:
  - id: rabbit@mq-02
    name: b
    hostIp: 10.0.0.2
    port: 5672
    managementPort: 15672
    sshPort: 22
    configOrder: 2
  - id: rabbit@mq-01
    name: a
    hostIp: 10.0.0.1
    port: 5672
    managementPort: 15672
    sshPort: 22
    configOrder: 1
  - id: rabbit@mq-03
    name: c
    hostname: mq-03.internal
    port: 5672
    managementPort: 15672
    sshPort: 22
    configOrder: 3
restartConfig:
  nodeStartupTimeout: 120
  healthCheckInterval: 5
"#
    }

    #[test]
    fn test_load_and_sort_by_config_order() {
        let topology = ClusterTopology::from_yaml(sample_yaml()).unwrap();
        assert_eq!(topology.cluster_name, "mq-prod");
        assert_eq!(topology.node_count(), 3);

        let order: Vec<&str> = topology
            .nodes_in_restart_order()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_restart_order_is_stable_across_serialization() {
        // Round-trip: serialize and reload, ascending order is unchanged
        let topology = ClusterTopology::from_yaml(sample_yaml()).unwrap();
        let serialized = serde_yaml::to_string(&topology).unwrap();
        let reloaded = ClusterTopology::from_yaml(&serialized).unwrap();

        let before: Vec<i64> = topology
            .nodes_in_restart_order()
            .iter()
            .map(|n| n.config_order)
            .collect();
        let after: Vec<i64> = reloaded
            .nodes_in_restart_order()
            .iter()
            .map(|n| n.config_order)
            .collect();
        assert_eq!(before, after);
        assert!(after.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_hostname_fallback() {
        let topology = ClusterTopology::from_yaml(sample_yaml()).unwrap();
        let c = topology.node_by_id("rabbit@mq-03").unwrap();
        assert_eq!(c.host(), "mq-03.internal");
        assert_eq!(c.management_base_url(), "http://mq-03.internal:15672");
    }

    #[test]
    fn test_duplicate_config_order_rejected() {
        let raw = sample_yaml().replace("configOrder: 2", "configOrder: 1");
        let err = ClusterTopology::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate configOrder"));
    }

    #[test]
    fn test_missing_host_rejected() {
        let raw = sample_yaml().replace("hostIp: 10.0.0.1\n", "");
        let err = ClusterTopology::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("hostIp or hostname"));
    }

    #[test]
    fn test_zero_port_rejected() {
        let raw = sample_yaml().replace("sshPort: 22", "sshPort: 0");
        let err = ClusterTopology::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("sshPort must be in 1..65535"));
    }

    #[test]
    fn test_load_shipped_topology() {
        // The sample topology in the repo must always stay loadable
        let topology = ClusterTopology::load("../config/topology.yaml").unwrap();
        assert_eq!(topology.node_count(), 3);
        assert!(topology.restart_config.is_some());
    }

    #[test]
    fn test_load_rejects_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"clusterName: [not, a, string").unwrap();
        let err = ClusterTopology::load(file.path()).unwrap_err();
        assert!(matches!(err, AdminError::Topology(_)));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = ClusterTopology::load("/nonexistent/topology.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/topology.yaml"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let raw = sample_yaml().replace("name: b", "name: a");
        let err = ClusterTopology::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate node name"));
    }
}
