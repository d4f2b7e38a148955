//! Typed client for the broker's management HTTP API.
//!
//! The orchestrator and validators consume the [`BrokerApi`] capability
//! contract; [`BrokerClient`] is the reqwest-backed production
//! implementation speaking HTTP Basic auth to the RabbitMQ management
//! plugin. All calls honor the configured per-call API timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::{AdminError, Result};
use crate::health::{HealthEvaluator, NodeHealth};
use crate::topology::{BrokerNode, ClusterTopology};

/// Raw node counters as reported by `GET /api/nodes/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mem_used: u64,
    #[serde(default)]
    pub mem_limit: u64,
    #[serde(default)]
    pub disk_free: u64,
    #[serde(default)]
    pub disk_free_limit: u64,
    #[serde(default)]
    pub fd_used: u64,
    #[serde(default)]
    pub fd_total: u64,
    #[serde(default)]
    pub sockets_used: u64,
    #[serde(default)]
    pub sockets_total: u64,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub mem_alarm: bool,
    #[serde(default)]
    pub disk_free_alarm: bool,
}

/// A resource alarm attributed to one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alarm {
    /// Alarm kind, e.g. `memory_alarm`, `disk_alarm`, `file_descriptor_alarm`
    pub alarm: String,
    /// Node name the alarm fired on
    pub node: String,
}

/// One client connection as listed by `GET /api/connections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub peer_host: Option<String>,
    #[serde(default)]
    pub peer_port: Option<u16>,
}

impl ConnectionInfo {
    pub fn is_running(&self) -> bool {
        self.state.as_deref() == Some("running")
    }
}

/// One queue as listed by `GET /api/queues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub messages: u64,
}

/// Acknowledgement for a maintenance-mode toggle.
///
/// Older broker versions lack the endpoint; the failure is downgraded to a
/// `warning` so restarts keep working against those clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceAck {
    pub node: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Result of a force-close sweep over one node's running connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceCloseReport {
    pub closed: u64,
    pub remaining: u64,
}

/// Per-node reachability probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityProbe {
    pub node: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Capability contract against the broker management API.
///
/// The orchestrator, cluster validator, and HTTP handlers depend on this
/// trait; tests substitute recording fakes.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Raw counters for one node.
    async fn node_info(&self, node: &BrokerNode) -> Result<NodeInfo>;

    /// Cluster-wide resource alarms.
    async fn alarms(&self) -> Result<Vec<Alarm>>;

    /// Node name -> unreachable peers, for nodes reporting partitions.
    async fn partitions(&self) -> Result<HashMap<String, Vec<String>>>;

    /// Client connections, optionally filtered to one node.
    async fn connections(&self, node: Option<&str>) -> Result<Vec<ConnectionInfo>>;

    /// Count of connections in state `running` on the node.
    async fn connection_count(&self, node: &str) -> Result<u64>;

    /// Close a single connection by its broker-assigned name.
    async fn close_connection(&self, name: &str, reason: &str) -> Result<()>;

    /// Close up to `max_to_close` running connections on the node,
    /// swallowing per-connection failures.
    async fn force_close_node_connections(
        &self,
        node: &str,
        max_to_close: u64,
    ) -> Result<ForceCloseReport>;

    /// Toggle maintenance mode against the node's own management endpoint.
    async fn set_maintenance_mode(
        &self,
        node: &BrokerNode,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck>;

    /// Derived health for one node (counters + alarms through the evaluator).
    async fn check_node_health(&self, node: &BrokerNode) -> Result<NodeHealth>;

    /// Queues, optionally filtered to one node.
    async fn queues(&self, node: Option<&str>) -> Result<Vec<QueueInfo>>;

    /// `GET /api/overview` against each topology node in turn.
    async fn test_connectivity(&self) -> Result<Vec<ConnectivityProbe>>;
}

/// reqwest-backed [`BrokerApi`] implementation.
pub struct BrokerClient {
    http: reqwest::Client,
    config: BrokerConfig,
    topology: Arc<ClusterTopology>,
    api_timeout: Duration,
}

impl BrokerClient {
    pub fn new(
        config: BrokerConfig,
        topology: Arc<ClusterTopology>,
        api_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(api_timeout)
            .build()
            .map_err(|e| AdminError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            topology,
            api_timeout,
        })
    }

    fn base_url(&self) -> &str {
        self.config.management_base_url.trim_end_matches('/')
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "Management API GET");
        let response = self
            .http
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(url, status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AdminError::BrokerApi(format!("Invalid response from {}: {}", url, e)))
    }

    /// All nodes known to the cluster, with raw counters.
    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.get_json(&format!("{}/api/nodes", self.base_url())).await
    }
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn node_info(&self, node: &BrokerNode) -> Result<NodeInfo> {
        let url = format!(
            "{}/api/nodes/{}",
            self.base_url(),
            encode_path_segment(&node.id)
        );
        self.get_json(&url).await
    }

    async fn alarms(&self) -> Result<Vec<Alarm>> {
        let nodes = self.list_nodes().await?;
        let mut alarms = Vec::new();
        for info in &nodes {
            if info.mem_alarm {
                alarms.push(Alarm {
                    alarm: "memory_alarm".to_string(),
                    node: info.name.clone(),
                });
            }
            if info.disk_free_alarm {
                alarms.push(Alarm {
                    alarm: "disk_alarm".to_string(),
                    node: info.name.clone(),
                });
            }
            // The broker reports no explicit fd alarm; near-exhaustion counts.
            if info.fd_total > 0 && info.fd_used * 100 / info.fd_total >= 98 {
                alarms.push(Alarm {
                    alarm: "file_descriptor_alarm".to_string(),
                    node: info.name.clone(),
                });
            }
        }
        Ok(alarms)
    }

    async fn partitions(&self) -> Result<HashMap<String, Vec<String>>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| !n.partitions.is_empty())
            .map(|n| (n.name, n.partitions))
            .collect())
    }

    async fn connections(&self, node: Option<&str>) -> Result<Vec<ConnectionInfo>> {
        let all: Vec<ConnectionInfo> = self
            .get_json(&format!("{}/api/connections", self.base_url()))
            .await?;
        Ok(match node {
            Some(node) => all.into_iter().filter(|c| c.node == node).collect(),
            None => all,
        })
    }

    async fn connection_count(&self, node: &str) -> Result<u64> {
        match self.connections(Some(node)).await {
            Ok(connections) => Ok(connections.iter().filter(|c| c.is_running()).count() as u64),
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to count node connections");
                Err(e)
            }
        }
    }

    async fn close_connection(&self, name: &str, reason: &str) -> Result<()> {
        let url = format!(
            "{}/api/connections/{}",
            self.base_url(),
            encode_path_segment(name)
        );
        let response = self
            .http
            .delete(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("X-Reason", reason)
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&url, status, &body));
        }
        Ok(())
    }

    async fn force_close_node_connections(
        &self,
        node: &str,
        max_to_close: u64,
    ) -> Result<ForceCloseReport> {
        let running: Vec<ConnectionInfo> = self
            .connections(Some(node))
            .await?
            .into_iter()
            .filter(|c| c.is_running())
            .collect();

        let total = running.len() as u64;
        let mut closed = 0u64;

        for connection in running.iter().take(max_to_close as usize) {
            match self
                .close_connection(&connection.name, "Closed by rolling restart")
                .await
            {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(
                        node = %node,
                        connection = %connection.name,
                        error = %e,
                        "Failed to close connection, continuing"
                    );
                }
            }
        }

        Ok(ForceCloseReport {
            closed,
            remaining: total.saturating_sub(closed),
        })
    }

    async fn set_maintenance_mode(
        &self,
        node: &BrokerNode,
        enabled: bool,
        reason: &str,
    ) -> Result<MaintenanceAck> {
        let url = format!(
            "{}/api/nodes/{}/maintenance",
            node.management_base_url(),
            encode_path_segment(&node.id)
        );
        debug!(node = %node.name, enabled, "Toggling maintenance mode");

        let response = self
            .http
            .put(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&serde_json::json!({ "enabled": enabled, "reason": reason }))
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(&url, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(MaintenanceAck {
                node: node.name.clone(),
                enabled,
                warning: None,
            });
        }

        // The endpoint is version-dependent. A server-side refusal must not
        // fail the restart; surface it as a warning on the acknowledgement.
        let body = response.text().await.unwrap_or_default();
        warn!(
            node = %node.name,
            status = %status,
            "Maintenance mode not supported by this broker, proceeding"
        );
        Ok(MaintenanceAck {
            node: node.name.clone(),
            enabled,
            warning: Some(format!(
                "maintenance mode unsupported (HTTP {}): {}",
                status.as_u16(),
                truncate(&body, 200)
            )),
        })
    }

    async fn check_node_health(&self, node: &BrokerNode) -> Result<NodeHealth> {
        let info = self.node_info(node).await?;
        let alarms = self.alarms().await?;
        Ok(HealthEvaluator::evaluate(&info, &alarms))
    }

    async fn queues(&self, node: Option<&str>) -> Result<Vec<QueueInfo>> {
        let all: Vec<QueueInfo> = self
            .get_json(&format!("{}/api/queues", self.base_url()))
            .await?;
        Ok(match node {
            Some(node) => all.into_iter().filter(|q| q.node == node).collect(),
            None => all,
        })
    }

    async fn test_connectivity(&self) -> Result<Vec<ConnectivityProbe>> {
        let mut probes = Vec::with_capacity(self.topology.node_count());

        for node in self.topology.nodes_in_restart_order() {
            let url = format!("{}/api/overview", node.management_base_url());
            let started = Instant::now();
            let outcome = self
                .http
                .get(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .timeout(self.api_timeout)
                .send()
                .await;

            let probe = match outcome {
                Ok(response) if response.status().is_success() => ConnectivityProbe {
                    node: node.name.clone(),
                    connected: true,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                },
                Ok(response) => ConnectivityProbe {
                    node: node.name.clone(),
                    connected: false,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                    error: Some(format!("HTTP {}", response.status().as_u16())),
                },
                Err(e) => ConnectivityProbe {
                    node: node.name.clone(),
                    connected: false,
                    duration_ms: None,
                    error: Some(classify_transport_error(&url, &e).to_string()),
                },
            };
            probes.push(probe);
        }

        Ok(probes)
    }
}

/// Map a transport failure onto the error taxonomy.
fn classify_transport_error(url: &str, err: &reqwest::Error) -> AdminError {
    if err.is_connect() {
        AdminError::Unreachable(format!("{}: {}", url, err))
    } else if err.is_timeout() {
        AdminError::Timeout(format!("{}: {}", url, err))
    } else {
        AdminError::BrokerApi(format!("{}: {}", url, err))
    }
}

/// Map an HTTP error status onto the error taxonomy.
fn classify_status(url: &str, status: StatusCode, body: &str) -> AdminError {
    match status {
        StatusCode::UNAUTHORIZED => AdminError::AuthFailed,
        StatusCode::NOT_FOUND => AdminError::EndpointNotFound(url.to_string()),
        _ => AdminError::BrokerApi(format!(
            "{} returned HTTP {}: {}",
            url,
            status.as_u16(),
            truncate(body, 200)
        )),
    }
}

/// Percent-encode a path segment. Connection names contain spaces, colons
/// and arrows; node names contain `@`.
fn encode_path_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'@' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status("http://x/api/nodes", StatusCode::UNAUTHORIZED, ""),
            AdminError::AuthFailed
        ));
        assert!(matches!(
            classify_status("http://x/api/nodes", StatusCode::NOT_FOUND, ""),
            AdminError::EndpointNotFound(_)
        ));
        assert!(matches!(
            classify_status("http://x/api/nodes", StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            AdminError::BrokerApi(_)
        ));
    }

    #[test]
    fn test_encode_path_segment() {
        assert_eq!(encode_path_segment("rabbit@mq-01"), "rabbit@mq-01");
        assert_eq!(
            encode_path_segment("172.17.0.1:54321 -> 172.17.0.2:5672"),
            "172.17.0.1%3A54321%20-%3E%20172.17.0.2%3A5672"
        );
    }

    #[test]
    fn test_connection_running_state() {
        let mut connection = ConnectionInfo {
            name: "c1".to_string(),
            node: "rabbit@mq-01".to_string(),
            state: Some("running".to_string()),
            user: None,
            peer_host: None,
            peer_port: None,
        };
        assert!(connection.is_running());

        connection.state = Some("blocked".to_string());
        assert!(!connection.is_running());

        connection.state = None;
        assert!(!connection.is_running());
    }

    #[test]
    fn test_node_info_tolerates_sparse_payload() {
        let info: NodeInfo =
            serde_json::from_str(r#"{"name":"rabbit@mq-01","running":true}"#).unwrap();
        assert!(info.running);
        assert_eq!(info.mem_limit, 0);
        assert!(info.partitions.is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }
}
