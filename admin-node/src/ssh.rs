//! Per-host command execution over SSH.
//!
//! Sessions are pooled by `(host, port)` and reused while the transport
//! stays alive; a failed command discards the session and redials once.
//! Creation is serialized per key so concurrent callers never dial the
//! same host twice.

use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::error::{AdminError, Result};
use crate::topology::BrokerNode;

/// Options for a single remote command.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Run under `sudo -n`
    pub sudo: bool,
    /// Per-command deadline
    pub timeout: Duration,
}

impl ExecOptions {
    pub fn plain(timeout: Duration) -> Self {
        Self {
            sudo: false,
            timeout,
        }
    }

    pub fn sudo(timeout: Duration) -> Self {
        Self {
            sudo: true,
            timeout,
        }
    }
}

/// Capability contract for running commands on broker hosts.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command on the node's host, returning trimmed stdout.
    ///
    /// Fails with [`AdminError::CommandFailed`] when the remote exit status
    /// is non-zero, carrying combined stdout+stderr.
    async fn execute(&self, node: &BrokerNode, command: &str, options: ExecOptions)
        -> Result<String>;

    /// Tear down every pooled session. Called on process shutdown.
    async fn dispose_all(&self);
}

type SessionSlot = Arc<Mutex<Option<Client>>>;

/// Pooled SSH executor backed by async-ssh2-tokio.
pub struct SshExecutor {
    config: SshConfig,
    sessions: DashMap<(String, u16), SessionSlot>,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    /// Key-path auth wins over password; neither configured is an error on
    /// first use.
    fn auth_method(&self) -> Result<AuthMethod> {
        if let Some(key_path) = self.config.key_path.as_deref() {
            return Ok(AuthMethod::with_key_file(key_path, None));
        }
        if let Some(password) = self.config.password.as_deref() {
            return Ok(AuthMethod::with_password(password));
        }
        Err(AdminError::Config(
            "no SSH authentication configured: set ssh.key_path or ssh.password".to_string(),
        ))
    }

    fn slot(&self, node: &BrokerNode) -> SessionSlot {
        let key = (node.host().to_string(), node.ssh_port);
        self.sessions
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn dial(&self, node: &BrokerNode) -> Result<Client> {
        let auth = self.auth_method()?;
        let host = node.host().to_string();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_seconds);
        let ssh_config = Config {
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_seconds)),
            ..Default::default()
        };

        debug!(host = %host, port = node.ssh_port, "Dialing SSH session");

        let client = tokio::time::timeout(
            connect_timeout,
            Client::connect_with_config(
                (host.as_str(), node.ssh_port),
                &self.config.user,
                auth,
                ServerCheckMethod::NoCheck,
                ssh_config,
            ),
        )
        .await
        .map_err(|_| {
            AdminError::Timeout(format!(
                "SSH connect to {}:{} exceeded {}s",
                host, node.ssh_port, connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| AdminError::Ssh(format!("connect to {}:{}: {}", host, node.ssh_port, e)))?;

        info!(host = %host, port = node.ssh_port, "SSH session established");
        Ok(client)
    }
}

#[async_trait]
impl CommandRunner for SshExecutor {
    async fn execute(
        &self,
        node: &BrokerNode,
        command: &str,
        options: ExecOptions,
    ) -> Result<String> {
        let full_command = full_command(command, options.sudo);
        let slot = self.slot(node);
        let mut session = slot.lock().await;

        for attempt in 0..2u8 {
            if session.is_none() {
                *session = Some(self.dial(node).await?);
            }

            debug!(node = %node.name, command = %full_command, "Executing remote command");

            let outcome = {
                let client = session.as_ref().expect("session populated above");
                tokio::time::timeout(options.timeout, client.execute(&full_command)).await
            };

            match outcome {
                Err(_) => {
                    // The channel may be wedged mid-command; do not reuse it.
                    *session = None;
                    return Err(AdminError::Timeout(format!(
                        "`{}` on {} exceeded {}s",
                        full_command,
                        node.name,
                        options.timeout.as_secs()
                    )));
                }
                Ok(Ok(result)) => {
                    if result.exit_status == 0 {
                        return Ok(result.stdout.trim_end().to_string());
                    }
                    return Err(AdminError::CommandFailed {
                        command: full_command,
                        exit_status: result.exit_status,
                        output: combine_output(&result.stdout, &result.stderr),
                    });
                }
                Ok(Err(e)) => {
                    // Transport-level failure: the socket is gone. Discard the
                    // session and redial once before giving up.
                    *session = None;
                    if attempt == 0 {
                        warn!(
                            node = %node.name,
                            error = %e,
                            "SSH session lost, reconnecting"
                        );
                        continue;
                    }
                    return Err(AdminError::Ssh(format!(
                        "`{}` on {}: {}",
                        full_command, node.name, e
                    )));
                }
            }
        }

        Err(AdminError::Ssh(format!(
            "`{}` on {}: retries exhausted",
            full_command, node.name
        )))
    }

    async fn dispose_all(&self) {
        let keys: Vec<(String, u16)> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.sessions.remove(&key) {
                let mut session = slot.lock().await;
                if let Some(client) = session.take() {
                    if let Err(e) = client.disconnect().await {
                        debug!(host = %key.0, error = %e, "Error closing SSH session");
                    }
                }
            }
        }
        info!("All SSH sessions disposed");
    }
}

fn full_command(command: &str, sudo: bool) -> String {
    if sudo {
        format!("sudo -n {}", command)
    } else {
        command.to_string()
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_prefix() {
        assert_eq!(
            full_command("systemctl stop rabbitmq-server", true),
            "sudo -n systemctl stop rabbitmq-server"
        );
        assert_eq!(full_command("uptime", false), "uptime");
    }

    #[test]
    fn test_combine_output() {
        assert_eq!(combine_output("out\n", "err\n"), "out\nerr");
        assert_eq!(combine_output("", "err"), "err");
        assert_eq!(combine_output("out", ""), "out");
        assert_eq!(combine_output("", ""), "");
    }

    #[test]
    fn test_auth_precedence_prefers_key() {
        let executor = SshExecutor::new(SshConfig {
            user: "ops".to_string(),
            key_path: Some("/etc/admin/id_ed25519".to_string()),
            password: Some("fallback".to_string()),
            connect_timeout_seconds: 30,
            keepalive_interval_seconds: 5,
        });
        assert!(executor.auth_method().is_ok());
    }

    #[test]
    fn test_missing_auth_is_config_error() {
        let executor = SshExecutor::new(SshConfig {
            user: "ops".to_string(),
            key_path: None,
            password: None,
            connect_timeout_seconds: 30,
            keepalive_interval_seconds: 5,
        });
        assert!(matches!(
            executor.auth_method(),
            Err(AdminError::Config(_))
        ));
    }
}
