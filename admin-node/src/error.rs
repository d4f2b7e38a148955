use thiserror::Error;

/// Errors that can occur in the admin node library
#[derive(Error, Debug)]
pub enum AdminError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Topology file error
    #[error("Topology error: {0}")]
    Topology(String),

    /// Rolling restart feature gate is off
    #[error("Rolling restart is disabled by configuration")]
    Disabled,

    /// Cluster admission denied
    #[error("Cluster validation failed: {}", reasons.join("; "))]
    Admission { reasons: Vec<String> },

    /// Cannot reach a management endpoint
    #[error("Cannot connect to management API: {0}")]
    Unreachable(String),

    /// HTTP 401 from the management API
    #[error("Authentication failed against management API")]
    AuthFailed,

    /// HTTP 404 from the management API
    #[error("Management endpoint not found: {0}")]
    EndpointNotFound(String),

    /// Any other management API failure
    #[error("Broker API error: {0}")]
    BrokerApi(String),

    /// SSH transport or session error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Remote command ran but exited non-zero
    #[error("Command `{command}` exited with status {exit_status}: {output}")]
    CommandFailed {
        command: String,
        exit_status: u32,
        output: String,
    },

    /// A per-node restart step failed
    #[error("Node operation failed: {0}")]
    NodeOperation(String),

    /// Per-call or per-phase deadline exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Second start while a run holds the active slot
    #[error("A rolling restart is already in progress")]
    AlreadyActive,

    /// Cancel or similar request while no run is active
    #[error("No rolling restart is in progress")]
    NotActive,

    /// Run stopped at a phase boundary after a cancel request
    #[error("Rolling restart cancelled")]
    Cancelled,

    /// Node id not present in the topology
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Internal(String),
}

/// Result type alias using AdminError
pub type Result<T> = std::result::Result<T, AdminError>;

impl From<String> for AdminError {
    fn from(s: String) -> Self {
        AdminError::Internal(s)
    }
}

impl From<&str> for AdminError {
    fn from(s: &str) -> Self {
        AdminError::Internal(s.to_string())
    }
}

impl From<serde_yaml::Error> for AdminError {
    fn from(err: serde_yaml::Error) -> Self {
        AdminError::Topology(err.to_string())
    }
}

impl From<config::ConfigError> for AdminError {
    fn from(err: config::ConfigError) -> Self {
        AdminError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AdminError::Config("missing broker password".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing broker password"
        );
    }

    #[test]
    fn test_admission_reasons_joined() {
        let err = AdminError::Admission {
            reasons: vec!["node down".to_string(), "alarms".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Cluster validation failed: node down; alarms"
        );
    }

    #[test]
    fn test_command_failed_carries_output() {
        let err = AdminError::CommandFailed {
            command: "systemctl start rabbitmq-server".to_string(),
            exit_status: 1,
            output: "Job failed".to_string(),
        };
        assert!(err.to_string().contains("exited with status 1"));
        assert!(err.to_string().contains("Job failed"));
    }

    #[test]
    fn test_error_from_string() {
        let err: AdminError = "boom".into();
        assert!(matches!(err, AdminError::Internal(_)));
    }
}
