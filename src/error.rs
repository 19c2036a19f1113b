use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 连接失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectErrorKind {
    Authentication,
    HostKeyMismatch,
    Dns,
    Timeout,
    Refused,
    Other,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectErrorKind::Authentication => "authentication error",
            ConnectErrorKind::HostKeyMismatch => "host key mismatch",
            ConnectErrorKind::Dns => "could not resolve hostname",
            ConnectErrorKind::Timeout => "connection timed out",
            ConnectErrorKind::Refused => "connection refused",
            ConnectErrorKind::Other => "connection error",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug, Clone, Serialize)]
pub enum InfraError {
    #[error("Could not connect to {host}: {kind} ({message})")]
    ConnectError {
        host: String,
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("Command timed out after {timeout}s on {host}")]
    CommandTimeout { host: String, timeout: u64 },

    #[error("Command IO error: {0}")]
    CommandIoError(String),

    #[error("Cycle detected in operation order, conflicting operations: {}", hashes.join(", "))]
    OrderingError { hashes: Vec<String> },

    #[error("Cannot have different values for `{key}` (operation {op_hash})")]
    OperationValueError { key: String, op_hash: String },

    #[error("Nested operation called with global arguments: {0:?}")]
    NestedOperationArguments(Vec<String>),

    #[error("Could not load fact {fact} on {host}")]
    FactError { host: String, fact: String },

    #[error("No hosts remaining!")]
    NoHostsRemaining,

    #[error("Over {limit}% of hosts failed ({actual}%)")]
    FailPercentExceeded { limit: u32, actual: u32 },

    #[error("No such connector: @{0}")]
    UnknownConnector(String),

    #[error("No such host in inventory: {0}")]
    HostNotFound(String),

    #[error("No such group in inventory: {0}")]
    GroupNotFound(String),

    #[error("Inventory error: {0}")]
    InventoryError(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("File operation failed: {0}")]
    FileOperationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Deploy error: {0}")]
    DeployError(String),

    #[error("sudo requires a password")]
    SudoPasswordRequired,

    #[error("Worker task failed: {0}")]
    TaskError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH error: {0}")]
    Ssh2Error(String),
}

impl InfraError {
    /// 结构性错误：出现即中止整个运行
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InfraError::OrderingError { .. }
                | InfraError::OperationValueError { .. }
                | InfraError::NestedOperationArguments(_)
                | InfraError::NoHostsRemaining
                | InfraError::FailPercentExceeded { .. }
                | InfraError::TaskError(_)
        )
    }

    pub fn connect(host: &str, kind: ConnectErrorKind, message: impl fmt::Display) -> Self {
        InfraError::ConnectError {
            host: host.to_string(),
            kind,
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(error: std::io::Error) -> Self {
        InfraError::IoError(error.to_string())
    }
}

impl From<ssh2::Error> for InfraError {
    fn from(error: ssh2::Error) -> Self {
        InfraError::Ssh2Error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_structural_errors_are_fatal() {
        assert!(InfraError::NoHostsRemaining.is_fatal());
        assert!(InfraError::OrderingError { hashes: vec![] }.is_fatal());
        assert!(InfraError::TaskError("join".to_string()).is_fatal());
        assert!(!InfraError::DeployError("Missing argument 0".to_string()).is_fatal());
        assert!(!InfraError::FactError {
            host: "a".to_string(),
            fact: "hostname".to_string(),
        }
        .is_fatal());
        assert!(!InfraError::CommandTimeout {
            host: "a".to_string(),
            timeout: 1,
        }
        .is_fatal());
    }
}
