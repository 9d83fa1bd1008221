// ============================================================================
// File: src/error.rs
// ----------------------------------------------------------------------------
// Error taxonomy for clone and sync operations.
// ============================================================================

use serde::{Deserialize, Serialize};

/// Errors raised anywhere inside the clone/sync engine
///
/// Struct variants carry the host or resource the failure is tied to so that
/// the orchestrator can turn them into a readable failed result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloneError {
    /// Bad identifier, path, or literal format
    #[error("Validation error ({field}): {message}")]
    Validation { field: &'static str, message: String },

    /// A path resolved outside of its required base directory
    #[error("Path traversal detected: {path}")]
    PathTraversal { path: String },

    /// Invalid or unusable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Network-level failure, refused connection, or handshake failure
    #[error("Connection error to {host}: {message}")]
    Connection { host: String, message: String },

    /// Credentials were rejected; retrying cannot help
    #[error("Authentication failed for {host}: {message}")]
    Authentication { host: String, message: String },

    /// Host key unknown or changed; retrying cannot help
    #[error("Host key verification failed for {host}: {message}")]
    HostKeyVerification { host: String, message: String },

    /// A remote command or transfer exceeded its wait budget
    #[error("Timeout during {operation} on {host} after {seconds}s")]
    Timeout {
        host: String,
        operation: String,
        seconds: u64,
    },

    /// Channel or protocol error on an established session
    #[error("SSH error on {host} during {operation}: {message}")]
    Ssh {
        host: String,
        operation: String,
        message: String,
    },

    /// A remote command ran but exited non-zero
    #[error("Remote command failed on {host} with exit code {exit_code}: {stderr}")]
    RemoteCommand {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("VM '{name}' not found on host '{host}'")]
    VmNotFound { name: String, host: String },

    #[error("VM '{name}' already exists on host '{host}'")]
    VmExists { name: String, host: String },

    #[error("Insufficient {resource}: {message}")]
    InsufficientResources {
        resource: &'static str,
        message: String,
    },

    /// A disk copy command failed
    #[error("Transfer error from {source_host} to {dest_host}: {message}")]
    Transfer {
        source_host: String,
        dest_host: String,
        message: String,
    },

    /// Post-transfer verification mismatch
    #[error("Integrity check failed for {path}: {message}")]
    Integrity { path: String, message: String },

    /// The hypervisor collaborator reported a failure
    #[error("Hypervisor error during {operation}: {message}")]
    Hypervisor { operation: String, message: String },

    /// Misuse of the transaction lifecycle
    #[error("Transaction {transaction_id}: {message}")]
    Transaction {
        transaction_id: String,
        message: String,
    },

    #[error("Operation {operation_id} was cancelled")]
    Cancelled { operation_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type for clone and sync operations
pub type CloneResult<T> = Result<T, CloneError>;

/// Coarse error classes; the CLI maps each to its own exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    Connection,
    NotFound,
    Exists,
    InsufficientResources,
    Transfer,
    Integrity,
    Hypervisor,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Distinct non-zero process exit code for this kind
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Configuration => 3,
            ErrorKind::Connection => 4,
            ErrorKind::NotFound => 5,
            ErrorKind::Exists => 6,
            ErrorKind::InsufficientResources => 7,
            ErrorKind::Transfer => 8,
            ErrorKind::Integrity => 9,
            ErrorKind::Hypervisor => 10,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl CloneError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        CloneError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CloneError::Internal {
            message: message.into(),
        }
    }

    pub fn transfer(
        source_host: impl Into<String>,
        dest_host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CloneError::Transfer {
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            message: message.into(),
        }
    }

    pub fn hypervisor(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CloneError::Hypervisor {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloneError::Validation { .. } | CloneError::PathTraversal { .. } => {
                ErrorKind::Validation
            }
            CloneError::Configuration { .. } => ErrorKind::Configuration,
            CloneError::Connection { .. }
            | CloneError::Authentication { .. }
            | CloneError::HostKeyVerification { .. }
            | CloneError::Timeout { .. }
            | CloneError::Ssh { .. } => ErrorKind::Connection,
            CloneError::VmNotFound { .. } => ErrorKind::NotFound,
            CloneError::VmExists { .. } => ErrorKind::Exists,
            CloneError::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            CloneError::Transfer { .. } | CloneError::RemoteCommand { .. } => {
                ErrorKind::Transfer
            }
            CloneError::Integrity { .. } => ErrorKind::Integrity,
            CloneError::Hypervisor { .. } => ErrorKind::Hypervisor,
            CloneError::Cancelled { .. } => ErrorKind::Cancelled,
            CloneError::Transaction { .. } | CloneError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the remote layer may attempt the same operation again
    ///
    /// Authentication and host-key failures need caller intervention, and a
    /// timed-out command may still be running remotely.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloneError::Connection { .. } | CloneError::Ssh { .. })
    }
}

impl From<tokio::task::JoinError> for CloneError {
    fn from(err: tokio::task::JoinError) -> Self {
        CloneError::internal(format!("Task join failed: {err}"))
    }
}

impl From<serde_json::Error> for CloneError {
    fn from(err: serde_json::Error) -> Self {
        CloneError::internal(format!("Serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::Configuration,
            ErrorKind::Connection,
            ErrorKind::NotFound,
            ErrorKind::Exists,
            ErrorKind::InsufficientResources,
            ErrorKind::Transfer,
            ErrorKind::Integrity,
            ErrorKind::Hypervisor,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        let refused = CloneError::Connection {
            host: "h".into(),
            message: "Connection refused".into(),
        };
        let auth = CloneError::Authentication {
            host: "h".into(),
            message: "denied".into(),
        };
        let host_key = CloneError::HostKeyVerification {
            host: "h".into(),
            message: "mismatch".into(),
        };
        let timeout = CloneError::Timeout {
            host: "h".into(),
            operation: "command".into(),
            seconds: 5,
        };

        assert!(refused.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!host_key.is_retryable());
        assert!(!timeout.is_retryable());
        assert_eq!(auth.kind(), ErrorKind::Connection);
    }

    #[test]
    fn vm_exists_message_mentions_already_exists() {
        let err = CloneError::VmExists {
            name: "web01_clone".into(),
            host: "hostB".into(),
        };
        assert!(err.to_string().contains("already exists"));
        assert_eq!(err.kind(), ErrorKind::Exists);
    }
}
