/*!
 * Error types for cda
 */

use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdaError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_REMOTE: i32 = 3;

#[derive(Debug, Error)]
pub enum CdaError {
    /// Configuration or pre-flight validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not establish an SSH session before the connect timeout
    #[error("failed to establish an SSH connection to {host} within {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    /// The strategy list for a host came out empty
    #[error("no usable logins found for {host}")]
    NoLogins { host: String },

    /// Login failed for a reason that is neither network nor authentication
    #[error("unexpected login failure on {host}: {message}")]
    Login { host: String, message: String },

    /// A fail-fast command returned non-zero
    #[error("command '{command}' on {host} failed (rc={code}): {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    /// The install backend reported the error status for some nodes
    #[error("error encountered in nodes: {}", .nodes.join(", "))]
    NodeError { nodes: Vec<String> },

    /// Booted workers could not be matched to their intended identity
    #[error("worker correlation failed: {0}")]
    Correlation(String),

    /// Install backend call failed
    #[error("install backend: {0}")]
    Backend(String),

    /// Cluster API call failed
    #[error("cluster API: {0}")]
    ClusterApi(String),

    /// Remote-management boot failed
    #[error("boot controller: {0}")]
    Boot(String),

    /// Bridge, DHCP or DNS collaborator failed
    #[error("network: {0}")]
    Network(String),

    /// Worker pool could not be built or a task vanished
    #[error("worker pool: {0}")]
    Pool(String),

    /// A poll loop gave up
    #[error("timed out waiting: {0}")]
    Exhausted(String),

    /// Output was not valid for the expected format
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse error category for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connectivity,
    Command,
    RemoteState,
    Correlation,
    Collaborator,
    Concurrency,
    IoError,
}

impl CdaError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CdaError::NodeError { .. } | CdaError::Correlation(_) => EXIT_REMOTE,
            _ => EXIT_FATAL,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            CdaError::Config(_) => ErrorCategory::Configuration,
            CdaError::ConnectTimeout { .. } | CdaError::NoLogins { .. } | CdaError::Login { .. } => {
                ErrorCategory::Connectivity
            }
            CdaError::CommandFailed { .. } => ErrorCategory::Command,
            CdaError::NodeError { .. } | CdaError::Exhausted(_) => ErrorCategory::RemoteState,
            CdaError::Correlation(_) => ErrorCategory::Correlation,
            CdaError::Backend(_)
            | CdaError::ClusterApi(_)
            | CdaError::Boot(_)
            | CdaError::Network(_)
            | CdaError::Parse(_) => ErrorCategory::Collaborator,
            CdaError::Pool(_) => ErrorCategory::Concurrency,
            CdaError::Io(_) => ErrorCategory::IoError,
        }
    }

    pub fn command_failed(host: &str, command: &str, code: i32, stderr: &str) -> Self {
        CdaError::CommandFailed {
            host: host.to_string(),
            command: command.to_string(),
            code,
            stderr: stderr.trim().to_string(),
        }
    }
}

impl From<serde_json::Error> for CdaError {
    fn from(err: serde_json::Error) -> Self {
        CdaError::Parse(err.to_string())
    }
}
