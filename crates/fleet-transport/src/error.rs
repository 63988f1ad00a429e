//! Transport error types.

use std::time::Duration;

use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Failures reaching or acting on a remote host.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command on {host} exited with {code:?}: {command}: {stderr}")]
    Command {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("command on {host} timed out after {timeout:?}: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The copy ran but the destination does not hold what was sent.
    #[error("file transfer to {host}:{path} failed verification: {reason}")]
    FileTransfer {
        host: String,
        path: String,
        reason: String,
    },

    #[error("local i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// ssh reserves exit status 255 for its own connection failures.
    const SSH_CONNECT_FAILURE: i32 = 255;

    /// Whether the host itself could not be reached, as opposed to a
    /// command that ran and failed.
    pub fn is_unreachable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Spawn { .. } => true,
            TransportError::Command { code, .. } => *code == Some(Self::SSH_CONNECT_FAILURE),
            _ => false,
        }
    }

    /// Whether a command ran and wrote `needle` to stderr.
    pub fn stderr_contains(&self, needle: &str) -> bool {
        matches!(self, TransportError::Command { stderr, .. } if stderr.contains(needle))
    }

    /// A command that ran to completion with a non-zero status.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, TransportError::Command { .. }) && !self.is_unreachable()
    }
}
