//! Error classification for remote execution.

use thiserror::Error;

use crate::runner::ProcessError;

/// Errors raised while running commands on, or copying files to, a machine.
///
/// Connection-class failures (the host was never reached) are distinguished
/// from command failures (the host ran the command and it exited non-zero)
/// because probing paths treat them as "unreachable" while provisioning
/// paths propagate them.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// The transport never reached the host.
    #[error("unable to connect to {host}: {message}")]
    Connection {
        /// Host that could not be reached.
        host: String,
        /// Diagnostic from the SSH client.
        message: String,
    },
    /// The command ran and exited non-zero while checking was requested.
    #[error("command '{command}' on {host} failed with exit status {status}: {stderr}")]
    Command {
        /// Host that ran the command.
        host: String,
        /// Command line as sent to the host.
        command: String,
        /// Exit status reported by the remote command.
        status: i32,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// The command exceeded its timeout and was abandoned.
    #[error("command '{command}' on {host} timed out after {seconds} seconds")]
    Timeout {
        /// Host the command was sent to.
        host: String,
        /// Command line as sent to the host.
        command: String,
        /// Timeout that was exceeded.
        seconds: u64,
    },
    /// A file copy failed.
    #[error("copying {from} to {to} failed: {message}")]
    Transfer {
        /// Copy source.
        from: String,
        /// Copy destination.
        to: String,
        /// Diagnostic from the copy client.
        message: String,
    },
    /// The machine has no address to connect to yet.
    #[error("machine '{machine}' has no known SSH address")]
    Unaddressable {
        /// Machine name.
        machine: String,
    },
}

impl SshError {
    /// Returns `true` when the host was never reached.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Unaddressable { .. }
        )
    }

    /// Returns `true` when the host ran the command and it failed.
    #[must_use]
    pub const fn is_command_failure(&self) -> bool {
        matches!(self, Self::Command { .. })
    }

    pub(crate) fn from_process(host: &str, command: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::TimedOut { seconds, .. } => Self::Timeout {
                host: host.to_owned(),
                command: command.to_owned(),
                seconds,
            },
            other => Self::Connection {
                host: host.to_owned(),
                message: other.to_string(),
            },
        }
    }
}
