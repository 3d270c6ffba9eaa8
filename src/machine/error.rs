//! Error and outcome types for machine operations.

use thiserror::Error;
use tracing::warn;

use crate::closure::StoreError;
use crate::config::ConfigError;
use crate::port::PortError;
use crate::runner::ProcessError;
use crate::scratch::ScratchError;
use crate::ssh::SshError;
use crate::state::StateError;

/// Errors raised by machine lifecycle operations.
#[derive(Debug, Error, PartialEq)]
pub enum MachineError {
    /// Raised when a remote command or file copy fails.
    #[error("remote operation failed: {0}")]
    Ssh(#[from] SshError),
    /// Raised when a bounded port wait expires.
    #[error("port wait failed: {0}")]
    Port(#[from] PortError),
    /// Raised when querying or copying a closure fails.
    #[error("closure transfer failed: {0}")]
    Store(#[from] StoreError),
    /// Raised when scratch files cannot be written.
    #[error("scratch directory error: {0}")]
    Scratch(#[from] ScratchError),
    /// Raised when a local helper program cannot run.
    #[error("local command failed: {0}")]
    Process(#[from] ProcessError),
    /// Raised when persisting state fails.
    #[error("state persistence failed: {0}")]
    State(#[from] StateError),
    /// Raised when the capability configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Raised when the VPN private key could not be written on the machine.
    #[error("unable to upload VPN key to '{machine}' (exit status {status})")]
    VpnKeyUpload {
        /// Machine name.
        machine: String,
        /// Exit status of the upload command.
        status: i32,
    },
    /// Raised when a backend is handed another backend's definition.
    #[error("machine '{machine}' of type {expected} cannot apply a {found} definition")]
    DefinitionMismatch {
        /// Machine name.
        machine: String,
        /// Backend tag of the machine.
        expected: &'static str,
        /// Backend tag of the definition.
        found: &'static str,
    },
    /// Raised when the local hypervisor refuses a power operation.
    #[error("failed to control VM '{machine}': {message}")]
    VmControl {
        /// Machine name.
        machine: String,
        /// Exit status or reason.
        message: String,
    },
    /// Raised when `ssh-keygen` fails.
    #[error("failed to generate key pair for '{machine}': {message}")]
    KeyGeneration {
        /// Machine name.
        machine: String,
        /// Diagnostic from `ssh-keygen`.
        message: String,
    },
}

/// An optional lifecycle operation the backend does not implement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsupportedOperation {
    /// Operation name.
    pub operation: &'static str,
    /// Machine the operation was requested for.
    pub machine: String,
}

/// Result of an optional lifecycle operation.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum OperationOutcome {
    /// The operation ran.
    Completed,
    /// The backend declined the operation.
    Unsupported(UnsupportedOperation),
}

impl OperationOutcome {
    /// Returns `true` when the backend declined the operation.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Logs and builds the outcome for an operation a backend declines.
pub fn unsupported(operation: &'static str, machine: &str) -> OperationOutcome {
    warn!(machine, operation, "operation not supported by this machine type");
    OperationOutcome::Unsupported(UnsupportedOperation {
        operation,
        machine: machine.to_owned(),
    })
}
