//! Closure transfer from the build host to machines.
//!
//! A machine on a slow link first fetches what it can from its substituters
//! (binary caches) and only then receives the remaining paths, compressed,
//! from the build host. Machines on a fast link skip the substituter pass
//! and receive everything uncompressed.

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::machine::{Machine, MachineError};
use crate::runner::ProcessError;
use crate::ssh::{RemoteCommand, SshTarget};

mod nix;

pub use nix::NixStore;

/// Errors raised by the build-host store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when a store tool cannot be launched.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Raised when a store tool exits non-zero.
    #[error("{program} failed with status {status}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status, or `unknown` when killed by a signal.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
}

/// Content-addressed store on the build host.
pub trait ClosureStore: Send + Sync {
    /// Lists `path` and every store path it depends on.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn query_dependency_closure(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StoreError>;

    /// Copies the closure of `path` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the copy fails.
    fn copy_closure_to(
        &self,
        target: &SshTarget,
        path: &Utf8Path,
        compress: bool,
    ) -> Result<(), StoreError>;
}

/// Transfers the closure of `path` to the machine.
///
/// The substituter pass is best effort and never fails the transfer; the
/// direct copy propagates its failures.
///
/// # Errors
///
/// Returns [`MachineError::Store`] when querying or copying fails and
/// [`MachineError::Ssh`] when the machine cannot be reached.
pub fn copy_closure_to<M: Machine + ?Sized>(machine: &M, path: &Utf8Path) -> Result<(), MachineError> {
    let target = machine.ssh_target()?;
    let context = machine.core().context();
    let fast = machine.has_really_fast_connection();

    if !fast {
        let closure = context.store.query_dependency_closure(path)?;
        let paths: Vec<String> = closure
            .iter()
            .map(|entry| escape(entry.as_str().into()).into_owned())
            .collect();
        info!(
            machine = machine.name(),
            paths = paths.len(),
            "fetching closure from substituters"
        );
        let output = machine.run_command(
            RemoteCommand::new(format!(
                "nix-store -j {} -r --ignore-unknown {}",
                context.toolchain.substitute_jobs,
                paths.join(" ")
            ))
            .unchecked(),
        )?;
        if output.status != 0 {
            info!(
                machine = machine.name(),
                status = output.status,
                "substituters could not provide every path"
            );
        }
    }

    info!(machine = machine.name(), %path, compress = !fast, "copying closure");
    context.store.copy_closure_to(&target, path, !fast)?;
    Ok(())
}

#[cfg(test)]
mod tests;
