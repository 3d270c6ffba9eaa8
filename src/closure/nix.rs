//! [`ClosureStore`] backed by `nix-store` and `nix-copy-closure`.

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tracing::debug;

use crate::config::{SshConfig, ToolchainConfig};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::ssh::{Client, SshTarget, client_options, destination};

use super::{ClosureStore, StoreError};

/// Runs the Nix store tools on the build host.
#[derive(Clone, Debug)]
pub struct NixStore<R: CommandRunner> {
    toolchain: ToolchainConfig,
    ssh: SshConfig,
    runner: R,
}

impl<R: CommandRunner> NixStore<R> {
    /// Creates a store using `runner` to launch the tools.
    #[must_use]
    pub const fn new(toolchain: ToolchainConfig, ssh: SshConfig, runner: R) -> Self {
        Self {
            toolchain,
            ssh,
            runner,
        }
    }

    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, StoreError> {
        debug!(command = %spec.command_string(), "running store command");
        let output = self.runner.run(spec)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(StoreError::CommandFailure {
            program: spec.program.clone(),
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

impl<R: CommandRunner> ClosureStore for NixStore<R> {
    fn query_dependency_closure(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StoreError> {
        let spec = CommandSpec::new(&self.toolchain.nix_store_bin)
            .arg("-qR")
            .arg(path.as_str());
        let output = self.run_checked(&spec)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Utf8PathBuf::from)
            .collect())
    }

    fn copy_closure_to(
        &self,
        target: &SshTarget,
        path: &Utf8Path,
        compress: bool,
    ) -> Result<(), StoreError> {
        // Nix splits NIX_SSHOPTS like a shell, so values with spaces (such
        // as a ProxyCommand) must be quoted.
        let ssh_options = client_options(&self.ssh, target, Client::Ssh)
            .into_iter()
            .map(|option| escape(option.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut spec = CommandSpec::new(&self.toolchain.nix_copy_closure_bin)
            .env("NIX_SSHOPTS", ssh_options)
            .arg("--to")
            .arg(destination(&self.ssh, target))
            .arg(path.as_str());
        if compress {
            spec = spec.arg("--gzip");
        }
        self.run_checked(&spec)?;
        Ok(())
    }
}
