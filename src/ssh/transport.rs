//! Process-backed SSH transport built on the system `ssh` and `scp` clients.

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::config::{ConfigError, SshConfig};
use crate::runner::{CommandRunner, CommandSpec, ProcessCommandRunner};

use super::{
    Client, FileTransfer, RemoteCommand, RemoteOutput, RemoteShell, SshError, SshTarget,
    client_options, destination, expand_tilde,
};

/// Exit status `ssh` reserves for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Runs remote commands and copies files by shelling out to `ssh`/`scp`.
#[derive(Clone, Debug)]
pub struct SshTransport<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl SshTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, ConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshTransport<R> {
    /// Creates a transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration validation fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    fn copy(&self, target: &SshTarget, from: &str, to: &str, recursive: bool) -> Result<(), SshError> {
        let mut spec = CommandSpec::new(&self.config.scp_bin)
            .args(client_options(&self.config, target, Client::Scp));
        if recursive {
            spec = spec.arg("-r");
        }
        spec = spec.arg(from).arg(to);

        debug!(host = %target.host, from, to, "copying file");
        let output = self.runner.run(&spec).map_err(|err| SshError::Transfer {
            from: from.to_owned(),
            to: to.to_owned(),
            message: err.to_string(),
        })?;
        if output.is_success() {
            return Ok(());
        }
        Err(SshError::Transfer {
            from: from.to_owned(),
            to: to.to_owned(),
            message: format!(
                "{} exited with status {}: {}",
                self.config.scp_bin,
                output.status_text(),
                output.stderr.trim()
            ),
        })
    }
}

impl<R: CommandRunner> RemoteShell for SshTransport<R> {
    fn run(&self, target: &SshTarget, command: &RemoteCommand) -> Result<RemoteOutput, SshError> {
        let mut spec = CommandSpec::new(&self.config.ssh_bin)
            .args(client_options(&self.config, target, Client::Ssh))
            .arg(destination(&self.config, target))
            .arg(command.command.as_str())
            .timeout(command.timeout);
        if let Some(input) = &command.stdin {
            spec = spec.stdin(input.clone());
        }

        let output = self
            .runner
            .run(&spec)
            .map_err(|err| SshError::from_process(&target.host, &command.command, err))?;

        match output.code {
            None | Some(SSH_TRANSPORT_FAILURE) => Err(SshError::Connection {
                host: target.host.clone(),
                message: if output.stderr.trim().is_empty() {
                    format!("{} exited with status {}", self.config.ssh_bin, output.status_text())
                } else {
                    output.stderr.trim().to_owned()
                },
            }),
            Some(status) => {
                if !command.capture_output && !output.stdout.trim().is_empty() {
                    debug!(host = %target.host, output = %output.stdout.trim_end(), "remote output");
                }
                command.settle(&target.host, status, output.stdout, &output.stderr)
            }
        }
    }

    fn reset(&self, target: &SshTarget) {
        let Some(control) = self.config.control_path.as_deref() else {
            return;
        };
        let spec = CommandSpec::new(&self.config.ssh_bin)
            .args(["-O", "exit", "-o"])
            .arg(format!("ControlPath={}", expand_tilde(control)))
            .arg(destination(&self.config, target));

        match self.runner.run(&spec) {
            Ok(output) if output.is_success() => {
                debug!(host = %target.host, "closed SSH control master");
            }
            Ok(_) => debug!(host = %target.host, "no SSH control master to close"),
            Err(err) => warn!(host = %target.host, error = %err, "failed to close SSH control master"),
        }
    }
}

impl<R: CommandRunner> FileTransfer for SshTransport<R> {
    fn upload(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &str,
        recursive: bool,
    ) -> Result<(), SshError> {
        let to = format!("{}:{remote}", destination(&self.config, target));
        self.copy(target, local.as_str(), &to, recursive)
    }

    fn download(
        &self,
        target: &SshTarget,
        remote: &str,
        local: &Utf8Path,
        recursive: bool,
    ) -> Result<(), SshError> {
        let from = format!("{}:{remote}", destination(&self.config, target));
        self.copy(target, &from, local.as_str(), recursive)
    }
}
