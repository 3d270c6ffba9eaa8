//! Remote-command and file-transfer capabilities.
//!
//! Machines never talk to `ssh` directly: they describe a [`RemoteCommand`]
//! and hand it, together with an [`SshTarget`], to a [`RemoteShell`]. The
//! process-backed implementation lives in [`SshTransport`]; tests plug in
//! scripted shells from [`crate::test_support`].

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::SshConfig;

mod error;
mod transport;

pub use error::SshError;
pub use transport::SshTransport;

/// Where and how to reach a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port the SSH daemon listens on.
    pub port: u16,
    /// Machine specific private key, overriding the configured identity.
    pub identity_file: Option<Utf8PathBuf>,
    /// Backend specific options appended after the common ones (for example
    /// a `ProxyCommand` for containers).
    pub extra_flags: Vec<String>,
}

impl SshTarget {
    /// Creates a target with no identity override or extra flags.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            identity_file: None,
            extra_flags: Vec::new(),
        }
    }
}

/// A command to execute on a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// Shell command line run by the remote login shell.
    pub command: String,
    /// Whether stdout should be returned to the caller.
    pub capture_output: bool,
    /// Whether a non-zero exit status is an error.
    pub check: bool,
    /// Upper bound on the run time.
    pub timeout: Option<Duration>,
    /// Bytes streamed to the remote command's standard input.
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    /// Creates a checked command that does not capture output.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            capture_output: false,
            check: true,
            timeout: None,
            stdin: None,
        }
    }

    /// Requests captured stdout.
    #[must_use]
    pub const fn captured(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Accepts any exit status; the caller inspects [`RemoteOutput::status`].
    #[must_use]
    pub const fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    /// Bounds the run time.
    #[must_use]
    pub const fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Streams `bytes` to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Prepends `prefix` to the command line.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.command.insert_str(0, prefix);
        self
    }

    /// Applies exit-status checking to a command that reached the host.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Command`] when checking is requested and `status`
    /// is non-zero.
    pub fn settle(
        &self,
        host: &str,
        status: i32,
        stdout: String,
        stderr: &str,
    ) -> Result<RemoteOutput, SshError> {
        if self.check && status != 0 {
            return Err(SshError::Command {
                host: host.to_owned(),
                command: self.command.clone(),
                status,
                stderr: stderr.trim().to_owned(),
            });
        }
        Ok(RemoteOutput {
            status,
            stdout: if self.capture_output {
                stdout
            } else {
                String::new()
            },
        })
    }
}

/// Output of a remote command that reached the host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit status of the remote command.
    pub status: i32,
    /// Captured stdout; empty unless capture was requested.
    pub stdout: String,
}

/// Runs commands on remote machines.
pub trait RemoteShell: Send + Sync {
    /// Executes `command` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connection`] or [`SshError::Timeout`] when the
    /// transport fails, and [`SshError::Command`] when a checked command
    /// exits non-zero.
    fn run(&self, target: &SshTarget, command: &RemoteCommand) -> Result<RemoteOutput, SshError>;

    /// Drops any cached connection to `target`, for example after a reboot.
    fn reset(&self, target: &SshTarget);
}

/// Copies files between the build host and machines.
pub trait FileTransfer: Send + Sync {
    /// Uploads `local` to `remote` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Transfer`] when the copy fails.
    fn upload(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &str,
        recursive: bool,
    ) -> Result<(), SshError>;

    /// Downloads `remote` from `target` into `local`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Transfer`] when the copy fails.
    fn download(
        &self,
        target: &SshTarget,
        remote: &str,
        local: &Utf8Path,
        recursive: bool,
    ) -> Result<(), SshError>;
}

/// Client whose option syntax is being rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Client {
    /// `ssh`, which takes the port via `-p`.
    Ssh,
    /// `scp`, which takes the port via `-P`.
    Scp,
}

/// Renders the options shared by every client invocation for `target`.
#[must_use]
pub fn client_options(config: &SshConfig, target: &SshTarget, client: Client) -> Vec<String> {
    let port_flag = match client {
        Client::Ssh => "-p",
        Client::Scp => "-P",
    };
    let mut args = vec![port_flag.to_owned(), target.port.to_string()];

    let identity = target
        .identity_file
        .as_ref()
        .map(ToString::to_string)
        .or_else(|| config.ssh_identity_file.as_deref().map(expand_tilde));
    if let Some(identity_file) = identity {
        args.push(String::from("-i"));
        args.push(identity_file);
    }

    if config.ssh_batch_mode {
        push_option(&mut args, "BatchMode=yes");
    }
    if !config.ssh_strict_host_key_checking {
        push_option(&mut args, "StrictHostKeyChecking=no");
    }
    if !config.ssh_known_hosts_file.trim().is_empty() {
        push_option(
            &mut args,
            &format!("UserKnownHostsFile={}", config.ssh_known_hosts_file),
        );
    }
    push_option(
        &mut args,
        &format!("ConnectTimeout={}", config.connect_timeout_secs),
    );
    if let Some(control) = config.control_path.as_deref() {
        push_option(&mut args, "ControlMaster=auto");
        push_option(&mut args, &format!("ControlPath={}", expand_tilde(control)));
        push_option(&mut args, "ControlPersist=60");
    }

    args.extend(target.extra_flags.iter().cloned());
    args
}

/// Renders `user@host` for `target`.
#[must_use]
pub fn destination(config: &SshConfig, target: &SshTarget) -> String {
    format!("{}@{}", config.ssh_user, target.host)
}

fn push_option(args: &mut Vec<String>, option: &str) {
    args.push(String::from("-o"));
    args.push(option.to_owned());
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// Returns the input unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
