//! The machine resource contract.
//!
//! [`Machine`] is implemented once per backend. Backends supply identity and
//! addressing (`kind`, `ssh_name`, the embedded [`MachineCore`]); everything
//! else has a default that implements the shared lifecycle protocol on top of
//! the capabilities in [`MachineContext`]. Optional operations a backend does
//! not support return [`OperationOutcome::Unsupported`] and log a warning
//! rather than failing.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::closure;
use crate::definition::{Definition, KeySpec, MachineDefinition};
use crate::keys;
use crate::port::{PortProbe, PortState};
use crate::probe::{self, CheckResult};
use crate::ssh::{RemoteCommand, RemoteOutput, SshError, SshTarget};
use crate::state::{LifecycleState, MachineState, attr};

mod context;
mod error;

pub use context::{MachineContext, MachineCore};
pub use error::{MachineError, OperationOutcome, UnsupportedOperation, unsupported};

/// Prepended to every remote command while the machine runs a rescue system,
/// which lacks the target's locale data.
pub const RESCUE_PREFIX: &str = "export LANG= LC_ALL= LC_TIME=; ";

const SWITCH_TO_CONFIGURATION: &str = "/nix/var/nix/profiles/system/bin/switch-to-configuration";
const CONSOLE_UNAVAILABLE: &str = "(not available for this machine type)\n";

/// A machine managed by the orchestrator.
///
/// Operations on one machine are not reentrant; callers drive different
/// machines from different threads.
pub trait Machine: Send {
    /// Backend tag, as used in `targetEnv`.
    fn kind(&self) -> &'static str;

    /// Embedded state and capabilities.
    fn core(&self) -> &MachineCore;

    /// Mutable access to the embedded state and capabilities.
    fn core_mut(&mut self) -> &mut MachineCore;

    /// Enables downcasting to the backend's concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Host SSH connects to, or `None` while the machine has no address.
    fn ssh_name(&self) -> Option<String>;

    /// Logical machine name.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Persisted state.
    fn state(&self) -> &MachineState {
        self.core().state()
    }

    /// Backend specific SSH options.
    fn extra_ssh_flags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Private key SSH should use for this machine.
    fn ssh_private_key_file(&self) -> Option<Utf8PathBuf> {
        self.core().ssh_private_key_file().map(Utf8Path::to_path_buf)
    }

    /// Connection details for the SSH capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Unaddressable`] when [`Self::ssh_name`] is `None`.
    fn ssh_target(&self) -> Result<SshTarget, SshError> {
        let host = self.ssh_name().ok_or_else(|| SshError::Unaddressable {
            machine: self.name().to_owned(),
        })?;
        Ok(SshTarget {
            host,
            port: self.state().ssh_port(),
            identity_file: self.ssh_private_key_file(),
            extra_flags: self.extra_ssh_flags(),
        })
    }

    /// Public IPv4 address, when the backend has one.
    fn public_ipv4(&self) -> Option<String> {
        self.state().extra_str(attr::PUBLIC_IPV4).map(str::to_owned)
    }

    /// Private IPv4 address, when the backend has one.
    fn private_ipv4(&self) -> Option<String> {
        self.state().extra_str(attr::PRIVATE_IPV4).map(str::to_owned)
    }

    /// Identifier of the private network the machine sits on, if any.
    /// Machines sharing a network reach each other by private address.
    fn private_network(&self) -> Option<String> {
        None
    }

    /// Whether the link from the build host is fast enough that fetching
    /// from substituters is not worth trying.
    fn has_really_fast_connection(&self) -> bool {
        false
    }

    /// Address this machine should use to reach `other`.
    fn address_to(&self, other: &dyn Machine) -> Option<String> {
        other.public_ipv4()
    }

    /// Runtime secrets to provision.
    fn keys(&self) -> &BTreeMap<String, KeySpec> {
        self.state().keys()
    }

    /// Serial console output.
    ///
    /// # Errors
    ///
    /// Backends that query a provider API surface its failures.
    fn console_output(&mut self) -> Result<String, MachineError> {
        Ok(CONSOLE_UNAVAILABLE.to_owned())
    }

    /// Copies the definition into the state. Backends extend this with their
    /// own attributes.
    ///
    /// # Errors
    ///
    /// Backends report definitions they cannot apply.
    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        self.set_common_state(defn.machine());
        Ok(())
    }

    /// Copies the backend independent attributes of `defn` into the state.
    fn set_common_state(&mut self, defn: &MachineDefinition) {
        let state = self.core_mut().state_mut();
        state.set_store_keys_on_machine(defn.store_keys_on_machine);
        state.set_keys(defn.keys.clone());
        state.set_ssh_port(defn.ssh_port);
        state.set_owners(defn.owners.clone());
    }

    /// Starts the machine. A no-op unless the backend can power machines on.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn start(&mut self) -> Result<OperationOutcome, MachineError> {
        Ok(OperationOutcome::Completed)
    }

    /// Stops the machine.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn stop(&mut self) -> Result<OperationOutcome, MachineError> {
        Ok(unsupported("stop", self.name()))
    }

    /// Reboots into a rescue system and waits for it.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn reboot_rescue(&mut self, _hard: bool) -> Result<OperationOutcome, MachineError> {
        Ok(unsupported("reboot_rescue", self.name()))
    }

    /// Snapshots the persistent disks `defn` declares.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn backup(
        &mut self,
        _defn: &dyn Definition,
        _backup_id: &str,
    ) -> Result<OperationOutcome, MachineError> {
        Ok(unsupported("backup", self.name()))
    }

    /// Restores persistent disks from a backup. An empty `devices` restores
    /// every disk of `defn`.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn restore(
        &mut self,
        _defn: &dyn Definition,
        _backup_id: &str,
        _devices: &[String],
    ) -> Result<OperationOutcome, MachineError> {
        Ok(unsupported("restore", self.name()))
    }

    /// Deletes a backup.
    ///
    /// # Errors
    ///
    /// Backends surface provider failures.
    fn remove_backup(
        &mut self,
        _backup_id: &str,
        _keep_physical: bool,
    ) -> Result<OperationOutcome, MachineError> {
        Ok(unsupported("remove_backup", self.name()))
    }

    /// Probes reachability and unit health. Never fails; problems are
    /// reported through the result and the lifecycle state.
    fn check(&mut self) -> CheckResult {
        probe::check(self)
    }

    /// The 1, 5 and 15 minute load averages, or `None` when the machine
    /// cannot be queried.
    fn load_average(&self) -> Option<[f64; 3]> {
        probe::load_average(self)
    }

    /// Runs a command on the machine. Every remote command goes through here.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] as classified by the remote shell.
    fn run_command(&self, command: RemoteCommand) -> Result<RemoteOutput, SshError> {
        let target = self.ssh_target()?;
        let delivered = if self.state().state() == LifecycleState::Rescue
            && !command.command.starts_with(RESCUE_PREFIX)
        {
            command.with_prefix(RESCUE_PREFIX)
        } else {
            command
        };
        debug!(machine = self.name(), command = %delivered.command, "running remote command");
        self.core().context().shell.run(&target, &delivered)
    }

    /// Asks the machine to reboot and drops the cached SSH connection.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the machine has no address or the
    /// command cannot be delivered for a reason other than the connection
    /// dropping.
    fn reboot(&mut self, hard: bool) -> Result<(), MachineError> {
        info!(machine = self.name(), hard, "rebooting");
        let command = if self.state().state() == LifecycleState::Rescue {
            // Rescue systems may lack systemd; the delay lets the SSH session
            // close before the machine goes down.
            "(sleep 2; reboot) &"
        } else {
            "systemctl reboot"
        };
        match self.run_command(RemoteCommand::new(command).unchecked()) {
            Ok(_) => {}
            Err(SshError::Connection { message, .. }) => {
                debug!(machine = self.name(), %message, "connection dropped by reboot");
            }
            Err(err) => return Err(err.into()),
        }
        let core = self.core_mut();
        core.clear_reachable();
        core.state_mut().set_state(LifecycleState::Starting);
        let target = self.ssh_target()?;
        self.core().context().shell.reset(&target);
        Ok(())
    }

    /// Reboots and blocks until SSH answers again, then re-sends keys.
    ///
    /// # Errors
    ///
    /// Propagates reboot, port wait and key upload failures.
    fn reboot_sync(&mut self, hard: bool) -> Result<(), MachineError> {
        self.reboot(hard)?;
        let target = self.ssh_target()?;
        let ports: Arc<dyn PortProbe> = Arc::clone(&self.core().context().ports);
        let name = self.name().to_owned();
        let mut progress = || debug!(machine = %name, "waiting for the machine to finish rebooting");

        info!(machine = %name, "waiting for the machine to finish rebooting");
        ports.wait_for_port(&target.host, target.port, PortState::Closed, &mut progress)?;
        debug!(machine = %name, "machine is down");
        ports.wait_for_port(&target.host, target.port, PortState::Open, &mut progress)?;
        info!(machine = %name, "machine is up");

        self.core_mut().mark_up();
        self.send_keys()
    }

    /// Blocks until the SSH port is open.
    ///
    /// Returns immediately when SSH has answered before, unless
    /// `force_recheck` asks for confirmation within the current operation.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the machine has no address and
    /// [`MachineError::Port`] when a bounded wait expires.
    fn wait_for_ssh(&mut self, force_recheck: bool) -> Result<(), MachineError> {
        let current = self.core();
        if current.state().ssh_pinged() && (!force_recheck || current.pinged_this_time()) {
            return Ok(());
        }
        let target = self.ssh_target()?;
        let name = self.name().to_owned();
        info!(machine = %name, "waiting for SSH");
        self.core().context().ports.wait_for_port(
            &target.host,
            target.port,
            PortState::Open,
            &mut || debug!(machine = %name, "SSH not yet reachable"),
        )?;

        let core = self.core_mut();
        if core.state().state() != LifecycleState::Rescue {
            core.state_mut().set_state(LifecycleState::Up);
        }
        core.mark_reachable();
        Ok(())
    }

    /// Uploads the machine's runtime secrets into `/run/keys`.
    ///
    /// # Errors
    ///
    /// Propagates remote command and upload failures.
    fn send_keys(&self) -> Result<(), MachineError> {
        keys::send_keys(self)
    }

    /// Ensures the machine holds a VPN key pair whose public half is
    /// recorded in the state.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::VpnKeyUpload`] when the private key cannot be
    /// written on the machine.
    fn generate_vpn_key(&mut self) -> Result<(), MachineError> {
        keys::generate_vpn_key(self)
    }

    /// Copies a closure to the machine, letting it fetch from substituters
    /// first unless its link is fast.
    ///
    /// # Errors
    ///
    /// Propagates closure query and copy failures.
    fn copy_closure_to(&self, path: &Utf8Path) -> Result<(), MachineError> {
        closure::copy_closure_to(self, path)
    }

    /// Uploads a local file or directory.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the copy fails.
    fn upload_file(
        &self,
        source: &Utf8Path,
        destination: &str,
        recursive: bool,
    ) -> Result<(), MachineError> {
        let target = self.ssh_target()?;
        self.core()
            .context()
            .files
            .upload(&target, source, destination, recursive)?;
        Ok(())
    }

    /// Downloads a remote file or directory.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the copy fails.
    fn download_file(
        &self,
        source: &str,
        destination: &Utf8Path,
        recursive: bool,
    ) -> Result<(), MachineError> {
        let target = self.ssh_target()?;
        self.core()
            .context()
            .files
            .download(&target, source, destination, recursive)?;
        Ok(())
    }

    /// Runs the activation script with `method` (for example `switch` or
    /// `boot`) and returns its exit status. `command` replaces the system
    /// profile's script.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the command cannot be delivered.
    fn switch_to_configuration(
        &self,
        method: &str,
        sync: bool,
        command: Option<&str>,
    ) -> Result<i32, MachineError> {
        let mut line = String::new();
        if !sync {
            line.push_str("NIXOS_NO_SYNC=1 ");
        }
        line.push_str(command.unwrap_or(SWITCH_TO_CONFIGURATION));
        line.push(' ');
        line.push_str(method);
        Ok(self.run_command(RemoteCommand::new(line).unchecked())?.status)
    }

    /// Writes a private key for SSH to use with this machine.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Scratch`] when the key cannot be written.
    fn write_ssh_private_key(&mut self, private_key: &str) -> Result<Utf8PathBuf, MachineError> {
        self.core_mut().write_ssh_private_key(private_key)
    }
}
