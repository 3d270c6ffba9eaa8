//! Runtime secret provisioning.
//!
//! Secrets are written to `/run/keys`, a memory-backed directory, so they
//! never reach the machine's disks. Each key is staged in the scratch
//! directory, copied over, re-owned and the staged copy removed.

use shell_escape::unix::escape;
use tracing::{debug, info};

use crate::machine::{Machine, MachineError};
use crate::ssh::RemoteCommand;
use crate::state::LifecycleState;

mod vpn;

pub use vpn::{KeyPair, VPN_KEY_PATH, create_key_pair, generate_vpn_key};

/// Remote directory receiving runtime secrets.
pub const KEYS_DIR: &str = "/run/keys";

/// Uploads every key in the machine's state.
///
/// Does nothing in RESCUE (where `/run` may be disk backed) or when the
/// deployed configuration stores keys itself.
///
/// # Errors
///
/// Propagates remote command, upload and scratch failures; keys already
/// uploaded stay in place.
pub fn send_keys<M: Machine + ?Sized>(machine: &M) -> Result<(), MachineError> {
    let state = machine.state();
    if state.state() == LifecycleState::Rescue {
        debug!(machine = machine.name(), "not sending keys to a rescue system");
        return Ok(());
    }
    if state.store_keys_on_machine() {
        return Ok(());
    }

    machine.run_command(RemoteCommand::new(format!(
        "mkdir -m 0750 -p {KEYS_DIR} && chown root:keys {KEYS_DIR}"
    )))?;

    let scratch = &machine.core().context().scratch;
    let staging_prefix = format!("key-{}-", machine.name());
    for (name, key) in machine.keys() {
        info!(machine = machine.name(), key = %name, "uploading key");
        let staged = scratch.secret_file(&staging_prefix, key.text.as_bytes())?;
        let destination = format!("{KEYS_DIR}/{name}");
        let escaped = escape(destination.as_str().into());
        let owner = format!("{}:{}", key.user, key.group);

        machine.run_command(RemoteCommand::new(format!("rm -f {escaped}")))?;
        machine.upload_file(staged.path(), &destination, false)?;
        machine.run_command(RemoteCommand::new(format!(
            "chown {} {escaped} && chmod {} {escaped}",
            escape(owner.as_str().into()),
            escape(key.permissions.as_str().into()),
        )))?;
        staged.close()?;
    }

    machine.run_command(RemoteCommand::new(format!("touch {KEYS_DIR}/done")))?;
    Ok(())
}

#[cfg(test)]
mod tests;
