//! VPN key pair provisioning.

use tracing::info;

use crate::machine::{Machine, MachineContext, MachineError};
use crate::runner::CommandSpec;
use crate::ssh::RemoteCommand;

/// Remote location of the VPN private key.
pub const VPN_KEY_PATH: &str = "/root/.ssh/id_charon_vpn";

/// An OpenSSH key pair.
#[derive(Clone, Eq, PartialEq)]
pub struct KeyPair {
    /// Private key in OpenSSH format.
    pub private: String,
    /// Public key line.
    pub public: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"<redacted>")
            .field("public", &self.public)
            .finish()
    }
}

/// Generates an ed25519 key pair in the scratch directory and reads it back,
/// leaving no files behind.
///
/// # Errors
///
/// Returns [`MachineError::KeyGeneration`] when `ssh-keygen` fails and
/// [`MachineError::Scratch`] when the generated files cannot be read.
pub fn create_key_pair(
    context: &MachineContext,
    label: &str,
    comment: &str,
) -> Result<KeyPair, MachineError> {
    let file_name = format!("id_vpn-{label}");
    let key_path = context.scratch.path().join(&file_name);
    let spec = CommandSpec::new(&context.toolchain.ssh_keygen_bin)
        .args(["-t", "ed25519", "-N", "", "-q", "-C"])
        .arg(comment)
        .arg("-f")
        .arg(key_path.as_str());

    let output = context.local.run(&spec)?;
    if !output.is_success() {
        return Err(MachineError::KeyGeneration {
            machine: label.to_owned(),
            message: format!(
                "{} exited with status {}: {}",
                context.toolchain.ssh_keygen_bin,
                output.status_text(),
                output.stderr.trim()
            ),
        });
    }

    let private = context.scratch.take(&file_name)?;
    let public = context.scratch.take(&format!("{file_name}.pub"))?;
    Ok(KeyPair {
        private,
        public: public.trim().to_owned(),
    })
}

/// Ensures the machine holds a VPN private key and the state records the
/// matching public key.
///
/// # Errors
///
/// Returns [`MachineError::VpnKeyUpload`] when writing the key exits
/// non-zero, and propagates connection and key generation failures.
pub fn generate_vpn_key<M: Machine + ?Sized>(machine: &mut M) -> Result<(), MachineError> {
    let key_exists = match machine.run_command(RemoteCommand::new(format!("test -f {VPN_KEY_PATH}")))
    {
        Ok(_) => true,
        Err(err) if err.is_command_failure() => false,
        Err(err) => return Err(err.into()),
    };
    if key_exists && machine.state().public_vpn_key().is_some() {
        return Ok(());
    }

    let comment = format!("hangar VPN key of {}", machine.name());
    let pair = create_key_pair(machine.core().context(), machine.name(), &comment)?;

    info!(machine = machine.name(), "uploading VPN key");
    let upload = RemoteCommand::new(format!(
        "umask 077 && mkdir -p /root/.ssh && cat > {VPN_KEY_PATH}"
    ))
    .unchecked()
    .with_stdin(pair.private.into_bytes());
    let output = machine.run_command(upload)?;
    if output.status != 0 {
        return Err(MachineError::VpnKeyUpload {
            machine: machine.name().to_owned(),
            status: output.status,
        });
    }

    machine
        .core_mut()
        .state_mut()
        .set_public_vpn_key(Some(pair.public));
    Ok(())
}
