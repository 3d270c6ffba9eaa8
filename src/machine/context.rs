//! Capabilities shared by machines and the per-machine core.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::closure::{ClosureStore, NixStore};
use crate::config::{SshConfig, ToolchainConfig};
use crate::port::{PortProbe, TcpPortProbe};
use crate::runner::{CommandRunner, ProcessCommandRunner};
use crate::scratch::ScratchDir;
use crate::ssh::{FileTransfer, RemoteShell, SshTransport};
use crate::state::{AttributeStore, LifecycleState, MachineState, ResourceId};

use super::MachineError;

/// The external capabilities a machine drives.
///
/// Cloning is cheap; every machine of a deployment shares one context and
/// therefore one scratch directory.
#[derive(Clone)]
pub struct MachineContext {
    /// Remote command execution.
    pub shell: Arc<dyn RemoteShell>,
    /// File copies to and from machines.
    pub files: Arc<dyn FileTransfer>,
    /// Port reachability polling.
    pub ports: Arc<dyn PortProbe>,
    /// Build-host closure store.
    pub store: Arc<dyn ClosureStore>,
    /// Local helper programs such as `ssh-keygen`.
    pub local: Arc<dyn CommandRunner>,
    /// Private scratch space for secrets and generated keys.
    pub scratch: Arc<ScratchDir>,
    /// Local tool settings.
    pub toolchain: ToolchainConfig,
}

impl MachineContext {
    /// Wires the process-backed capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Config`] when either configuration fails
    /// validation and [`MachineError::Scratch`] when the scratch directory
    /// cannot be created.
    pub fn from_config(ssh: SshConfig, toolchain: ToolchainConfig) -> Result<Self, MachineError> {
        toolchain.validate()?;
        let transport = Arc::new(SshTransport::with_process_runner(ssh.clone())?);
        Ok(Self {
            shell: transport.clone(),
            files: transport,
            ports: Arc::new(TcpPortProbe::new()),
            store: Arc::new(NixStore::new(toolchain.clone(), ssh, ProcessCommandRunner)),
            local: Arc::new(ProcessCommandRunner),
            scratch: Arc::new(ScratchDir::new()?),
            toolchain,
        })
    }
}

impl fmt::Debug for MachineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineContext")
            .field("scratch", &self.scratch.path())
            .field("toolchain", &self.toolchain)
            .finish_non_exhaustive()
    }
}

/// State and capabilities every backend embeds.
#[derive(Debug)]
pub struct MachineCore {
    state: MachineState,
    context: MachineContext,
    pinged_this_time: bool,
    ssh_private_key_file: Option<Utf8PathBuf>,
}

impl MachineCore {
    /// Creates a core with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self::with_state(MachineState::new(id), context)
    }

    /// Creates a core around an existing state.
    #[must_use]
    pub const fn with_state(state: MachineState, context: MachineContext) -> Self {
        Self {
            state,
            context,
            pinged_this_time: false,
            ssh_private_key_file: None,
        }
    }

    /// Replaces the in-memory state with the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::State`] when the store cannot be read.
    pub fn load(&mut self, store: &dyn AttributeStore) -> Result<(), MachineError> {
        self.state = MachineState::load(store, self.state.id().clone())?;
        Ok(())
    }

    /// Persists changed attributes.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::State`] when the store write fails.
    pub fn save(&mut self, store: &dyn AttributeStore) -> Result<(), MachineError> {
        self.state.save(store)?;
        Ok(())
    }

    /// Logical machine name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Persisted state.
    #[must_use]
    pub const fn state(&self) -> &MachineState {
        &self.state
    }

    /// Mutable persisted state.
    pub const fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }

    /// Shared capabilities.
    #[must_use]
    pub const fn context(&self) -> &MachineContext {
        &self.context
    }

    /// Whether SSH answered during the current operation.
    #[must_use]
    pub const fn pinged_this_time(&self) -> bool {
        self.pinged_this_time
    }

    /// Records that SSH answered, now and durably.
    pub fn mark_reachable(&mut self) {
        self.state.set_ssh_pinged(true);
        self.pinged_this_time = true;
    }

    /// Forgets that SSH answered during the current operation. The durable
    /// `sshPinged` flag is kept.
    pub const fn clear_reachable(&mut self) {
        self.pinged_this_time = false;
    }

    /// Marks the machine up and reachable.
    pub fn mark_up(&mut self) {
        self.state.set_state(LifecycleState::Up);
        self.mark_reachable();
    }

    /// Key file written by [`Self::write_ssh_private_key`], if any.
    #[must_use]
    pub fn ssh_private_key_file(&self) -> Option<&Utf8Path> {
        self.ssh_private_key_file.as_deref()
    }

    /// Writes a private key into the scratch directory and remembers its
    /// path for later SSH invocations.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Scratch`] when the file cannot be written.
    pub fn write_ssh_private_key(&mut self, private_key: &str) -> Result<Utf8PathBuf, MachineError> {
        let file_name = format!("id_hangar-{}", self.name());
        let path = self
            .context
            .scratch
            .write_private(&file_name, private_key.as_bytes())?;
        self.ssh_private_key_file = Some(path.clone());
        Ok(path)
    }
}
