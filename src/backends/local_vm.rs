//! Virtual machines on the build host, run by libvirtd or VirtualBox.
//!
//! Both hypervisors are driven through their local command line tools, so
//! unlike the cloud backends these machines can be powered on and off here.

use std::any::Any;
use std::fmt;

use serde_json::Value;
use tracing::info;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError, OperationOutcome};
use crate::runner::CommandSpec;
use crate::state::{LifecycleState, ResourceId, attr};

use super::downcast_definition;

const MEMORY_SIZE: &str = "memorySize";
const VCPU: &str = "vcpu";

/// Hypervisor running a local VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmKind {
    /// A libvirt domain.
    Libvirtd,
    /// A VirtualBox VM.
    Virtualbox,
}

impl VmKind {
    /// Backend tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Libvirtd => "libvirtd",
            Self::Virtualbox => "virtualbox",
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Definition of a local VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalVmDefinition {
    kind: VmKind,
    machine: MachineDefinition,
    /// Memory in MiB.
    pub memory_size: Option<u64>,
    /// Virtual CPU count.
    pub vcpu: Option<u32>,
}

impl LocalVmDefinition {
    /// Parses the definition for the given hypervisor.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError`] when an attribute has the wrong shape.
    pub fn from_raw(kind: VmKind, raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            kind,
            machine: MachineDefinition::from_raw(raw)?,
            memory_size: raw.attr(MEMORY_SIZE)?,
            vcpu: raw.attr(VCPU)?,
        })
    }

    /// Hypervisor the definition targets.
    #[must_use]
    pub const fn kind(&self) -> VmKind {
        self.kind
    }
}

impl Definition for LocalVmDefinition {
    fn target_env(&self) -> &'static str {
        self.kind.tag()
    }

    fn machine(&self) -> &MachineDefinition {
        &self.machine
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A VM on the build host.
#[derive(Debug)]
pub struct LocalVmMachine {
    kind: VmKind,
    core: MachineCore,
}

impl LocalVmMachine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(kind: VmKind, id: ResourceId, context: MachineContext) -> Self {
        Self {
            kind,
            core: MachineCore::new(id, context),
        }
    }

    /// Hypervisor running the VM.
    #[must_use]
    pub const fn vm_kind(&self) -> VmKind {
        self.kind
    }

    /// Records the VM's address on the host-only network.
    pub fn set_private_ipv4(&mut self, address: Option<String>) {
        self.core
            .state_mut()
            .set_extra(attr::PRIVATE_IPV4, address.map_or(Value::Null, Value::String));
    }

    fn power_command(&self, on: bool) -> Result<CommandSpec, MachineError> {
        let vm = self
            .core
            .state()
            .vm_id()
            .ok_or_else(|| MachineError::VmControl {
                machine: self.name().to_owned(),
                message: String::from("no VM identifier recorded"),
            })?;
        let tools = &self.core.context().toolchain;
        Ok(match self.kind {
            VmKind::Libvirtd => CommandSpec::new(&tools.virsh_bin)
                .args(["-c", tools.libvirt_uri.as_str()])
                .arg(if on { "start" } else { "shutdown" })
                .arg(vm),
            VmKind::Virtualbox if on => CommandSpec::new(&tools.vboxmanage_bin)
                .args(["startvm", vm, "--type", "headless"]),
            VmKind::Virtualbox => CommandSpec::new(&tools.vboxmanage_bin)
                .args(["controlvm", vm, "acpipowerbutton"]),
        })
    }

    fn power(&self, on: bool) -> Result<(), MachineError> {
        let spec = self.power_command(on)?;
        let output = self.core.context().local.run(&spec)?;
        if output.is_success() {
            return Ok(());
        }
        Err(MachineError::VmControl {
            machine: self.name().to_owned(),
            message: format!(
                "{} exited with {}: {}",
                spec.command_string(),
                output.status_text(),
                output.stderr.trim()
            ),
        })
    }
}

impl Machine for LocalVmMachine {
    fn kind(&self) -> &'static str {
        self.kind.tag()
    }

    fn core(&self) -> &MachineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MachineCore {
        &mut self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ssh_name(&self) -> Option<String> {
        self.private_ipv4()
    }

    fn has_really_fast_connection(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<OperationOutcome, MachineError> {
        info!(machine = self.name(), hypervisor = %self.kind, "starting VM");
        self.power(true)?;
        self.wait_for_ssh(true)?;
        Ok(OperationOutcome::Completed)
    }

    fn stop(&mut self) -> Result<OperationOutcome, MachineError> {
        info!(machine = self.name(), hypervisor = %self.kind, "stopping VM");
        self.power(false)?;
        let state = self.core.state_mut();
        state.set_state(LifecycleState::Stopped);
        state.set_ssh_pinged(false);
        Ok(OperationOutcome::Completed)
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let vm = downcast_definition::<LocalVmDefinition>(&*self, defn)?;
        if vm.kind() != self.kind {
            return Err(MachineError::DefinitionMismatch {
                machine: self.name().to_owned(),
                expected: self.kind.tag(),
                found: vm.kind().tag(),
            });
        }
        self.set_common_state(vm.machine());
        let state = self.core.state_mut();
        state.set_extra(MEMORY_SIZE, vm.memory_size.map_or(Value::Null, Value::from));
        state.set_extra(VCPU, vm.vcpu.map_or(Value::Null, Value::from));
        Ok(())
    }
}

/// Builds a libvirtd [`LocalVmDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn libvirtd_definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(LocalVmDefinition::from_raw(VmKind::Libvirtd, raw)?))
}

/// Builds a VirtualBox [`LocalVmDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn virtualbox_definition(
    raw: &RawDefinition,
) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(LocalVmDefinition::from_raw(VmKind::Virtualbox, raw)?))
}

/// Builds a libvirtd [`LocalVmMachine`].
#[must_use]
pub fn libvirtd_machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(LocalVmMachine::new(VmKind::Libvirtd, id, context))
}

/// Builds a VirtualBox [`LocalVmMachine`].
#[must_use]
pub fn virtualbox_machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(LocalVmMachine::new(VmKind::Virtualbox, id, context))
}
