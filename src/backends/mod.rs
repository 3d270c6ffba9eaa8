//! Machine backends, one per target environment.
//!
//! Each backend contributes a definition type (its view of the deployment
//! attributes) and a machine type (its addressing and capability overrides).
//! Provisioning through provider APIs is outside this crate; backends here
//! only model what the shared lifecycle protocol needs.

use crate::definition::Definition;
use crate::machine::{Machine, MachineError};

pub mod container;
pub mod ec2;
pub mod gce;
pub mod hetzner;
pub mod local_vm;
pub mod none;

pub use container::{ContainerDefinition, ContainerMachine};
pub use ec2::{Ec2Definition, Ec2Machine};
pub use gce::{GceDefinition, GceMachine};
pub use hetzner::{HetznerDefinition, HetznerMachine};
pub use local_vm::{LocalVmDefinition, LocalVmMachine, VmKind};
pub use none::{NoneDefinition, NoneMachine};

/// Address of `other` as seen from `this`: the private address when both
/// sit on the same private network, the public one otherwise.
#[must_use]
pub fn address_via_private_network(this: &dyn Machine, other: &dyn Machine) -> Option<String> {
    match (this.private_network(), other.private_network()) {
        (Some(mine), Some(theirs)) if mine == theirs => {
            other.private_ipv4().or_else(|| other.public_ipv4())
        }
        _ => other.public_ipv4(),
    }
}

/// Downcasts `defn` to the backend's definition type.
///
/// # Errors
///
/// Returns [`MachineError::DefinitionMismatch`] naming both tags when `defn`
/// belongs to another backend.
pub fn downcast_definition<'a, D: 'static>(
    machine: &dyn Machine,
    defn: &'a dyn Definition,
) -> Result<&'a D, MachineError> {
    defn.as_any()
        .downcast_ref::<D>()
        .ok_or_else(|| MachineError::DefinitionMismatch {
            machine: machine.name().to_owned(),
            expected: machine.kind(),
            found: defn.target_env(),
        })
}

#[cfg(test)]
mod tests;
