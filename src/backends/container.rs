//! NixOS containers running on a host machine.

use std::any::Any;

use serde_json::Value;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError};
use crate::state::{ResourceId, attr};

use super::downcast_definition;

/// Backend tag.
pub const TARGET_ENV: &str = "container";

const HOST: &str = "host";
const LOCALHOST: &str = "localhost";

/// Definition of a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerDefinition {
    machine: MachineDefinition,
    /// Machine hosting the container; `localhost` for the build host.
    pub host: String,
}

impl ContainerDefinition {
    /// Parses the definition; `host` defaults to `localhost`.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError`] when an attribute has the wrong shape.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            machine: MachineDefinition::from_raw(raw)?,
            host: raw
                .attr::<String>(HOST)?
                .unwrap_or_else(|| LOCALHOST.to_owned()),
        })
    }
}

impl Definition for ContainerDefinition {
    fn target_env(&self) -> &'static str {
        TARGET_ENV
    }

    fn machine(&self) -> &MachineDefinition {
        &self.machine
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A container reached through its host.
#[derive(Debug)]
pub struct ContainerMachine {
    core: MachineCore,
}

impl ContainerMachine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self {
            core: MachineCore::new(id, context),
        }
    }

    /// Host running the container.
    #[must_use]
    pub fn host(&self) -> &str {
        self.core.state().extra_str(HOST).unwrap_or(LOCALHOST)
    }

    /// Records the container's address on the host bridge.
    pub fn set_private_ipv4(&mut self, address: Option<String>) {
        self.core
            .state_mut()
            .set_extra(attr::PRIVATE_IPV4, address.map_or(Value::Null, Value::String));
    }

    fn on_build_host(&self) -> bool {
        self.host() == LOCALHOST
    }
}

impl Machine for ContainerMachine {
    fn kind(&self) -> &'static str {
        TARGET_ENV
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

    fn extra_ssh_flags(&self) -> Vec<String> {
        if self.on_build_host() {
            Vec::new()
        } else {
            vec![
                "-o".to_owned(),
                format!("ProxyCommand=ssh -x -a root@{} nc %h %p", self.host()),
            ]
        }
    }

    fn has_really_fast_connection(&self) -> bool {
        self.on_build_host()
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let container = downcast_definition::<ContainerDefinition>(&*self, defn)?;
        self.set_common_state(container.machine());
        self.core
            .state_mut()
            .set_extra(HOST, Value::String(container.host.clone()));
        Ok(())
    }
}

/// Builds a [`ContainerDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(ContainerDefinition::from_raw(raw)?))
}

/// Builds a [`ContainerMachine`].
#[must_use]
pub fn machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(ContainerMachine::new(id, context))
}
