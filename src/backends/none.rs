//! Pre-existing hosts reached at a fixed address.

use std::any::Any;

use serde_json::Value;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError};
use crate::state::ResourceId;

use super::downcast_definition;

/// Backend tag.
pub const TARGET_ENV: &str = "none";

const TARGET_HOST: &str = "targetHost";

/// Definition of a pre-existing host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NoneDefinition {
    machine: MachineDefinition,
    target_host: String,
}

impl NoneDefinition {
    /// Parses the definition; `targetHost` defaults to the machine name.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError`] when an attribute has the wrong shape.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            machine: MachineDefinition::from_raw(raw)?,
            target_host: raw
                .attr::<String>(TARGET_HOST)?
                .unwrap_or_else(|| raw.name.clone()),
        })
    }

    /// Address to connect to.
    #[must_use]
    pub fn target_host(&self) -> &str {
        &self.target_host
    }
}

impl Definition for NoneDefinition {
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

/// A host managed only over SSH.
#[derive(Debug)]
pub struct NoneMachine {
    core: MachineCore,
}

impl NoneMachine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self {
            core: MachineCore::new(id, context),
        }
    }

    /// Address recorded for the host.
    #[must_use]
    pub fn target_host(&self) -> Option<&str> {
        self.core.state().extra_str(TARGET_HOST)
    }

    /// Records the address of the host.
    pub fn set_target_host(&mut self, host: Option<String>) {
        self.core
            .state_mut()
            .set_extra(TARGET_HOST, host.map_or(Value::Null, Value::String));
    }
}

impl Machine for NoneMachine {
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
        self.target_host().map(str::to_owned)
    }

    fn public_ipv4(&self) -> Option<String> {
        self.ssh_name()
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let none = downcast_definition::<NoneDefinition>(&*self, defn)?;
        self.set_common_state(none.machine());
        self.set_target_host(Some(none.target_host().to_owned()));
        Ok(())
    }
}

/// Builds a [`NoneDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(NoneDefinition::from_raw(raw)?))
}

/// Builds a [`NoneMachine`].
#[must_use]
pub fn machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(NoneMachine::new(id, context))
}
