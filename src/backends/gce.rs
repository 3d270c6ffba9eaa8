//! Google Compute Engine instances.

use std::any::Any;

use serde_json::Value;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError};
use crate::state::{ResourceId, attr};

use super::{address_via_private_network, downcast_definition};

/// Backend tag.
pub const TARGET_ENV: &str = "gce";

const REGION: &str = "region";
const NETWORK: &str = "network";
const INSTANCE_TYPE: &str = "instanceType";
const DEFAULT_NETWORK: &str = "default";

/// Definition of a GCE instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GceDefinition {
    machine: MachineDefinition,
    /// Zone the instance is created in.
    pub region: String,
    /// VPC network name.
    pub network: String,
    /// Machine type.
    pub instance_type: Option<String>,
}

impl GceDefinition {
    /// Parses the definition; `network` defaults to `default`.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::MissingAttribute`] when `region` is absent.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            machine: MachineDefinition::from_raw(raw)?,
            region: raw.require_str(REGION)?.to_owned(),
            network: raw
                .attr::<String>(NETWORK)?
                .unwrap_or_else(|| DEFAULT_NETWORK.to_owned()),
            instance_type: raw.attr(INSTANCE_TYPE)?,
        })
    }
}

impl Definition for GceDefinition {
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

/// A GCE instance.
#[derive(Debug)]
pub struct GceMachine {
    core: MachineCore,
}

impl GceMachine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self {
            core: MachineCore::new(id, context),
        }
    }

    /// Network the instance is attached to.
    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.core.state().extra_str(NETWORK)
    }

    /// Records the addresses assigned by GCE.
    pub fn set_addresses(&mut self, public: Option<String>, private: Option<String>) {
        let state = self.core.state_mut();
        state.set_extra(attr::PUBLIC_IPV4, public.map_or(Value::Null, Value::String));
        state.set_extra(attr::PRIVATE_IPV4, private.map_or(Value::Null, Value::String));
    }
}

impl Machine for GceMachine {
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
        self.public_ipv4()
    }

    fn private_network(&self) -> Option<String> {
        self.network().map(|network| format!("gce:{network}"))
    }

    fn address_to(&self, other: &dyn Machine) -> Option<String> {
        address_via_private_network(self, other)
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let gce = downcast_definition::<GceDefinition>(&*self, defn)?;
        self.set_common_state(gce.machine());
        let state = self.core.state_mut();
        state.set_extra(REGION, Value::String(gce.region.clone()));
        state.set_extra(NETWORK, Value::String(gce.network.clone()));
        state.set_extra(
            INSTANCE_TYPE,
            gce.instance_type.clone().map_or(Value::Null, Value::String),
        );
        Ok(())
    }
}

/// Builds a [`GceDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(GceDefinition::from_raw(raw)?))
}

/// Builds a [`GceMachine`].
#[must_use]
pub fn machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(GceMachine::new(id, context))
}
