//! Hetzner dedicated servers.

use std::any::Any;

use serde_json::Value;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError};
use crate::state::{LifecycleState, ResourceId};

use super::downcast_definition;

/// Backend tag.
pub const TARGET_ENV: &str = "hetzner";

const MAIN_IPV4: &str = "mainIPv4";
const STATE_MAIN_IPV4: &str = "mainIpv4";
const ROBOT_USER: &str = "robotUser";

/// Definition of a Hetzner server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HetznerDefinition {
    machine: MachineDefinition,
    /// Main IPv4 address of the server.
    pub main_ipv4: String,
    /// Robot account owning the server.
    pub robot_user: Option<String>,
}

impl HetznerDefinition {
    /// Parses the definition.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::MissingAttribute`] when `mainIPv4` is
    /// absent.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            machine: MachineDefinition::from_raw(raw)?,
            main_ipv4: raw.require_str(MAIN_IPV4)?.to_owned(),
            robot_user: raw.attr(ROBOT_USER)?,
        })
    }
}

impl Definition for HetznerDefinition {
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

/// A Hetzner dedicated server.
#[derive(Debug)]
pub struct HetznerMachine {
    core: MachineCore,
}

impl HetznerMachine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self {
            core: MachineCore::new(id, context),
        }
    }

    /// Main IPv4 address recorded for the server.
    #[must_use]
    pub fn main_ipv4(&self) -> Option<&str> {
        self.core.state().extra_str(STATE_MAIN_IPV4)
    }
}

impl Machine for HetznerMachine {
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
        self.main_ipv4().map(str::to_owned)
    }

    fn public_ipv4(&self) -> Option<String> {
        self.ssh_name()
    }

    // The rescue system gets a fresh host key on every boot.
    fn extra_ssh_flags(&self) -> Vec<String> {
        if self.state().state() == LifecycleState::Rescue {
            vec![
                "-o".to_owned(),
                "LogLevel=quiet".to_owned(),
                "-o".to_owned(),
                "StrictHostKeyChecking=no".to_owned(),
            ]
        } else {
            Vec::new()
        }
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let hetzner = downcast_definition::<HetznerDefinition>(&*self, defn)?;
        self.set_common_state(hetzner.machine());
        let state = self.core.state_mut();
        state.set_extra(STATE_MAIN_IPV4, Value::String(hetzner.main_ipv4.clone()));
        state.set_extra(
            ROBOT_USER,
            hetzner.robot_user.clone().map_or(Value::Null, Value::String),
        );
        Ok(())
    }
}

/// Builds a [`HetznerDefinition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(HetznerDefinition::from_raw(raw)?))
}

/// Builds a [`HetznerMachine`].
#[must_use]
pub fn machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(HetznerMachine::new(id, context))
}
