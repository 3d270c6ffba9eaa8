//! Amazon EC2 instances.

use std::any::Any;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::definition::{Definition, DefinitionError, MachineDefinition, RawDefinition};
use crate::machine::{Machine, MachineContext, MachineCore, MachineError};
use crate::state::{ResourceId, attr};

use super::{address_via_private_network, downcast_definition};

/// Backend tag.
pub const TARGET_ENV: &str = "ec2";

const REGION: &str = "region";
const ZONE: &str = "zone";
const INSTANCE_TYPE: &str = "instanceType";
const KEY_PAIR: &str = "keyPair";
const PRIVATE_KEY: &str = "privateKey";
const USE_PRIVATE_IP_ADDRESS: &str = "usePrivateIpAddress";

/// Definition of an EC2 instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ec2Definition {
    machine: MachineDefinition,
    /// AWS region.
    pub region: String,
    /// Availability zone, when pinned.
    pub zone: Option<String>,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Name of the EC2 key pair installed on the instance.
    pub key_pair: Option<String>,
    /// Local path of the private key matching `key_pair`.
    pub private_key: Option<String>,
    /// Whether to connect over the private address.
    pub use_private_ip_address: bool,
}

impl Ec2Definition {
    /// Parses the definition.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::MissingAttribute`] when `region` is absent
    /// and [`DefinitionError::InvalidAttribute`] for malformed attributes.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            machine: MachineDefinition::from_raw(raw)?,
            region: raw.require_str(REGION)?.to_owned(),
            zone: raw.attr(ZONE)?,
            instance_type: raw.attr(INSTANCE_TYPE)?,
            key_pair: raw.attr(KEY_PAIR)?,
            private_key: raw.attr(PRIVATE_KEY)?,
            use_private_ip_address: raw.attr(USE_PRIVATE_IP_ADDRESS)?.unwrap_or(false),
        })
    }
}

impl Definition for Ec2Definition {
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

/// An EC2 instance.
#[derive(Debug)]
pub struct Ec2Machine {
    core: MachineCore,
}

impl Ec2Machine {
    /// Creates a machine with default state.
    #[must_use]
    pub fn new(id: ResourceId, context: MachineContext) -> Self {
        Self {
            core: MachineCore::new(id, context),
        }
    }

    /// Region the instance lives in.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.core.state().extra_str(REGION)
    }

    /// Records the addresses assigned by EC2.
    pub fn set_addresses(&mut self, public: Option<String>, private: Option<String>) {
        let state = self.core.state_mut();
        state.set_extra(attr::PUBLIC_IPV4, public.map_or(Value::Null, Value::String));
        state.set_extra(attr::PRIVATE_IPV4, private.map_or(Value::Null, Value::String));
    }
}

impl Machine for Ec2Machine {
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
        if self.core.state().extra_flag(USE_PRIVATE_IP_ADDRESS) {
            self.private_ipv4()
        } else {
            self.public_ipv4()
        }
    }

    fn ssh_private_key_file(&self) -> Option<Utf8PathBuf> {
        self.core
            .ssh_private_key_file()
            .map(Utf8Path::to_path_buf)
            .or_else(|| self.core.state().extra_str(PRIVATE_KEY).map(Utf8PathBuf::from))
    }

    fn private_network(&self) -> Option<String> {
        self.region().map(|region| format!("ec2:{region}"))
    }

    fn address_to(&self, other: &dyn Machine) -> Option<String> {
        address_via_private_network(self, other)
    }

    fn apply_definition(&mut self, defn: &dyn Definition) -> Result<(), MachineError> {
        let ec2 = downcast_definition::<Ec2Definition>(&*self, defn)?;
        self.set_common_state(ec2.machine());
        let state = self.core.state_mut();
        state.set_extra(REGION, Value::String(ec2.region.clone()));
        state.set_extra(ZONE, ec2.zone.clone().map_or(Value::Null, Value::String));
        state.set_extra(
            INSTANCE_TYPE,
            ec2.instance_type.clone().map_or(Value::Null, Value::String),
        );
        state.set_extra(KEY_PAIR, ec2.key_pair.clone().map_or(Value::Null, Value::String));
        state.set_extra(
            PRIVATE_KEY,
            ec2.private_key.clone().map_or(Value::Null, Value::String),
        );
        state.set_extra(
            USE_PRIVATE_IP_ADDRESS,
            Value::Bool(ec2.use_private_ip_address),
        );
        Ok(())
    }
}

/// Builds an [`Ec2Definition`].
///
/// # Errors
///
/// Returns [`DefinitionError`] when the attributes are malformed.
pub fn definition(raw: &RawDefinition) -> Result<Box<dyn Definition>, DefinitionError> {
    Ok(Box::new(Ec2Definition::from_raw(raw)?))
}

/// Builds an [`Ec2Machine`].
#[must_use]
pub fn machine(id: ResourceId, context: MachineContext) -> Box<dyn Machine> {
    Box::new(Ec2Machine::new(id, context))
}
