//! Tag-keyed factories for resource definitions and states.
//!
//! Machines are keyed by their `targetEnv` tag and other resources by their
//! `type` tag. New backends plug in through [`BackendRegistry::register_machine`]
//! and [`BackendRegistry::register_resource`]; callers only see the
//! [`DefinitionRecord`] and [`ResourceState`] enums.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use thiserror::Error;
use tracing::debug;

use crate::backends::{container, ec2, gce, hetzner, local_vm, none};
use crate::definition::{
    Definition, DefinitionError, RawDefinition, ResourceDefinition, TARGET_ENV,
};
use crate::machine::{Machine, MachineContext};
use crate::state::ResourceId;

/// Builds a backend definition from raw attributes.
pub type DefinitionFactory = fn(&RawDefinition) -> Result<Box<dyn Definition>, DefinitionError>;

/// Builds a backend machine with default state.
pub type MachineFactory = fn(ResourceId, MachineContext) -> Box<dyn Machine>;

/// Resource types the orchestrator tracks without a machine behind them.
pub const BUILTIN_RESOURCE_TYPES: [&str; 17] = [
    "ec2-keypair",
    "ssh-keypair",
    "sqs-queue",
    "s3-bucket",
    "iam-role",
    "ec2-security-group",
    "ec2-placement-group",
    "ebs-volume",
    "elastic-ip",
    "gce-disk",
    "gce-image",
    "gce-static-ip",
    "gce-network",
    "gce-http-health-check",
    "gce-target-pool",
    "gce-forwarding-rule",
    "gse-bucket",
];

/// What a registry lookup was resolving.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupKind {
    /// A definition from the deployment specification.
    Definition,
    /// A state row from the persistence layer.
    State,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Definition => "definition",
            Self::State => "state",
        })
    }
}

/// Errors raised by registry lookups.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RegistryError {
    /// Raised when no backend or resource type is registered for the tag.
    #[error("unknown backend or resource type '{tag}' (while creating a {kind})")]
    UnknownBackendType {
        /// The unrecognised tag.
        tag: String,
        /// What was being created.
        kind: LookupKind,
    },
    /// Raised when the backend rejects the definition's attributes.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// A parsed definition.
#[derive(Debug)]
pub enum DefinitionRecord {
    /// A machine of some backend.
    Machine(Box<dyn Definition>),
    /// Any other resource.
    Resource(ResourceDefinition),
}

impl DefinitionRecord {
    /// The `targetEnv` or `type` tag the record was created for.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Machine(defn) => defn.target_env(),
            Self::Resource(defn) => &defn.resource_type,
        }
    }
}

/// Identity of a non-machine resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceRecord {
    /// Type tag.
    pub resource_type: String,
    /// Resource identity.
    pub id: ResourceId,
}

/// A state object created for a stored row.
pub enum ResourceState {
    /// A machine of some backend.
    Machine(Box<dyn Machine>),
    /// Any other resource.
    Resource(ResourceRecord),
}

impl fmt::Debug for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Machine(machine) => f
                .debug_tuple("Machine")
                .field(&machine.kind())
                .field(machine.state().id())
                .finish(),
            Self::Resource(record) => f.debug_tuple("Resource").field(record).finish(),
        }
    }
}

impl ResourceState {
    /// The machine, when the state is one.
    #[must_use]
    pub fn as_machine(&self) -> Option<&dyn Machine> {
        match self {
            Self::Machine(machine) => Some(machine.as_ref()),
            Self::Resource(_) => None,
        }
    }

    /// Consumes the state, yielding the machine when it is one.
    #[must_use]
    pub fn into_machine(self) -> Option<Box<dyn Machine>> {
        match self {
            Self::Machine(machine) => Some(machine),
            Self::Resource(_) => None,
        }
    }
}

#[derive(Clone, Copy)]
struct MachineBackend {
    definition: DefinitionFactory,
    machine: MachineFactory,
}

/// Factories keyed by tag.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    machines: BTreeMap<String, MachineBackend>,
    resources: BTreeSet<String>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .field("resources", &self.resources)
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every backend and resource type this crate ships.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_machine(none::TARGET_ENV, none::definition, none::machine);
        registry.register_machine(ec2::TARGET_ENV, ec2::definition, ec2::machine);
        registry.register_machine(gce::TARGET_ENV, gce::definition, gce::machine);
        registry.register_machine(hetzner::TARGET_ENV, hetzner::definition, hetzner::machine);
        registry.register_machine(
            container::TARGET_ENV,
            container::definition,
            container::machine,
        );
        registry.register_machine(
            local_vm::VmKind::Libvirtd.tag(),
            local_vm::libvirtd_definition,
            local_vm::libvirtd_machine,
        );
        registry.register_machine(
            local_vm::VmKind::Virtualbox.tag(),
            local_vm::virtualbox_definition,
            local_vm::virtualbox_machine,
        );
        for tag in BUILTIN_RESOURCE_TYPES {
            registry.register_resource(tag);
        }
        registry
    }

    /// Registers a machine backend, replacing any previous one with the tag.
    pub fn register_machine(
        &mut self,
        tag: &str,
        definition: DefinitionFactory,
        machine: MachineFactory,
    ) {
        self.machines
            .insert(tag.to_owned(), MachineBackend { definition, machine });
    }

    /// Registers a non-machine resource type.
    pub fn register_resource(&mut self, tag: &str) {
        self.resources.insert(tag.to_owned());
    }

    /// Registered machine tags, sorted.
    pub fn machine_tags(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    /// Registered resource tags, sorted.
    pub fn resource_tags(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(String::as_str)
    }

    /// Builds the definition variant for `raw`.
    ///
    /// A `type` attribute marks a non-machine resource; otherwise `targetEnv`
    /// selects the machine backend.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBackendType`] for unregistered tags and
    /// [`RegistryError::Definition`] when `targetEnv` is absent or the backend
    /// rejects the attributes.
    pub fn create_definition(&self, raw: &RawDefinition) -> Result<DefinitionRecord, RegistryError> {
        if let Some(tag) = raw.resource_type() {
            if !self.resources.contains(tag) {
                return Err(unknown(tag, LookupKind::Definition));
            }
            return Ok(DefinitionRecord::Resource(ResourceDefinition {
                resource_type: tag.to_owned(),
                raw: raw.clone(),
            }));
        }

        let tag = raw.require_str(TARGET_ENV)?;
        let backend = self
            .machines
            .get(tag)
            .ok_or_else(|| unknown(tag, LookupKind::Definition))?;
        debug!(name = %raw.name, backend = tag, "creating definition");
        Ok(DefinitionRecord::Machine((backend.definition)(raw)?))
    }

    /// Builds the state variant for a stored row of type `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBackendType`] for unregistered tags.
    pub fn create_state(
        &self,
        tag: &str,
        id: ResourceId,
        context: MachineContext,
    ) -> Result<ResourceState, RegistryError> {
        if let Some(backend) = self.machines.get(tag) {
            debug!(resource = %id, backend = tag, "creating machine state");
            return Ok(ResourceState::Machine((backend.machine)(id, context)));
        }
        if self.resources.contains(tag) {
            return Ok(ResourceState::Resource(ResourceRecord {
                resource_type: tag.to_owned(),
                id,
            }));
        }
        Err(unknown(tag, LookupKind::State))
    }
}

fn unknown(tag: &str, kind: LookupKind) -> RegistryError {
    RegistryError::UnknownBackendType {
        tag: tag.to_owned(),
        kind,
    }
}

static BUILTIN: LazyLock<BackendRegistry> = LazyLock::new(BackendRegistry::builtin);

/// [`BackendRegistry::create_definition`] on the builtin registry.
///
/// # Errors
///
/// See [`BackendRegistry::create_definition`].
pub fn create_definition(raw: &RawDefinition) -> Result<DefinitionRecord, RegistryError> {
    BUILTIN.create_definition(raw)
}

/// [`BackendRegistry::create_state`] on the builtin registry.
///
/// # Errors
///
/// See [`BackendRegistry::create_state`].
pub fn create_state(
    tag: &str,
    id: ResourceId,
    context: MachineContext,
) -> Result<ResourceState, RegistryError> {
    BUILTIN.create_state(tag, id, context)
}
