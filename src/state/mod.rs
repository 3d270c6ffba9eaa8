//! Persisted machine state.
//!
//! A [`MachineState`] mirrors one resource row in the deployment store. Every
//! setter records the attribute it touched; [`MachineState::save`] writes
//! exactly those attributes, so the store never receives a write for a value
//! that did not change.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::KeySpec;

mod store;

pub use store::{AttributeStore, JsonFileStore, MemoryStore, StateError};

/// Attribute names as they appear in the deployment store.
pub mod attr {
    /// Provider identifier of the machine.
    pub const VM_ID: &str = "vmId";
    /// Lifecycle state.
    pub const STATE: &str = "state";
    /// Whether SSH has ever answered.
    pub const SSH_PINGED: &str = "sshPinged";
    /// SSH port.
    pub const SSH_PORT: &str = "targetPort";
    /// Public half of the machine's VPN key.
    pub const PUBLIC_VPN_KEY: &str = "publicVpnKey";
    /// Whether secrets live on disk instead of `/run/keys`.
    pub const STORE_KEYS_ON_MACHINE: &str = "storeKeysOnMachine";
    /// Runtime secrets.
    pub const KEYS: &str = "keys";
    /// Owner e-mail addresses.
    pub const OWNERS: &str = "owners";
    /// Path of the deployed configuration sources.
    pub const CONFIGS_PATH: &str = "configsPath";
    /// Store path of the activated system closure.
    pub const TOPLEVEL: &str = "toplevel";
    /// Public IPv4 address, set by backends that have one.
    pub const PUBLIC_IPV4: &str = "publicIpv4";
    /// Private IPv4 address, set by backends that have one.
    pub const PRIVATE_IPV4: &str = "privateIpv4";
}

/// Identity of a resource in the deployment store.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ResourceId {
    /// Logical name from the deployment specification.
    pub name: String,
    /// Store row identifier.
    pub id: u64,
}

impl ResourceId {
    /// Creates an identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.id)
    }
}

/// Lifecycle of a machine as far as the orchestrator knows it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not created yet, or destroyed.
    #[default]
    Missing,
    /// Booting or rebooting.
    Starting,
    /// Running and answering SSH.
    Up,
    /// Was up but stopped answering health checks.
    Unreachable,
    /// Powered off.
    Stopped,
    /// Booted into a rescue system.
    Rescue,
}

impl LifecycleState {
    /// Returns `true` for states in which the machine is expected to boot or
    /// be running.
    #[must_use]
    pub const fn started(self) -> bool {
        matches!(self, Self::Starting | Self::Up)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Missing => "missing",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Unreachable => "unreachable",
            Self::Stopped => "stopped",
            Self::Rescue => "rescue",
        })
    }
}

/// Persisted attributes shared by every machine backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineState {
    id: ResourceId,
    vm_id: Option<String>,
    state: LifecycleState,
    ssh_pinged: bool,
    ssh_port: u16,
    public_vpn_key: Option<String>,
    store_keys_on_machine: bool,
    keys: BTreeMap<String, KeySpec>,
    owners: Vec<String>,
    configs_path: Option<String>,
    toplevel: Option<String>,
    extra: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
}

impl MachineState {
    /// Creates a state with every attribute at its default and nothing dirty.
    #[must_use]
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            vm_id: None,
            state: LifecycleState::Missing,
            ssh_pinged: false,
            ssh_port: 22,
            public_vpn_key: None,
            store_keys_on_machine: true,
            keys: BTreeMap::new(),
            owners: Vec::new(),
            configs_path: None,
            toplevel: None,
            extra: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds a state from the store, applying defaults for attributes that
    /// are absent or null.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the store cannot be read or an attribute
    /// has the wrong JSON shape.
    pub fn load(store: &dyn AttributeStore, id: ResourceId) -> Result<Self, StateError> {
        let attributes = store.attributes(&id)?;
        let mut state = Self::new(id);
        for (name, value) in attributes {
            if value.is_null() {
                continue;
            }
            state.apply(&name, value)?;
        }
        Ok(state)
    }

    /// Writes every changed attribute and clears the change set.
    ///
    /// On error the change set is kept so a later save retries the writes.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when encoding or the store write fails.
    pub fn save(&mut self, store: &dyn AttributeStore) -> Result<(), StateError> {
        for name in &self.dirty {
            store.set(&self.id, name, self.attribute(name)?)?;
        }
        self.dirty.clear();
        Ok(())
    }

    /// Attributes changed since the last load or save.
    #[must_use]
    pub const fn changed_attributes(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Store identity.
    #[must_use]
    pub const fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Logical machine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Provider identifier.
    #[must_use]
    pub fn vm_id(&self) -> Option<&str> {
        self.vm_id.as_deref()
    }

    /// Sets the provider identifier.
    pub fn set_vm_id(&mut self, value: Option<String>) {
        update(&mut self.vm_id, value, &mut self.dirty, attr::VM_ID);
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sets the lifecycle state.
    pub fn set_state(&mut self, value: LifecycleState) {
        update(&mut self.state, value, &mut self.dirty, attr::STATE);
    }

    /// Whether SSH has ever answered.
    #[must_use]
    pub const fn ssh_pinged(&self) -> bool {
        self.ssh_pinged
    }

    /// Records whether SSH has answered.
    pub fn set_ssh_pinged(&mut self, value: bool) {
        update(&mut self.ssh_pinged, value, &mut self.dirty, attr::SSH_PINGED);
    }

    /// SSH port.
    #[must_use]
    pub const fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// Sets the SSH port.
    pub fn set_ssh_port(&mut self, value: u16) {
        update(&mut self.ssh_port, value, &mut self.dirty, attr::SSH_PORT);
    }

    /// Public half of the VPN key.
    #[must_use]
    pub fn public_vpn_key(&self) -> Option<&str> {
        self.public_vpn_key.as_deref()
    }

    /// Sets the public VPN key.
    pub fn set_public_vpn_key(&mut self, value: Option<String>) {
        update(
            &mut self.public_vpn_key,
            value,
            &mut self.dirty,
            attr::PUBLIC_VPN_KEY,
        );
    }

    /// Whether secrets are stored on disk by the deployed configuration.
    #[must_use]
    pub const fn store_keys_on_machine(&self) -> bool {
        self.store_keys_on_machine
    }

    /// Sets the secret storage policy.
    pub fn set_store_keys_on_machine(&mut self, value: bool) {
        update(
            &mut self.store_keys_on_machine,
            value,
            &mut self.dirty,
            attr::STORE_KEYS_ON_MACHINE,
        );
    }

    /// Runtime secrets keyed by name.
    #[must_use]
    pub const fn keys(&self) -> &BTreeMap<String, KeySpec> {
        &self.keys
    }

    /// Replaces the runtime secrets.
    pub fn set_keys(&mut self, value: BTreeMap<String, KeySpec>) {
        update(&mut self.keys, value, &mut self.dirty, attr::KEYS);
    }

    /// Owner e-mail addresses.
    #[must_use]
    pub fn owners(&self) -> &[String] {
        &self.owners
    }

    /// Replaces the owners.
    pub fn set_owners(&mut self, value: Vec<String>) {
        update(&mut self.owners, value, &mut self.dirty, attr::OWNERS);
    }

    /// Path of the deployed configuration sources.
    #[must_use]
    pub fn configs_path(&self) -> Option<&str> {
        self.configs_path.as_deref()
    }

    /// Sets the configuration sources path.
    pub fn set_configs_path(&mut self, value: Option<String>) {
        update(
            &mut self.configs_path,
            value,
            &mut self.dirty,
            attr::CONFIGS_PATH,
        );
    }

    /// Store path of the activated system.
    #[must_use]
    pub fn toplevel(&self) -> Option<&str> {
        self.toplevel.as_deref()
    }

    /// Sets the activated system path.
    pub fn set_toplevel(&mut self, value: Option<String>) {
        update(&mut self.toplevel, value, &mut self.dirty, attr::TOPLEVEL);
    }

    /// Backend specific attribute.
    #[must_use]
    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Backend specific attribute as a string.
    #[must_use]
    pub fn extra_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    /// Backend specific attribute as a boolean, `false` when absent.
    #[must_use]
    pub fn extra_flag(&self, name: &str) -> bool {
        self.extra
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sets a backend specific attribute; `Value::Null` clears it.
    pub fn set_extra(&mut self, name: &str, value: Value) {
        let current = self.extra.get(name).unwrap_or(&Value::Null);
        if *current == value {
            return;
        }
        if value.is_null() {
            self.extra.remove(name);
        } else {
            self.extra.insert(name.to_owned(), value);
        }
        self.dirty.insert(name.to_owned());
    }

    fn attribute(&self, name: &str) -> Result<Value, StateError> {
        Ok(match name {
            attr::VM_ID => encode(name, &self.vm_id)?,
            attr::STATE => encode(name, &self.state)?,
            attr::SSH_PINGED => Value::Bool(self.ssh_pinged),
            attr::SSH_PORT => Value::from(self.ssh_port),
            attr::PUBLIC_VPN_KEY => encode(name, &self.public_vpn_key)?,
            attr::STORE_KEYS_ON_MACHINE => Value::Bool(self.store_keys_on_machine),
            attr::KEYS => encode(name, &self.keys)?,
            attr::OWNERS => encode(name, &self.owners)?,
            attr::CONFIGS_PATH => encode(name, &self.configs_path)?,
            attr::TOPLEVEL => encode(name, &self.toplevel)?,
            _ => self.extra.get(name).cloned().unwrap_or(Value::Null),
        })
    }

    fn apply(&mut self, name: &str, value: Value) -> Result<(), StateError> {
        match name {
            attr::VM_ID => self.vm_id = Some(decode(name, value)?),
            attr::STATE => self.state = decode(name, value)?,
            attr::SSH_PINGED => self.ssh_pinged = decode(name, value)?,
            attr::SSH_PORT => self.ssh_port = decode(name, value)?,
            attr::PUBLIC_VPN_KEY => self.public_vpn_key = Some(decode(name, value)?),
            attr::STORE_KEYS_ON_MACHINE => self.store_keys_on_machine = decode(name, value)?,
            attr::KEYS => self.keys = decode(name, value)?,
            attr::OWNERS => self.owners = decode(name, value)?,
            attr::CONFIGS_PATH => self.configs_path = Some(decode(name, value)?),
            attr::TOPLEVEL => self.toplevel = Some(decode(name, value)?),
            _ => {
                self.extra.insert(name.to_owned(), value);
            }
        }
        Ok(())
    }
}

fn update<T: PartialEq>(slot: &mut T, value: T, dirty: &mut BTreeSet<String>, name: &str) {
    if *slot != value {
        *slot = value;
        dirty.insert(name.to_owned());
    }
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<Value, StateError> {
    serde_json::to_value(value).map_err(|err| StateError::Encode {
        attribute: name.to_owned(),
        message: err.to_string(),
    })
}

fn decode<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, StateError> {
    serde_json::from_value(value).map_err(|err| StateError::Decode {
        attribute: name.to_owned(),
        message: err.to_string(),
    })
}
