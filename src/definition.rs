//! Resource definitions handed over by the deployment parser.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Attribute carrying a machine's backend tag.
pub const TARGET_ENV: &str = "targetEnv";
/// Attribute carrying a non-machine resource's type tag.
pub const RESOURCE_TYPE: &str = "type";

/// Errors raised while interpreting a raw definition.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DefinitionError {
    /// A required attribute is absent or null.
    #[error("definition '{name}' is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Resource name.
        name: String,
        /// Attribute that was expected.
        attribute: String,
    },
    /// An attribute has the wrong shape.
    #[error("definition '{name}' has invalid attribute '{attribute}': {message}")]
    InvalidAttribute {
        /// Resource name.
        name: String,
        /// Offending attribute.
        attribute: String,
        /// Deserializer diagnostic.
        message: String,
    },
}

/// A runtime secret to place on the machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Secret contents.
    pub text: String,
    /// Owning user of the key file.
    #[serde(default = "default_root")]
    pub user: String,
    /// Owning group of the key file.
    #[serde(default = "default_root")]
    pub group: String,
    /// Octal permission string applied with `chmod`.
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

impl KeySpec {
    /// Creates a key owned by `root:root` with mode `0600`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user: default_root(),
            group: default_root(),
            permissions: default_permissions(),
        }
    }
}

fn default_root() -> String {
    String::from("root")
}

fn default_permissions() -> String {
    String::from("0600")
}

/// A resource definition as produced by the deployment parser: a name plus
/// a JSON object of attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDefinition {
    /// Logical resource name.
    pub name: String,
    /// Attributes keyed by their deployment-language names.
    pub attrs: Map<String, Value>,
}

impl RawDefinition {
    /// Creates a definition from a JSON value; non-object values yield no
    /// attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, attrs: Value) -> Self {
        Self {
            name: name.into(),
            attrs: match attrs {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Backend tag of a machine definition.
    #[must_use]
    pub fn target_env(&self) -> Option<&str> {
        self.attr_str(TARGET_ENV)
    }

    /// Type tag of a non-machine resource definition.
    #[must_use]
    pub fn resource_type(&self) -> Option<&str> {
        self.attr_str(RESOURCE_TYPE)
    }

    /// String attribute, if present.
    #[must_use]
    pub fn attr_str(&self, attribute: &str) -> Option<&str> {
        self.attrs.get(attribute).and_then(Value::as_str)
    }

    /// String attribute that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::MissingAttribute`] when absent or not a
    /// string.
    pub fn require_str(&self, attribute: &str) -> Result<&str, DefinitionError> {
        self.attr_str(attribute)
            .ok_or_else(|| DefinitionError::MissingAttribute {
                name: self.name.clone(),
                attribute: attribute.to_owned(),
            })
    }

    /// Typed attribute; `None` when absent or null.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::InvalidAttribute`] when the value cannot be
    /// deserialized as `T`.
    pub fn attr<T: DeserializeOwned>(&self, attribute: &str) -> Result<Option<T>, DefinitionError> {
        match self.attrs.get(attribute) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| DefinitionError::InvalidAttribute {
                    name: self.name.clone(),
                    attribute: attribute.to_owned(),
                    message: err.to_string(),
                }),
        }
    }
}

/// Attributes every machine definition carries, whatever the backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineDefinition {
    /// Logical machine name.
    pub name: String,
    /// Runtime secrets keyed by name.
    pub keys: BTreeMap<String, KeySpec>,
    /// Whether the deployed configuration keeps secrets on disk itself.
    pub store_keys_on_machine: bool,
    /// SSH port.
    pub ssh_port: u16,
    /// Whether to activate the configuration even when unchanged.
    pub always_activate: bool,
    /// Machines this one keeps encrypted tunnels to.
    pub encrypted_links_to: BTreeSet<String>,
    /// Owner e-mail addresses.
    pub owners: Vec<String>,
}

impl MachineDefinition {
    /// Extracts the common attributes, applying defaults for absent ones.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::InvalidAttribute`] when an attribute has
    /// the wrong shape.
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: raw.name.clone(),
            keys: raw.attr("keys")?.unwrap_or_default(),
            store_keys_on_machine: raw.attr("storeKeysOnMachine")?.unwrap_or(true),
            ssh_port: raw.attr("targetPort")?.unwrap_or(22),
            always_activate: raw.attr("alwaysActivate")?.unwrap_or(true),
            encrypted_links_to: raw.attr("encryptedLinksTo")?.unwrap_or_default(),
            owners: raw.attr("owners")?.unwrap_or_default(),
        })
    }
}

/// A backend's view of a machine definition.
pub trait Definition: fmt::Debug + Send + Sync {
    /// Backend tag, as used in `targetEnv`.
    fn target_env(&self) -> &'static str;

    /// Common machine attributes.
    fn machine(&self) -> &MachineDefinition;

    /// Enables downcasting to the backend's concrete definition.
    fn as_any(&self) -> &dyn Any;
}

/// Definition of a non-machine resource (key pairs, volumes, buckets, ...).
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDefinition {
    /// Type tag.
    pub resource_type: String,
    /// The parsed attributes, kept verbatim.
    pub raw: RawDefinition,
}
