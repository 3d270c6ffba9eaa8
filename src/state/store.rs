//! Attribute stores backing [`super::MachineState`].

use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::Value;
use thiserror::Error;

use super::ResourceId;

/// Errors raised while reading or writing persisted attributes.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// Filesystem access failed.
    #[error("state store i/o failed for {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// A stored resource row is not a JSON object.
    #[error("state file {path} is corrupt: {message}")]
    Corrupt {
        /// Offending file.
        path: Utf8PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// A stored attribute has an unexpected JSON shape.
    #[error("failed to decode attribute '{attribute}': {message}")]
    Decode {
        /// Attribute name.
        attribute: String,
        /// Deserializer diagnostic.
        message: String,
    },
    /// An attribute value could not be rendered as JSON.
    #[error("failed to encode attribute '{attribute}': {message}")]
    Encode {
        /// Attribute name.
        attribute: String,
        /// Serializer diagnostic.
        message: String,
    },
}

/// Durable per-resource attribute rows.
pub trait AttributeStore: Send + Sync {
    /// Reads one attribute.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the backing storage cannot be read.
    fn get(&self, id: &ResourceId, name: &str) -> Result<Option<Value>, StateError>;

    /// Writes one attribute.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the backing storage cannot be written.
    fn set(&self, id: &ResourceId, name: &str, value: Value) -> Result<(), StateError>;

    /// Reads every attribute of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the backing storage cannot be read.
    fn attributes(&self, id: &ResourceId) -> Result<BTreeMap<String, Value>, StateError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    rows: BTreeMap<ResourceId, BTreeMap<String, Value>>,
    changes: Vec<(ResourceId, String)>,
}

/// In-memory store that also records every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(resource, attribute)` write in order.
    #[must_use]
    pub fn changes(&self) -> Vec<(ResourceId, String)> {
        self.lock().changes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttributeStore for MemoryStore {
    fn get(&self, id: &ResourceId, name: &str) -> Result<Option<Value>, StateError> {
        Ok(self
            .lock()
            .rows
            .get(id)
            .and_then(|row| row.get(name))
            .cloned())
    }

    fn set(&self, id: &ResourceId, name: &str, value: Value) -> Result<(), StateError> {
        let mut inner = self.lock();
        inner
            .rows
            .entry(id.clone())
            .or_default()
            .insert(name.to_owned(), value);
        inner.changes.push((id.clone(), name.to_owned()));
        Ok(())
    }

    fn attributes(&self, id: &ResourceId) -> Result<BTreeMap<String, Value>, StateError> {
        Ok(self.lock().rows.get(id).cloned().unwrap_or_default())
    }
}

/// Stores each resource as a pretty-printed JSON object in `<id>.<name>.json`.
#[derive(Debug)]
pub struct JsonFileStore {
    root: Utf8PathBuf,
    dir: Dir,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: &Utf8Path) -> Result<Self, StateError> {
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(|err| io_error(root, &err))?;
        let dir =
            Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| io_error(root, &err))?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the resource files.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn file_name(id: &ResourceId) -> String {
        format!("{}.{}.json", id.id, id.name)
    }

    fn read_row(&self, id: &ResourceId) -> Result<BTreeMap<String, Value>, StateError> {
        let file_name = Self::file_name(id);
        let path = self.root.join(&file_name);
        let contents = match self.dir.read_to_string(&file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(io_error(&path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|err| StateError::Corrupt {
            path,
            message: err.to_string(),
        })
    }
}

impl AttributeStore for JsonFileStore {
    fn get(&self, id: &ResourceId, name: &str) -> Result<Option<Value>, StateError> {
        Ok(self.read_row(id)?.remove(name))
    }

    fn set(&self, id: &ResourceId, name: &str, value: Value) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut row = self.read_row(id)?;
        row.insert(name.to_owned(), value);

        let file_name = Self::file_name(id);
        let rendered = serde_json::to_string_pretty(&row).map_err(|err| StateError::Encode {
            attribute: name.to_owned(),
            message: err.to_string(),
        })?;
        self.dir
            .write(&file_name, rendered)
            .map_err(|err| io_error(&self.root.join(&file_name), &err))
    }

    fn attributes(&self, id: &ResourceId) -> Result<BTreeMap<String, Value>, StateError> {
        self.read_row(id)
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
