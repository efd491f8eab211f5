use super::{Entries, KeyValueStore};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tempfile::NamedTempFile;

/// One `<namespace>.json` file per namespace holding `{key: base64(value)}`.
///
/// Saves write a temporary file in the same directory, fsync it and rename
/// it over the old file, so a crash leaves either the old or the new map.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| Error::Storage(err.to_string()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, namespace: &str) -> Result<PathBuf> {
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
        if !valid {
            return Err(Error::Storage(format!("invalid namespace {namespace:?}")));
        }
        Ok(self.root.join(format!("{namespace}.json")))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn load_namespace(&self, namespace: &str) -> Result<Entries> {
        let raw = match fs::read(self.path(namespace)?) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
            Err(err) => return Err(Error::Storage(err.to_string())),
        };

        let encoded: BTreeMap<String, String> = serde_json::from_slice(&raw)
            .map_err(|err| Error::Storage(format!("{namespace}: {err}")))?;
        encoded
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value)
                    .map(|bytes| (key, bytes))
                    .map_err(|err| Error::Storage(format!("{namespace}: {err}")))
            })
            .collect()
    }

    fn save(&self, namespace: &str, entries: &Entries) -> Result<()> {
        let path = self.path(namespace)?;
        let encoded: BTreeMap<&str, String> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), STANDARD.encode(value)))
            .collect();
        let json = serde_json::to_vec(&encoded).map_err(|_| Error::Serialization)?;

        let storage_err = |err: std::io::Error| Error::Storage(err.to_string());
        let mut file = NamedTempFile::new_in(&self.root).map_err(storage_err)?;
        file.write_all(&json).map_err(storage_err)?;
        file.as_file().sync_all().map_err(storage_err)?;
        file.persist(&path)
            .map_err(|err| Error::Storage(err.error.to_string()))?;
        Ok(())
    }

    fn destroy_namespace(&self, namespace: &str) -> Result<()> {
        match fs::remove_file(self.path(namespace)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Storage(err.to_string())),
        }
    }
}

/// Volatile backend for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    namespaces: RwLock<HashMap<String, Entries>>,
}

impl InMemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn load_namespace(&self, namespace: &str) -> Result<Entries> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }

    fn save(&self, namespace: &str, entries: &Entries) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        namespaces.insert(namespace.to_owned(), entries.clone());
        Ok(())
    }

    fn destroy_namespace(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        namespaces.remove(namespace);
        Ok(())
    }
}
