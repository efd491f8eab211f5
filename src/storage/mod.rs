//! Persistent protocol state.
//!
//! Every store owns one namespace of a [`KeyValueStore`] and rewrites the
//! whole namespace on each mutation. Mutations of one namespace are
//! serialised by a per-namespace lock around load-mutate-save, so readers
//! always see either the old or the new map.
//!
//! Store operations never fail: a read of a malformed value yields `None`
//! and a failed write yields `false`, both logged with `tracing::warn!`.

mod backend;
mod identity;
mod prekey;
mod session;
mod signed_prekey;

pub use backend::{FileKeyValueStore, InMemoryKeyValueStore};
pub use identity::{IdentityKeyStore, RegistrationRecord, TrustPolicy};
pub use prekey::{PreKeyRecord, PreKeyStore, LAST_RESORT_PRE_KEY_ID};
pub use session::SessionStore;
pub use signed_prekey::{SignedPreKeyRecord, SignedPreKeyStore};

use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub const USER_NAMESPACE: &str = "user";
pub const IDENTITIES_NAMESPACE: &str = "identities";
pub const PRE_KEYS_NAMESPACE: &str = "prekeys";
pub const SIGNED_PRE_KEYS_NAMESPACE: &str = "signed_prekeys";
pub const SESSIONS_NAMESPACE: &str = "sessions";

/// Contents of one namespace.
pub type Entries = BTreeMap<String, Vec<u8>>;

/// Generic persistence collaborator: named maps of binary values.
pub trait KeyValueStore: Send + Sync {
    /// Loads a whole namespace. A namespace never written is empty.
    fn load_namespace(&self, namespace: &str) -> Result<Entries>;

    fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.load_namespace(namespace)?.remove(key))
    }

    /// Atomically replaces a namespace.
    fn save(&self, namespace: &str, entries: &Entries) -> Result<()>;

    fn destroy_namespace(&self, namespace: &str) -> Result<()>;
}

/// A namespace plus the lock serialising its mutations.
pub(crate) struct Namespace {
    backend: Arc<dyn KeyValueStore>,
    name: String,
    guard: Mutex<()>,
}

impl Namespace {
    pub(crate) fn new(backend: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            guard: Mutex::new(()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn entries(&self) -> Entries {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.backend
            .load_namespace(&self.name)
            .unwrap_or_else(|err| {
                warn!(namespace = %self.name, error = %err, "unreadable namespace");
                Entries::new()
            })
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.backend
            .load(&self.name, key)
            .unwrap_or_else(|err| {
                warn!(namespace = %self.name, key, error = %err, "unreadable namespace");
                None
            })
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Runs `mutate` over the namespace and persists the result.
    ///
    /// Returns `None` when the namespace could not be read or written; the
    /// stored map is then left as it was.
    pub(crate) fn update<R>(&self, mutate: impl FnOnce(&mut Entries) -> R) -> Option<R> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entries = match self.backend.load_namespace(&self.name) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    namespace = %self.name,
                    error = %err,
                    "refusing to overwrite unreadable namespace"
                );
                return None;
            }
        };
        let result = mutate(&mut entries);

        match self.backend.save(&self.name, &entries) {
            Ok(()) => Some(result),
            Err(err) => {
                warn!(namespace = %self.name, error = %err, "failed to persist namespace");
                None
            }
        }
    }

    pub(crate) fn put(&self, key: &str, value: Vec<u8>) -> bool {
        self.update(|entries| {
            entries.insert(key.to_owned(), value);
        })
        .is_some()
    }

    /// Removes `key`; `true` when it existed and the removal was persisted.
    pub(crate) fn remove(&self, key: &str) -> bool {
        self.update(|entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    pub(crate) fn clear(&self) -> bool {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        match self.backend.destroy_namespace(&self.name) {
            Ok(()) => true,
            Err(err) => {
                warn!(namespace = %self.name, error = %err, "failed to destroy namespace");
                false
            }
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish()
    }
}

/// The four protocol stores over one backend.
#[derive(Debug)]
pub struct ProtocolStore {
    pub identity: IdentityKeyStore,
    pub pre_keys: PreKeyStore,
    pub signed_pre_keys: SignedPreKeyStore,
    pub sessions: SessionStore,
}

impl ProtocolStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, policy: TrustPolicy) -> Self {
        Self {
            identity: IdentityKeyStore::new(Arc::clone(&backend), policy),
            pre_keys: PreKeyStore::new(Arc::clone(&backend)),
            signed_pre_keys: SignedPreKeyStore::new(Arc::clone(&backend)),
            sessions: SessionStore::new(backend),
        }
    }

    /// Wipes every persisted protocol namespace of the local device.
    pub fn destroy(&self) -> bool {
        // no short-circuit: wipe as much as possible
        let identity = self.identity.clear();
        let pre_keys = self.pre_keys.clear();
        let signed = self.signed_pre_keys.clear();
        let sessions = self.sessions.clear();
        identity && pre_keys && signed && sessions
    }
}
