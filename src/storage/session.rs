use super::{KeyValueStore, Namespace, SESSIONS_NAMESPACE};
use crate::address::{ProtocolAddress, DEFAULT_DEVICE_ID};
use crate::state::SessionRecord;
use std::sync::Arc;
use tracing::warn;

/// Session records keyed by `name.device`.
#[derive(Debug)]
pub struct SessionStore {
    namespace: Namespace,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            namespace: Namespace::new(backend, SESSIONS_NAMESPACE),
        }
    }

    pub fn load(&self, address: &ProtocolAddress) -> Option<SessionRecord> {
        let bytes = self.namespace.get(&address.to_string())?;
        SessionRecord::from_bytes(&bytes)
            .map_err(|err| warn!(%address, error = %err, "stored session is invalid"))
            .ok()
    }

    pub fn store(&self, address: &ProtocolAddress, record: &SessionRecord) -> bool {
        match record.to_bytes() {
            Ok(bytes) => self.namespace.put(&address.to_string(), bytes),
            Err(err) => {
                warn!(%address, error = %err, "session could not be encoded");
                false
            }
        }
    }

    /// Whether an established session exists for `address`.
    #[must_use]
    pub fn contains(&self, address: &ProtocolAddress) -> bool {
        self.load(address)
            .is_some_and(|record| record.session_state().is_some())
    }

    pub fn remove(&self, address: &ProtocolAddress) -> bool {
        self.namespace.remove(&address.to_string())
    }

    /// Removes the sessions of every device of `name`, returning how many.
    pub fn remove_all(&self, name: &str) -> usize {
        self.namespace
            .update(|entries| {
                let before = entries.len();
                entries.retain(|key, _| {
                    ProtocolAddress::parse(key).map_or(true, |address| address.name() != name)
                });
                before - entries.len()
            })
            .unwrap_or(0)
    }

    /// Device ids other than the primary one that hold a session with `name`.
    #[must_use]
    pub fn sub_device_sessions(&self, name: &str) -> Vec<u32> {
        let mut devices: Vec<u32> = self
            .namespace
            .entries()
            .keys()
            .filter_map(|key| ProtocolAddress::parse(key))
            .filter(|address| address.name() == name && address.device_id() != DEFAULT_DEVICE_ID)
            .map(|address| address.device_id())
            .collect();
        devices.sort_unstable();
        devices
    }

    pub(crate) fn clear(&self) -> bool {
        self.namespace.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKeyValueStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryKeyValueStore::new()))
    }

    #[test]
    fn test_empty_record_is_not_a_session() {
        let store = store();
        let bob = ProtocolAddress::primary("bob");

        assert!(store.store(&bob, &SessionRecord::default()));
        assert!(store.load(&bob).is_some());
        assert!(!store.contains(&bob));
    }

    #[test]
    fn test_device_listing_and_bulk_removal() {
        let store = store();
        for address in [
            ProtocolAddress::new("bob", 1),
            ProtocolAddress::new("bob", 3),
            ProtocolAddress::new("bob", 2),
            ProtocolAddress::new("bobby", 2),
        ] {
            store.store(&address, &SessionRecord::default());
        }

        assert_eq!(store.sub_device_sessions("bob"), vec![2, 3]);
        assert_eq!(store.remove_all("bob"), 3);
        assert!(store.load(&ProtocolAddress::new("bob", 1)).is_none());
        assert!(store.load(&ProtocolAddress::new("bobby", 2)).is_some());
    }
}
