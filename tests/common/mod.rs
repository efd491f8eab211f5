//! In-memory key server and relay shared by the client tests.

#![allow(dead_code, unreachable_pub)]

use async_trait::async_trait;
use serde_json::{json, Value};
use signal_session::transport::{
    AccountAttributes, DeviceKeys, KeyBundleResponse, KeyExchangeTransport, KeysUpload,
    MessageRelayTransport, OutgoingMessages, PreKeyEntity, SendResponse, SignedPreKeyEntity,
    TransportError,
};
use signal_session::{ClientConfig, ProtocolAddress, SignalClient};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct PublishedKeys {
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyEntity,
    pub pre_keys: VecDeque<PreKeyEntity>,
    pub last_resort_key: Option<PreKeyEntity>,
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub accounts: HashMap<String, AccountAttributes>,
    pub keys: HashMap<String, PublishedKeys>,
    /// Pending envelopes per recipient
    pub pending: HashMap<String, Vec<Value>>,
    /// `(sender, destination, batch)` of every PUT
    pub puts: Vec<(String, String, OutgoingMessages)>,
    pub bundle_fetches: Vec<String>,
    /// Number of upcoming PUTs answered with stale devices
    pub stale_responses: u32,
    pub fail_deletes: bool,
    clock: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FakeServer(Arc<Mutex<ServerState>>);

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.0.lock().unwrap()
    }

    pub fn connect(&self, user: &str) -> Arc<Connection> {
        Arc::new(Connection {
            user: user.to_owned(),
            server: self.clone(),
        })
    }

    pub fn client(&self, user: &str) -> SignalClient {
        self.client_with(ClientConfig::new(user))
    }

    pub fn client_at(&self, user: &str, dir: &Path) -> SignalClient {
        let mut config = ClientConfig::new(user);
        config.data_dir = Some(dir.to_path_buf());
        self.client_with(config)
    }

    pub fn client_with(&self, config: ClientConfig) -> SignalClient {
        let connection = self.connect(&config.username);
        SignalClient::open(config, connection.clone(), connection).unwrap()
    }

    pub fn pending_for(&self, user: &str) -> Vec<Value> {
        self.state().pending.get(user).cloned().unwrap_or_default()
    }

    /// Queues a raw envelope for `recipient`.
    pub fn deliver(&self, recipient: &str, envelope: Value) {
        self.state()
            .pending
            .entry(recipient.to_owned())
            .or_default()
            .push(envelope);
    }

    /// Drops the first `count` one-time pre-keys `user` published.
    pub fn discard_pre_keys(&self, user: &str, count: usize) {
        let mut state = self.state();
        let keys = state.keys.get_mut(user).unwrap();
        for _ in 0..count {
            keys.pre_keys.pop_front();
        }
    }

    pub fn pre_key_ids(&self, user: &str) -> Vec<u32> {
        self.state().keys[user]
            .pre_keys
            .iter()
            .map(|entity| entity.key_id)
            .collect()
    }
}

/// One user's view of the server.
#[derive(Debug)]
pub struct Connection {
    user: String,
    server: FakeServer,
}

#[async_trait]
impl KeyExchangeTransport for Connection {
    async fn fetch_bundle(
        &self,
        address: &ProtocolAddress,
    ) -> Result<KeyBundleResponse, TransportError> {
        let mut state = self.server.state();
        state.bundle_fetches.push(address.name().to_owned());
        let keys = state
            .keys
            .get_mut(address.name())
            .ok_or(TransportError::NotFound)?;

        let pre_key = keys
            .pre_keys
            .pop_front()
            .or_else(|| keys.last_resort_key.clone());
        Ok(KeyBundleResponse {
            identity_key: Some(keys.identity_key.clone()),
            devices: vec![DeviceKeys {
                device_id: Some(address.device_id()),
                registration_id: Some(keys.registration_id),
                pre_key,
                signed_pre_key: Some(keys.signed_pre_key.clone()),
            }],
        })
    }

    async fn publish_account_attributes(
        &self,
        attributes: &AccountAttributes,
    ) -> Result<(), TransportError> {
        let mut state = self.server.state();
        if let Some(keys) = state.keys.get_mut(&self.user) {
            keys.registration_id = attributes.registration_id;
        }
        state.accounts.insert(self.user.clone(), attributes.clone());
        Ok(())
    }

    async fn publish_keys(&self, upload: &KeysUpload) -> Result<(), TransportError> {
        let mut state = self.server.state();
        let registration_id = state
            .accounts
            .get(&self.user)
            .map_or(0, |account| account.registration_id);

        let keys = state
            .keys
            .entry(self.user.clone())
            .or_insert_with(|| PublishedKeys {
                registration_id,
                identity_key: upload.identity_key.clone(),
                signed_pre_key: upload.signed_pre_key.clone(),
                pre_keys: VecDeque::new(),
                last_resort_key: None,
            });
        if keys.identity_key != upload.identity_key {
            keys.pre_keys.clear();
        }
        keys.registration_id = registration_id;
        keys.identity_key = upload.identity_key.clone();
        keys.signed_pre_key = upload.signed_pre_key.clone();
        keys.pre_keys.extend(upload.pre_keys.iter().cloned());
        keys.last_resort_key = upload.last_resort_key.clone();
        Ok(())
    }

    async fn pre_key_count(&self) -> Result<u32, TransportError> {
        let state = self.server.state();
        let count = state
            .keys
            .get(&self.user)
            .map_or(0, |keys| keys.pre_keys.len());
        Ok(u32::try_from(count).unwrap())
    }
}

#[async_trait]
impl MessageRelayTransport for Connection {
    async fn fetch_pending(&self) -> Result<Vec<Value>, TransportError> {
        Ok(self.server.pending_for(&self.user))
    }

    async fn delete_message(&self, source: &str, timestamp: u64) -> Result<(), TransportError> {
        let mut state = self.server.state();
        if state.fail_deletes {
            return Err(TransportError::Network("connection reset".into()));
        }
        if let Some(pending) = state.pending.get_mut(&self.user) {
            pending.retain(|envelope| {
                envelope["source"] != source || envelope["timestamp"] != timestamp
            });
        }
        Ok(())
    }

    async fn put_messages(
        &self,
        destination: &str,
        messages: &OutgoingMessages,
    ) -> Result<SendResponse, TransportError> {
        let mut state = self.server.state();
        state
            .puts
            .push((self.user.clone(), destination.to_owned(), messages.clone()));

        if state.stale_responses > 0 {
            state.stale_responses -= 1;
            return Ok(SendResponse {
                stale_devices: Some(vec![1]),
            });
        }

        for message in &messages.messages {
            state.clock += 1;
            let envelope = json!({
                "type": message.kind,
                "source": self.user,
                "sourceDevice": 1,
                "timestamp": state.clock,
                "relay": "",
                "message": message.body,
                "tag": message.tag,
            });
            state
                .pending
                .entry(destination.to_owned())
                .or_default()
                .push(envelope);
        }
        Ok(SendResponse::default())
    }
}
