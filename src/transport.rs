//! Collaborator interfaces for the key server and the message relay.
//!
//! The crate never speaks HTTP itself. Callers provide implementations of
//! [`KeyExchangeTransport`] and [`MessageRelayTransport`]; the DTOs here fix
//! the JSON bodies those implementations exchange with the server.

use crate::address::ProtocolAddress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered 404
    #[error("resource not found")]
    NotFound,

    /// Any other non-2xx status
    #[error("server answered with status {0}")]
    Status(u16),

    /// The request never completed
    #[error("network failure: {0}")]
    Network(String),

    /// The response body could not be decoded
    #[error("undecodable response: {0}")]
    Decode(String),
}

/// `GET /v2/keys/{name}/1`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundleResponse {
    #[serde(default)]
    pub identity_key: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceKeys>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default)]
    pub registration_id: Option<u32>,
    #[serde(default)]
    pub pre_key: Option<PreKeyEntity>,
    #[serde(default)]
    pub signed_pre_key: Option<SignedPreKeyEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

/// `PUT /v1/accounts/attributes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAttributes {
    pub signaling_key: String,
    pub fetches_messages: bool,
    pub registration_id: u32,
    pub name: String,
    pub voice: bool,
}

impl AccountAttributes {
    #[must_use]
    pub fn new(name: &str, registration_id: u32, signaling_key: &str) -> Self {
        Self {
            signaling_key: signaling_key.to_owned(),
            fetches_messages: true,
            registration_id,
            name: name.to_owned(),
            voice: false,
        }
    }
}

/// `PUT /v2/keys`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysUpload {
    pub identity_key: String,
    pub pre_keys: Vec<PreKeyEntity>,
    pub signed_pre_key: SignedPreKeyEntity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resort_key: Option<PreKeyEntity>,
}

/// `GET /v2/keys`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyCount {
    pub count: u32,
}

/// One entry of `PUT /v1/messages/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub kind: u32,
    pub destination: String,
    pub content: String,
    pub tag: String,
    pub silent: bool,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    pub body: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessages {
    pub messages: Vec<OutgoingMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    #[serde(default)]
    pub stale_devices: Option<Vec<u32>>,
}

impl SendResponse {
    #[must_use]
    pub fn has_stale_devices(&self) -> bool {
        self.stale_devices
            .as_ref()
            .is_some_and(|devices| !devices.is_empty())
    }
}

/// Key server operations.
#[async_trait]
pub trait KeyExchangeTransport: Send + Sync {
    /// Fetches the published bundle of `address`.
    ///
    /// Implementations map HTTP 404 to [`TransportError::NotFound`].
    async fn fetch_bundle(
        &self,
        address: &ProtocolAddress,
    ) -> Result<KeyBundleResponse, TransportError>;

    async fn publish_account_attributes(
        &self,
        attributes: &AccountAttributes,
    ) -> Result<(), TransportError>;

    async fn publish_keys(&self, keys: &KeysUpload) -> Result<(), TransportError>;

    /// One-time pre-keys the server still holds for us.
    async fn pre_key_count(&self) -> Result<u32, TransportError>;
}

/// Message relay operations.
#[async_trait]
pub trait MessageRelayTransport: Send + Sync {
    /// Raw JSON records waiting on the relay.
    async fn fetch_pending(&self) -> Result<Vec<serde_json::Value>, TransportError>;

    async fn delete_message(&self, source: &str, timestamp: u64) -> Result<(), TransportError>;

    async fn put_messages(
        &self,
        destination: &str,
        messages: &OutgoingMessages,
    ) -> Result<SendResponse, TransportError>;
}
