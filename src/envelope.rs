//! Raw relay records.

use crate::address::{ProtocolAddress, DEFAULT_DEVICE_ID};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Envelope type of encrypted messages.
pub const CIPHERTEXT_TYPE: u32 = 1;

/// Tag of regular chat messages; also assumed for untagged records.
pub const CHAT_TAG: &str = "chat";

/// Tag matching every tag in cleanup operations.
pub const ANY_TAG: &str = "*";

/// One record fetched from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: u32,
    pub source: String,
    pub source_device: u32,
    /// Server timestamp, also the relay's id for the record
    pub timestamp: u64,
    pub relay: String,
    /// Base64 ciphertext
    pub message: String,
    pub tag: Option<String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            kind: 0,
            source: String::new(),
            source_device: DEFAULT_DEVICE_ID,
            timestamp: 0,
            relay: String::new(),
            message: String::new(),
            tag: None,
        }
    }
}

/// Coarse type of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Ciphertext,
    Other(u32),
}

impl Envelope {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| Error::ServerDataInvalid(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| Error::ServerDataInvalid(err.to_string()))
    }

    #[must_use]
    pub fn classify(&self) -> EnvelopeKind {
        match self.kind {
            CIPHERTEXT_TYPE => EnvelopeKind::Ciphertext,
            other => EnvelopeKind::Other(other),
        }
    }

    #[must_use]
    pub fn is_ciphertext(&self) -> bool {
        self.classify() == EnvelopeKind::Ciphertext
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(CHAT_TAG)
    }

    /// Whether the envelope belongs to conversation `tag`; `*` matches all.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        tag == ANY_TAG || self.tag() == tag
    }

    /// Ciphertext from `contact` with a non-empty body.
    ///
    /// Our own sends are echoed back with an empty body and are skipped.
    #[must_use]
    pub fn is_decryptable_for(&self, contact: &str) -> bool {
        self.is_ciphertext() && self.source == contact && !self.message.is_empty()
    }

    /// Sessions are kept per contact on the primary device.
    #[must_use]
    pub fn address(&self) -> ProtocolAddress {
        ProtocolAddress::primary(self.source.as_str())
    }

    /// Decoded ciphertext.
    pub fn body(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.message)
            .map_err(|_| {
                Error::ServerDataInvalid(format!("envelope {} body is not base64", self.timestamp))
            })
    }
}

/// Unread ciphertexts of one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub count: u32,
    /// Newest server timestamp seen
    pub latest: u64,
}

/// Unread ciphertexts per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadTally(BTreeMap<String, UnreadEntry>);

impl UnreadTally {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `envelope` if it is a ciphertext.
    pub fn record(&mut self, envelope: &Envelope) {
        if !envelope.is_ciphertext() {
            return;
        }
        let entry = self.0.entry(envelope.source.clone()).or_default();
        entry.count += 1;
        entry.latest = entry.latest.max(envelope.timestamp);
    }

    #[must_use]
    pub fn get(&self, source: &str) -> Option<&UnreadEntry> {
        self.0.get(source)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UnreadEntry)> {
        self.0.iter()
    }
}

impl<'a> FromIterator<&'a Envelope> for UnreadTally {
    fn from_iter<I: IntoIterator<Item = &'a Envelope>>(iter: I) -> Self {
        let mut tally = Self::new();
        for envelope in iter {
            tally.record(envelope);
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        Envelope::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_relay_record() {
        let parsed = envelope(json!({
            "type": 1,
            "source": "bob",
            "sourceDevice": 1,
            "timestamp": 1_531_000_000_123u64,
            "relay": "",
            "message": "AQID",
            "tag": "txnote"
        }));

        assert_eq!(parsed.classify(), EnvelopeKind::Ciphertext);
        assert_eq!(parsed.tag(), "txnote");
        assert_eq!(parsed.body().unwrap(), vec![1, 2, 3]);
        assert_eq!(parsed.address(), ProtocolAddress::primary("bob"));
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let parsed = envelope(json!({"source": "bob"}));

        assert_eq!(parsed.classify(), EnvelopeKind::Other(0));
        assert_eq!(parsed.source_device, 1);
        assert_eq!(parsed.tag(), CHAT_TAG);
        assert!(parsed.has_tag(ANY_TAG));
    }

    #[test]
    fn test_decryptable_filter() {
        let record = envelope(json!({"type": 1, "source": "bob", "message": "AQID"}));
        assert!(record.is_decryptable_for("bob"));
        assert!(!record.is_decryptable_for("carol"));

        let echo = envelope(json!({"type": 1, "source": "bob", "message": ""}));
        assert!(!echo.is_decryptable_for("bob"));

        let receipt = envelope(json!({"type": 5, "source": "bob", "message": "AQID"}));
        assert!(!receipt.is_decryptable_for("bob"));
    }

    #[test]
    fn test_unread_tally() {
        let records = [
            envelope(json!({"type": 1, "source": "bob", "timestamp": 20})),
            envelope(json!({"type": 1, "source": "bob", "timestamp": 10})),
            envelope(json!({"type": 1, "source": "carol", "timestamp": 5})),
            envelope(json!({"type": 5, "source": "dave", "timestamp": 7})),
        ];
        let tally: UnreadTally = records.iter().collect();

        assert_eq!(tally.get("bob"), Some(&UnreadEntry { count: 2, latest: 20 }));
        assert_eq!(tally.get("carol").map(|entry| entry.count), Some(1));
        assert_eq!(tally.get("dave"), None);
        assert_eq!(
            serde_json::to_value(&tally).unwrap(),
            json!({"bob": {"count": 2, "latest": 20}, "carol": {"count": 1, "latest": 5}})
        );
    }

    #[test]
    fn test_invalid_json_is_server_data_error() {
        assert!(matches!(
            Envelope::from_json("{\"type\": \"one\"}"),
            Err(Error::ServerDataInvalid(_))
        ));
        assert!(Envelope::from_json("not json").is_err());
    }
}
