//! Decrypted message history per contact and tag.

use crate::envelope::CHAT_TAG;
use crate::error::{Error, Result};
use crate::storage::{KeyValueStore, Namespace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const UNDECRYPTABLE_STATUS: &str = "UNDECRYPTABLE_MESSAGE";
pub const UNDECRYPTABLE_CONTENT: &str = "🔒 You cannot read this message.";

const CHAT_NAMESPACE: &str = "messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Warning,
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    pub content: String,
    /// Author of the message
    pub username: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub device: u32,
    pub server_timestamp: u64,
    /// Seconds since the Unix epoch, set when the entry is appended
    #[serde(default)]
    pub saved_timestamp: u64,
}

impl ParsedMessage {
    #[must_use]
    pub fn new(username: &str, device: u32, server_timestamp: u64, content: String) -> Self {
        Self {
            content,
            username: username.to_owned(),
            kind: MessageKind::Message,
            status: None,
            device,
            server_timestamp,
            saved_timestamp: 0,
        }
    }

    /// Placeholder recorded for a message that could not be decrypted.
    #[must_use]
    pub fn undecryptable(username: &str, device: u32, server_timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Warning,
            status: Some(UNDECRYPTABLE_STATUS.to_owned()),
            ..Self::new(username, device, server_timestamp, UNDECRYPTABLE_CONTENT.to_owned())
        }
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.kind == MessageKind::Warning
    }
}

/// Overview of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub username: String,
    pub unread: u32,
    /// Newest entry; set for the chat tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ParsedMessage>,
    /// Whole history; set for every other tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ParsedMessage>>,
}

/// Persisted conversation history.
pub trait ConversationLog: Send + Sync {
    /// Appends `message`, stamping its saved timestamp, and returns it.
    fn append(&self, tag: &str, contact: &str, message: ParsedMessage) -> Result<ParsedMessage>;

    /// Entries with `contact`, newest first.
    fn list(&self, tag: &str, contact: &str) -> Vec<ParsedMessage>;

    fn list_all(&self, tag: &str) -> Vec<ConversationSummary>;

    /// Whether an entry for the envelope `server_timestamp` from `username`
    /// is already recorded.
    fn contains(&self, tag: &str, contact: &str, username: &str, server_timestamp: u64) -> bool {
        self.list(tag, contact).iter().any(|message| {
            message.username == username && message.server_timestamp == server_timestamp
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConversationEntry {
    unread_count: u32,
    messages: Vec<ParsedMessage>,
}

/// [`ConversationLog`] over a [`KeyValueStore`], one namespace per tag.
///
/// `chat` lives in `messages`, any other tag `t` in `messages_t`.
pub struct StoredConversationLog {
    backend: Arc<dyn KeyValueStore>,
    namespaces: Mutex<HashMap<String, Arc<Namespace>>>,
}

impl StoredConversationLog {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Store namespace of `tag`.
    ///
    /// Bytes outside `[A-Za-z0-9_]` are written as `-` plus two hex digits,
    /// so every tag maps to a distinct, file-safe name.
    #[must_use]
    pub fn namespace_for(tag: &str) -> String {
        if tag == CHAT_TAG {
            return CHAT_NAMESPACE.to_owned();
        }

        let mut namespace = format!("{CHAT_NAMESPACE}_");
        for byte in tag.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                namespace.push(char::from(byte));
            } else {
                namespace.push_str(&format!("-{byte:02x}"));
            }
        }
        namespace
    }

    fn namespace(&self, tag: &str) -> Arc<Namespace> {
        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(namespaces.entry(tag.to_owned()).or_insert_with(|| {
            Arc::new(Namespace::new(
                Arc::clone(&self.backend),
                Self::namespace_for(tag),
            ))
        }))
    }

    fn entry(namespace: &Namespace, bytes: &[u8]) -> Option<ConversationEntry> {
        serde_json::from_slice(bytes)
            .map_err(|err| {
                warn!(namespace = namespace.name(), error = %err, "conversation is invalid");
            })
            .ok()
    }
}

impl ConversationLog for StoredConversationLog {
    fn append(
        &self,
        tag: &str,
        contact: &str,
        mut message: ParsedMessage,
    ) -> Result<ParsedMessage> {
        message.saved_timestamp = now_seconds();
        let namespace = self.namespace(tag);

        let stored = namespace.update(|entries| {
            let mut entry = entries
                .get(contact)
                .and_then(|bytes| Self::entry(&namespace, bytes))
                .unwrap_or_default();
            entry.messages.push(message.clone());
            serde_json::to_vec(&entry).map(|bytes| {
                entries.insert(contact.to_owned(), bytes);
            })
        });

        match stored {
            Some(Ok(())) => Ok(message),
            Some(Err(_)) => Err(Error::Serialization),
            None => Err(Error::Storage(format!("conversation {tag}/{contact}"))),
        }
    }

    fn list(&self, tag: &str, contact: &str) -> Vec<ParsedMessage> {
        let namespace = self.namespace(tag);
        let Some(entry) = namespace
            .get(contact)
            .and_then(|bytes| Self::entry(&namespace, &bytes))
        else {
            return Vec::new();
        };

        let mut messages: Vec<_> = entry.messages.into_iter().rev().collect();
        messages.sort_by(|a, b| b.saved_timestamp.cmp(&a.saved_timestamp));
        messages
    }

    fn list_all(&self, tag: &str) -> Vec<ConversationSummary> {
        let namespace = self.namespace(tag);
        namespace
            .entries()
            .into_iter()
            .filter_map(|(contact, bytes)| {
                let entry = Self::entry(&namespace, &bytes)?;
                let mut messages: Vec<_> = entry.messages.into_iter().rev().collect();
                messages.sort_by(|a, b| b.saved_timestamp.cmp(&a.saved_timestamp));

                let (last_message, messages) = if tag == CHAT_TAG {
                    (messages.into_iter().next(), None)
                } else {
                    (None, Some(messages))
                };
                Some(ConversationSummary {
                    username: contact,
                    unread: entry.unread_count,
                    last_message,
                    messages,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for StoredConversationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredConversationLog").finish_non_exhaustive()
    }
}

pub(crate) fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
