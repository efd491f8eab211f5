//! Signal-protocol session core for an end-to-end encrypted messenger.
//!
//! The crate covers everything between a user action and the bytes handed to
//! the relay: X3DH session setup against published pre-key bundles, the
//! Double Ratchet, per-address session records, persistent key stores,
//! registration and pre-key pool upkeep, relay envelope parsing and a
//! conversation log of decrypted messages.
//!
//! HTTP is left to the caller. [`transport::KeyExchangeTransport`] and
//! [`transport::MessageRelayTransport`] describe the server calls and
//! [`storage::KeyValueStore`] the persistence the core relies on.
//!
//! # Security Properties
//!
//! - Forward secrecy: message keys are derived per message and dropped after
//!   use.
//! - Post-compromise security: every reply performs a DH ratchet step.
//! - Identity pinning: the first identity seen for a contact is trusted and
//!   a later change is rejected until the contact is re-established.
//!
//! # Protocol Flow
//!
//! ```rust
//! use rand_core::OsRng;
//! use signal_session::keys::{IdentityKeyPair, KeyPair};
//! use signal_session::x3dh::{self, PreKeyBundle, ResponderKeys};
//! use signal_session::DoubleRatchet;
//!
//! // Bob publishes an identity key and a signed pre-key
//! let bob_identity = IdentityKeyPair::generate(&mut OsRng);
//! let bob_signed = KeyPair::generate(&mut OsRng);
//! let bundle = PreKeyBundle {
//!     registration_id: 7,
//!     device_id: 1,
//!     pre_key: None,
//!     signed_pre_key_id: 1,
//!     signed_pre_key: *bob_signed.public_key(),
//!     signed_pre_key_signature: bob_identity
//!         .sign(&mut OsRng, &bob_signed.public_key().serialize()),
//!     identity_key: *bob_identity.public_key(),
//! };
//!
//! // Alice agrees on a root key and can send right away
//! let alice_identity = IdentityKeyPair::generate(&mut OsRng);
//! let init = x3dh::initiate(&mut OsRng, &alice_identity, &bundle)?;
//! let mut alice = DoubleRatchet::new_sender(&mut OsRng, init.root_key, *bob_signed.public_key())?;
//! let message = alice.encrypt(b"hi bob", &init.associated_data)?;
//!
//! // Bob answers with the same key material
//! let keys = ResponderKeys {
//!     identity: &bob_identity,
//!     signed_pre_key: &bob_signed,
//!     one_time_pre_key: None,
//! };
//! let response = x3dh::respond(&keys, alice_identity.public_key(), &init.base_key)?;
//! let mut bob = DoubleRatchet::new_receiver(response.root_key, bob_signed.secret_key().clone());
//! assert_eq!(bob.decrypt(&mut OsRng, &message, &response.associated_data)?, b"hi bob");
//! # Ok::<(), signal_session::Error>(())
//! ```
//!
//! Applications normally go through [`SignalClient`], which runs this flow
//! against the stores and transports.
//!
//! # Modules
//!
//! - [`x3dh`]: key agreement
//! - [`double_ratchet`]: per-message keys
//! - [`state`]: session states and records
//! - [`session_builder`] and [`session_cipher`]: sessions over the store
//! - [`storage`]: key stores over a [`storage::KeyValueStore`]
//! - [`registration`]: account creation and pre-key pool
//! - [`envelope`] and [`conversation`]: relay records and message history
//! - [`client`]: the high-level client

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug,
    clippy::module_name_repetitions
)]

pub mod address;
pub mod client;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod double_ratchet;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod registration;
pub mod session_builder;
pub mod session_cipher;
pub mod state;
pub mod storage;
pub mod transport;
pub mod x3dh;
pub mod xeddsa;

pub use address::ProtocolAddress;
pub use client::SignalClient;
pub use config::{init_tracing, load_config, ClientConfig};
pub use conversation::{ConversationLog, ConversationSummary, ParsedMessage, StoredConversationLog};
pub use double_ratchet::DoubleRatchet;
pub use envelope::{Envelope, UnreadTally};
pub use error::{Error, ErrorKind, Result};
pub use keys::{IdentityKeyPair, KeyPair, PublicKey, SecretKey};
pub use protocol::{CiphertextMessage, CiphertextType, PreKeySignalMessage, SignalMessage};
pub use session_builder::SessionBuilder;
pub use session_cipher::{DecryptOutcome, SessionCipher};
pub use state::{SessionRecord, SessionState};
pub use storage::{KeyValueStore, ProtocolStore, TrustPolicy};
pub use x3dh::PreKeyBundle;
