//! Remote party addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device id every contact is addressed with.
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// A remote user's device: `(name, device id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// Address of the contact's primary device.
    pub fn primary(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_DEVICE_ID)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Parses the `name.device` form produced by `Display`.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let (name, device) = key.rsplit_once('.')?;
        let device_id = device.parse().ok()?;
        Some(Self::new(name, device_id))
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}
