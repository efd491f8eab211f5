//! Client configuration and logging set-up.

use crate::address::DEFAULT_DEVICE_ID;
use crate::error::{Error, Result};
use crate::storage::TrustPolicy;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Installs the global `tracing` subscriber once per process.
///
/// `RUST_LOG` wins over `default_level`. Later calls are no-ops.
pub fn init_tracing(default_level: &str) -> Result<()> {
    TRACING_INITIALIZED
        .get_or_try_init(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level));
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .try_init()
                .map_err(|err| Error::InvalidConfiguration(err.to_string()))
        })
        .map(|_| ())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local account name
    pub username: String,

    /// Directory of the file store; in-memory when unset
    pub data_dir: Option<PathBuf>,

    pub device_id: u32,
    pub trust_policy: TrustPolicy,
    pub pre_keys: PreKeyConfig,
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            data_dir: None,
            device_id: DEFAULT_DEVICE_ID,
            trust_policy: TrustPolicy::default(),
            pre_keys: PreKeyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One-time pre-key pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// Keys generated at registration
    pub batch_size: u32,
    /// Refill when the server holds this many or fewer
    pub low_water_mark: u32,
    /// Pool size a refill restores
    pub high_water_mark: u32,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            low_water_mark: 10,
            high_water_mark: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|err| Error::InvalidConfiguration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(invalid("username must not be empty"));
        }
        if self.device_id == 0 {
            return Err(invalid("device_id must be positive"));
        }
        if self.pre_keys.batch_size == 0 {
            return Err(invalid("pre_keys.batch_size must be positive"));
        }
        if self.pre_keys.low_water_mark >= self.pre_keys.high_water_mark {
            return Err(invalid("pre_keys.low_water_mark must be below high_water_mark"));
        }
        if let Err(err) = EnvFilter::try_new(&self.logging.level) {
            return Err(invalid(&format!("logging.level: {err}")));
        }
        Ok(())
    }

    /// Installs the global subscriber at `logging.level`.
    pub fn init_tracing(&self) -> Result<()> {
        init_tracing(&self.logging.level)
    }
}

/// Reads and validates a TOML configuration file.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = fs::read_to_string(path)
        .map_err(|err| Error::InvalidConfiguration(format!("{}: {err}", path.display())))?;
    ClientConfig::from_toml_str(&content)
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfiguration(reason.to_owned())
}
