//! File configuration for a bridge, a bus and a state store.
//!
//! ```toml
//! [bridge]
//! transport = "broadcast"
//! namespace = "shop"
//!
//! [bus]
//! app_id = "cart"
//! default_timeout_ms = 5000
//!
//! [store]
//! debounce_ms = 16
//! ```
//!
//! Every section and field is optional.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::bus::BusConfig;
use crate::error::ConfigError;
use crate::state::StoreConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub bridge: BridgeConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
}

impl MeshConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load config from disk, or return the defaults if the file doesn't
    /// exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
