//! Bridge configuration.

use std::path::Path;

use serde::Deserialize;

use crate::error::BridgeError;

/// Configuration for a bridge instance.
///
/// Controls the guest's memory ceiling, instruction fuel, and whether the
/// optional `start` export runs after instantiation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum linear memory pages (1 page = 64 KiB).
    /// Default: 256 pages = 16 MiB.
    pub max_memory_pages: u32,

    /// Wasmtime fuel granted to each export call. `None` disables metering.
    pub fuel_limit: Option<u64>,

    /// Call the guest's `start` export (if it has one) after instantiation.
    pub run_start: bool,
}

impl BridgeConfig {
    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_pages as usize) * 65536
    }

    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Read a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 256, // 16 MiB
            fuel_limit: Some(1_000_000_000),
            run_start: true,
        }
    }
}
