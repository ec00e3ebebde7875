//! Device identity: a stable id for this installation plus a display name.
//!
//! The id is written into every metadata blob and wrapped-CEK record; its
//! short form tags conflict copies.

use sbx_core::types::{new_id, unix_now};
use sbx_core::SbxResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// UUID v4 generated on first run
    pub device_id: String,
    /// Human-readable name (defaults to the hostname)
    pub name: String,
    /// Unix timestamp of creation
    pub created_at: u64,
}

impl DeviceIdentity {
    pub fn generate(name: Option<&str>) -> Self {
        Self {
            device_id: new_id(),
            name: name.map(str::to_string).unwrap_or_else(default_device_name),
            created_at: unix_now(),
        }
    }

    /// Load the identity at `path`, creating and saving one if absent.
    pub fn load_or_create(path: &Path, name: Option<&str>) -> SbxResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let mut identity: Self = serde_json::from_str(&content)?;
            if let Some(n) = name {
                if identity.name != n {
                    identity.name = n.to_string();
                    identity.save(path)?;
                }
            }
            return Ok(identity);
        }
        let identity = Self::generate(name);
        identity.save(path)?;
        tracing::info!(device_id = %identity.device_id, name = %identity.name, "created device identity");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> SbxResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// First eight hex digits of the id, used as a conflict suffix.
    pub fn short_id(&self) -> String {
        self.device_id
            .chars()
            .filter(char::is_ascii_hexdigit)
            .take(8)
            .collect()
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}
