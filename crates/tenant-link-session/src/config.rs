//! Manager configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::phone::PhoneFormat;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for the session manager.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Delay before reconnecting after a retryable disconnect.
    pub reconnect_delay_secs: u64,
    /// Pause between tenants during startup recovery.
    pub startup_stagger_ms: u64,
    /// Country code used when normalizing phone numbers.
    pub country_code: String,
    /// Protocol address domain appended to normalized numbers.
    pub address_domain: String,
    /// Per-tenant event channel capacity.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            startup_stagger_ms: 2000,
            country_code: "62".into(),
            address_domain: "s.whatsapp.net".into(),
            event_capacity: 64,
        }
    }
}

impl ManagerConfig {
    /// Load a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Delay before a reconnect attempt.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Pause between tenants during recovery.
    #[must_use]
    pub const fn startup_stagger(&self) -> Duration {
        Duration::from_millis(self.startup_stagger_ms)
    }

    /// Phone normalization settings.
    #[must_use]
    pub fn phone_format(&self) -> PhoneFormat {
        PhoneFormat::new(&self.country_code, &self.address_domain)
    }
}
