/// Configuration structures that can be tested independently
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::ConfigError;

/// Update-run tuning. Defaults reproduce the behaviour the firmware server
/// and the deployed devices agree on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// mDNS host name of the firmware server
    pub service_name: String,
    pub query_timeout_ms: u64,
    /// Unconditional wait before every discovery, lets the AP settle
    pub startup_grace_ms: u64,
    pub firmware_port: u16,
    pub firmware_path: String,
    /// Wait between a successful install and the restart
    pub restart_delay_ms: u64,
    pub chunk_size: usize,
    pub http_timeout_ms: u64,
    pub task_stack_size: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            service_name: "firmware".to_string(),
            query_timeout_ms: 1_000,
            startup_grace_ms: 10_000,
            firmware_port: 34271,
            firmware_path: "/firmware".to_string(),
            restart_delay_ms: 1_000,
            chunk_size: 4096,
            http_timeout_ms: 30_000,
            task_stack_size: 8192,
        }
    }
}

impl OtaConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Empty { field: "service_name" });
        }
        if self.service_name.contains('.') {
            // query_a takes the bare host name, ".local" is implied
            return Err(ConfigError::OutOfRange {
                field: "service_name",
                value: self.service_name.clone(),
            });
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange { field: "query_timeout_ms", value: "0".into() });
        }
        if self.firmware_port == 0 {
            return Err(ConfigError::OutOfRange { field: "firmware_port", value: "0".into() });
        }
        if !self.firmware_path.starts_with('/') {
            return Err(ConfigError::OutOfRange {
                field: "firmware_path",
                value: self.firmware_path.clone(),
            });
        }
        if !(512..=16 * 1024).contains(&self.chunk_size) {
            return Err(ConfigError::OutOfRange {
                field: "chunk_size",
                value: self.chunk_size.to_string(),
            });
        }
        if self.task_stack_size < 4096 {
            return Err(ConfigError::OutOfRange {
                field: "task_stack_size",
                value: self.task_stack_size.to_string(),
            });
        }
        Ok(())
    }
}

/// Soft access point the device hosts; the control plane and the
/// firmware server both live on this network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_connections: u16,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self::with_credentials("YOLO", "12345678")
    }
}

impl AccessPointConfig {
    pub fn with_credentials(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            channel: 1,
            max_connections: 5,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() {
            return Err(ConfigError::Empty { field: "ssid" });
        }
        if self.ssid.len() > 32 {
            return Err(ConfigError::OutOfRange { field: "ssid", value: self.ssid.clone() });
        }
        // WPA2-PSK passphrases are 8..=63 characters; empty means an open AP
        if !self.password.is_empty() && !(8..=63).contains(&self.password.len()) {
            return Err(ConfigError::OutOfRange {
                field: "password",
                value: format!("{} characters", self.password.len()),
            });
        }
        if !(1..=13).contains(&self.channel) {
            return Err(ConfigError::OutOfRange {
                field: "channel",
                value: self.channel.to_string(),
            });
        }
        if !(1..=10).contains(&self.max_connections) {
            return Err(ConfigError::OutOfRange {
                field: "max_connections",
                value: self.max_connections.to_string(),
            });
        }
        Ok(())
    }
}

/// Settings as written to the settings store, tagged with the fingerprint
/// of the compiled defaults they were saved under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredSettings<T> {
    pub defaults: String,
    pub settings: T,
}

impl<T: Serialize> StoredSettings<T> {
    pub fn new(settings: T, defaults: &T) -> Self {
        Self { defaults: fingerprint(defaults), settings }
    }
}

/// Hex SHA-256 of the JSON form of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_vec(value).unwrap_or_default();
    Sha256::digest(&json).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Where the active settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    Stored,
    FirstBoot,
    /// The firmware was rebuilt or updated with different defaults
    DefaultsChanged,
    Invalid(String),
}

impl SettingsSource {
    /// Whether the defaults should be written back to the store
    pub fn needs_save(&self) -> bool {
        *self != SettingsSource::Stored
    }
}

/// Pick the active settings. A stored blob wins only if it was saved under
/// the same compiled defaults and still validates; otherwise `defaults`.
pub fn restore_settings<T, V>(blob: Option<&[u8]>, defaults: T, validate: V) -> (T, SettingsSource)
where
    T: Serialize + DeserializeOwned,
    V: Fn(&T) -> Result<(), ConfigError>,
{
    let Some(blob) = blob else {
        return (defaults, SettingsSource::FirstBoot);
    };

    let stored: StoredSettings<T> = match serde_json::from_slice(blob) {
        Ok(stored) => stored,
        Err(e) => return (defaults, SettingsSource::Invalid(e.to_string())),
    };
    if stored.defaults != fingerprint(&defaults) {
        return (defaults, SettingsSource::DefaultsChanged);
    }
    if let Err(e) = validate(&stored.settings) {
        return (defaults, SettingsSource::Invalid(e.to_string()));
    }
    (stored.settings, SettingsSource::Stored)
}
