//! Configuration file loading.
//!
//! The file is JSON:
//!
//! ```json
//! { "mac_addresses": ["A4:C1:38:0E:7F:2B"], "poll_interval_minutes": 15 }
//! ```
//!
//! Only one sensor is monitored. When more addresses are listed the first one
//! wins and the rest are reported back as a [`ConfigWarning`].

use std::{fmt, path::Path, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

use crate::sensor::DeviceIdentity;

pub const DEFAULT_POLL_INTERVAL_MINUTES: u64 = 15;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// One year.
pub const MAX_POLL_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// A century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

fn default_poll_interval_minutes() -> u64 {
    DEFAULT_POLL_INTERVAL_MINUTES
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no MAC addresses found in config")]
    NoAddresses,

    #[error("invalid MAC address {value:?}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("poll_interval_minutes must be greater than zero")]
    ZeroPollInterval,

    #[error("retention_days must be greater than zero")]
    ZeroRetention,

    #[error("poll_interval_minutes must be at most {MAX_POLL_INTERVAL_MINUTES}, got {0}")]
    PollIntervalTooLong(u64),

    #[error("retention_days must be at most {MAX_RETENTION_DAYS}, got {0}")]
    RetentionTooLong(u32),
}

/// The file as written.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub mac_addresses: Vec<String>,

    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Validated settings the agent runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub device: DeviceIdentity,
    pub poll_interval: Duration,
    pub retention_window: TimeDelta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    ExtraAddresses { used: String, ignored: Vec<String> },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::ExtraAddresses { used, ignored } => write!(
                f,
                "config contains more than one MAC address; only {used} is monitored, ignoring {}",
                ignored.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub settings: Settings,
    pub warnings: Vec<ConfigWarning>,
}

impl RawConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn normalize(self) -> Result<Normalized, ConfigError> {
        let mut addresses = self
            .mac_addresses
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        let first = addresses.next().ok_or(ConfigError::NoAddresses)?;
        let device = first
            .parse::<DeviceIdentity>()
            .map_err(|e| ConfigError::InvalidAddress {
                value: first.clone(),
                reason: format!("{e:#}"),
            })?;

        let ignored: Vec<String> = addresses.map(|a| a.to_uppercase()).collect();
        let mut warnings = Vec::new();
        if !ignored.is_empty() {
            warnings.push(ConfigWarning::ExtraAddresses {
                used: device.to_string(),
                ignored,
            });
        }

        if self.poll_interval_minutes == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.poll_interval_minutes > MAX_POLL_INTERVAL_MINUTES {
            return Err(ConfigError::PollIntervalTooLong(self.poll_interval_minutes));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::ZeroRetention);
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::RetentionTooLong(self.retention_days));
        }

        Ok(Normalized {
            settings: Settings {
                device,
                poll_interval: Duration::from_secs(self.poll_interval_minutes * 60),
                retention_window: TimeDelta::days(i64::from(self.retention_days)),
            },
            warnings,
        })
    }
}
