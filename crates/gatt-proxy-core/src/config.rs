//! Configuration types for the GATT proxy
//!
//! This module provides the expected topology (which services and
//! characteristics to mirror), the target device name and the timing
//! options for the remote link and the local server.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ProxyError, Result};

/// Default time allowed from connect to a complete topology
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 30_000;

/// Default time allowed for publishing every mirror service
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the proxy event broadcast channel
pub const DEFAULT_EVENTS_CAPACITY: usize = 256;

/// Main configuration for the GATT proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Advertised name of the remote device to mirror (case-insensitive)
    #[serde(default)]
    pub target_name: String,

    /// Name the local mirror advertises (defaults to `target_name`)
    #[serde(default)]
    pub local_name: Option<String>,

    /// Expected topology, in discovery order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Remote link behavior
    #[serde(default)]
    pub link: LinkConfig,

    /// Local server behavior
    #[serde(default)]
    pub server: ServerConfig,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

/// One expected service and its expected characteristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service id
    pub uuid: Uuid,
    /// Characteristic ids, in order
    pub characteristics: Vec<Uuid>,
}

impl ServiceConfig {
    /// Create a service entry
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }
}

/// Remote link behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Give up scanning after this long (None = scan until found)
    #[serde(with = "humantime_serde_opt", default)]
    pub scan_timeout: Option<Duration>,

    /// Time allowed from the connect request until the topology is complete
    #[serde(with = "humantime_serde", default = "default_discovery_timeout")]
    pub discovery_timeout: Duration,
}

fn default_discovery_timeout() -> Duration {
    Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS)
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout: None,
            discovery_timeout: default_discovery_timeout(),
        }
    }
}

/// Local server behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Time allowed for publishing all mirror services and starting to advertise
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
}

fn default_publish_timeout() -> Duration {
    Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS)
}

fn default_events_capacity() -> usize {
    DEFAULT_EVENTS_CAPACITY
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            publish_timeout: default_publish_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target_name: String::new(),
            local_name: None,
            services: Vec::new(),
            link: LinkConfig::default(),
            server: ServerConfig::default(),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl ProxyConfig {
    /// Name the mirror advertises
    pub fn advertised_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.target_name)
    }

    /// Load a configuration from a JSON string and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ProxyConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check the configuration for problems that would make mirroring impossible
    pub fn validate(&self) -> Result<()> {
        if self.target_name.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "target_name must not be empty".to_string(),
            ));
        }
        if self.services.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "at least one service must be configured".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(ProxyError::InvalidConfig(
                "events_capacity must be greater than zero".to_string(),
            ));
        }

        let mut seen_services = HashSet::new();
        for service in &self.services {
            if !seen_services.insert(service.uuid) {
                return Err(ProxyError::InvalidConfig(format!(
                    "duplicate service {}",
                    service.uuid
                )));
            }
            if service.characteristics.is_empty() {
                return Err(ProxyError::InvalidConfig(format!(
                    "service {} has no characteristics",
                    service.uuid
                )));
            }
            let mut seen_chars = HashSet::new();
            for characteristic in &service.characteristics {
                if !seen_chars.insert(*characteristic) {
                    return Err(ProxyError::InvalidConfig(format!(
                        "duplicate characteristic {} in service {}",
                        characteristic, service.uuid
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for ProxyConfig
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remote device name to match
    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.config.target_name = name.into();
        self
    }

    /// Set the name the mirror advertises
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.config.local_name = Some(name.into());
        self
    }

    /// Add an expected service with its characteristics
    pub fn service(mut self, uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        self.config
            .services
            .push(ServiceConfig::new(uuid, characteristics));
        self
    }

    /// Set the scan timeout
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.config.link.scan_timeout = Some(timeout);
        self
    }

    /// Set the discovery timeout
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.link.discovery_timeout = timeout;
        self
    }

    /// Set the publish timeout
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.publish_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
