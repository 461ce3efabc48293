//! Layered configuration: built-in defaults, optional TOML file, then
//! `PLANTBUS_*` environment variables (`__` separates nested keys).

use crate::device::{DeviceProfile, MAX_DEVICES};
use crate::engine::DEFAULT_TICK_MS;
use crate::hub::{DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_QUEUE_DEPTH};
use crate::signal::{signal_key, Quantity};
use crate::store::DEFAULT_RETENTION;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub const ENV_PREFIX: &str = "PLANTBUS";
pub const CONFIG_PATH_ENV: &str = "PLANTBUS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4334,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub tick_ms: u64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// One retention limit for every signal.
    pub retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub min_sampling_interval_ms: u64,
    pub default_queue_depth: usize,
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            min_sampling_interval_ms: 100,
            default_queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            reap_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub signal: String,
    pub interval_ms: u64,
    pub topic: String,
    pub publisher_id: String,
    pub writer_id: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signal: "Device1_Temperature".to_string(),
            interval_ms: 100,
            topic: "/plantbus/temperature".to_string(),
            publisher_id: "plantbus".to_string(),
            writer_id: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
    pub store: StoreConfig,
    pub subscription: SubscriptionConfig,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
    pub devices: Vec<DeviceProfile>,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            simulation: SimulationConfig::default(),
            store: StoreConfig::default(),
            subscription: SubscriptionConfig::default(),
            bridge: BridgeConfig::default(),
            logging: LoggingConfig::default(),
            devices: DeviceProfile::defaults(),
        }
    }
}

impl PlantConfig {
    /// Loads defaults, then `path` (or `$PLANTBUS_CONFIG`) if given, then the
    /// environment, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&PlantConfig::default())?);

        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        if let Some(path) = path.map(Path::to_path_buf).or_else(|| env_path.map(Into::into)) {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PlantConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.tick_ms == 0 {
            return Err(ConfigError::Invalid("simulation.tick_ms must be positive".to_string()));
        }
        if self.store.retention == 0 {
            return Err(ConfigError::Invalid("store.retention must be positive".to_string()));
        }
        if self.subscription.default_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "subscription.default_queue_depth must be positive".to_string(),
            ));
        }
        if self.bridge.enabled && self.bridge.interval_ms == 0 {
            return Err(ConfigError::Invalid("bridge.interval_ms must be positive".to_string()));
        }
        if self.devices.len() > MAX_DEVICES {
            return Err(ConfigError::Invalid(format!(
                "{} devices configured, at most {} supported",
                self.devices.len(),
                MAX_DEVICES
            )));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device name '{}'", device.name)));
            }
            if Quantity::ALL.iter().any(|q| q.key_for(&device.name).is_none()) {
                return Err(ConfigError::Invalid(format!("device name '{}' is too long", device.name)));
            }
        }

        if self.bridge.enabled {
            let known = signal_key(&self.bridge.signal).is_some()
                && self
                    .devices
                    .iter()
                    .any(|d| Quantity::ALL.iter().any(|q| q.key_for(&d.name).as_deref() == Some(self.bridge.signal.as_str())));
            if !known {
                return Err(ConfigError::Invalid(format!(
                    "bridge.signal '{}' is not a registered signal",
                    self.bridge.signal
                )));
            }
        }

        Ok(())
    }
}
