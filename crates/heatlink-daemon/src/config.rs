//! Daemon configuration.
//!
//! One TOML file describes the whole deployment: the Modbus listener, the
//! HTTP facade, the settings database, the telemetry brokers and the static
//! device table.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use heatlink_core::DeviceConfig;
use heatlink_telemetry::BrokerSettings;

fn default_modbus_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_modbus_port() -> u16 {
    8503
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_enabled() -> bool {
    true
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("heatlink.redb")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusSection {
    #[serde(default = "default_modbus_bind")]
    pub bind: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ModbusSection {
    fn default() -> Self {
        Self {
            bind: default_modbus_bind(),
            port: default_modbus_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub modbus: ModbusSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub brokers: Vec<BrokerSettings>,
    pub devices: Vec<DeviceConfig>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}
