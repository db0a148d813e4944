use std::path::Path;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use proximity_rs::{LockThreshold, Settings};
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub devices: Vec<BleDevice>,
    pub presence: Option<PresenceConfig>,
    pub action: Option<ActionConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum LockRssi {
    Rssi(i32),
    /// Only `"disabled"` is accepted.
    Keyword(String),
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub lock_rssi: Option<LockRssi>,
    pub departure_timeout_seconds: Option<u32>,
    pub loss_timeout_seconds: Option<u32>,
    pub passive_mode: Option<bool>,
}

/// Shell commands run on presence transitions.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ActionConfig {
    pub on_close: Option<String>,
    pub on_away: Option<String>,
    pub on_lost: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.settings()?;
        Ok(config)
    }

    pub fn settings(&self) -> anyhow::Result<Settings> {
        self.presence.clone().unwrap_or_default().settings()
    }

    /// Engine identity for every configured device.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.address.to_string()).collect()
    }
}

impl PresenceConfig {
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let defaults = Settings::default();
        let lock_threshold = match &self.lock_rssi {
            None => defaults.lock_threshold,
            Some(LockRssi::Rssi(rssi)) if *rssi > 0 => {
                bail!("lock_rssi must not be positive, got {rssi}")
            }
            Some(LockRssi::Rssi(rssi)) => LockThreshold::Rssi(*rssi),
            Some(LockRssi::Keyword(word)) if word.eq_ignore_ascii_case("disabled") => {
                LockThreshold::Disabled
            }
            Some(LockRssi::Keyword(word)) => {
                bail!("lock_rssi must be a number or \"disabled\", got {word:?}")
            }
        };
        Ok(Settings {
            lock_threshold,
            departure_timeout_seconds: self
                .departure_timeout_seconds
                .unwrap_or(defaults.departure_timeout_seconds),
            loss_timeout_seconds: self
                .loss_timeout_seconds
                .unwrap_or(defaults.loss_timeout_seconds),
            passive_mode: self.passive_mode.unwrap_or(defaults.passive_mode),
        })
    }
}
