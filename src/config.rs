use crate::aggregate::{self, VirtualBattery, VoltagePolicy};
use crate::reader::{DeviceIdentity, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use crate::telemetry::{self, VIRTUAL_BATTERY_KEY, VIRTUAL_BATTERY_SLUG};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub port: String,
    pub address: u32,
    #[serde(default = "DeviceConfig::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "DeviceConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "MonitorConfig::default_true")]
    pub enabled: bool,
}

impl DeviceConfig {
    fn default_baud_rate() -> u32 {
        DEFAULT_BAUD_RATE
    }

    fn default_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }

    pub fn identity(&self) -> Result<DeviceIdentity, Error> {
        DeviceIdentity::new(
            self.name.clone(),
            self.port.clone(),
            self.address,
            self.baud_rate,
            self.timeout,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualBatteryConfig {
    #[serde(default = "MonitorConfig::default_true")]
    pub enabled: bool,
    #[serde(default = "VirtualBatteryConfig::default_name")]
    pub name: String,
    #[serde(default)]
    pub voltage_policy: VoltagePolicy,
}

impl VirtualBatteryConfig {
    fn default_name() -> String {
        aggregate::DEFAULT_NAME.into()
    }
}

impl Default for VirtualBatteryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: Self::default_name(),
            voltage_policy: VoltagePolicy::default(),
        }
    }
}

/// Settings of the polling daemon, read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(
        default = "MonitorConfig::default_poll_interval",
        with = "humantime_serde"
    )]
    pub poll_interval: Duration,
    #[serde(default)]
    pub energy_storage: Option<PathBuf>,
    #[serde(default)]
    pub virtual_battery: VirtualBatteryConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::default_poll_interval(),
            energy_storage: None,
            virtual_battery: VirtualBatteryConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "monitor.yaml";

    fn default_poll_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_true() -> bool {
        true
    }

    pub fn load(config_file_path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = config_file_path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let config_file = std::fs::File::open(path)?;
        Self::from_reader(config_file)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_reader(reader)
            .map_err(|err| Error::Configuration(format!("invalid monitor config: {err}")))?;
        if config.poll_interval.is_zero() {
            return Err(Error::Configuration("poll_interval must be positive".into()));
        }
        Ok(config)
    }

    /// Identities of the enabled devices, in configuration order.
    ///
    /// Invalid entries are logged and left out; they never stop the others.
    /// A device name keys both the energy counters and the published topics,
    /// so only the first device claiming a name (or its slug) is kept.
    pub fn identities(&self) -> Vec<DeviceIdentity> {
        let mut claimed: HashMap<String, String> = HashMap::new();
        self.devices
            .iter()
            .filter(|device| {
                if !device.enabled {
                    log::debug!("Skipping disabled device: {}", device.name);
                }
                device.enabled
            })
            .filter_map(|device| {
                match device
                    .identity()
                    .and_then(|identity| Self::claim(&mut claimed, identity))
                {
                    Ok(identity) => Some(identity),
                    Err(err) => {
                        log::error!("Ignoring device '{}': {err}", device.name);
                        None
                    }
                }
            })
            .collect()
    }

    fn claim(
        claimed: &mut HashMap<String, String>,
        identity: DeviceIdentity,
    ) -> Result<DeviceIdentity, Error> {
        let name = identity.name();
        let slug = telemetry::slug(name);
        if name == VIRTUAL_BATTERY_KEY || slug == VIRTUAL_BATTERY_SLUG {
            return Err(Error::Configuration(format!(
                "device name '{name}' is reserved for the virtual battery"
            )));
        }
        if let Some(owner) = claimed.get(&slug) {
            return Err(Error::Configuration(format!(
                "device name '{name}' collides with '{owner}'"
            )));
        }
        claimed.insert(slug, name.to_string());
        Ok(identity)
    }

    pub fn virtual_battery(&self) -> Option<VirtualBattery> {
        self.virtual_battery.enabled.then(|| {
            VirtualBattery::new(
                self.virtual_battery.name.clone(),
                self.virtual_battery.voltage_policy,
            )
        })
    }
}
