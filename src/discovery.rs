//! One-shot scan of serial ports and bus addresses for responding devices.
//!
//! The scan produces advisory configuration: a `devices:` block that can be
//! pasted into the monitor configuration, plus a JSON summary for tooling.

use crate::config::{DeviceConfig, VirtualBatteryConfig};
use crate::reader::{DeviceReader, ADDRESS_RANGE, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use crate::transport::Transport;
use crate::Error;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ADDRESS_RANGE: RangeInclusive<u8> = 1..=16;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const YAML_ARTIFACT: &str = "discovered_batteries.yaml";
pub const JSON_ARTIFACT: &str = "discovered_batteries.json";

const PORT_PATTERNS: &[&str] = &[
    "/dev/serial/by-id/*",
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    "/dev/ttyAMA*",
];
const STABLE_ALIAS_DIR: &str = "/dev/serial/by-id/";

/// Maps an endpoint to the underlying link it points at.
pub trait AliasResolver {
    /// Canonical name of the link, `None` when the endpoint does not exist.
    fn resolve(&self, endpoint: &str) -> Option<String>;
}

/// Resolves symlinks on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsAliasResolver;

impl AliasResolver for FsAliasResolver {
    fn resolve(&self, endpoint: &str) -> Option<String> {
        std::fs::canonicalize(endpoint)
            .ok()
            .map(|path| path.to_string_lossy().into_owned())
    }
}

/// Fixed alias table, endpoint -> link.
impl AliasResolver for HashMap<String, String> {
    fn resolve(&self, endpoint: &str) -> Option<String> {
        self.get(endpoint).cloned()
    }
}

fn is_stable_alias(endpoint: &str) -> bool {
    endpoint.starts_with(STABLE_ALIAS_DIR)
}

/// Picks the endpoint to use among aliases of one link: the first stable
/// alias, else the first candidate.
pub fn resolve_stable_alias(aliases: &[String]) -> Option<String> {
    aliases
        .iter()
        .find(|alias| is_stable_alias(alias))
        .or_else(|| aliases.first())
        .cloned()
}

/// Drops endpoints that do not exist and keeps one endpoint per link, in
/// order of first appearance.
pub fn dedupe_endpoints<R: AliasResolver + ?Sized>(
    resolver: &R,
    endpoints: impl IntoIterator<Item = String>,
) -> Vec<String> {
    let mut links: Vec<(String, Vec<String>)> = Vec::new();
    for endpoint in endpoints {
        let Some(link) = resolver.resolve(&endpoint) else {
            log::debug!("Skipping missing port {endpoint}");
            continue;
        };
        match links.iter_mut().find(|(known, _)| *known == link) {
            Some((_, aliases)) if !aliases.contains(&endpoint) => aliases.push(endpoint),
            Some(_) => {}
            None => links.push((link, vec![endpoint])),
        }
    }
    links
        .into_iter()
        .filter_map(|(link, aliases)| {
            let chosen = resolve_stable_alias(&aliases)?;
            if aliases.len() > 1 {
                log::debug!("{link}: using {chosen} out of {aliases:?}");
            }
            Some(chosen)
        })
        .collect()
}

/// Serial ports present on this machine.
pub fn enumerate_ports() -> Vec<String> {
    let mut ports = Vec::new();
    for pattern in PORT_PATTERNS {
        let mut matches: Vec<String> = match glob::glob(pattern) {
            Ok(paths) => paths
                .filter_map(Result::ok)
                .map(|path| path.to_string_lossy().into_owned())
                .collect(),
            Err(err) => {
                log::warn!("Invalid port pattern {pattern}: {err}");
                continue;
            }
        };
        matches.sort();
        ports.extend(matches);
    }
    ports
}

/// Ports to scan: the explicit list when given, otherwise every serial port
/// found on the machine.
pub fn candidate_endpoints<R: AliasResolver + ?Sized>(
    resolver: &R,
    explicit: &[String],
) -> Vec<String> {
    if explicit.is_empty() {
        dedupe_endpoints(resolver, enumerate_ports())
    } else {
        dedupe_endpoints(resolver, explicit.iter().cloned())
    }
}

pub fn clamp_probe_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT)
}

/// One address that answered with a decodable frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub port: String,
    pub address: u8,
    pub name: String,
    pub enabled: bool,
}

impl DiscoveredDevice {
    pub fn new(port: impl Into<String>, address: u8) -> Self {
        Self {
            port: port.into(),
            address,
            name: format!("Battery_{address}"),
            enabled: true,
        }
    }

    pub fn to_config(&self) -> DeviceConfig {
        DeviceConfig {
            name: self.name.clone(),
            port: self.port.clone(),
            address: u32::from(self.address),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    addresses: RangeInclusive<u8>,
    timeout: Duration,
    baud_rate: u32,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            addresses: DEFAULT_ADDRESS_RANGE,
            timeout: DEFAULT_PROBE_TIMEOUT,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl Scanner {
    /// The timeout is clamped to the probe limits, the range must lie within
    /// the bus address range.
    pub fn new(addresses: RangeInclusive<u8>, timeout: Duration) -> Result<Self, Error> {
        if addresses.is_empty()
            || !ADDRESS_RANGE.contains(addresses.start())
            || !ADDRESS_RANGE.contains(addresses.end())
        {
            return Err(Error::Configuration(format!(
                "address range {}..={} must lie within {}..={}",
                addresses.start(),
                addresses.end(),
                ADDRESS_RANGE.start(),
                ADDRESS_RANGE.end()
            )));
        }
        let clamped = clamp_probe_timeout(timeout);
        if clamped != timeout {
            log::info!("Probe timeout {timeout:?} clamped to {clamped:?}");
        }
        Ok(Self {
            addresses,
            timeout: clamped,
            baud_rate: DEFAULT_BAUD_RATE,
        })
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn addresses(&self) -> RangeInclusive<u8> {
        self.addresses.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probes every address on every endpoint. Silence and garbage both mean
    /// "no device here".
    pub fn scan<T: Transport>(
        &self,
        reader: &mut DeviceReader<T>,
        endpoints: &[String],
    ) -> Vec<DiscoveredDevice> {
        log::info!(
            "Scanning {} port(s), addresses {}..={}, timeout {:?}",
            endpoints.len(),
            self.addresses.start(),
            self.addresses.end(),
            self.timeout
        );
        let mut found = Vec::new();
        for endpoint in endpoints {
            let before = found.len();
            for address in self.addresses.clone() {
                if reader
                    .probe(endpoint, address, self.baud_rate, self.timeout)
                    .is_some()
                {
                    log::debug!("{endpoint}: device at address {address}");
                    found.push(DiscoveredDevice::new(endpoint.as_str(), address));
                }
            }
            log::info!("Port {endpoint}: {} device(s)", found.len() - before);
        }
        log::info!("Discovery complete: {} device(s) found", found.len());
        found
    }
}

#[derive(Serialize)]
struct SuggestedConfig {
    virtual_battery: VirtualBatteryConfig,
    devices: Vec<DeviceConfig>,
}

#[derive(Serialize)]
struct Summary<'a> {
    count: usize,
    results: &'a [DiscoveredDevice],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub devices: Vec<DiscoveredDevice>,
}

impl DiscoveryReport {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self { devices }
    }

    /// Configuration snippet with one entry per discovered device.
    pub fn to_yaml(&self) -> Result<String, Error> {
        let suggested = SuggestedConfig {
            virtual_battery: VirtualBatteryConfig::default(),
            devices: self.devices.iter().map(DiscoveredDevice::to_config).collect(),
        };
        let body = serde_yaml::to_string(&suggested)
            .map_err(|err| Error::Configuration(format!("cannot render discovery YAML: {err}")))?;
        Ok(format!(
            "# Battery discovery, copy into the monitor configuration\n{body}"
        ))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        let summary = Summary {
            count: self.devices.len(),
            results: &self.devices,
        };
        Ok(serde_json::to_string_pretty(&summary).map_err(crate::error::PersistenceError::from)?)
    }

    /// Writes both artifacts into `dir`. Failures are logged and skipped;
    /// the returned list holds the files actually written.
    pub fn write_artifacts(&self, dir: &Path) -> Vec<PathBuf> {
        let mut written = Vec::new();
        if let Err(err) = std::fs::create_dir_all(dir) {
            log::warn!("Cannot create {dir:?}: {err}");
            return written;
        }
        let artifacts = [
            (YAML_ARTIFACT, self.to_yaml()),
            (JSON_ARTIFACT, self.to_json()),
        ];
        for (file_name, content) in artifacts {
            let path = dir.join(file_name);
            let result = content.and_then(|text| Ok(std::fs::write(&path, text + "\n")?));
            match result {
                Ok(()) => {
                    log::info!("Discovery result saved to {path:?}");
                    written.push(path);
                }
                Err(err) => log::warn!("Could not write {path:?}: {err}"),
            }
        }
        written
    }
}
