use crate::error::DecodeError;
use crate::protocol::DeviceReading;
use crate::transport::Transport;
use crate::Error;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Addresses a device on the bus may use.
pub const ADDRESS_RANGE: RangeInclusive<u8> = 1..=247;

/// Where and how to reach one physical device. Validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    name: String,
    endpoint: String,
    address: u8,
    baud_rate: u32,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
}

impl DeviceIdentity {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        address: u32,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let name = name.into();
        let endpoint = endpoint.into();
        let address = u8::try_from(address)
            .ok()
            .filter(|a| ADDRESS_RANGE.contains(a))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "device '{name}': address {address} outside {}..={}",
                    ADDRESS_RANGE.start(),
                    ADDRESS_RANGE.end()
                ))
            })?;
        if name.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "device at {endpoint} address {address}: empty name"
            )));
        }
        if endpoint.trim().is_empty() {
            return Err(Error::Configuration(format!("device '{name}': empty port")));
        }
        if baud_rate == 0 {
            return Err(Error::Configuration(format!("device '{name}': baud rate is zero")));
        }
        if timeout.is_zero() {
            return Err(Error::Configuration(format!("device '{name}': timeout is zero")));
        }
        Ok(Self {
            name,
            endpoint,
            address,
            baud_rate,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A decoded reading together with the device it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSample {
    pub identity: DeviceIdentity,
    pub reading: DeviceReading,
}

/// Result of reading one device. Only `Reading` carries data, every other
/// outcome means "skip this device for the cycle".
#[derive(Debug)]
pub enum ReadOutcome {
    Reading(DeviceSample),
    /// No complete frame before the timeout.
    Timeout { received: usize },
    DecodeFailed(DecodeError),
    /// The link itself could not be used, e.g. the port failed to open.
    LinkFailed(Error),
}

impl ReadOutcome {
    pub fn into_result(self) -> Result<DeviceSample, Error> {
        match self {
            ReadOutcome::Reading(sample) => Ok(sample),
            ReadOutcome::Timeout { received } => Err(Error::LinkTimeout { received }),
            ReadOutcome::DecodeFailed(err) => Err(Error::Decode(err)),
            ReadOutcome::LinkFailed(err) => Err(err),
        }
    }

    pub fn is_reading(&self) -> bool {
        matches!(self, ReadOutcome::Reading(_))
    }
}

/// Sends Service 42 requests through a [`Transport`] and decodes the replies.
#[derive(Debug)]
pub struct DeviceReader<T> {
    transport: T,
}

impl<T: Transport> DeviceReader<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn read(&mut self, identity: &DeviceIdentity) -> ReadOutcome {
        log::debug!(
            "Reading {} (port {}, address {})",
            identity.name(),
            identity.endpoint(),
            identity.address()
        );
        match self.exchange(
            identity.endpoint(),
            identity.address(),
            identity.baud_rate(),
            identity.timeout(),
        ) {
            Ok(reading) => ReadOutcome::Reading(DeviceSample {
                identity: identity.clone(),
                reading,
            }),
            Err(outcome) => outcome,
        }
    }

    /// Reads an address without a configured identity. Any failure means
    /// "no device here".
    pub fn probe(
        &mut self,
        endpoint: &str,
        address: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> Option<DeviceReading> {
        self.exchange(endpoint, address, baud_rate, timeout).ok()
    }

    fn exchange(
        &mut self,
        endpoint: &str,
        address: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<DeviceReading, ReadOutcome> {
        let response = self
            .transport
            .send_and_receive(endpoint, address, baud_rate, timeout)
            .map_err(|err| {
                log::warn!("{endpoint} address {address}: link failure: {err}");
                ReadOutcome::LinkFailed(err)
            })?;
        let payload = response.payload().ok_or_else(|| {
            log::debug!(
                "{endpoint} address {address}: no complete frame ({} bytes)",
                response.bytes.len()
            );
            ReadOutcome::Timeout {
                received: response.bytes.len(),
            }
        })?;
        DeviceReading::decode(&payload).map_err(|err| {
            log::warn!("{endpoint} address {address}: {err}");
            ReadOutcome::DecodeFailed(err)
        })
    }
}
