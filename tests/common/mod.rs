#![allow(dead_code)]

use darenbms_lib::protocol::{frame_checksum, length_field};
use darenbms_lib::transport::{RawResponse, Transport};
use darenbms_lib::Error;
use std::collections::HashMap;
use std::time::Duration;

/// Encodes a Service 42 response the way a device would send it.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    pub address: u8,
    pub soc_percent: f64,
    pub pack_voltage_v: f64,
    pub cell_voltages_v: Vec<f64>,
    pub ambient_temp_c: f64,
    pub pack_avg_temp_c: f64,
    pub mos_temp_c: f64,
    pub cell_temps_c: Vec<f64>,
    pub pack_current_a: f64,
    pub internal_resistance_mohm: f64,
    pub soh_percent: u16,
    pub full_charge_capacity_ah: f64,
    pub remaining_capacity_ah: f64,
    pub cycle_count: u16,
    pub status_words: [u16; 15],
    /// Extra INFO chars appended after the last field.
    pub trailing: String,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            address: 1,
            soc_percent: 80.0,
            pack_voltage_v: 53.2,
            cell_voltages_v: vec![3.325; 16],
            ambient_temp_c: 22.0,
            pack_avg_temp_c: 21.5,
            mos_temp_c: 23.0,
            cell_temps_c: vec![21.0, 21.5, 22.0, -5.5],
            pack_current_a: 0.0,
            internal_resistance_mohm: 1.5,
            soh_percent: 100,
            full_charge_capacity_ah: 100.0,
            remaining_capacity_ah: 80.0,
            cycle_count: 12,
            status_words: [0; 15],
            trailing: String::new(),
        }
    }
}

fn word(value: f64, scale: f64) -> String {
    format!("{:04X}", ((value * scale).round() as i64 as i16) as u16)
}

impl PayloadBuilder {
    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn current(mut self, amps: f64) -> Self {
        self.pack_current_a = amps;
        self
    }

    pub fn voltage(mut self, volts: f64) -> Self {
        self.pack_voltage_v = volts;
        self
    }

    pub fn soc(mut self, percent: f64) -> Self {
        self.soc_percent = percent;
        self
    }

    pub fn cells(mut self, volts: &[f64]) -> Self {
        self.cell_voltages_v = volts.to_vec();
        self
    }

    fn info(&self) -> String {
        let mut info = String::from("00");
        info += &word(self.soc_percent, 100.0);
        info += &word(self.pack_voltage_v, 100.0);
        info += &format!("{:02X}", self.cell_voltages_v.len());
        for cell in &self.cell_voltages_v {
            info += &word(*cell, 1000.0);
        }
        info += &word(self.ambient_temp_c, 10.0);
        info += &word(self.pack_avg_temp_c, 10.0);
        info += &word(self.mos_temp_c, 10.0);
        info += &format!("{:02X}", self.cell_temps_c.len());
        for temp in &self.cell_temps_c {
            info += &word(*temp, 10.0);
        }
        info += &word(self.pack_current_a, 100.0);
        info += &word(self.internal_resistance_mohm, 10.0);
        info += &format!("{:04X}", self.soh_percent);
        info += "00";
        info += &word(self.full_charge_capacity_ah, 100.0);
        info += &word(self.remaining_capacity_ah, 100.0);
        info += &format!("{:04X}", self.cycle_count);
        for status in self.status_words {
            info += &format!("{status:04X}");
        }
        info += "00";
        info += "0000";
        info += &self.trailing;
        info
    }

    /// Payload between the `~` marker and the terminator, with valid checksums.
    pub fn payload(&self) -> String {
        let info = self.info();
        let body = format!(
            "22{:02X}4A00{}{info}",
            self.address,
            length_field(info.len() as u16)
        );
        format!("{body}{:04X}", frame_checksum(&body))
    }

    pub fn frame(&self) -> Vec<u8> {
        format!("~{}\r", self.payload()).into_bytes()
    }
}

/// What the mock bus answers at one (port, address).
#[derive(Debug, Clone)]
pub enum Reply {
    Frame(Vec<u8>),
    Partial(Vec<u8>),
    PortError,
}

/// Scripted bus. Unknown (port, address) pairs stay silent.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: HashMap<(String, u8), Reply>,
    pub requests: Vec<(String, u8)>,
}

impl MockTransport {
    pub fn with(mut self, endpoint: &str, address: u8, reply: Reply) -> Self {
        self.replies.insert((endpoint.to_string(), address), reply);
        self
    }

    pub fn set(&mut self, endpoint: &str, address: u8, reply: Reply) {
        self.replies.insert((endpoint.to_string(), address), reply);
    }
}

impl Transport for MockTransport {
    fn send_and_receive(
        &mut self,
        endpoint: &str,
        address: u8,
        _baud_rate: u32,
        _timeout: Duration,
    ) -> Result<RawResponse, Error> {
        self.requests.push((endpoint.to_string(), address));
        match self.replies.get(&(endpoint.to_string(), address)) {
            Some(Reply::Frame(bytes)) => Ok(RawResponse::complete(bytes.clone())),
            Some(Reply::Partial(bytes)) => Ok(RawResponse::partial(bytes.clone())),
            Some(Reply::PortError) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{endpoint} unavailable"),
            ))),
            None => Ok(RawResponse::partial(Vec::new())),
        }
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}
