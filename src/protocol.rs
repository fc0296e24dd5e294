use crate::error::DecodeError;
use serde::{Serialize, Serializer};
use std::fmt;

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);

/// Leading marker of every frame (`~`).
pub const START_BYTE: u8 = b'~';
/// Trailing terminator of every frame (carriage return).
pub const TERMINATOR: u8 = b'\r';

pub const PROTOCOL_VERSION: u8 = 0x22;
pub const CID1_BATTERY: u8 = 0x4A;
/// Service 42, "GetDeviceInfo".
pub const CID2_GET_DEVICE_INFO: u8 = 0x42;

// LENID 0x002 (the INFO of the request is the address byte) with its LENCHK nibble
const REQUEST_LENGTH_FIELD: &str = "E002";
// The vendor tool sends this checksum for every address
const REQUEST_CHECKSUM: &str = "FD28";
const REQUEST_FRAME_LENGTH: usize = 20;

const HEADER_CHARS: usize = 8;
const LENGTH_CHARS: usize = 4;
const CHECKSUM_CHARS: usize = 4;
const INFO_LENGTH_MASK: u16 = 0x0FFF;

/// Current deadband around zero used to classify a battery as idle.
pub const CURRENT_DEADBAND_A: f64 = 0.1;

/// Builds the Service 42 request frame for `address`.
///
/// ```
/// let frame = darenbms_lib::protocol::device_info_request(0x01);
/// assert_eq!(frame, b"~22014A42E00201FD28\r");
/// ```
pub fn device_info_request(address: u8) -> Vec<u8> {
    let mut tx_buffer = Vec::with_capacity(REQUEST_FRAME_LENGTH);
    tx_buffer.push(START_BYTE);
    tx_buffer.extend_from_slice(
        format!(
            "{PROTOCOL_VERSION:02X}{address:02X}{CID1_BATTERY:02X}{CID2_GET_DEVICE_INFO:02X}\
             {REQUEST_LENGTH_FIELD}{address:02X}{REQUEST_CHECKSUM}"
        )
        .as_bytes(),
    );
    tx_buffer.push(TERMINATOR);
    tx_buffer
}

/// Frame checksum: two's complement of the sum of the ASCII codes of `body`
/// (uppercase form), modulo 0x10000.
pub fn frame_checksum(body: &str) -> u16 {
    let sum = body
        .bytes()
        .fold(0u16, |acc, b| acc.wrapping_add(b.to_ascii_uppercase() as u16));
    (!sum).wrapping_add(1)
}

/// LENCHK nibble: two's complement of the sum of the three LENID nibbles, modulo 16.
pub fn length_checksum(info_len_chars: u16) -> u8 {
    let sum = (info_len_chars & 0xF)
        + ((info_len_chars >> 4) & 0xF)
        + ((info_len_chars >> 8) & 0xF);
    ((!sum).wrapping_add(1) & 0xF) as u8
}

/// Builds the 4 hex char length field for an INFO block of `info_len_chars`.
pub fn length_field(info_len_chars: u16) -> String {
    let lenid = info_len_chars & INFO_LENGTH_MASK;
    format!("{:X}{:03X}", length_checksum(lenid), lenid)
}

/// Interprets the low `bits` of `value` as a two's-complement number.
///
/// Only 8 and 16 bit fields occur on the wire.
pub fn twos_complement(value: u32, bits: u32) -> i32 {
    let sign_bit = 1u32 << (bits - 1);
    if value & sign_bit != 0 {
        (value as i64 - (1i64 << bits)) as i32
    } else {
        value as i32
    }
}

/// A 16 bit field whose meaning is vendor specific; kept as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawWord(pub u16);

/// An 8 bit field whose meaning is vendor specific; kept as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawByte(pub u8);

impl fmt::Display for RawWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl fmt::Debug for RawWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl Serialize for RawWord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for RawByte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl fmt::Debug for RawByte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl Serialize for RawByte {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Sequential reader over the INFO block. Every read advances by the field width.
struct InfoCursor<'a> {
    block: &'a str,
    position: usize,
}

impl<'a> InfoCursor<'a> {
    fn new(block: &'a str) -> Self {
        Self { block, position: 0 }
    }

    fn take(&mut self, field: &'static str, width: usize) -> Result<&'a str, DecodeError> {
        let end = self.position + width;
        if end > self.block.len() {
            log::warn!(
                "Read beyond INFO block - field={} needed={} position={} available={}",
                field,
                width,
                self.position,
                self.block.len()
            );
            return Err(DecodeError::TruncatedField {
                field,
                needed: width,
                position: self.position,
                available: self.block.len(),
            });
        }
        let segment = &self.block[self.position..end];
        log::trace!("{} @{}: {}", field, self.position, segment);
        self.position = end;
        Ok(segment)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        let position = HEADER_CHARS + LENGTH_CHARS + self.position;
        u8::from_str_radix(self.take(field, 2)?, 16)
            .map_err(|_| DecodeError::InvalidHex { position })
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let position = HEADER_CHARS + LENGTH_CHARS + self.position;
        u16::from_str_radix(self.take(field, 4)?, 16)
            .map_err(|_| DecodeError::InvalidHex { position })
    }

    fn i16(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        Ok(twos_complement(self.u16(field)? as u32, 16))
    }

    fn scaled(&mut self, field: &'static str, divisor: f64) -> Result<f64, DecodeError> {
        Ok(self.u16(field)? as f64 / divisor)
    }

    fn scaled_signed(&mut self, field: &'static str, divisor: f64) -> Result<f64, DecodeError> {
        Ok(self.i16(field)? as f64 / divisor)
    }
}

macro_rules! status_words {
    ($($field:ident),+ $(,)?) => {
        /// The fixed block of status words following the cycle count.
        /// Bit level meaning is vendor specific and not interpreted here.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct StatusWords {
            $(pub $field: RawWord,)+
        }

        impl StatusWords {
            pub const COUNT: usize = [$(stringify!($field)),+].len();

            fn decode(cursor: &mut InfoCursor<'_>) -> Result<Self, DecodeError> {
                Ok(Self {
                    $($field: RawWord(cursor.u16(stringify!($field))?),)+
                })
            }

            /// Name and value of every word, in wire order.
            pub fn iter(&self) -> impl Iterator<Item = (&'static str, RawWord)> {
                [$((stringify!($field), self.$field)),+].into_iter()
            }
        }
    };
}

status_words!(
    voltage_status,
    current_status,
    temperature_status,
    alarm_status,
    fet_status,
    overvoltage_protection_low,
    undervoltage_protection_low,
    overvoltage_alarm_low,
    undervoltage_alarm_low,
    cell_balance_low,
    cell_balance_high,
    overvoltage_protection_high,
    undervoltage_protection_high,
    overvoltage_alarm_high,
    undervoltage_alarm_high,
);

/// Coarse direction of energy flow, derived from the pack current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryStatus {
    Charging,
    Discharging,
    Idle,
}

impl BatteryStatus {
    pub fn from_current(current_a: f64) -> Self {
        if current_a > CURRENT_DEADBAND_A {
            BatteryStatus::Charging
        } else if current_a < -CURRENT_DEADBAND_A {
            BatteryStatus::Discharging
        } else {
            BatteryStatus::Idle
        }
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatteryStatus::Charging => write!(f, "charging"),
            BatteryStatus::Discharging => write!(f, "discharging"),
            BatteryStatus::Idle => write!(f, "idle"),
        }
    }
}

/// One decoded Service 42 response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub version: u8,
    pub address: u8,
    pub command: u8,
    pub return_code: u8,
    pub info_len_chars: usize,
    pub length_checksum_valid: bool,
    pub data_flag: RawByte,
    pub soc_percent: f64,
    pub pack_voltage_v: f64,
    pub cell_voltages_v: Vec<f64>,
    pub ambient_temp_c: f64,
    pub pack_avg_temp_c: f64,
    pub mos_temp_c: f64,
    pub cell_temps_c: Vec<f64>,
    /// positive=charging, negative=discharging
    pub pack_current_a: f64,
    pub pack_internal_resistance_mohm: f64,
    /// Reported unscaled by the device.
    pub soh_percent: u16,
    pub user_defined: u8,
    pub full_charge_capacity_ah: f64,
    pub remaining_capacity_ah: f64,
    pub cycle_count: u16,
    pub status: StatusWords,
    pub machine_status: RawByte,
    pub io_status: RawWord,
    pub checksum: RawWord,
    pub checksum_valid: bool,
}

fn hex_u8(hex: &str) -> u8 {
    // callers only pass validated 2 char hex slices
    u8::from_str_radix(hex, 16).unwrap_or_default()
}

impl DeviceReading {
    /// Decodes the ASCII hex payload of a response, without the `~` marker
    /// and the terminator. Hex digits may be upper or lower case.
    pub fn decode(payload: &str) -> std::result::Result<Self, DecodeError> {
        if let Some(position) = payload.bytes().position(|b| !b.is_ascii_hexdigit()) {
            log::warn!("Invalid hex character at position {}", position);
            return Err(DecodeError::InvalidHex { position });
        }
        if payload.len() < HEADER_CHARS + LENGTH_CHARS {
            return Err(DecodeError::TruncatedHeader {
                length: payload.len(),
            });
        }

        let version = hex_u8(&payload[0..2]);
        let address = hex_u8(&payload[2..4]);
        let command = hex_u8(&payload[4..6]);
        let return_code = hex_u8(&payload[6..8]);
        if return_code != 0 {
            log::debug!("Device {:02X} answered with return code {:02X}", address, return_code);
        }

        let length_raw = u16::from_str_radix(&payload[8..12], 16)
            .map_err(|_| DecodeError::InvalidHex { position: 8 })?;
        let lenid = length_raw & INFO_LENGTH_MASK;
        let info_len_chars = lenid as usize;
        let length_checksum_valid = (length_raw >> 12) as u8 == length_checksum(lenid);

        let expected = HEADER_CHARS + LENGTH_CHARS + info_len_chars + CHECKSUM_CHARS;
        if payload.len() != expected {
            log::warn!(
                "Length mismatch - info_len_chars={} expected={} received={}",
                info_len_chars,
                expected,
                payload.len()
            );
            return Err(DecodeError::LengthMismatch {
                info_len_chars,
                expected,
                actual: payload.len(),
            });
        }
        if !length_checksum_valid {
            log::warn!("Invalid length checksum nibble in {}", &payload[8..12]);
        }

        let info_start = HEADER_CHARS + LENGTH_CHARS;
        let info_end = info_start + info_len_chars;
        let checksum = u16::from_str_radix(&payload[info_end..], 16)
            .map_err(|_| DecodeError::InvalidHex { position: info_end })?;
        let calculated = frame_checksum(&payload[..info_end]);
        let checksum_valid = calculated == checksum;
        if !checksum_valid {
            log::warn!(
                "Invalid checksum - calculated={:04X} received={:04X}",
                calculated,
                checksum
            );
        }

        let mut info = InfoCursor::new(&payload[info_start..info_end]);

        let data_flag = RawByte(info.u8("data_flag")?);
        let soc_percent = info.scaled("soc", 100.0)?;
        let pack_voltage_v = info.scaled("pack_voltage", 100.0)?;

        let cell_count = info.u8("cell_count")?;
        let cell_voltages_v = (0..cell_count)
            .map(|_| info.scaled("cell_voltage", 1000.0))
            .collect::<Result<Vec<_>, _>>()?;

        let ambient_temp_c = info.scaled_signed("ambient_temp", 10.0)?;
        let pack_avg_temp_c = info.scaled_signed("pack_avg_temp", 10.0)?;
        let mos_temp_c = info.scaled_signed("mos_temp", 10.0)?;

        let sensor_count = info.u8("temp_sensor_count")?;
        let cell_temps_c = (0..sensor_count)
            .map(|_| info.scaled_signed("cell_temp", 10.0))
            .collect::<Result<Vec<_>, _>>()?;

        let pack_current_a = info.scaled_signed("pack_current", 100.0)?;
        let pack_internal_resistance_mohm = info.scaled("internal_resistance", 10.0)?;
        let soh_percent = info.u16("soh")?;
        let user_defined = info.u8("user_defined")?;
        let full_charge_capacity_ah = info.scaled("full_charge_capacity", 100.0)?;
        let remaining_capacity_ah = info.scaled("remaining_capacity", 100.0)?;
        let cycle_count = info.u16("cycle_count")?;
        let status = StatusWords::decode(&mut info)?;
        let machine_status = RawByte(info.u8("machine_status")?);
        let io_status = RawWord(info.u16("io_status")?);

        if info.position != info_len_chars {
            log::warn!(
                "Field table mismatch - INFO block {} chars, consumed {}",
                info_len_chars,
                info.position
            );
            return Err(DecodeError::FieldCountMismatch {
                expected: info_len_chars,
                consumed: info.position,
            });
        }

        Ok(Self {
            version,
            address,
            command,
            return_code,
            info_len_chars,
            length_checksum_valid,
            data_flag,
            soc_percent,
            pack_voltage_v,
            cell_voltages_v,
            ambient_temp_c,
            pack_avg_temp_c,
            mos_temp_c,
            cell_temps_c,
            pack_current_a,
            pack_internal_resistance_mohm,
            soh_percent,
            user_defined,
            full_charge_capacity_ah,
            remaining_capacity_ah,
            cycle_count,
            status,
            machine_status,
            io_status,
            checksum: RawWord(checksum),
            checksum_valid,
        })
    }

    pub fn power_w(&self) -> f64 {
        self.pack_voltage_v * self.pack_current_a
    }

    pub fn min_cell_voltage_v(&self) -> Option<f64> {
        self.cell_voltages_v.iter().copied().reduce(f64::min)
    }

    pub fn max_cell_voltage_v(&self) -> Option<f64> {
        self.cell_voltages_v.iter().copied().reduce(f64::max)
    }

    pub fn cell_voltage_diff_v(&self) -> Option<f64> {
        Some(self.max_cell_voltage_v()? - self.min_cell_voltage_v()?)
    }

    pub fn status(&self) -> BatteryStatus {
        BatteryStatus::from_current(self.pack_current_a)
    }
}
