#![cfg_attr(docsrs, feature(doc_cfg))]
//! # darenbms_lib
//!
//! This crate provides a library for polling Daren BMS (Battery Management System) devices
//! over their ASCII-hex "Service 42" protocol on a shared RS485 bus.
//!
//! Readings of several batteries are combined into one virtual battery, and charge/discharge
//! energy is integrated into counters that persist across restarts.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `darenbms` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the serial [`transport::Transport`] using the `serialport` crate.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `darenbms` binary executable (`serialport`, CLI and MQTT crates).

/// Contains error types for the library.
mod error;
/// Frame layout, checksums and the Service 42 decoder.
pub mod protocol;
/// Link abstraction and terminator-delimited reads.
pub mod transport;
/// One request/response exchange per device.
pub mod reader;
/// Virtual battery built from the readings of one cycle.
pub mod aggregate;
/// Persistent energy counters.
pub mod energy;
/// Scan of serial ports and addresses for responding devices.
pub mod discovery;
/// YAML configuration of the monitor.
pub mod config;
/// Polling cycle.
pub mod monitor;
/// Records handed to telemetry sinks.
pub mod telemetry;

pub use error::{DecodeError, Error, PersistenceError};

/// Serial port transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
