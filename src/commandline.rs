use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use darenbms_lib::{config::MonitorConfig, reader};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(value: &str) -> Result<u8, String> {
    let address: u8 = value
        .parse()
        .map_err(|_| format!("'{value}' is not an address"))?;
    if reader::ADDRESS_RANGE.contains(&address) {
        Ok(address)
    } else {
        Err(format!(
            "address must be within {}..={}",
            reader::ADDRESS_RANGE.start(),
            reader::ADDRESS_RANGE.end()
        ))
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read one device once and print the decoded reading as JSON
    Read {
        /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,
        /// Bus address of the BMS (1..247)
        #[arg(short, long, value_parser = parse_address, default_value = "1")]
        address: u8,
        #[arg(long, default_value_t = reader::DEFAULT_BAUD_RATE)]
        baud_rate: u32,
        /// Timeout for the response (e.g., "500ms", "2s")
        #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
        timeout: Duration,
    },
    /// Run in daemon mode, polling every configured battery each interval
    Daemon {
        /// The monitor configuration file (devices, interval, virtual battery)
        #[arg(short, long, default_value_t = MonitorConfig::DEFAULT_CONFIG_FILE.to_string())]
        config: String,
        /// Stop after this many cycles instead of running until Ctrl+C or SIGTERM
        #[arg(long)]
        cycles: Option<u64>,
        /// Output destination for readings
        #[command(subcommand)]
        output: DaemonOutput,
    },
    /// Scan serial ports for responding batteries and write a configuration snippet
    Discover {
        /// Ports to scan; all serial ports of the machine when omitted
        #[arg(long, use_value_delimiter = true)]
        ports: Vec<String>,
        /// First address to probe
        #[arg(long, value_parser = parse_address, default_value = "1")]
        from: u8,
        /// Last address to probe
        #[arg(long, value_parser = parse_address, default_value = "16")]
        to: u8,
        /// Timeout per probe, clamped to 50ms..5s
        #[arg(value_parser = humantime::parse_duration, long, default_value = "300ms")]
        timeout: Duration,
        /// Directory receiving the discovery artifacts
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Zero the energy counters of one key (a battery name or the virtual battery)
    ResetEnergy {
        /// Energy counters file; default location when omitted
        #[arg(long)]
        storage: Option<PathBuf>,
        /// Counter key, e.g. "Battery_1" or "_virtual_battery"
        key: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read batteries and print them to the standard output (console).
    Console,
    /// Continuously read batteries and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

const fn about_text() -> &'static str {
    "daren bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between two requests on the bus (e.g., "15ms", "50ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, global = true, default_value = "15ms")]
    pub delay: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use darenbms_lib::discovery;

    #[test]
    fn discover_defaults() {
        let args = CliArgs::parse_from(["darenbms", "discover"]);
        assert_eq!(
            args.command,
            CliCommands::Discover {
                ports: vec![],
                from: *discovery::DEFAULT_ADDRESS_RANGE.start(),
                to: *discovery::DEFAULT_ADDRESS_RANGE.end(),
                timeout: discovery::DEFAULT_PROBE_TIMEOUT,
                output_dir: PathBuf::from("."),
            }
        );
    }

    #[test]
    fn daemon_with_mqtt_output() {
        let args = CliArgs::parse_from([
            "darenbms", "daemon", "--config", "bank.yaml", "--cycles", "2", "mqtt",
        ]);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                config: "bank.yaml".into(),
                cycles: Some(2),
                output: DaemonOutput::Mqtt {
                    config_file: mqtt::MqttConfig::DEFAULT_CONFIG_FILE.into()
                },
            }
        );
    }

    #[test]
    fn address_out_of_range_is_rejected() {
        assert!(CliArgs::try_parse_from(["darenbms", "read", "--address", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["darenbms", "read", "--address", "248"]).is_err());
        assert!(CliArgs::try_parse_from(["darenbms", "read", "--address", "247"]).is_ok());
    }
}
