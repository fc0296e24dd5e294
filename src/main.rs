use anyhow::{Context, Result};
use clap::Parser;
use darenbms_lib::config::MonitorConfig;
use darenbms_lib::discovery::{self, DiscoveryReport, FsAliasResolver, Scanner};
use darenbms_lib::energy::{EnergyIntegrator, EnergyStore};
use darenbms_lib::reader::{DeviceIdentity, DeviceReader};
use darenbms_lib::serialport::SerialTransport;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;
mod shutdown;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut transport = SerialTransport::new();
    transport.set_delay(args.delay);

    match args.command {
        CliCommands::Read {
            device,
            address,
            baud_rate,
            timeout,
        } => {
            let identity = DeviceIdentity::new(
                format!("Battery_{address}"),
                device.as_str(),
                u32::from(address),
                baud_rate,
                timeout,
            )?;
            let sample = DeviceReader::new(transport)
                .read(&identity)
                .into_result()
                .with_context(|| format!("Cannot read address {address} on '{device}'"))?;
            if !sample.reading.checksum_valid {
                warn!("Frame checksum mismatch, values may be corrupt");
            }
            println!("{}", serde_json::to_string_pretty(&sample.reading)?);
        }
        CliCommands::Daemon {
            config,
            cycles,
            output,
        } => {
            let monitor_config = MonitorConfig::load(&config)
                .with_context(|| format!("Cannot load monitor config '{config}'"))?;
            daemon::run(monitor_config, output, args.delay, cycles)?;
        }
        CliCommands::Discover {
            ports,
            from,
            to,
            timeout,
            output_dir,
        } => {
            let scanner = Scanner::new(from..=to, timeout)?;
            let endpoints = discovery::candidate_endpoints(&FsAliasResolver, &ports);
            if endpoints.is_empty() {
                warn!("No serial ports found to scan.");
            }
            let found = scanner.scan(&mut DeviceReader::new(transport), &endpoints);
            let report = DiscoveryReport::new(found);
            report.write_artifacts(&output_dir);
            print!("{}", report.to_yaml()?);
        }
        CliCommands::ResetEnergy { storage, key } => {
            let store = EnergyStore::resolve(storage.as_deref());
            info!("Resetting '{key}' in {:?}", store.path());
            let integrator = EnergyIntegrator::open(store);
            let totals = integrator.reset(&key, chrono::Utc::now());
            println!("{}", serde_json::to_string_pretty(&totals)?);
        }
    }

    Ok(())
}
