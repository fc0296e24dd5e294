use anyhow::{bail, Context, Result};
use darenbms_lib::config::MonitorConfig;
use darenbms_lib::energy::{EnergyIntegrator, EnergyStore};
use darenbms_lib::monitor::Monitor;
use darenbms_lib::serialport::SerialTransport;
use darenbms_lib::telemetry::{self, TelemetryRecord, TelemetrySink};
use darenbms_lib::transport::Transport;
use log::{info, warn};
use std::time::{Duration, Instant};

use crate::shutdown::{self, Shutdown};
use crate::{commandline, mqtt};

/// Prints every record to the standard output.
struct ConsoleSink;

impl TelemetrySink for ConsoleSink {
    fn publish(
        &mut self,
        device_key: &str,
        record: &TelemetryRecord,
    ) -> Result<(), darenbms_lib::Error> {
        println!(
            "--- {device_key} at {} ---",
            chrono::Local::now().to_rfc3339()
        );
        for (key, value) in record {
            if let Some(text) = telemetry::state_payload(value) {
                println!("{key}: {text}");
            }
        }
        println!("--------------------------");
        Ok(())
    }
}

pub fn run(
    config: MonitorConfig,
    output: commandline::DaemonOutput,
    delay: Duration,
    cycles: Option<u64>,
) -> Result<()> {
    let devices = config.identities();
    if devices.is_empty() {
        bail!("No enabled device in the configuration");
    }
    info!(
        "Starting daemon mode: output={output:?}, interval={:?}, devices={}",
        config.poll_interval,
        devices.len()
    );

    let store = EnergyStore::resolve(config.energy_storage.as_deref());
    info!("Energy counters stored in {:?}", store.path());
    let energy = EnergyIntegrator::open(store);

    let mut transport = SerialTransport::new();
    transport.set_delay(delay);
    let mut monitor = Monitor::new(transport, devices, config.virtual_battery(), energy);

    let mut sink: Box<dyn TelemetrySink> = match &output {
        commandline::DaemonOutput::Console => Box::new(ConsoleSink),
        commandline::DaemonOutput::Mqtt { config_file } => {
            let mqtt_config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {mqtt_config:?}");
            let publisher = mqtt::MqttPublisher::new(mqtt_config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Box::new(publisher)
        }
    };

    let shutdown = Shutdown::new();
    shutdown::listen(shutdown.clone())?;
    poll_loop(
        &mut monitor,
        sink.as_mut(),
        config.poll_interval,
        cycles,
        &shutdown,
    );
    Ok(())
}

/// Polls until `shutdown` is requested or `cycles` cycles completed.
/// Returns the number of completed cycles.
fn poll_loop<T: Transport>(
    monitor: &mut Monitor<T>,
    sink: &mut dyn TelemetrySink,
    poll_interval: Duration,
    cycles: Option<u64>,
    shutdown: &Shutdown,
) -> u64 {
    let mut completed = 0u64;
    loop {
        let started = Instant::now();
        let report = monitor.poll_cycle(shutdown.flag());
        if report.cancelled {
            break;
        }
        let published = report.publish(sink);
        info!("Published {published} record(s)");

        completed += 1;
        if cycles.is_some_and(|limit| completed >= limit) {
            info!("Stopping after {completed} cycle(s)");
            break;
        }
        let elapsed = started.elapsed();
        if elapsed >= poll_interval {
            warn!("Cycle took {elapsed:?}, longer than the poll interval");
            if shutdown.is_requested() {
                break;
            }
        } else if shutdown.wait(poll_interval - elapsed) {
            break;
        }
    }
    info!("Polling stopped after {completed} cycle(s)");
    completed
}
