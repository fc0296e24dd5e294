use crate::aggregate::{CompositeReading, VirtualBattery};
use crate::energy::{EnergyIntegrator, EnergyTotals};
use crate::reader::{DeviceIdentity, DeviceReader, DeviceSample, ReadOutcome};
use crate::telemetry::{self, TelemetryRecord, TelemetrySink, VIRTUAL_BATTERY_KEY};
use crate::transport::Transport;
use crate::Error;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A device left out of a cycle and why.
#[derive(Debug)]
pub struct Skipped {
    pub name: String,
    pub reason: Error,
}

/// Everything one polling cycle produced.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub samples: Vec<DeviceSample>,
    pub composite: Option<CompositeReading>,
    /// Totals after this cycle's update, keyed like the energy store.
    pub energy: BTreeMap<String, EnergyTotals>,
    pub skipped: Vec<Skipped>,
    /// Shutdown was requested before every device was read.
    pub cancelled: bool,
}

impl CycleReport {
    /// One record per device that answered, then the composite.
    pub fn records(&self) -> Vec<(String, TelemetryRecord)> {
        let mut records: Vec<_> = self
            .samples
            .iter()
            .map(|sample| {
                let key = sample.identity.name().to_string();
                let record = telemetry::device_record(sample, self.energy.get(&key).copied());
                (key, record)
            })
            .collect();
        if let Some(composite) = &self.composite {
            records.push((
                VIRTUAL_BATTERY_KEY.to_string(),
                telemetry::composite_record(
                    composite,
                    self.energy.get(VIRTUAL_BATTERY_KEY).copied(),
                ),
            ));
        }
        records
    }

    /// Hands every record to the sink. A failing record does not stop the rest.
    pub fn publish(&self, sink: &mut dyn TelemetrySink) -> usize {
        let mut published = 0;
        for (key, record) in self.records() {
            match sink.publish(&key, &record) {
                Ok(()) => published += 1,
                Err(err) => log::warn!("Publishing {key} failed: {err}"),
            }
        }
        published
    }
}

/// Reads the configured devices once per cycle, aggregates and integrates.
pub struct Monitor<T> {
    reader: DeviceReader<T>,
    devices: Vec<DeviceIdentity>,
    virtual_battery: Option<VirtualBattery>,
    energy: EnergyIntegrator,
}

impl<T: Transport> Monitor<T> {
    pub fn new(
        transport: T,
        devices: Vec<DeviceIdentity>,
        virtual_battery: Option<VirtualBattery>,
        energy: EnergyIntegrator,
    ) -> Self {
        Self {
            reader: DeviceReader::new(transport),
            devices,
            virtual_battery,
            energy,
        }
    }

    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.devices
    }

    pub fn energy(&self) -> &EnergyIntegrator {
        &self.energy
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.reader.transport_mut()
    }

    pub fn poll_cycle(&mut self, shutdown: &AtomicBool) -> CycleReport {
        self.poll_cycle_at(shutdown, Utc::now)
    }

    /// Like [`Monitor::poll_cycle`] with an explicit clock, sampled once per
    /// energy update.
    pub fn poll_cycle_at(
        &mut self,
        shutdown: &AtomicBool,
        mut now: impl FnMut() -> DateTime<Utc>,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        for identity in &self.devices {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("Shutdown requested, abandoning cycle");
                report.cancelled = true;
                return report;
            }
            match self.reader.read(identity) {
                ReadOutcome::Reading(sample) => report.samples.push(sample),
                outcome => {
                    if let Err(reason) = outcome.into_result() {
                        log::warn!("{}: skipped this cycle: {reason}", identity.name());
                        report.skipped.push(Skipped {
                            name: identity.name().to_string(),
                            reason,
                        });
                    }
                }
            }
        }

        if report.samples.is_empty() {
            log::warn!("No device answered this cycle");
            return report;
        }

        for sample in &report.samples {
            let key = sample.identity.name().to_string();
            let totals = self.energy.update(&key, sample.reading.power_w(), now());
            report.energy.insert(key, totals);
        }

        if let Some(battery) = &self.virtual_battery {
            report.composite = battery.aggregate(&report.samples);
            if let Some(composite) = &report.composite {
                let totals = self
                    .energy
                    .update(VIRTUAL_BATTERY_KEY, composite.power_w, now());
                report.energy.insert(VIRTUAL_BATTERY_KEY.to_string(), totals);
            }
        }

        log::info!(
            "Cycle done: {} of {} device(s) answered",
            report.samples.len(),
            self.devices.len()
        );
        report
    }
}
