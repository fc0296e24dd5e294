//! Combines the readings of one polling cycle into a single virtual battery.

use crate::protocol::BatteryStatus;
use crate::reader::DeviceSample;
use serde::{Deserialize, Serialize};

/// Name of the composite device when none is configured.
pub const DEFAULT_NAME: &str = "Battery Bank";

/// How pack voltages of the physical batteries combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoltagePolicy {
    /// Batteries wired in series: voltages add up.
    #[default]
    Series,
    /// Batteries wired in parallel: the bank sits at the mean voltage.
    Parallel,
}

/// Aggregate of every device that answered in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeReading {
    pub name: String,
    pub soc_percent: f64,
    pub pack_voltage_v: f64,
    pub pack_current_a: f64,
    /// Always `pack_voltage_v * pack_current_a`.
    pub power_w: f64,
    pub remaining_capacity_ah: f64,
    pub full_charge_capacity_ah: f64,
    pub temperature_c: f64,
    pub cell_voltages_v: Vec<f64>,
    pub min_cell_voltage_v: f64,
    pub max_cell_voltage_v: f64,
    pub cell_voltage_diff_v: f64,
    pub cycle_count: u16,
    pub device_count: usize,
    pub devices: Vec<String>,
    pub status: BatteryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualBattery {
    name: String,
    policy: VoltagePolicy,
}

impl Default for VirtualBattery {
    fn default() -> Self {
        Self::new(DEFAULT_NAME, VoltagePolicy::default())
    }
}

/// Mean of the finite values, 0 when there are none.
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Charge mean. A pack reporting 0% has no usable SOC and is left out.
fn soc_mean(values: impl Iterator<Item = f64>) -> f64 {
    mean(values.filter(|v| *v != 0.0))
}

impl VirtualBattery {
    pub fn new(name: impl Into<String>, policy: VoltagePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> VoltagePolicy {
        self.policy
    }

    /// Builds the composite from scratch. `None` when no device answered.
    pub fn aggregate(&self, samples: &[DeviceSample]) -> Option<CompositeReading> {
        if samples.is_empty() {
            log::debug!("{}: no readings to aggregate", self.name);
            return None;
        }
        let readings = || samples.iter().map(|s| &s.reading);

        let pack_voltage_v: f64 = match self.policy {
            VoltagePolicy::Series => readings().map(|r| r.pack_voltage_v).sum(),
            VoltagePolicy::Parallel => mean(readings().map(|r| r.pack_voltage_v)),
        };
        let pack_current_a: f64 = readings().map(|r| r.pack_current_a).sum();

        let cell_voltages_v: Vec<f64> = readings()
            .flat_map(|r| r.cell_voltages_v.iter().copied())
            .collect();
        let (min_cell_voltage_v, max_cell_voltage_v) = cell_voltages_v
            .iter()
            .copied()
            .fold(None, |range: Option<(f64, f64)>, v| match range {
                Some((min, max)) => Some((min.min(v), max.max(v))),
                None => Some((v, v)),
            })
            .unwrap_or((0.0, 0.0));

        let composite = CompositeReading {
            name: self.name.clone(),
            soc_percent: soc_mean(readings().map(|r| r.soc_percent)),
            pack_voltage_v,
            pack_current_a,
            power_w: pack_voltage_v * pack_current_a,
            remaining_capacity_ah: readings().map(|r| r.remaining_capacity_ah).sum(),
            full_charge_capacity_ah: readings().map(|r| r.full_charge_capacity_ah).sum(),
            temperature_c: mean(readings().map(|r| r.pack_avg_temp_c)),
            min_cell_voltage_v,
            max_cell_voltage_v,
            cell_voltage_diff_v: max_cell_voltage_v - min_cell_voltage_v,
            cell_voltages_v,
            cycle_count: readings().map(|r| r.cycle_count).max().unwrap_or(0),
            device_count: samples.len(),
            devices: samples
                .iter()
                .map(|s| s.identity.name().to_string())
                .collect(),
            status: BatteryStatus::from_current(pack_current_a),
        };
        log::debug!(
            "{}: {} devices, {:.2}V {:.2}A {:.1}W",
            composite.name,
            composite.device_count,
            composite.pack_voltage_v,
            composite.pack_current_a,
            composite.power_w
        );
        Some(composite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceReading;
    use crate::reader::DeviceIdentity;
    use std::time::Duration;

    const DEVICE_FRAME: &str = "22014A00E0C60118FE14BC100CF40CF40CF00CF20CF30CF60D020CF50CF50CFF0CF50CF40CF80CF90CFA0CF000E600C800D20400C800C800C800C800000000006400294A1A6B003F000000000000000000230000000000000000000000000000000000000000000000D3EF";

    fn sample(name: &str, voltage: f64, current: f64) -> DeviceSample {
        let mut reading = DeviceReading::decode(DEVICE_FRAME).unwrap();
        reading.pack_voltage_v = voltage;
        reading.pack_current_a = current;
        DeviceSample {
            identity: DeviceIdentity::new(name, "/dev/ttyUSB0", 1, 9600, Duration::from_secs(1))
                .unwrap(),
            reading,
        }
    }

    #[test]
    fn empty_cycle_has_no_composite() {
        assert_eq!(VirtualBattery::default().aggregate(&[]), None);
    }

    #[test]
    fn series_bank_sums_voltage() {
        let samples = [sample("a", 53.08, 1.0), sample("b", 52.90, -0.5)];
        let composite = VirtualBattery::default().aggregate(&samples).unwrap();
        assert!((composite.pack_voltage_v - 105.98).abs() < 1e-9);
        assert!((composite.pack_current_a - 0.5).abs() < 1e-9);
        assert_eq!(composite.status, BatteryStatus::Charging);
        assert_eq!(
            composite.power_w,
            composite.pack_voltage_v * composite.pack_current_a
        );
        assert_eq!(composite.device_count, 2);
        assert_eq!(composite.devices, vec!["a", "b"]);
        assert_eq!(composite.name, DEFAULT_NAME);
    }

    #[test]
    fn parallel_bank_averages_voltage() {
        let samples = [sample("a", 53.0, -10.0), sample("b", 52.0, -10.0)];
        let battery = VirtualBattery::new("Rack", VoltagePolicy::Parallel);
        let composite = battery.aggregate(&samples).unwrap();
        assert!((composite.pack_voltage_v - 52.5).abs() < 1e-9);
        assert!((composite.pack_current_a + 20.0).abs() < 1e-9);
        assert_eq!(composite.status, BatteryStatus::Discharging);
        assert_eq!(composite.power_w, composite.pack_voltage_v * composite.pack_current_a);
    }

    #[test]
    fn capacities_cycles_and_cells() {
        let mut first = sample("a", 53.0, 0.0);
        let mut second = sample("b", 53.0, 0.05);
        second.reading.cycle_count = 120;
        second.reading.soc_percent = 40.0;
        second.reading.pack_avg_temp_c = 30.0;
        second.reading.cell_voltages_v = vec![3.2, 3.45];
        first.reading.cell_voltages_v = vec![3.3, 3.31];
        let composite = VirtualBattery::default()
            .aggregate(&[first.clone(), second])
            .unwrap();

        assert_eq!(composite.cycle_count, 120);
        assert!((composite.remaining_capacity_ah - 2.0 * 67.63).abs() < 1e-9);
        assert!((composite.full_charge_capacity_ah - 2.0 * 105.7).abs() < 1e-9);
        assert!((composite.soc_percent - (63.98 + 40.0) / 2.0).abs() < 1e-9);
        assert!((composite.temperature_c - 25.0).abs() < 1e-9);
        assert_eq!(composite.cell_voltages_v, vec![3.3, 3.31, 3.2, 3.45]);
        assert_eq!(composite.min_cell_voltage_v, 3.2);
        assert_eq!(composite.max_cell_voltage_v, 3.45);
        assert!((composite.cell_voltage_diff_v - 0.25).abs() < 1e-9);
        assert_eq!(composite.status, BatteryStatus::Idle);
        assert_eq!(first.reading.cycle_count, 63);
    }

    #[test]
    fn non_finite_values_are_skipped_in_means() {
        let mut first = sample("a", 53.0, 0.0);
        first.reading.soc_percent = f64::NAN;
        let second = sample("b", 53.0, 0.0);
        let composite = VirtualBattery::default().aggregate(&[first, second]).unwrap();
        assert!((composite.soc_percent - 63.98).abs() < 1e-9);
    }

    #[test]
    fn zero_soc_is_skipped() {
        let mut first = sample("a", 53.0, 0.0);
        first.reading.soc_percent = 80.0;
        let mut second = sample("b", 53.0, 0.0);
        second.reading.soc_percent = 0.0;
        second.reading.pack_avg_temp_c = 0.0;
        let composite = VirtualBattery::default()
            .aggregate(&[first.clone(), second.clone()])
            .unwrap();
        assert!((composite.soc_percent - 80.0).abs() < 1e-9);
        // temperature keeps a real 0 °C
        assert!((composite.temperature_c - first.reading.pack_avg_temp_c / 2.0).abs() < 1e-9);

        first.reading.soc_percent = 0.0;
        let composite = VirtualBattery::default().aggregate(&[first, second]).unwrap();
        assert_eq!(composite.soc_percent, 0.0);
    }

    #[test]
    fn no_cells_gives_zero_range() {
        let mut only = sample("a", 53.0, 0.0);
        only.reading.cell_voltages_v.clear();
        let composite = VirtualBattery::default().aggregate(&[only]).unwrap();
        assert_eq!(composite.min_cell_voltage_v, 0.0);
        assert_eq!(composite.max_cell_voltage_v, 0.0);
        assert_eq!(composite.cell_voltage_diff_v, 0.0);
    }
}
