//! Flat key/value records handed to a telemetry sink once per cycle.

use crate::aggregate::CompositeReading;
use crate::energy::EnergyTotals;
use crate::reader::DeviceSample;
use crate::Error;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Energy key and record key of the composite device.
pub const VIRTUAL_BATTERY_KEY: &str = "_virtual_battery";
/// Device id suffix the composite publishes under.
pub const VIRTUAL_BATTERY_SLUG: &str = "virtual";

pub type TelemetryRecord = BTreeMap<String, Value>;

/// Receives the records of one cycle. How they are published is up to the sink.
pub trait TelemetrySink {
    fn publish(&mut self, device_key: &str, record: &TelemetryRecord) -> Result<(), Error>;
}

/// How a record key is presented as a Home Assistant sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensor {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub icon: &'static str,
}

macro_rules! sensor {
    ($key:literal, $name:literal, $unit:expr, $class:expr, $state:expr, $icon:literal) => {
        Sensor {
            key: $key,
            name: $name,
            unit: $unit,
            device_class: $class,
            state_class: $state,
            icon: $icon,
        }
    };
}

const MEASUREMENT: Option<&str> = Some("measurement");
const TOTAL_INCREASING: Option<&str> = Some("total_increasing");

/// Sensors shared by devices and the composite.
pub const SENSORS: &[Sensor] = &[
    sensor!("soc", "SOC", Some("%"), Some("battery"), MEASUREMENT, "mdi:battery"),
    sensor!(
        "pack_voltage",
        "Pack Voltage",
        Some("V"),
        Some("voltage"),
        MEASUREMENT,
        "mdi:lightning-bolt"
    ),
    sensor!(
        "pack_current",
        "Pack Current",
        Some("A"),
        Some("current"),
        MEASUREMENT,
        "mdi:current-dc"
    ),
    sensor!("power", "Power", Some("W"), Some("power"), MEASUREMENT, "mdi:flash"),
    sensor!(
        "remaining_capacity",
        "Remaining Capacity",
        Some("Ah"),
        None,
        MEASUREMENT,
        "mdi:battery-charging"
    ),
    sensor!("full_capacity", "Full Capacity", Some("Ah"), None, MEASUREMENT, "mdi:battery"),
    sensor!(
        "temperature",
        "Temperature",
        Some("°C"),
        Some("temperature"),
        MEASUREMENT,
        "mdi:thermometer"
    ),
    sensor!(
        "min_cell_voltage",
        "Min Cell Voltage",
        Some("V"),
        Some("voltage"),
        MEASUREMENT,
        "mdi:battery-low"
    ),
    sensor!(
        "max_cell_voltage",
        "Max Cell Voltage",
        Some("V"),
        Some("voltage"),
        MEASUREMENT,
        "mdi:battery-high"
    ),
    sensor!(
        "cell_voltage_diff",
        "Cell Voltage Difference",
        Some("V"),
        Some("voltage"),
        MEASUREMENT,
        "mdi:battery-alert"
    ),
    sensor!("cycle_count", "Cycle Count", None, None, TOTAL_INCREASING, "mdi:counter"),
    sensor!("status", "Status", None, None, None, "mdi:information"),
    sensor!(
        "energy_in_total",
        "Energy In Total",
        Some("kWh"),
        Some("energy"),
        TOTAL_INCREASING,
        "mdi:battery-arrow-down"
    ),
    sensor!(
        "energy_out_total",
        "Energy Out Total",
        Some("kWh"),
        Some("energy"),
        TOTAL_INCREASING,
        "mdi:battery-arrow-up"
    ),
];

/// Additional sensors of the composite.
pub const VIRTUAL_SENSORS: &[Sensor] = &[
    sensor!("battery_count", "Battery Count", None, None, MEASUREMENT, "mdi:counter"),
    sensor!("connected_batteries", "Connected Batteries", None, None, None, "mdi:battery-outline"),
];

/// Sensors published for a record key.
pub fn sensors_for(device_key: &str) -> impl Iterator<Item = &'static Sensor> {
    let extra: &'static [Sensor] = if device_key == VIRTUAL_BATTERY_KEY {
        VIRTUAL_SENSORS
    } else {
        &[]
    };
    SENSORS.iter().chain(extra)
}

/// Plain-text state of one record value: floats rounded to 3 decimals,
/// lists joined with ", ". `None` for null.
pub fn state_payload(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(|f| ((f * 1000.0).round() / 1000.0).to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(state_payload)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        other => Some(other.to_string()),
    }
}

/// Topic-safe identifier derived from a display name.
pub fn slug(name: &str) -> String {
    name.trim().to_lowercase().replace(char::is_whitespace, "_")
}

fn insert(record: &mut TelemetryRecord, key: &str, value: Value) {
    record.insert(key.to_string(), value);
}

fn insert_energy(record: &mut TelemetryRecord, energy: Option<EnergyTotals>) {
    if let Some(energy) = energy {
        insert(record, "energy_in_total", json!(energy.energy_in_kwh));
        insert(record, "energy_out_total", json!(energy.energy_out_kwh));
    }
}

pub fn device_record(sample: &DeviceSample, energy: Option<EnergyTotals>) -> TelemetryRecord {
    let reading = &sample.reading;
    let mut record = TelemetryRecord::new();
    insert(&mut record, "name", json!(sample.identity.name()));
    insert(&mut record, "soc", json!(reading.soc_percent));
    insert(&mut record, "pack_voltage", json!(reading.pack_voltage_v));
    insert(&mut record, "pack_current", json!(reading.pack_current_a));
    insert(&mut record, "power", json!(reading.power_w()));
    insert(&mut record, "remaining_capacity", json!(reading.remaining_capacity_ah));
    insert(&mut record, "full_capacity", json!(reading.full_charge_capacity_ah));
    insert(&mut record, "temperature", json!(reading.pack_avg_temp_c));
    if let (Some(min), Some(max)) = (reading.min_cell_voltage_v(), reading.max_cell_voltage_v()) {
        insert(&mut record, "min_cell_voltage", json!(min));
        insert(&mut record, "max_cell_voltage", json!(max));
        insert(&mut record, "cell_voltage_diff", json!(max - min));
    }
    insert(&mut record, "cycle_count", json!(reading.cycle_count));
    insert(&mut record, "status", json!(reading.status().to_string()));
    insert_energy(&mut record, energy);
    record
}

pub fn composite_record(
    composite: &CompositeReading,
    energy: Option<EnergyTotals>,
) -> TelemetryRecord {
    let mut record = TelemetryRecord::new();
    insert(&mut record, "name", json!(composite.name));
    insert(&mut record, "soc", json!(composite.soc_percent));
    insert(&mut record, "pack_voltage", json!(composite.pack_voltage_v));
    insert(&mut record, "pack_current", json!(composite.pack_current_a));
    insert(&mut record, "power", json!(composite.power_w));
    insert(&mut record, "remaining_capacity", json!(composite.remaining_capacity_ah));
    insert(&mut record, "full_capacity", json!(composite.full_charge_capacity_ah));
    insert(&mut record, "temperature", json!(composite.temperature_c));
    insert(&mut record, "min_cell_voltage", json!(composite.min_cell_voltage_v));
    insert(&mut record, "max_cell_voltage", json!(composite.max_cell_voltage_v));
    insert(&mut record, "cell_voltage_diff", json!(composite.cell_voltage_diff_v));
    insert(&mut record, "cycle_count", json!(composite.cycle_count));
    insert(&mut record, "status", json!(composite.status.to_string()));
    insert(&mut record, "battery_count", json!(composite.device_count));
    insert(&mut record, "connected_batteries", json!(composite.devices));
    insert_energy(&mut record, energy);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::VirtualBattery;
    use crate::protocol::DeviceReading;
    use crate::reader::DeviceIdentity;
    use std::time::Duration;

    const DEVICE_FRAME: &str = "22014A00E0C60118FE14BC100CF40CF40CF00CF20CF30CF60D020CF50CF50CFF0CF50CF40CF80CF90CFA0CF000E600C800D20400C800C800C800C800000000006400294A1A6B003F000000000000000000230000000000000000000000000000000000000000000000D3EF";

    fn sample() -> DeviceSample {
        DeviceSample {
            identity: DeviceIdentity::new(
                "Battery_1",
                "/dev/ttyUSB0",
                1,
                9600,
                Duration::from_secs(1),
            )
            .unwrap(),
            reading: DeviceReading::decode(DEVICE_FRAME).unwrap(),
        }
    }

    #[test]
    fn device_record_has_every_sensor() {
        let energy = EnergyTotals {
            energy_in_kwh: 1.25,
            energy_out_kwh: 0.5,
        };
        let record = device_record(&sample(), Some(energy));
        for sensor in SENSORS {
            assert!(record.contains_key(sensor.key), "missing {}", sensor.key);
        }
        assert_eq!(record["status"], json!("idle"));
        assert_eq!(record["cycle_count"], json!(63));
        assert_eq!(record["energy_in_total"], json!(1.25));
    }

    #[test]
    fn composite_record_lists_devices() {
        let composite = VirtualBattery::default().aggregate(&[sample()]).unwrap();
        let record = composite_record(&composite, None);
        for sensor in sensors_for(VIRTUAL_BATTERY_KEY) {
            if !sensor.key.starts_with("energy_") {
                assert!(record.contains_key(sensor.key), "missing {}", sensor.key);
            }
        }
        assert!(!record.contains_key("energy_in_total"));
        assert_eq!(record["connected_batteries"], json!(["Battery_1"]));
        assert_eq!(record["battery_count"], json!(1));
    }

    #[test]
    fn state_payload_formatting() {
        assert_eq!(state_payload(&json!(53.08123)), Some("53.081".into()));
        assert_eq!(state_payload(&json!(63)), Some("63".into()));
        assert_eq!(state_payload(&json!("idle")), Some("idle".into()));
        assert_eq!(state_payload(&json!(["a", "b"])), Some("a, b".into()));
        assert_eq!(state_payload(&Value::Null), None);
    }

    #[test]
    fn virtual_battery_has_extra_sensors() {
        assert_eq!(sensors_for("Battery_1").count(), SENSORS.len());
        assert_eq!(
            sensors_for(VIRTUAL_BATTERY_KEY).count(),
            SENSORS.len() + VIRTUAL_SENSORS.len()
        );
        assert_eq!(slug(" Battery Bank "), "battery_bank");
    }
}
