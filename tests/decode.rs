mod common;

use common::{assert_close, PayloadBuilder};
use darenbms_lib::protocol::{frame_checksum, length_field, BatteryStatus, DeviceReading};
use darenbms_lib::DecodeError;

#[test]
fn encoded_fields_decode_to_the_same_values() {
    let builder = PayloadBuilder::default()
        .address(0x0C)
        .soc(57.31)
        .voltage(51.27)
        .current(-12.34)
        .cells(&[3.201, 3.215, 3.199, 3.250]);
    let reading = DeviceReading::decode(&builder.payload()).unwrap();

    assert_eq!(reading.address, 0x0C);
    assert!(reading.checksum_valid);
    assert!(reading.length_checksum_valid);
    assert_close(reading.soc_percent, 57.31);
    assert_close(reading.pack_voltage_v, 51.27);
    assert_close(reading.pack_current_a, -12.34);
    assert_eq!(reading.cell_voltages_v.len(), 4);
    for (decoded, expected) in reading.cell_voltages_v.iter().zip([3.201, 3.215, 3.199, 3.250]) {
        assert_close(*decoded, expected);
    }
    assert_close(reading.ambient_temp_c, 22.0);
    assert_close(reading.pack_avg_temp_c, 21.5);
    assert_close(reading.mos_temp_c, 23.0);
    assert_eq!(reading.cell_temps_c.len(), 4);
    assert_close(reading.cell_temps_c[3], -5.5);
    assert_close(reading.pack_internal_resistance_mohm, 1.5);
    assert_eq!(reading.soh_percent, 100);
    assert_close(reading.full_charge_capacity_ah, 100.0);
    assert_close(reading.remaining_capacity_ah, 80.0);
    assert_eq!(reading.cycle_count, 12);
    assert_eq!(reading.status(), BatteryStatus::Discharging);
}

#[test]
fn decoding_is_idempotent() {
    let payload = PayloadBuilder::default().current(3.0).payload();
    assert_eq!(
        DeviceReading::decode(&payload).unwrap(),
        DeviceReading::decode(&payload).unwrap()
    );
}

#[test]
fn cell_count_drives_the_layout() {
    for cells in [0usize, 1, 8, 24] {
        let builder = PayloadBuilder::default().cells(&vec![3.3; cells]);
        let reading = DeviceReading::decode(&builder.payload()).unwrap();
        assert_eq!(reading.cell_voltages_v.len(), cells);
        assert_eq!(reading.cycle_count, 12);
    }
}

#[test]
fn lowercase_hex_is_accepted() {
    let payload = PayloadBuilder::default().current(-1.0).payload();
    let reading = DeviceReading::decode(&payload.to_lowercase()).unwrap();
    assert!(reading.checksum_valid);
    assert_close(reading.pack_current_a, -1.0);
}

#[test]
fn declared_length_longer_than_payload() {
    // header declares 10 INFO chars, only 8 follow before the checksum
    let body = format!("22014A00{}{}", length_field(10), "00112233");
    let payload = format!("{body}{:04X}", frame_checksum(&body));
    assert!(matches!(
        DeviceReading::decode(&payload),
        Err(DecodeError::LengthMismatch {
            info_len_chars: 10,
            ..
        })
    ));
}

#[test]
fn unconsumed_info_chars_are_rejected() {
    let mut builder = PayloadBuilder::default();
    builder.trailing = "ABCD".into();
    let payload = builder.payload();
    let info_len = payload.len() - 16;
    assert_eq!(
        DeviceReading::decode(&payload),
        Err(DecodeError::FieldCountMismatch {
            expected: info_len,
            consumed: info_len - 4,
        })
    );
}

#[test]
fn bad_checksum_is_reported_not_rejected() {
    let mut payload = PayloadBuilder::default().payload();
    payload.truncate(payload.len() - 4);
    payload.push_str("0000");
    let reading = DeviceReading::decode(&payload).unwrap();
    assert!(!reading.checksum_valid);
    assert_close(reading.soc_percent, 80.0);
}
