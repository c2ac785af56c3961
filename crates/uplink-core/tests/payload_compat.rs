/// Compatibility tests for the upstream payload shapes.
///
/// Covers:
/// - push (broker uplink) events
/// - pull (storage endpoint) envelopes
/// - flattened HTTP bodies, numbered and named keys
/// - channel-agnostic output
/// - rejection of empty and timestamp-less payloads
use chrono::{TimeZone, Utc};
use serde_json::json;
use uplink_core::{
    Channel, Measurements, NormalizeError, Normalizer, UNKNOWN_DEVICE, split_records,
};

fn push_event() -> serde_json::Value {
    json!({
        "end_device_ids": {"device_id": "dev-1", "application_ids": {"application_id": "app"}},
        "received_at": "2024-01-01T10:00:00Z",
        "uplink_message": {"decoded_payload": {"field5": 23.4, "field3": 55.0}}
    })
}

// ---------------------------------------------------------------------------
// Push shape
// ---------------------------------------------------------------------------

#[test]
fn push_scenario_normalizes_expected_fields() {
    let reading = Normalizer::new()
        .normalize(&push_event(), Channel::Push)
        .expect("push event should normalize");

    assert_eq!(reading.device_id, "dev-1");
    assert_eq!(
        reading.received_at,
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    );
    assert_eq!(
        reading.measurements,
        Measurements {
            temperature_c: Some(23.4),
            humidity: Some(55.0),
            battery_voltage: None,
            motion_counts: None,
        }
    );
    assert!(!reading.timestamp_degraded);
}

#[test]
fn push_with_all_slots() {
    let payload = json!({
        "end_device_ids": {"device_id": "lht65n-01"},
        "received_at": "2024-03-05T08:15:30.123456789Z",
        "uplink_message": {"decoded_payload": {
            "field1": 3.05, "field3": 41.2, "field4": 17, "field5": 19.8, "field2": 1
        }}
    });
    let m = Normalizer::new()
        .normalize(&payload, Channel::Push)
        .unwrap()
        .measurements;
    assert_eq!(m.battery_voltage, Some(3.05));
    assert_eq!(m.humidity, Some(41.2));
    assert_eq!(m.motion_counts, Some(17));
    assert_eq!(m.temperature_c, Some(19.8));
}

#[test]
fn only_temperature_is_valid() {
    let payload = json!({
        "end_device_ids": {"device_id": "dev-1"},
        "received_at": "2024-01-01T10:00:00Z",
        "uplink_message": {"decoded_payload": {"field5": 18.25}}
    });
    let m = Normalizer::new()
        .normalize(&payload, Channel::Push)
        .unwrap()
        .measurements;
    assert_eq!(m.temperature_c, Some(18.25));
    assert_eq!(m.humidity, None);
    assert_eq!(m.battery_voltage, None);
    assert_eq!(m.motion_counts, None);
}

#[test]
fn push_without_device_uses_fallback_then_sentinel() {
    let payload = json!({
        "received_at": "2024-01-01T10:00:00Z",
        "uplink_message": {"decoded_payload": {"field5": 1.0}}
    });
    let with_fallback = Normalizer::new()
        .with_fallback_device("configured-dev")
        .normalize(&payload, Channel::Push)
        .unwrap();
    assert_eq!(with_fallback.device_id, "configured-dev");

    let without = Normalizer::new().normalize(&payload, Channel::Push).unwrap();
    assert_eq!(without.device_id, UNKNOWN_DEVICE);
}

#[test]
fn push_does_not_unwrap_result_envelope() {
    let payload = json!({"result": push_event()});
    assert_eq!(
        Normalizer::new().normalize(&payload, Channel::Push),
        Err(NormalizeError::MissingTimestamp)
    );
}

// ---------------------------------------------------------------------------
// Pull shape
// ---------------------------------------------------------------------------

#[test]
fn pull_envelope_matches_push() {
    let normalizer = Normalizer::new();
    let pushed = normalizer.normalize(&push_event(), Channel::Push).unwrap();
    let pulled = normalizer
        .normalize(&json!({"result": push_event()}), Channel::Pull)
        .unwrap();
    assert_eq!(pushed, pulled);
}

#[test]
fn pull_ndjson_body_end_to_end() {
    let body = format!(
        "{}\n{}\n",
        json!({"result": push_event()}),
        json!({"result": {
            "end_device_ids": {"device_id": "dev-1"},
            "received_at": "2024-01-01T10:20:00.5+00:00",
            "uplink_message": {"decoded_payload": {"field1": 3.1}}
        }})
    );
    let normalizer = Normalizer::new();
    let readings: Vec<_> = split_records(&body)
        .into_iter()
        .map(|r| normalizer.normalize(&r.unwrap(), Channel::Pull).unwrap())
        .collect();
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[1].measurements.battery_voltage, Some(3.1));
    assert!(readings[0].received_at < readings[1].received_at);
}

#[test]
fn empty_result_envelope_is_rejected() {
    assert_eq!(
        Normalizer::new().normalize(&json!({"result": {}}), Channel::Pull),
        Err(NormalizeError::Empty)
    );
}

// ---------------------------------------------------------------------------
// Flattened shape
// ---------------------------------------------------------------------------

#[test]
fn flattened_numbered_keys() {
    let payload = json!({
        "device_id": "dev-9",
        "received_at": "2024-01-01T10:00:00Z",
        "field1": 3.0, "field3": 50.0, "field4": 2, "field5": 21.5
    });
    let r = Normalizer::new().normalize(&payload, Channel::Http).unwrap();
    assert_eq!(r.device_id, "dev-9");
    assert_eq!(r.measurements.motion_counts, Some(2));
}

#[test]
fn flattened_named_keys_under_fields() {
    let payload = json!({
        "device_id": "dev-9",
        "received_at": "2024-01-01T10:00:00Z",
        "fields": {"temperature_c": 21.5, "humidity": 40, "battery_voltage": null}
    });
    let m = Normalizer::new()
        .normalize(&payload, Channel::Http)
        .unwrap()
        .measurements;
    assert_eq!(m.temperature_c, Some(21.5));
    assert_eq!(m.humidity, Some(40.0));
    assert_eq!(m.battery_voltage, None);
}

#[test]
fn http_accepts_push_shape() {
    let r = Normalizer::new()
        .normalize(&push_event(), Channel::Http)
        .unwrap();
    assert_eq!(r.device_id, "dev-1");
    assert_eq!(r.measurements.temperature_c, Some(23.4));
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[test]
fn non_object_and_empty_payloads_are_rejected() {
    let n = Normalizer::new();
    assert_eq!(
        n.normalize(&json!([1, 2]), Channel::Pull),
        Err(NormalizeError::NotAnObject)
    );
    assert_eq!(n.normalize(&json!({}), Channel::Push), Err(NormalizeError::Empty));
}

#[test]
fn unparseable_timestamp_is_rejected_not_substituted() {
    let payload = json!({
        "end_device_ids": {"device_id": "dev-1"},
        "received_at": "01/01/2024 10:00",
        "uplink_message": {"decoded_payload": {"field5": 1.0}}
    });
    assert_eq!(
        Normalizer::new().normalize(&payload, Channel::Push),
        Err(NormalizeError::InvalidTimestamp("01/01/2024 10:00".to_owned()))
    );
}

#[test]
fn undecodable_bytes_are_rejected() {
    let n = Normalizer::new();
    assert_eq!(
        n.normalize_bytes(&[0xff, 0xfe, 0x00], Channel::Push),
        Err(NormalizeError::InvalidUtf8)
    );
    assert!(matches!(
        n.normalize_bytes(b"{not json", Channel::Push),
        Err(NormalizeError::InvalidJson(_))
    ));
}
