// fixtures: Upstream payload builders shared by the test suites.

use serde_json::{Value, json};

/// A broker uplink event for `device_id` measured at `received_at`.
pub fn push_uplink(device_id: &str, received_at: &str, decoded_payload: Value) -> Value {
    json!({
        "end_device_ids": {
            "device_id": device_id,
            "application_ids": {"application_id": "field-app"}
        },
        "received_at": received_at,
        "uplink_message": {
            "f_port": 2,
            "decoded_payload": decoded_payload,
            "rx_metadata": [{"gateway_ids": {"gateway_id": "gw-1"}, "rssi": -97}]
        }
    })
}

/// A push event with temperature and humidity set.
pub fn climate_uplink(device_id: &str, received_at: &str, temperature_c: f64, humidity: f64) -> Value {
    push_uplink(
        device_id,
        received_at,
        json!({"field5": temperature_c, "field3": humidity}),
    )
}

/// Wrap a record the way the storage query endpoint does.
pub fn storage_envelope(record: Value) -> Value {
    json!({ "result": record })
}

/// Newline-delimited JSON body of storage envelopes, one per record.
pub fn ndjson(records: &[Value]) -> String {
    records
        .iter()
        .map(|r| format!("{}\n", storage_envelope(r.clone())))
        .collect()
}

/// `2024-01-01T10:MM:00Z`, for building distinct event times.
pub fn minute(m: u32) -> String {
    format!("2024-01-01T10:{m:02}:00Z")
}
