//! Normalization of provider payloads into [`Vehicle`]s.
//!
//! The provider returns vehicle lists in several shapes depending on account
//! type and API version. Each known shape has its own extractor; extractors
//! are tried in a fixed order and the first one producing vehicles wins.
//! Decoding into typed records happens here so the rest of the pipeline only
//! ever sees [`Vehicle`] and [`Position`].

use crate::types::{Position, Vehicle};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

type Extractor = fn(&Value) -> Vec<&Value>;

/// Known payload shapes in precedence order.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("list", top_level_list),
    ("monitors", nested_monitors),
    ("devices", nested_devices),
    ("groups", grouped_devices),
];

fn top_level_list(payload: &Value) -> Vec<&Value> {
    payload
        .as_array()
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn nested_list<'a>(payload: &'a Value, key: &str) -> Vec<&'a Value> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn nested_monitors(payload: &Value) -> Vec<&Value> {
    nested_list(payload, "monitors")
}

fn nested_devices(payload: &Value) -> Vec<&Value> {
    nested_list(payload, "devices")
}

fn grouped_devices(payload: &Value) -> Vec<&Value> {
    nested_list(payload, "groups")
        .into_iter()
        .flat_map(|group| nested_list(group, "devices"))
        .collect()
}

/// Provider ids are sometimes strings, sometimes numbers.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text.trim().to_string(),
            RawId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct RawVehicle {
    #[serde(default, alias = "deviceId", alias = "imei")]
    device_id: Option<RawId>,
    // Names and SIM numbers arrive as strings or numbers.
    #[serde(default, alias = "deviceName")]
    name: Option<Value>,
    #[serde(default, alias = "simNumber")]
    sim: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct RawPosition {
    #[serde(alias = "deviceId", alias = "imei")]
    device_id: RawId,
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude", alias = "lon")]
    lng: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default, alias = "direction")]
    course: Option<f64>,
    #[serde(default, alias = "gpsTime")]
    timestamp: Option<Value>,
}

fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// Decodes one provider object. Returns `None` when the object has no usable
/// device id.
fn decode_vehicle(item: &Value) -> Option<Vehicle> {
    let raw = match RawVehicle::deserialize(item) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "dropping undecodable vehicle record");
            return None;
        }
    };

    let device_id = raw
        .device_id
        .map(RawId::into_string)
        .filter(|id| !id.is_empty());
    let Some(device_id) = device_id else {
        tracing::warn!(record = %item, "dropping vehicle record without device id");
        return None;
    };

    let name = raw
        .name
        .and_then(value_to_text)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| device_id.clone());
    let sim_number = raw
        .sim
        .and_then(value_to_text)
        .map(|sim| sim.trim().to_string())
        .filter(|sim| !sim.is_empty());

    Some(Vehicle {
        device_id,
        name,
        sim_number,
        status: raw.status.and_then(value_to_text),
        position: None,
        raw_payload: item.clone(),
    })
}

/// Normalizes a vehicle-list payload. Unknown or empty shapes produce an
/// empty list.
pub fn normalize_vehicles(payload: &Value) -> Vec<Vehicle> {
    for (shape, extract) in EXTRACTORS {
        let vehicles: Vec<Vehicle> = extract(payload)
            .into_iter()
            .filter_map(decode_vehicle)
            .collect();
        if !vehicles.is_empty() {
            tracing::trace!(shape, count = vehicles.len(), "normalized vehicle payload");
            return vehicles;
        }
    }
    Vec::new()
}

/// Decodes a flat position list keyed by device id. Entries that cannot be
/// decoded are skipped. Returns `None` when the payload is not a list.
pub fn decode_positions(payload: &Value) -> Option<HashMap<String, Position>> {
    let items = payload.as_array()?;
    let positions = items
        .iter()
        .filter_map(|item| match RawPosition::deserialize(item) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable position");
                None
            }
        })
        .map(|raw| {
            let position = Position {
                latitude: raw.lat,
                longitude: raw.lng,
                speed: raw.speed,
                course: raw.course,
                recorded_at: raw.timestamp.and_then(value_to_text),
            };
            (raw.device_id.into_string(), position)
        })
        .collect();
    Some(positions)
}

/// Attaches positions to vehicles by device id. Vehicles without a reported
/// position keep whatever they had.
pub fn merge_positions(
    vehicles: Vec<Vehicle>,
    mut positions: HashMap<String, Position>,
) -> Vec<Vehicle> {
    vehicles
        .into_iter()
        .map(|mut vehicle| {
            if let Some(position) = positions.remove(&vehicle.device_id) {
                vehicle.position = Some(position);
            }
            vehicle
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(vehicles: &[Vehicle]) -> Vec<&str> {
        vehicles.iter().map(|v| v.device_id.as_str()).collect()
    }

    #[test]
    fn test_top_level_list() {
        let payload = json!([
            {"device_id": "A1", "name": "Truck 1"},
            {"deviceId": 42, "deviceName": "Van"},
        ]);
        let vehicles = normalize_vehicles(&payload);
        assert_eq!(ids(&vehicles), ["A1", "42"]);
        assert_eq!(vehicles[1].name, "Van");
        assert_eq!(vehicles[0].raw_payload, payload[0]);
    }

    #[test]
    fn test_nested_monitors() {
        let payload = json!({"monitors": [{"imei": "860000", "simNumber": "+100", "status": 1}]});
        let vehicles = normalize_vehicles(&payload);
        assert_eq!(ids(&vehicles), ["860000"]);
        assert_eq!(vehicles[0].sim_number.as_deref(), Some("+100"));
        assert_eq!(vehicles[0].status.as_deref(), Some("1"));
        // Missing names fall back to the device id.
        assert_eq!(vehicles[0].name, "860000");
    }

    #[test]
    fn test_nested_devices() {
        let payload = json!({"devices": [{"device_id": "D1"}, {"device_id": "D2"}]});
        assert_eq!(ids(&normalize_vehicles(&payload)), ["D1", "D2"]);
    }

    #[test]
    fn test_grouped_devices_are_flattened_in_order() {
        let payload = json!({"groups": [
            {"name": "north", "devices": [{"device_id": "N1"}, {"device_id": "N2"}]},
            {"name": "empty"},
            {"name": "south", "devices": [{"device_id": "S1"}]},
        ]});
        assert_eq!(ids(&normalize_vehicles(&payload)), ["N1", "N2", "S1"]);
    }

    #[test]
    fn test_precedence_monitors_before_devices() {
        let payload = json!({
            "devices": [{"device_id": "from-devices"}],
            "monitors": [{"device_id": "from-monitors"}],
        });
        assert_eq!(ids(&normalize_vehicles(&payload)), ["from-monitors"]);
    }

    #[test]
    fn test_empty_shape_falls_through_to_next() {
        let payload = json!({
            "monitors": [],
            "devices": [{"device_id": "D1"}],
        });
        assert_eq!(ids(&normalize_vehicles(&payload)), ["D1"]);
    }

    #[test]
    fn test_unknown_shapes_yield_empty_list() {
        for payload in [
            json!(null),
            json!("text"),
            json!({}),
            json!({"vehicles": [{"device_id": "X"}]}),
            json!({"monitors": "not a list"}),
        ] {
            assert!(normalize_vehicles(&payload).is_empty(), "{payload}");
        }
    }

    #[test]
    fn test_records_without_device_id_are_dropped() {
        let payload = json!([
            {"name": "no id"},
            {"device_id": "   "},
            {"device_id": null},
            {"device_id": "OK"},
            "garbage",
        ]);
        assert_eq!(ids(&normalize_vehicles(&payload)), ["OK"]);
    }

    #[test]
    fn test_numeric_names_and_sims_are_kept() {
        let payload = json!([
            {"device_id": "A1", "name": "Truck", "sim": 8613800000u64},
            {"device_id": "A2", "name": 7},
            {"device_id": "A3", "name": null, "sim": "  "},
        ]);
        let vehicles = normalize_vehicles(&payload);
        assert_eq!(ids(&vehicles), ["A1", "A2", "A3"]);
        assert_eq!(vehicles[0].sim_number.as_deref(), Some("8613800000"));
        assert_eq!(vehicles[1].name, "7");
        assert_eq!(vehicles[2].name, "A3");
        assert!(vehicles[2].sim_number.is_none());
    }

    #[test]
    fn test_decode_and_merge_positions() {
        let payload = json!([
            {"device_id": "A1", "lat": 52.5, "lng": 13.4, "speed": 30.0, "timestamp": 1700000000},
            {"deviceId": 7, "latitude": -33.9, "longitude": 151.2},
            {"device_id": "broken"},
        ]);
        let positions = decode_positions(&payload).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions["A1"].recorded_at.as_deref(), Some("1700000000"));

        let vehicles = normalize_vehicles(&json!([
            {"device_id": "A1"},
            {"device_id": "7"},
            {"device_id": "no-position"},
        ]));
        let merged = merge_positions(vehicles, positions);
        assert_eq!(merged[0].position.as_ref().unwrap().speed, Some(30.0));
        assert_eq!(merged[1].position.as_ref().unwrap().latitude, -33.9);
        assert!(merged[2].position.is_none());
    }

    #[test]
    fn test_positions_payload_must_be_a_list() {
        assert!(decode_positions(&json!({"positions": []})).is_none());
        assert!(decode_positions(&json!([])).unwrap().is_empty());
    }
}
