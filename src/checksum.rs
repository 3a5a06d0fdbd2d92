use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, WebhookError};
use crate::types::TrackEvent;

/// SHA-256 over the canonical serialization of an event timeline.
///
/// The checksum domain is only the ordered event sequence. Two
/// timelines that differ solely in JSON object key ordering hash to
/// the same value; any change to event content or ordering does not.
pub fn events_checksum(events: &[TrackEvent]) -> Result<String> {
    let value = serde_json::to_value(events).map_err(WebhookError::internal)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Compact JSON with object keys sorted lexicographically at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Round-trip through Value for proper string escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{TrackEventStatusCode, TrackInfo};

    #[test]
    fn object_key_order_is_irrelevant() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"k\"ey": "va\nlue"});
        assert_eq!(canonical_json(&v), "{\"k\\\"ey\":\"va\\nlue\"}");
    }

    #[test]
    fn checksum_is_stable_across_calls() {
        let events = vec![
            TrackEvent::new(TrackEventStatusCode::InformationReceived),
            TrackEvent::new(TrackEventStatusCode::InTransit),
        ];
        assert_eq!(
            events_checksum(&events).unwrap(),
            events_checksum(&events).unwrap()
        );
    }

    #[test]
    fn checksum_changes_when_events_change() {
        let three = vec![
            TrackEvent::new(TrackEventStatusCode::InformationReceived),
            TrackEvent::new(TrackEventStatusCode::AtPickup),
            TrackEvent::new(TrackEventStatusCode::InTransit),
        ];
        let mut four = three.clone();
        four.push(TrackEvent::new(TrackEventStatusCode::Delivered));
        assert_ne!(
            events_checksum(&three).unwrap(),
            events_checksum(&four).unwrap()
        );
    }

    #[test]
    fn sender_and_recipient_are_excluded() {
        let mut info = TrackInfo::new(vec![TrackEvent::new(TrackEventStatusCode::InTransit)]);
        let bare = events_checksum(&info.events).unwrap();
        info.sender = Some(crate::types::TrackContact {
            name: Some("sender".to_string()),
            time: None,
        });
        assert_eq!(bare, events_checksum(&info.events).unwrap());
    }
}
