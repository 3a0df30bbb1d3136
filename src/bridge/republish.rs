//! Pure republication planning: topic rewriting and property fan-out
//!
//! Upstream topics have the shape `<account-id>/<vehicle-id>/<rest...>`.
//! Each delivered message yields one raw passthrough publish plus, when the
//! payload is well-formed telemetry, one publish per property of its `data`
//! object. The account id is never exposed downstream.

use serde_json::Value;

/// A single planned publish: topic and payload, QoS 0, not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Rewrite an upstream topic for the raw passthrough:
/// `<prefix>raw` + everything from the first `/` onward, so
/// `G/V/a/b` becomes `<prefix>raw/V/a/b`. A topic without any `/`
/// collapses to `<prefix>raw`.
pub fn raw_topic(prefix: &str, upstream_topic: &str) -> String {
    match upstream_topic.find('/') {
        Some(pos) => format!("{prefix}raw{}", &upstream_topic[pos..]),
        None => format!("{prefix}raw"),
    }
}

/// Plan the per-property publishes for one payload.
///
/// Errors are descriptions for the log; the caller drops the message and
/// keeps the session alive.
pub fn fan_out(
    prefix: &str,
    upstream_topic: &str,
    payload: &[u8],
) -> Result<Vec<PlannedPublish>, String> {
    let json: Value =
        serde_json::from_slice(payload).map_err(|e| format!("payload is not JSON: {e}"))?;

    let vin = extract_vehicle_id(&json, upstream_topic)?;

    let Some(data) = json.get("data").and_then(Value::as_object) else {
        return Err("payload has no data object".to_string());
    };

    let mut publishes = Vec::new();
    for (name, entry) in data {
        // only entries shaped like { value, timestamp?, unit? } are telemetry
        if entry.get("value").is_none() {
            continue;
        }
        let serialized =
            serde_json::to_vec(entry).map_err(|e| format!("serializing {name}: {e}"))?;
        publishes.push(PlannedPublish {
            topic: format!("{prefix}vehicles/{vin}/{name}"),
            payload: serialized,
        });
    }
    Ok(publishes)
}

/// Determine the vehicle id: a top-level `vin` string wins; otherwise the
/// second slash-delimited topic segment, which must be a 17-character VIN.
pub fn extract_vehicle_id(payload: &Value, upstream_topic: &str) -> Result<String, String> {
    if let Some(vin) = payload.get("vin").and_then(Value::as_str) {
        if !vin.is_empty() {
            return Ok(vin.to_string());
        }
    }

    let mut segments = upstream_topic.split('/');
    let _account = segments.next();
    let vin = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("no vehicle id in payload or topic '{upstream_topic}'"))?;

    if vin.len() != 17 {
        return Err(format!(
            "invalid vehicle id length from topic '{upstream_topic}': {vin}"
        ));
    }
    Ok(vin.to_string())
}
