use crate::error::ParseError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

/// Stored in `moisture_level` when a reading carries no moisture value.
/// Such readings never pass validation, so this only matters to callers
/// that bypass the validator.
pub const DEFAULT_MOISTURE: f64 = 0.0;

pub const UNKNOWN_DEVICE: &str = "unknown";

/// Tried in order; the first that matches wins. All are read as UTC.
const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
];

/// One normalized sensor observation, built from a single inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub raw_payload: String,
}

impl Reading {
    pub fn moisture_level(&self) -> f64 {
        self.moisture.unwrap_or(DEFAULT_MOISTURE)
    }
}

pub fn normalize(topic: &str, raw_payload: &[u8]) -> Result<Reading, ParseError> {
    normalize_at(topic, raw_payload, Utc::now())
}

/// Same as [`normalize`] with an explicit ingestion time, used when the
/// payload carries no usable timestamp.
pub fn normalize_at(
    topic: &str,
    raw_payload: &[u8],
    ingested_at: DateTime<Utc>,
) -> Result<Reading, ParseError> {
    let text = std::str::from_utf8(raw_payload)?;
    let doc = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(ParseError::Malformed(format!(
                "expected an object, got {}",
                json_kind(&other)
            )))
        }
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };

    let device_id = device_from_topic(topic)
        .map(str::to_string)
        .or_else(|| first_text(&doc, &["sensor_id", "device_id"]))
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

    Ok(Reading {
        timestamp: resolve_timestamp(&doc).unwrap_or(ingested_at),
        moisture: first_number(&doc, &["moisture", "moisture_level"])?,
        temperature: first_number(&doc, &["temperature", "temp"])?,
        humidity: first_number(&doc, &["humidity"])?,
        battery: first_number(&doc, &["battery", "battery_level"])?,
        device_id,
        raw_payload: text.to_string(),
    })
}

/// `prefix/<device>/suffix` -> `<device>`. Topics with fewer than three
/// segments carry no device segment.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    let device = segments.nth(1)?;
    segments.next().map(|_| device)
}

fn first_text(doc: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match doc.get(*k) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// First alias that is present and not null wins. A present value that
/// cannot be read as a finite float fails the whole message.
fn first_number(doc: &Map<String, Value>, keys: &[&str]) -> Result<Option<f64>, ParseError> {
    for key in keys {
        match doc.get(*key) {
            None | Some(Value::Null) => continue,
            Some(v) => return coerce_f64(v).map(Some).ok_or_else(|| mismatch(key, v)),
        }
    }
    Ok(None)
}

fn coerce_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

fn mismatch(field: &str, v: &Value) -> ParseError {
    ParseError::TypeMismatch {
        field: field.to_string(),
        value: v.to_string(),
    }
}

fn resolve_timestamp(doc: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = ["timestamp", "time"]
        .iter()
        .find_map(|k| doc.get(*k).filter(|v| !v.is_null()))?;
    let parsed = raw.as_str().and_then(parse_timestamp);
    if parsed.is_none() {
        debug!(value = %raw, "unusable timestamp; using ingestion time");
    }
    parsed
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
