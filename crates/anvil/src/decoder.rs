// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload decoder
//!
//! Turns a JSON object payload into one [`Reading`] per numeric field:
//!
//! ```text
//! devices/tank1/telemetry  {"temperature": 80, "ph": 2.4}
//!   -> (tank1, temperature, 80.0)
//!   -> (tank1, ph, 2.4)
//! ```
//!
//! The decoder is pure: the same inputs always produce the same readings,
//! it performs no I/O and holds no mutable state, so one instance can be
//! shared across tasks. Problems are reported through [`DecodeOutcome`]
//! and never abort decoding of the remaining fields.

use crate::config::{ConfigError, DecoderConfig};
use crate::model::Reading;
use crate::topic::{topic_matches, DeviceMapper, UNKNOWN_DEVICE};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Payload keys that may carry a device id.
const DEVICE_KEYS: [&str; 3] = ["device_id", "deviceId", "device"];

/// Payload keys that may carry a timestamp.
const TIMESTAMP_KEYS: [&str; 2] = ["timestamp", "ts"];

/// Unix timestamps above this value (2100-01-01 in seconds) are milliseconds.
const MILLIS_THRESHOLD: i64 = 4_102_444_800;

/// Why a payload produced no readings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("payload has no numeric fields ({} skipped)", .0.len())]
    NoNumericFields(Vec<SkippedField>),
}

/// A field that did not produce a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedField {
    /// Field name (dot path when flattening)
    pub key: String,
    /// JSON kind of the rejected value, or `timestamp` for an unparseable
    /// payload timestamp
    pub kind: &'static str,
}

impl fmt::Display for SkippedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.kind)
    }
}

/// Result classification of one decode.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// Every sensor field produced a reading.
    Complete,
    /// Some fields were skipped; the rest produced readings.
    Partial { skipped: Vec<SkippedField> },
    /// No readings could be produced.
    Failed(DecodeError),
}

impl DecodeOutcome {
    /// True when nothing was skipped.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// True when the payload produced no readings.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Fields that were skipped (empty unless partial or a field-level failure).
    pub fn skipped(&self) -> &[SkippedField] {
        match self {
            Self::Partial { skipped } | Self::Failed(DecodeError::NoNumericFields(skipped)) => {
                skipped.as_slice()
            }
            _ => &[],
        }
    }
}

#[derive(Clone)]
struct CompiledRoute {
    filter: String,
    mapper: Option<Arc<dyn DeviceMapper>>,
    exclude: HashSet<String>,
}

/// Decodes flat JSON telemetry payloads into readings.
#[derive(Clone)]
pub struct PayloadDecoder {
    default_mapper: Arc<dyn DeviceMapper>,
    routes: Vec<CompiledRoute>,
    exclude: HashSet<String>,
    payload_timestamps: bool,
    payload_device_id: bool,
    flatten_nested: bool,
}

impl PayloadDecoder {
    /// Create a decoder using `mapper` for every topic.
    pub fn new(mapper: Arc<dyn DeviceMapper>) -> Self {
        Self {
            default_mapper: mapper,
            routes: Vec::new(),
            exclude: HashSet::new(),
            payload_timestamps: false,
            payload_device_id: false,
            flatten_nested: false,
        }
    }

    /// Build a decoder from configuration.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, ConfigError> {
        let default_mapper = config
            .device_rule
            .build()
            .map_err(|e| ConfigError::Invalid(format!("decoder.device_rule: {}", e)))?;

        let mut routes = Vec::with_capacity(config.routes.len());
        for (i, route) in config.routes.iter().enumerate() {
            let mapper = match &route.device_rule {
                Some(rule) => Some(rule.build().map_err(|e| {
                    ConfigError::Invalid(format!("decoder.routes[{}].device_rule: {}", i, e))
                })?),
                None => None,
            };
            routes.push(CompiledRoute {
                filter: route.topic_pattern.clone(),
                mapper,
                exclude: route.exclude.iter().cloned().collect(),
            });
        }

        Ok(Self {
            default_mapper,
            routes,
            exclude: config.exclude.iter().cloned().collect(),
            payload_timestamps: config.payload_timestamps,
            payload_device_id: config.payload_device_id,
            flatten_nested: config.flatten_nested,
        })
    }

    /// Take reading timestamps from `timestamp`/`ts` payload fields.
    pub fn with_payload_timestamps(mut self, enabled: bool) -> Self {
        self.payload_timestamps = enabled;
        self
    }

    /// Let a `device_id`/`deviceId`/`device` payload field override the topic rule.
    pub fn with_payload_device_id(mut self, enabled: bool) -> Self {
        self.payload_device_id = enabled;
        self
    }

    /// Expand nested objects into dot-path sensor names.
    pub fn with_flatten_nested(mut self, enabled: bool) -> Self {
        self.flatten_nested = enabled;
        self
    }

    /// Never turn `key` into a reading.
    pub fn exclude(mut self, key: impl Into<String>) -> Self {
        self.exclude.insert(key.into());
        self
    }

    /// Decode a payload received on `topic` at `received_at`.
    pub fn decode(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> (Vec<Reading>, DecodeOutcome) {
        let object = match parse_object(payload) {
            Ok(object) => object,
            Err(e) => return (Vec::new(), DecodeOutcome::Failed(e)),
        };

        let route = self.routes.iter().find(|r| topic_matches(&r.filter, topic));
        let mapper = route
            .and_then(|r| r.mapper.as_ref())
            .unwrap_or(&self.default_mapper);

        let mut skipped = Vec::new();
        let mut reserved: HashSet<&'static str> = HashSet::new();

        let mut device_id = None;
        if self.payload_device_id {
            reserved.extend(DEVICE_KEYS);
            device_id = DEVICE_KEYS
                .iter()
                .find_map(|k| object.get(*k).and_then(Value::as_str))
                .map(str::to_string);
        }
        let device_id = device_id
            .or_else(|| mapper.device_id(topic))
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

        let mut timestamp = received_at;
        if self.payload_timestamps {
            reserved.extend(TIMESTAMP_KEYS);
            if let Some((key, value)) = TIMESTAMP_KEYS
                .iter()
                .find_map(|k| object.get(*k).map(|v| (*k, v)))
            {
                match parse_timestamp(value) {
                    Some(ts) => timestamp = ts,
                    None => skipped.push(SkippedField {
                        key: key.to_string(),
                        kind: "timestamp",
                    }),
                }
            }
        }

        let ctx = FieldContext {
            topic,
            device_id: &device_id,
            timestamp,
            reserved: &reserved,
            route_exclude: route.map(|r| &r.exclude),
        };
        let mut readings = Vec::with_capacity(object.len());
        self.collect(&ctx, &object, None, &mut readings, &mut skipped);

        let outcome = if readings.is_empty() {
            DecodeOutcome::Failed(DecodeError::NoNumericFields(skipped))
        } else if skipped.is_empty() {
            DecodeOutcome::Complete
        } else {
            DecodeOutcome::Partial { skipped }
        };

        (readings, outcome)
    }

    fn collect(
        &self,
        ctx: &FieldContext<'_>,
        object: &Map<String, Value>,
        prefix: Option<&str>,
        readings: &mut Vec<Reading>,
        skipped: &mut Vec<SkippedField>,
    ) {
        for (key, value) in object {
            let name = match prefix {
                Some(p) => format!("{}.{}", p, key),
                None => key.clone(),
            };

            if prefix.is_none() && ctx.reserved.contains(key.as_str()) {
                if self.payload_device_id
                    && DEVICE_KEYS.contains(&key.as_str())
                    && !value.is_string()
                {
                    skipped.push(SkippedField {
                        key: name,
                        kind: json_kind(value),
                    });
                }
                continue;
            }
            if self.is_excluded(ctx, &name) {
                continue;
            }

            match value {
                Value::Number(n) => match n.as_f64() {
                    Some(v) => readings.push(Reading {
                        timestamp: ctx.timestamp,
                        device_id: ctx.device_id.to_string(),
                        sensor_name: name,
                        value: v,
                        topic: ctx.topic.to_string(),
                    }),
                    None => skipped.push(SkippedField {
                        key: name,
                        kind: "number",
                    }),
                },
                Value::Object(nested) if self.flatten_nested => {
                    self.collect(ctx, nested, Some(&name), readings, skipped);
                }
                other => skipped.push(SkippedField {
                    key: name,
                    kind: json_kind(other),
                }),
            }
        }
    }

    fn is_excluded(&self, ctx: &FieldContext<'_>, name: &str) -> bool {
        self.exclude.contains(name) || ctx.route_exclude.is_some_and(|ex| ex.contains(name))
    }
}

impl fmt::Debug for PayloadDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadDecoder")
            .field("routes", &self.routes.len())
            .field("exclude", &self.exclude)
            .field("payload_timestamps", &self.payload_timestamps)
            .field("payload_device_id", &self.payload_device_id)
            .field("flatten_nested", &self.flatten_nested)
            .finish()
    }
}

struct FieldContext<'a> {
    topic: &'a str,
    device_id: &'a str,
    timestamp: DateTime<Utc>,
    reserved: &'a HashSet<&'static str>,
    route_exclude: Option<&'a HashSet<String>>,
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DecodeError::NotAnObject(json_kind(&other))),
        Err(e) => Err(DecodeError::InvalidJson(e.to_string())),
    }
}

/// Parse an RFC 3339 string or a Unix timestamp (seconds, or milliseconds
/// past 2100 in seconds).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }

    let n = value.as_i64()?;
    if n > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicRoute;
    use crate::topic::DeviceRule;

    const TOPIC: &str = "devices/tank1/telemetry";

    fn decoder() -> PayloadDecoder {
        PayloadDecoder::from_config(&DecoderConfig::default()).unwrap()
    }

    fn received() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn value_of(readings: &[Reading], sensor: &str) -> f64 {
        readings
            .iter()
            .find(|r| r.sensor_name == sensor)
            .map(|r| r.value)
            .unwrap_or_else(|| panic!("missing sensor {}", sensor))
    }

    #[test]
    fn test_decode_flat_numeric_object() {
        let (readings, outcome) =
            decoder().decode(TOPIC, br#"{"temperature": 80, "ph": 2.4}"#, received());

        assert!(outcome.is_complete());
        assert_eq!(readings.len(), 2);
        assert!((value_of(&readings, "temperature") - 80.0).abs() < f64::EPSILON);
        assert!((value_of(&readings, "ph") - 2.4).abs() < f64::EPSILON);
        for r in &readings {
            assert_eq!(r.device_id, "tank1");
            assert_eq!(r.topic, TOPIC);
            assert_eq!(r.timestamp, received());
        }
    }

    #[test]
    fn test_decode_partial_skips_non_numeric() {
        let payload = br#"{"temperature": 21.5, "status": "ok", "alarm": true, "notes": null}"#;
        let (readings, outcome) = decoder().decode(TOPIC, payload, received());

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_name, "temperature");
        match &outcome {
            DecodeOutcome::Partial { skipped } => {
                let keys: HashSet<_> = skipped.iter().map(|s| s.key.as_str()).collect();
                assert_eq!(keys, HashSet::from(["status", "alarm", "notes"]));
            }
            other => panic!("expected Partial, got {:?}", other),
        }
    }

    fn failure(payload: &[u8]) -> DecodeError {
        let (readings, outcome) = decoder().decode(TOPIC, payload, received());
        assert!(readings.is_empty());
        match outcome {
            DecodeOutcome::Failed(e) => e,
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_failures_never_panic() {
        assert_eq!(failure(b""), DecodeError::Empty);
        assert_eq!(failure(b"   \n"), DecodeError::Empty);
        assert_eq!(failure(&[0xff, 0xfe, 0x00]), DecodeError::InvalidUtf8);
        assert_eq!(failure(b"[1, 2, 3]"), DecodeError::NotAnObject("array"));
        assert_eq!(failure(b"42"), DecodeError::NotAnObject("number"));
        assert!(matches!(failure(b"not json"), DecodeError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_object_without_numbers_fails() {
        let (readings, outcome) = decoder().decode(TOPIC, br#"{"status": "ok"}"#, received());
        assert!(readings.is_empty());
        assert!(outcome.is_failure());
        assert_eq!(outcome.skipped().len(), 1);

        let (readings, outcome) = decoder().decode(TOPIC, b"{}", received());
        assert!(readings.is_empty());
        assert_eq!(
            outcome,
            DecodeOutcome::Failed(DecodeError::NoNumericFields(Vec::new()))
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let d = decoder();
        let payload = br#"{"a": 1, "b": 2.5, "c": "x", "d": -3}"#;
        let first = d.decode(TOPIC, payload, received());
        let second = d.decode(TOPIC, payload, received());
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_device_fallback() {
        let (readings, _) = decoder().decode("flat", br#"{"v": 1}"#, received());
        assert_eq!(readings[0].device_id, UNKNOWN_DEVICE);
    }

    #[test]
    fn test_payload_device_id_override() {
        let d = decoder().with_payload_device_id(true);
        let (readings, outcome) =
            d.decode(TOPIC, br#"{"device_id": "pump-9", "rpm": 1200}"#, received());

        assert!(outcome.is_complete());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "pump-9");

        // Numeric device ids are not sensors but are reported.
        let (readings, outcome) = d.decode(TOPIC, br#"{"device": 7, "rpm": 1}"#, received());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "tank1");
        assert_eq!(outcome.skipped()[0].key, "device");
    }

    #[test]
    fn test_payload_timestamps() {
        let d = decoder().with_payload_timestamps(true);

        let (readings, outcome) =
            d.decode(TOPIC, br#"{"ts": 1700000100, "v": 1}"#, received());
        assert!(outcome.is_complete());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].timestamp.timestamp(), 1_700_000_100);

        let (readings, _) = d.decode(TOPIC, br#"{"ts": 1700000100250, "v": 1}"#, received());
        assert_eq!(readings[0].timestamp.timestamp_millis(), 1_700_000_100_250);

        let (readings, _) = d.decode(
            TOPIC,
            br#"{"timestamp": "2024-01-02T03:04:05Z", "v": 1}"#,
            received(),
        );
        assert_eq!(readings[0].timestamp.to_rfc3339(), "2024-01-02T03:04:05+00:00");

        let (readings, outcome) =
            d.decode(TOPIC, br#"{"timestamp": "yesterday", "v": 1}"#, received());
        assert_eq!(readings[0].timestamp, received());
        assert_eq!(outcome.skipped()[0].kind, "timestamp");
    }

    #[test]
    fn test_timestamp_fields_are_sensors_when_disabled() {
        let (readings, _) = decoder().decode(TOPIC, br#"{"ts": 5, "v": 1}"#, received());
        assert_eq!(readings.len(), 2);
    }

    #[test]
    fn test_flatten_nested() {
        let payload = br#"{"location": {"lat": 48.85, "lon": 2.35, "name": "paris"}, "v": 1}"#;

        let (readings, outcome) = decoder().decode(TOPIC, payload, received());
        assert_eq!(readings.len(), 1);
        assert_eq!(outcome.skipped()[0].kind, "object");

        let (readings, outcome) = decoder()
            .with_flatten_nested(true)
            .decode(TOPIC, payload, received());
        assert_eq!(readings.len(), 3);
        assert!((value_of(&readings, "location.lat") - 48.85).abs() < 1e-9);
        assert_eq!(outcome.skipped()[0].key, "location.name");
    }

    #[test]
    fn test_routes_and_exclusions() {
        let config = DecoderConfig {
            exclude: vec!["seq".to_string()],
            routes: vec![TopicRoute {
                topic_pattern: "device/organ_bath/+".to_string(),
                device_rule: Some(DeviceRule::LastSegment),
                exclude: vec!["battery".to_string()],
            }],
            ..DecoderConfig::default()
        };
        let d = PayloadDecoder::from_config(&config).unwrap();
        let payload = br#"{"temp": 37.0, "battery": 88, "seq": 4}"#;

        let (readings, outcome) = d.decode("device/organ_bath/ob1", payload, received());
        assert!(outcome.is_complete());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id, "ob1");

        let (readings, _) = d.decode("devices/tank1/telemetry", payload, received());
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].device_id, "tank1");
    }

    #[test]
    fn test_invalid_route_regex_rejected() {
        let config = DecoderConfig {
            routes: vec![TopicRoute {
                topic_pattern: "#".to_string(),
                device_rule: Some(DeviceRule::Regex {
                    pattern: "([".to_string(),
                }),
                exclude: Vec::new(),
            }],
            ..DecoderConfig::default()
        };
        assert!(matches!(
            PayloadDecoder::from_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_decoder_shared_across_threads() {
        let d = Arc::new(decoder());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let d = Arc::clone(&d);
                std::thread::spawn(move || {
                    let payload = format!(r#"{{"v": {}}}"#, i);
                    d.decode(TOPIC, payload.as_bytes(), received()).0
                })
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            let readings = h.join().unwrap();
            assert_eq!(readings[0].value, i as f64);
        }
    }
}
