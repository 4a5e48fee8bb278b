// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge data model
//!
//! Records that flow from the bus to storage. Both are immutable once
//! built and live only until the batch that carries them is flushed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message exactly as received from the bus (audit record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Receipt timestamp assigned by the subscription manager
    pub received_at: DateTime<Utc>,

    /// Topic the message was published on
    pub topic: String,

    /// Unmodified payload bytes
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Create a raw record
    pub fn new(received_at: DateTime<Utc>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            received_at,
            topic: topic.into(),
            payload,
        }
    }

    /// Payload rendered as text (lossy for non UTF-8 bytes)
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// One decoded sensor value
///
/// Storage assigns the row identity (timestamp + generated id), so two
/// readings with identical fields are both kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Reading timestamp (receipt time unless taken from the payload)
    pub timestamp: DateTime<Utc>,

    /// Device identifier resolved from the topic (or payload)
    pub device_id: String,

    /// Sensor (field) name
    pub sensor_name: String,

    /// Numeric value
    pub value: f64,

    /// Source topic
    pub topic: String,
}

/// The two independent storage paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Raw audit archive.
    Raw,
    /// Decoded readings.
    Readings,
}

impl SinkKind {
    /// Stable name used in logs and statistics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Readings => "readings",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_message_payload_text() {
        let raw = RawMessage::new(Utc::now(), "a/b", b"{\"x\": 1}".to_vec());
        assert_eq!(raw.payload_text(), "{\"x\": 1}");

        let binary = RawMessage::new(Utc::now(), "a/b", vec![0xff, b'o', b'k']);
        assert_eq!(binary.payload_text(), "\u{fffd}ok");
    }

    #[test]
    fn test_reading_serialization() {
        let reading = Reading {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            device_id: "tank1".to_string(),
            sensor_name: "ph".to_string(),
            value: 2.4,
            topic: "devices/tank1/telemetry".to_string(),
        };

        let json = serde_json::to_string(&reading).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(reading, back);
    }

    #[test]
    fn test_sink_kind_names() {
        assert_eq!(SinkKind::Raw.to_string(), "raw");
        assert_eq!(SinkKind::Readings.as_str(), "readings");
    }
}
