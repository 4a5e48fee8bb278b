// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic filters and topic-to-device mapping.
//!
//! Filters follow MQTT rules: `+` matches exactly one level, `#` matches
//! the remaining levels (including none) and must be the last level.
//! Device mapping is a pure function of the topic; any
//! `Fn(&str) -> Option<String>` can stand in for the built-in rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Device id used when a rule cannot resolve one.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Check whether a topic matches an MQTT topic filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate an MQTT topic filter.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter is empty".to_string());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!(
                "'#' must be a whole level and the last one in '{}'",
                filter
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must be a whole level in '{}'", filter));
        }
    }

    Ok(())
}

/// Resolves a device id from a topic.
pub trait DeviceMapper: Send + Sync {
    /// Device id for `topic`, or `None` if the rule does not apply.
    fn device_id(&self, topic: &str) -> Option<String>;
}

impl<F> DeviceMapper for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn device_id(&self, topic: &str) -> Option<String> {
        self(topic)
    }
}

/// Configured device mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceRule {
    /// Topic level at `index` (0-based): `devices/tank1/telemetry` with
    /// index 1 gives `tank1`.
    Segment { index: usize },

    /// Last topic level.
    LastSegment,

    /// The whole topic.
    Topic,

    /// First capture group of a regular expression.
    Regex { pattern: String },
}

impl Default for DeviceRule {
    fn default() -> Self {
        Self::Segment { index: 1 }
    }
}

impl DeviceRule {
    /// Compile the rule into a mapper.
    pub fn build(&self) -> Result<Arc<dyn DeviceMapper>, regex::Error> {
        let mapper: Arc<dyn DeviceMapper> = match self {
            Self::Segment { index } => Arc::new(SegmentMapper { index: *index }),
            Self::LastSegment => Arc::new(|topic: &str| {
                topic
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }),
            Self::Topic => Arc::new(|topic: &str| Some(topic.to_string())),
            Self::Regex { pattern } => Arc::new(RegexMapper {
                regex: Regex::new(pattern)?,
            }),
        };
        Ok(mapper)
    }
}

impl fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment { index } => write!(f, "segment[{}]", index),
            Self::LastSegment => f.write_str("last_segment"),
            Self::Topic => f.write_str("topic"),
            Self::Regex { pattern } => write!(f, "regex({})", pattern),
        }
    }
}

struct SegmentMapper {
    index: usize,
}

impl DeviceMapper for SegmentMapper {
    fn device_id(&self, topic: &str) -> Option<String> {
        topic
            .split('/')
            .nth(self.index)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

struct RegexMapper {
    regex: Regex,
}

impl DeviceMapper for RegexMapper {
    fn device_id(&self, topic: &str) -> Option<String> {
        self.regex
            .captures(topic)?
            .get(1)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("device/organ_bath/+", "device/organ_bath/ob1"));
        assert!(topic_matches("device/+/status", "device/ob1/status"));
        assert!(topic_matches("device/#", "device/organ_bath/ob1/status"));
        assert!(topic_matches("device/#", "device"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("exact/topic", "exact/topic"));
        assert!(!topic_matches("device/+/status", "device/ob1/data"));
        assert!(!topic_matches("device/organ_bath/+", "device/organ_bath/ob1/extra"));
        assert!(!topic_matches("device/+", "device"));
        assert!(!topic_matches("exact/topic", "exact"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("telemetry/#").is_ok());
        assert!(validate_filter("devices/+/telemetry").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a/dev+/b").is_err());
    }

    #[test]
    fn test_segment_rule() {
        let mapper = DeviceRule::default().build().unwrap();
        assert_eq!(
            mapper.device_id("devices/tank1/telemetry"),
            Some("tank1".to_string())
        );
        assert_eq!(mapper.device_id("single"), None);

        let first = DeviceRule::Segment { index: 0 }.build().unwrap();
        assert_eq!(first.device_id("tank7/ph"), Some("tank7".to_string()));
    }

    #[test]
    fn test_last_segment_and_topic_rules() {
        let last = DeviceRule::LastSegment.build().unwrap();
        assert_eq!(last.device_id("device/organ_bath/ob1"), Some("ob1".to_string()));
        assert_eq!(last.device_id("device/"), None);

        let whole = DeviceRule::Topic.build().unwrap();
        assert_eq!(whole.device_id("a/b"), Some("a/b".to_string()));
    }

    #[test]
    fn test_regex_rule() {
        let rule = DeviceRule::Regex {
            pattern: r"device/organ_bath/(.+)".to_string(),
        };
        let mapper = rule.build().unwrap();
        assert_eq!(
            mapper.device_id("device/organ_bath/ob1"),
            Some("ob1".to_string())
        );
        assert_eq!(mapper.device_id("other/ob1"), None);

        let bad = DeviceRule::Regex {
            pattern: "(".to_string(),
        };
        assert!(bad.build().is_err());
    }

    #[test]
    fn test_closure_mapper() {
        let mapper = |topic: &str| topic.strip_prefix("site-a/").map(str::to_uppercase);
        assert_eq!(mapper.device_id("site-a/pump"), Some("PUMP".to_string()));
        assert_eq!(mapper.device_id("site-b/pump"), None);
    }

    #[test]
    fn test_device_rule_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            rule: DeviceRule,
        }

        let w: Wrapper = toml::from_str("rule = { kind = \"segment\", index = 2 }").unwrap();
        assert_eq!(w.rule, DeviceRule::Segment { index: 2 });

        let w: Wrapper = toml::from_str("rule = { kind = \"last_segment\" }").unwrap();
        assert_eq!(w.rule, DeviceRule::LastSegment);
    }
}
