use crate::error::RoutingError;
use std::fmt;

/// The single topic exchange all device events go through.
pub const EXCHANGE_NAME: &str = "device_events";

/// Leading segment of every device routing key.
pub const ROUTING_PREFIX: &str = "device";

/// Queue used by consumers that do not select a device type.
pub const ALL_DEVICES_QUEUE: &str = "all_devices_queue";

/// Queue name for a device type, e.g. `tv` -> `tv_queue`.
pub fn queue_name(device_type: &str) -> String {
    format!("{}_queue", device_type)
}

/// A fully specified routing key, `device.<type>.<state>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn for_device(device_type: &str, state: &str) -> Result<Self, RoutingError> {
        check_literal("device type", device_type)?;
        check_literal("state", state)?;
        Ok(Self(format!("{}.{}.{}", ROUTING_PREFIX, device_type, state)))
    }

    /// Parse an arbitrary routing key. Wildcards are not allowed.
    pub fn parse(key: &str) -> Result<Self, RoutingError> {
        if key.split('.').any(str::is_empty) {
            return Err(RoutingError::EmptySegment(key.to_string()));
        }
        if key.contains('*') || key.contains('#') {
            return Err(RoutingError::WildcardInKey(key.to_string()));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A binding pattern with topic-exchange wildcards.
///
/// `*` matches exactly one segment, `#` matches zero or more.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingPattern(String);

impl BindingPattern {
    /// `device.<type>.<state_pattern>`. The type may be `*` to match every
    /// device type; the state pattern may be a literal state, `*` or `#`.
    pub fn for_device(device_type: &str, state_pattern: &str) -> Result<Self, RoutingError> {
        if device_type != "*" {
            check_literal("device type", device_type)?;
        }
        Self::parse(&format!(
            "{}.{}.{}",
            ROUTING_PREFIX, device_type, state_pattern
        ))
    }

    pub fn parse(pattern: &str) -> Result<Self, RoutingError> {
        for segment in pattern.split('.') {
            if segment.is_empty() {
                return Err(RoutingError::EmptySegment(pattern.to_string()));
            }
            let has_wildcard = segment.contains('*') || segment.contains('#');
            if has_wildcard && segment.len() > 1 {
                return Err(RoutingError::MixedWildcard(segment.to_string()));
            }
        }
        Ok(Self(pattern.to_string()))
    }

    pub fn matches(&self, key: &RoutingKey) -> bool {
        topic_matches(&self.0, key.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check if a routing key matches a binding pattern using topic-exchange
/// rules. Unlike MQTT, `#` may appear anywhere and also matches nothing.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    // Quick exact match
    if pattern == key {
        return true;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = key.split('.').collect();
    segments_match(&pattern_parts, &key_parts)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((first, rest)) if *first == "#" => {
            // Adjacent '#' behave like one
            if rest.first() == Some(&"#") {
                return segments_match(rest, key);
            }
            (0..=key.len()).any(|skip| segments_match(rest, &key[skip..]))
        }
        Some((first, rest)) if *first == "*" => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((first, rest)) => key.first() == Some(first) && segments_match(rest, &key[1..]),
    }
}

fn check_literal(field: &'static str, value: &str) -> Result<(), RoutingError> {
    if value.is_empty() {
        return Err(RoutingError::EmptySegment(value.to_string()));
    }
    if value.contains(['.', '*', '#']) {
        return Err(RoutingError::InvalidSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
