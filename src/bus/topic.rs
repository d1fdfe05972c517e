//! Topic grammar and zigbee2mqtt-style topic naming
//!
//! Patterns are `/`-delimited. `+` stands for exactly one segment, a trailing
//! `#` for the rest of the topic.
//!
//! ```text
//! zigbee2mqtt/[Study] Light               state
//! zigbee2mqtt/[Study] Light/set           command
//! zigbee2mqtt/[Study] Light/availability  online/offline
//! zigbee2mqtt/#                           catch-all
//! ```

use serde::{Deserialize, Serialize};

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: char = '#';

/// Returns true when `topic` is covered by `pattern`.
///
/// Exact equality wins first. A pattern ending in `#` matches every topic that
/// starts with the pattern minus the `#`. Otherwise both are split on `/`, the
/// segment counts must agree and every pattern segment must either equal the
/// topic segment or be `+`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(MULTI_LEVEL) {
        return topic.starts_with(prefix);
    }

    let pattern_segments: Vec<&str> = pattern.split(SEPARATOR).collect();
    let topic_segments: Vec<&str> = topic.split(SEPARATOR).collect();

    if pattern_segments.len() != topic_segments.len() {
        return false;
    }

    pattern_segments
        .iter()
        .zip(topic_segments.iter())
        .all(|(p, t)| *p == SINGLE_LEVEL || p == t)
}

/// Builds the per-device topics below one base topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    base: String,
}

impl TopicScheme {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let base = base.trim_end_matches(SEPARATOR).to_string();
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `{base}/{friendly_name}`
    pub fn state(&self, friendly_name: &str) -> String {
        format!("{}/{}", self.base, friendly_name)
    }

    /// `{base}/{friendly_name}/set`
    pub fn command(&self, friendly_name: &str) -> String {
        format!("{}/{}/set", self.base, friendly_name)
    }

    /// `{base}/{friendly_name}/availability`
    pub fn availability(&self, friendly_name: &str) -> String {
        format!("{}/{}/availability", self.base, friendly_name)
    }

    /// `{base}/#`, used by audit consumers.
    pub fn catch_all(&self) -> String {
        format!("{}/#", self.base)
    }

    /// Strips the base prefix, leaving the device part of a topic.
    pub fn device_part<'t>(&self, topic: &'t str) -> &'t str {
        topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .unwrap_or(topic)
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("zigbee2mqtt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_matches_itself() {
        assert!(topic_matches("x/y", "x/y"));
        assert!(!topic_matches("x/y", "x/z"));
    }

    #[test]
    fn trailing_hash_matches_everything_below() {
        assert!(topic_matches("a/b/#", "a/b/c"));
        assert!(topic_matches("a/b/#", "a/b/c/d"));
        assert!(!topic_matches("a/b/#", "a/x/c"));
    }

    #[test]
    fn trailing_hash_is_a_plain_prefix_test() {
        // "a/b/#" minus "#" is "a/b/", so the bare parent does not match
        assert!(!topic_matches("a/b/#", "a/b"));
        assert!(topic_matches("zigbee2mqtt/#", "zigbee2mqtt/[Study] Light/availability"));
    }

    #[test]
    fn plus_matches_exactly_one_segment() {
        assert!(topic_matches("a/+/c", "a/z/c"));
        assert!(!topic_matches("a/+/c", "a/z/y"));
        assert!(!topic_matches("a/+/c", "a/z"));
        assert!(!topic_matches("a/+/c", "a/z/c/d"));
    }

    #[test]
    fn plus_segments_can_repeat() {
        assert!(topic_matches("+/+/availability", "zigbee2mqtt/Plug/availability"));
        assert!(!topic_matches("+/+/availability", "zigbee2mqtt/Plug"));
    }

    #[test]
    fn scheme_builds_device_topics() {
        let scheme = TopicScheme::new("zigbee2mqtt/");
        assert_eq!(scheme.state("[Study] Light"), "zigbee2mqtt/[Study] Light");
        assert_eq!(scheme.command("[Study] Light"), "zigbee2mqtt/[Study] Light/set");
        assert_eq!(
            scheme.availability("[Study] Light"),
            "zigbee2mqtt/[Study] Light/availability"
        );
        assert_eq!(scheme.catch_all(), "zigbee2mqtt/#");
        assert_eq!(scheme.device_part("zigbee2mqtt/[Hallway] CO2"), "[Hallway] CO2");
        assert_eq!(scheme.device_part("dashboard/other"), "dashboard/other");
    }
}
