//! Topic filter matching and topic template rendering
//!
//! [`TopicFilter`] turns an MQTT subscription filter (with `+` and `#`
//! wildcards and an optional `$share/<group>/` prefix) into an exact-match
//! predicate that code outside the transport can use, e.g. a processor
//! deciding whether a queued message belongs to it.

use regex::Regex;
use thiserror::Error;

const SHARE_PREFIX: &str = "$share/";

/// Compiled subscription filter
#[derive(Debug, Clone)]
pub struct TopicFilter {
    filter: String,
    share_group: Option<String>,
    pattern: Regex,
    leading_wildcard: bool,
}

impl TopicFilter {
    /// Validate and compile a filter
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        validate_topic_filter(filter)?;

        let (share_group, effective) = split_share_prefix(filter)?;
        let pattern = Regex::new(&filter_to_regex(effective))
            .map_err(|e| TopicError::InvalidFilter(format!("{filter}: {e}")))?;

        Ok(Self {
            filter: filter.to_string(),
            share_group: share_group.map(str::to_string),
            pattern,
            leading_wildcard: effective.starts_with(['+', '#']),
        })
    }

    /// Does `topic` belong to the set of topics this filter subscribes to
    pub fn matches(&self, topic: &str) -> bool {
        // Wildcards in the first level never match topics starting with '$'
        if self.leading_wildcard && topic.starts_with('$') {
            return false;
        }
        self.pattern.is_match(topic)
    }

    /// Filter as configured, including any shared-subscription prefix
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    pub fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    /// Regular expression the filter compiles to
    pub fn regex_pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Strip `$share/<group>/` and return the group plus the effective filter
fn split_share_prefix(filter: &str) -> Result<(Option<&str>, &str), TopicError> {
    match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => {
            let (group, effective) = rest.split_once('/').ok_or_else(|| {
                TopicError::InvalidFilter(format!("{filter}: shared subscription has no filter"))
            })?;
            Ok((Some(group), effective))
        }
        None => Ok((None, filter)),
    }
}

/// Convert a wildcard filter into an anchored regular expression
pub fn filter_to_regex(filter: &str) -> String {
    let mut pattern = String::from("^");

    for (index, segment) in filter.split('/').enumerate() {
        match segment {
            "#" => {
                if index == 0 {
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("(?:/.*)?");
                }
                break;
            }
            "+" => {
                if index > 0 {
                    pattern.push('/');
                }
                pattern.push_str("[^/]*");
            }
            literal => {
                if index > 0 {
                    pattern.push('/');
                }
                pattern.push_str(&regex::escape(literal));
            }
        }
    }

    pattern.push('$');
    pattern
}

/// Check wildcard placement rules for a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyFilter);
    }
    if filter.contains('\0') {
        return Err(TopicError::InvalidFilter(format!(
            "{filter}: contains a NUL character"
        )));
    }

    let (share_group, effective) = split_share_prefix(filter)?;
    if let Some(group) = share_group {
        if group.is_empty() || group.contains(['+', '#']) {
            return Err(TopicError::InvalidFilter(format!(
                "{filter}: invalid shared subscription group '{group}'"
            )));
        }
        if effective.is_empty() {
            return Err(TopicError::EmptyFilter);
        }
    }

    let segments: Vec<&str> = effective.split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.contains('#') && (*segment != "#" || index != last) {
            return Err(TopicError::InvalidFilter(format!(
                "{filter}: '#' must occupy the whole final level"
            )));
        }
        if segment.contains('+') && *segment != "+" {
            return Err(TopicError::InvalidFilter(format!(
                "{filter}: '+' must occupy a whole level"
            )));
        }
    }

    Ok(())
}

/// Topic with `{name}` placeholders, e.g. `nodes/alert/devices/{device_id}/{reason}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate(String);

impl TopicTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Substitute placeholders; values cannot introduce levels or wildcards
    pub fn render(&self, values: &[(&str, &str)]) -> String {
        let mut topic = self.0.clone();
        for (name, value) in values {
            let safe: String = value
                .chars()
                .map(|c| if matches!(c, '/' | '+' | '#') { '_' } else { c })
                .collect();
            topic = topic.replace(&format!("{{{name}}}"), &safe);
        }
        topic
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic filter cannot be empty")]
    EmptyFilter,
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(f: &str) -> TopicFilter {
        TopicFilter::new(f).unwrap()
    }

    #[test]
    fn test_single_level_wildcard() {
        let f = filter("devices/+/data");

        assert!(f.matches("devices/7/data"));
        assert!(f.matches("devices/sensor-01/data"));
        assert!(!f.matches("devices/7/8/data"));
        assert!(!f.matches("devices/7"));
        assert!(!f.matches("devices/7/data/extra"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let f = filter("devices/#");

        assert!(f.matches("devices"));
        assert!(f.matches("devices/7/data"));
        assert!(f.matches("devices/7"));
        assert!(!f.matches("device"));
        assert!(!f.matches("devicesx/7"));
    }

    #[test]
    fn test_literal_filter_is_exact() {
        let f = filter("nodes/alert/devices/1/temperature_high");

        assert!(f.matches("nodes/alert/devices/1/temperature_high"));
        assert!(!f.matches("nodes/alert/devices/1/temperature_high_cleared"));
        assert!(!f.matches("Nodes/alert/devices/1/temperature_high"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let f = filter("a.b/+/c");

        assert!(f.matches("a.b/x/c"));
        assert!(!f.matches("aXb/x/c"));
    }

    #[test]
    fn test_shared_subscription_prefix_is_stripped() {
        let f = filter("$share/nodes/devices/+/data");

        assert_eq!(f.share_group(), Some("nodes"));
        assert!(f.matches("devices/42/data"));
        assert!(!f.matches("$share/nodes/devices/42/data"));
    }

    #[test]
    fn test_leading_wildcards_skip_system_topics() {
        assert!(!filter("#").matches("$SYS/broker/load"));
        assert!(!filter("+/broker/load").matches("$SYS/broker/load"));
        assert!(filter("#").matches("devices/1/data"));
        assert!(filter("$SYS/#").matches("$SYS/broker/load"));
        assert!(filter("+/broker/load").matches("/broker/load"));
    }

    #[test]
    fn test_regex_is_anchored() {
        assert_eq!(filter_to_regex("devices/+/data"), "^devices/[^/]*/data$");
        assert_eq!(filter_to_regex("devices/#"), "^devices(?:/.*)?$");
        assert_eq!(filter_to_regex("#"), "^.*$");
    }

    #[test]
    fn test_invalid_filters_rejected() {
        assert_eq!(validate_topic_filter(""), Err(TopicError::EmptyFilter));
        assert!(validate_topic_filter("devices/#/data").is_err());
        assert!(validate_topic_filter("devices/a#").is_err());
        assert!(validate_topic_filter("devices/a+/data").is_err());
        assert!(validate_topic_filter("$share/nodes").is_err());
        assert!(validate_topic_filter("$share//devices/+").is_err());
        assert!(validate_topic_filter("devices/+/data").is_ok());
        assert!(validate_topic_filter("#").is_ok());
    }

    #[test]
    fn test_template_render() {
        let template = TopicTemplate::new("nodes/alert/devices/{device_id}/{reason}");
        let topic = template.render(&[("device_id", "17"), ("reason", "temperature_high")]);

        assert_eq!(topic, "nodes/alert/devices/17/temperature_high");
    }

    #[test]
    fn test_template_values_cannot_add_levels() {
        let template = TopicTemplate::new("nodes/{device_id}/data");
        let topic = template.render(&[("device_id", "a/b#")]);

        assert_eq!(topic, "nodes/a_b_/data");
    }

    proptest! {
        #[test]
        fn literal_filter_matches_only_itself(
            segments in prop::collection::vec("[a-z0-9_-]{1,8}", 1..5),
            other in "[a-z0-9_-]{1,8}"
        ) {
            let topic = segments.join("/");
            let f = TopicFilter::new(&topic).unwrap();
            prop_assert!(f.matches(&topic));

            let longer = format!("{topic}/{other}");
            prop_assert!(!f.matches(&longer));
        }

        #[test]
        fn plus_matches_exactly_one_level(
            prefix in "[a-z]{1,6}",
            level in "[a-z0-9]{0,6}",
            suffix in "[a-z]{1,6}"
        ) {
            let f = TopicFilter::new(&format!("{prefix}/+/{suffix}")).unwrap();
            let one_level = format!("{prefix}/{level}/{suffix}");
            let two_levels = format!("{prefix}/{level}/x/{suffix}");
            prop_assert!(f.matches(&one_level));
            prop_assert!(!f.matches(&two_levels));
        }

        #[test]
        fn hash_matches_parent_and_descendants(
            prefix in "[a-z]{1,6}",
            rest in prop::collection::vec("[a-z0-9]{1,6}", 0..4)
        ) {
            let f = TopicFilter::new(&format!("{prefix}/#")).unwrap();
            prop_assert!(f.matches(&prefix));
            let mut topic = prefix.clone();
            for level in rest {
                topic.push('/');
                topic.push_str(&level);
            }
            prop_assert!(f.matches(&topic));
        }
    }
}
