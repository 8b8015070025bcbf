use crate::errors::MqttError;
use crate::MqttMessage;
use rumqttc::QoS;
use rumqttc::SubscribeFilter;
use std::convert::TryFrom;
use std::fmt;

/// An MQTT topic name, checked against the MQTT 3.1.1 grammar.
///
/// A topic name addresses a single topic: it contains no `+` or `#`
/// wildcard. Use [TopicFilter] for subscription patterns.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Topic {
    pub name: String,
}

impl Topic {
    /// Check the name is a valid MQTT topic and build a new topic.
    pub fn new(name: &str) -> Result<Topic, MqttError> {
        if rumqttc::valid_topic(name) {
            Ok(Topic { name: name.into() })
        } else {
            Err(MqttError::InvalidTopic { name: name.into() })
        }
    }

    /// Build a new topic, assuming the name is valid.
    pub fn new_unchecked(name: &str) -> Topic {
        Topic { name: name.into() }
    }

    /// The filter that accepts only this topic.
    pub fn filter(&self) -> TopicFilter {
        TopicFilter {
            patterns: vec![self.name.clone()],
            qos: QoS::AtLeastOnce,
        }
    }

    /// The segments of this topic, split on `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.name
    }
}

impl TryFrom<&str> for Topic {
    type Error = MqttError;

    fn try_from(name: &str) -> Result<Topic, MqttError> {
        Topic::new(name)
    }
}

/// A set of MQTT subscription patterns sharing a QoS.
///
/// Patterns may use the MQTT wildcards: `+` matches exactly one segment,
/// `#` matches any number of trailing segments and must come last.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicFilter {
    pub patterns: Vec<String>,
    pub qos: QoS,
}

impl Default for TopicFilter {
    fn default() -> Self {
        TopicFilter::empty()
    }
}

impl TopicFilter {
    /// An empty topic filter, accepting no topic at all.
    pub fn empty() -> TopicFilter {
        TopicFilter {
            patterns: vec![],
            qos: QoS::AtLeastOnce,
        }
    }

    /// Check the pattern is a valid MQTT filter and build a new topic filter.
    pub fn new(pattern: &str) -> Result<TopicFilter, MqttError> {
        let mut filter = TopicFilter::empty();
        filter.add(pattern)?;
        Ok(filter)
    }

    /// Build a new topic filter, assuming the pattern is valid.
    pub fn new_unchecked(pattern: &str) -> TopicFilter {
        TopicFilter {
            patterns: vec![pattern.into()],
            qos: QoS::AtLeastOnce,
        }
    }

    /// Check the pattern is a valid MQTT filter and add it to this filter.
    pub fn add(&mut self, pattern: &str) -> Result<(), MqttError> {
        if rumqttc::valid_filter(pattern) {
            self.patterns.push(pattern.into());
            Ok(())
        } else {
            Err(MqttError::InvalidFilter {
                pattern: pattern.into(),
            })
        }
    }

    /// Add all the patterns of the other filter to this one.
    pub fn add_all(&mut self, other: TopicFilter) {
        self.patterns.extend(other.patterns)
    }

    /// Check if the given topic is accepted by one of the patterns.
    pub fn accept_topic(&self, topic: &Topic) -> bool {
        self.accept_topic_name(&topic.name)
    }

    /// Check if the given topic name is accepted by one of the patterns.
    pub fn accept_topic_name(&self, topic: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| rumqttc::matches(topic, pattern))
    }

    /// Check if the given message is published on an accepted topic.
    pub fn accept(&self, msg: &MqttMessage) -> bool {
        self.accept_topic(&msg.topic)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// This topic filter with the given QoS.
    pub fn with_qos(self, qos: QoS) -> Self {
        Self { qos, ..self }
    }

    /// The list of `SubscribeFilter` expected by `rumqttc`.
    pub(crate) fn filters(&self) -> Vec<SubscribeFilter> {
        let qos = self.qos;
        self.patterns
            .iter()
            .map(|path| SubscribeFilter {
                path: path.clone(),
                qos,
            })
            .collect()
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> TopicFilter {
        topic.filter()
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = MqttError;

    fn try_from(pattern: &str) -> Result<TopicFilter, MqttError> {
        TopicFilter::new(pattern)
    }
}

impl TryFrom<Vec<&str>> for TopicFilter {
    type Error = MqttError;

    fn try_from(patterns: Vec<&str>) -> Result<TopicFilter, MqttError> {
        let mut filter = TopicFilter::empty();
        for pattern in patterns {
            filter.add(pattern)?
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_topics_are_accepted() {
        assert!(Topic::new("telemetry").is_ok());
        assert!(Topic::new("rtk/v1/acme/hq/ap-01/state").is_ok());
    }

    #[test]
    fn wildcards_are_invalid_in_topic_names() {
        assert!(Topic::new("rtk/+/acme").is_err());
        assert!(Topic::new("rtk/#").is_err());
    }

    #[test]
    fn valid_filters_are_accepted() {
        assert!(TopicFilter::new("a/b/c").is_ok());
        assert!(TopicFilter::new("a/+/c").is_ok());
        assert!(TopicFilter::new("a/b/#").is_ok());
    }

    #[test]
    fn misplaced_wildcards_are_rejected() {
        assert!(TopicFilter::new("").is_err());
        assert!(TopicFilter::new("a/#/c").is_err());
    }

    #[test]
    fn plus_matches_exactly_one_segment() {
        let filter = TopicFilter::new("rtk/v1/+/+/+/state").unwrap();
        assert!(filter.accept_topic_name("rtk/v1/acme/hq/ap-01/state"));
        assert!(!filter.accept_topic_name("rtk/v1/acme/hq/state"));
        assert!(!filter.accept_topic_name("rtk/v1/acme/hq/ap-01/evt"));
    }

    #[test]
    fn hash_matches_trailing_segments() {
        let filter = TopicFilter::new("rtk/v1/+/+/+/evt/#").unwrap();
        assert!(filter.accept_topic_name("rtk/v1/acme/hq/ap-01/evt/wifi.roam_miss"));
        assert!(filter.accept_topic_name("rtk/v1/acme/hq/ap-01/evt/a/b"));
        assert!(!filter.accept_topic_name("rtk/v1/acme/hq/ap-01/state"));
    }

    #[test]
    fn filters_accumulate_patterns() {
        let mut filter = TopicFilter::new("a/b").unwrap();
        filter.add("c/+").unwrap();
        filter.add_all(TopicFilter::new_unchecked("d/#"));

        assert!(filter.accept_topic_name("a/b"));
        assert!(filter.accept_topic_name("c/x"));
        assert!(filter.accept_topic_name("d/y/z"));
        assert!(!filter.accept_topic_name("e"));
    }
}
