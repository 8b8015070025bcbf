//! The canonical RTK topic space.
//!
//! Every canonical topic has five mandatory segments plus a channel tail:
//!
//! ```text
//! rtk/v1/<tenant>/<site>/<device_id>/<kind>[/<sub>...]
//! ```
//!
//! The first two segments form the schema prefix. The next three identify
//! the device. The tail identifies the [Channel] the message belongs to.
//! Any topic not matching these constraints is non-canonical and routes
//! through the wrapper fabric instead of the codec.

use mqtt_channel::Topic;
use mqtt_channel::TopicFilter;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

/// The topic schema of a deployment, built from a root prefix.
///
/// ```
/// # use rtk_api::topics::{RtkSchema, Channel, DeviceTopicId};
/// let rtk = RtkSchema::default();
/// assert_eq!(&rtk.prefix, "rtk/v1");
///
/// let topic = rtk.topic_for(
///     &"acme/hq/ap-01".parse().unwrap(),
///     &Channel::Event { event_type: "wifi.roam_miss".to_string() },
/// );
/// assert_eq!(topic.name, "rtk/v1/acme/hq/ap-01/evt/wifi.roam_miss");
///
/// let (device, channel) = rtk.device_channel_of(&topic).unwrap();
/// assert_eq!(device.device_id(), "ap-01");
/// ```
#[derive(Debug, Clone)]
pub struct RtkSchema {
    pub prefix: String,
}

/// The default schema using `rtk/v1` for the topic prefix
impl Default for RtkSchema {
    fn default() -> Self {
        RtkSchema::with_prefix("rtk/v1".to_string())
    }
}

impl RtkSchema {
    /// Build a new schema using the given prefix for all topics.
    pub fn with_prefix(prefix: String) -> Self {
        RtkSchema { prefix }
    }

    /// Get the topic addressing a given device channel.
    pub fn topic_for(&self, device: &DeviceTopicId, channel: &Channel) -> Topic {
        Topic::new_unchecked(&format!("{}/{device}/{channel}", self.prefix))
    }

    /// Get the device and channel addressed by some topic.
    pub fn device_channel_of(
        &self,
        topic: impl AsRef<str>,
    ) -> Result<(DeviceTopicId, Channel), TopicParseError> {
        let topic = topic.as_ref();
        let tail = self
            .strip_prefix(topic)
            .ok_or_else(|| TopicParseError::Prefix {
                expected: self.prefix.clone(),
                topic: topic.to_string(),
            })?;

        let mut segments = tail.splitn(4, '/');
        let tenant = segments.next().unwrap_or_default();
        let site = segments.next().unwrap_or_default();
        let device = segments.next().unwrap_or_default();
        let channel = segments.next().ok_or_else(|| TopicParseError::MissingKind {
            topic: topic.to_string(),
        })?;

        let device = DeviceTopicId::new(tenant, site, device)?;
        let channel = channel.parse()?;
        Ok((device, channel))
    }

    /// Check whether the topic belongs to the canonical topic space,
    /// i.e. starts with the schema prefix.
    ///
    /// This is a routing predicate, not a validity check: a topic may be
    /// canonical yet fail [RtkSchema::device_channel_of].
    pub fn is_canonical(&self, topic: impl AsRef<str>) -> bool {
        self.strip_prefix(topic.as_ref()).is_some()
    }

    /// Get the topic filter to subscribe to messages from specific devices
    /// and channels.
    ///
    /// ```
    /// # use rtk_api::topics::{RtkSchema, DeviceFilter, ChannelFilter};
    /// let rtk = RtkSchema::default();
    /// let topics = rtk.topics(DeviceFilter::AnyDevice, ChannelFilter::AnyEvent);
    /// assert!(topics.accept_topic_name("rtk/v1/acme/hq/ap-01/evt/wifi.roam_miss"));
    /// assert!(!topics.accept_topic_name("rtk/v1/acme/hq/ap-01/state"));
    /// ```
    pub fn topics(&self, device: DeviceFilter, channel: ChannelFilter) -> TopicFilter {
        let device = match device {
            DeviceFilter::AnyDevice => "+/+/+".to_string(),
            DeviceFilter::Tenant(tenant) => format!("{tenant}/+/+"),
            DeviceFilter::Device(device) => device.to_string(),
        };
        let channel = match channel {
            ChannelFilter::State => "state".to_string(),
            ChannelFilter::AnyTelemetry => "telemetry/+".to_string(),
            ChannelFilter::Telemetry(metric) => format!("telemetry/{metric}"),
            ChannelFilter::AnyEvent => "evt/#".to_string(),
            ChannelFilter::Event(event_type) => format!("evt/{event_type}"),
            ChannelFilter::AnyCommand => "cmd/+".to_string(),
            ChannelFilter::Command(direction) => format!("cmd/{direction}"),
            ChannelFilter::Attributes => "attr".to_string(),
            ChannelFilter::LastWill => "lwt".to_string(),
        };

        TopicFilter::new_unchecked(&format!("{}/{device}/{channel}", self.prefix))
    }

    fn strip_prefix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|tail| tail.strip_prefix('/'))
    }
}

/// The three topic segments identifying a device: tenant, site, device id.
///
/// Each segment is non-empty and free of `/`, `+` and `#`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DeviceTopicId {
    tenant: String,
    site: String,
    device: String,
}

impl DeviceTopicId {
    pub fn new(
        tenant: impl AsRef<str>,
        site: impl AsRef<str>,
        device: impl AsRef<str>,
    ) -> Result<Self, TopicParseError> {
        let id = DeviceTopicId {
            tenant: tenant.as_ref().to_string(),
            site: site.as_ref().to_string(),
            device: device.as_ref().to_string(),
        };
        for segment in [&id.tenant, &id.site, &id.device] {
            check_segment(segment)?;
        }
        Ok(id)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn device_id(&self) -> &str {
        &self.device
    }
}

fn check_segment(segment: &str) -> Result<(), TopicParseError> {
    if segment.is_empty() || segment.contains(['/', '+', '#']) {
        return Err(TopicParseError::InvalidSegment {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

impl Display for DeviceTopicId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.site, self.device)
    }
}

impl FromStr for DeviceTopicId {
    type Err = TopicParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split('/').collect::<Vec<_>>()[..] {
            [tenant, site, device] => DeviceTopicId::new(tenant, site, device),
            _ => Err(TopicParseError::InvalidDeviceId {
                input: input.to_string(),
            }),
        }
    }
}

/// A channel identifies the category of the messages exchanged over a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    State,
    Telemetry { metric: String },
    Event { event_type: String },
    Command { direction: CommandDirection },
    Attributes,
    LastWill,
}

impl Channel {
    /// The `kind` topic segment of this channel.
    pub fn kind(&self) -> &'static str {
        match self {
            Channel::State => "state",
            Channel::Telemetry { .. } => "telemetry",
            Channel::Event { .. } => "evt",
            Channel::Command { .. } => "cmd",
            Channel::Attributes => "attr",
            Channel::LastWill => "lwt",
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(channel: &str) -> Result<Self, ChannelParseError> {
        let segments: Vec<&str> = channel.split('/').collect();
        for segment in &segments {
            if segment.is_empty() || segment.contains(['+', '#']) {
                return Err(ChannelParseError::InvalidSegment {
                    channel: channel.to_string(),
                });
            }
        }
        match segments[..] {
            ["state"] => Ok(Channel::State),
            ["telemetry", metric] => Ok(Channel::Telemetry {
                metric: metric.to_string(),
            }),
            ["evt", event_type] => Ok(Channel::Event {
                event_type: event_type.to_string(),
            }),
            ["cmd", direction] => Ok(Channel::Command {
                direction: direction.parse()?,
            }),
            ["attr"] => Ok(Channel::Attributes),
            ["lwt"] => Ok(Channel::LastWill),
            ["telemetry"] | ["evt"] | ["cmd"] => Err(ChannelParseError::MissingSubSegment {
                kind: segments[0].to_string(),
            }),
            _ => Err(ChannelParseError::UnknownChannel {
                channel: channel.to_string(),
            }),
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::State => write!(f, "state"),
            Channel::Telemetry { metric } => write!(f, "telemetry/{metric}"),
            Channel::Event { event_type } => write!(f, "evt/{event_type}"),
            Channel::Command { direction } => write!(f, "cmd/{direction}"),
            Channel::Attributes => write!(f, "attr"),
            Channel::LastWill => write!(f, "lwt"),
        }
    }
}

/// The direction segment of a command topic: `req`, `ack` or `res`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandDirection {
    Request,
    Ack,
    Result,
}

impl FromStr for CommandDirection {
    type Err = ChannelParseError;

    fn from_str(direction: &str) -> Result<Self, ChannelParseError> {
        match direction {
            "req" => Ok(CommandDirection::Request),
            "ack" => Ok(CommandDirection::Ack),
            "res" => Ok(CommandDirection::Result),
            other => Err(ChannelParseError::UnknownCommandDirection {
                direction: other.to_string(),
            }),
        }
    }
}

impl Display for CommandDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandDirection::Request => write!(f, "req"),
            CommandDirection::Ack => write!(f, "ack"),
            CommandDirection::Result => write!(f, "res"),
        }
    }
}

/// Select the devices a subscription addresses.
pub enum DeviceFilter {
    AnyDevice,
    Tenant(String),
    Device(DeviceTopicId),
}

/// Select the channels a subscription addresses.
pub enum ChannelFilter {
    State,
    AnyTelemetry,
    Telemetry(String),
    AnyEvent,
    Event(String),
    AnyCommand,
    Command(CommandDirection),
    Attributes,
    LastWill,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum TopicParseError {
    #[error("Not a canonical topic, expected the {expected:?} prefix: {topic:?}")]
    Prefix { expected: String, topic: String },

    #[error("Not a canonical topic, no kind segment: {topic:?}")]
    MissingKind { topic: String },

    #[error("Invalid device segment: {segment:?}")]
    InvalidSegment { segment: String },

    #[error("A device identifier requires tenant/site/device segments: {input:?}")]
    InvalidDeviceId { input: String },

    #[error(transparent)]
    Channel(#[from] ChannelParseError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ChannelParseError {
    #[error("Unknown channel: {channel:?}")]
    UnknownChannel { channel: String },

    #[error("Invalid channel segment: {channel:?}")]
    InvalidSegment { channel: String },

    #[error("A {kind} channel requires a sub segment")]
    MissingSubSegment { kind: String },

    #[error("A command direction is req, ack or res, got {direction:?}")]
    UnknownCommandDirection { direction: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parsing_an_event_topic() {
        let rtk = RtkSchema::default();
        let (device, channel) = rtk
            .device_channel_of("rtk/v1/acme/hq/ap-01/evt/wifi.roam_miss")
            .unwrap();

        assert_eq!(device.tenant(), "acme");
        assert_eq!(device.site(), "hq");
        assert_eq!(device.device_id(), "ap-01");
        assert_eq!(
            channel,
            Channel::Event {
                event_type: "wifi.roam_miss".to_string()
            }
        );
    }

    #[test]
    fn parse_then_build_round_trips() {
        let rtk = RtkSchema::default();
        for topic in [
            "rtk/v1/acme/hq/ap-01/evt/wifi.roam_miss",
            "rtk/v1/acme/hq/ap-01/state",
            "rtk/v1/acme/hq/ap-01/telemetry/cpu_usage",
            "rtk/v1/acme/hq/ap-01/cmd/req",
            "rtk/v1/acme/hq/ap-01/cmd/ack",
            "rtk/v1/acme/hq/ap-01/cmd/res",
            "rtk/v1/acme/hq/ap-01/attr",
            "rtk/v1/acme/hq/ap-01/lwt",
        ] {
            let (device, channel) = rtk.device_channel_of(topic).unwrap();
            assert_eq!(rtk.topic_for(&device, &channel).name, topic);
        }
    }

    #[test]
    fn foreign_topics_are_not_canonical() {
        let rtk = RtkSchema::default();
        assert!(rtk.is_canonical("rtk/v1/acme/hq/ap-01/state"));
        assert!(!rtk.is_canonical("homeassistant/light/living/state"));
        assert!(!rtk.is_canonical("rtk/v2/acme/hq/ap-01/state"));
        assert!(!rtk.is_canonical("rtk"));
    }

    #[test]
    fn truncated_topics_are_rejected() {
        let rtk = RtkSchema::default();
        assert_matches!(
            rtk.device_channel_of("rtk/v1/acme/hq"),
            Err(TopicParseError::MissingKind { .. })
        );
        assert_matches!(
            rtk.device_channel_of("other/v1/acme/hq/ap-01/state"),
            Err(TopicParseError::Prefix { .. })
        );
    }

    #[test]
    fn wildcards_are_invalid_device_segments() {
        assert_matches!(
            DeviceTopicId::new("acme", "+", "ap-01"),
            Err(TopicParseError::InvalidSegment { .. })
        );
        assert_matches!(
            DeviceTopicId::new("", "hq", "ap-01"),
            Err(TopicParseError::InvalidSegment { .. })
        );
    }

    #[test]
    fn channels_require_their_sub_segment() {
        let rtk = RtkSchema::default();
        assert_matches!(
            rtk.device_channel_of("rtk/v1/acme/hq/ap-01/telemetry"),
            Err(TopicParseError::Channel(
                ChannelParseError::MissingSubSegment { .. }
            ))
        );
        assert_matches!(
            rtk.device_channel_of("rtk/v1/acme/hq/ap-01/cmd/nope"),
            Err(TopicParseError::Channel(
                ChannelParseError::UnknownCommandDirection { .. }
            ))
        );
        assert_matches!(
            rtk.device_channel_of("rtk/v1/acme/hq/ap-01/state/extra"),
            Err(TopicParseError::Channel(ChannelParseError::UnknownChannel {
                ..
            }))
        );
    }

    #[test]
    fn subscription_filters_cover_the_channel() {
        let rtk = RtkSchema::default();

        let states = rtk.topics(DeviceFilter::AnyDevice, ChannelFilter::State);
        assert!(states.accept_topic_name("rtk/v1/acme/hq/ap-01/state"));
        assert!(!states.accept_topic_name("rtk/v1/acme/hq/ap-01/attr"));

        let acks = rtk.topics(
            DeviceFilter::AnyDevice,
            ChannelFilter::Command(CommandDirection::Ack),
        );
        assert!(acks.accept_topic_name("rtk/v1/acme/hq/ap-01/cmd/ack"));
        assert!(!acks.accept_topic_name("rtk/v1/acme/hq/ap-01/cmd/res"));

        let tenant = rtk.topics(
            DeviceFilter::Tenant("acme".to_string()),
            ChannelFilter::AnyEvent,
        );
        assert!(tenant.accept_topic_name("rtk/v1/acme/dc/sw-07/evt/net.arp_loss"));
        assert!(!tenant.accept_topic_name("rtk/v1/other/dc/sw-07/evt/net.arp_loss"));
    }
}
