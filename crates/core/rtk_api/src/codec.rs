//! Conversion between typed canonical messages and raw MQTT messages.
//!
//! Encoding serializes an [RtkMessage] onto its canonical topic with the
//! QoS/retain defaults of its kind. Decoding picks the target type from
//! the topic `kind` segment, then validates the payload `schema` field
//! against the registry. When topic and payload disagree on the kind, the
//! topic wins and the mismatch is a hard failure.

use crate::envelope::Envelope;
use crate::envelope::RtkMessage;
use crate::schema::SchemaId;
use crate::schema::SchemaIdError;
use crate::schema::SchemaLookup;
use crate::schema::SchemaRegistry;
use crate::schema::ValidationError;
use crate::topics::Channel;
use crate::topics::CommandDirection;
use crate::topics::DeviceTopicId;
use crate::topics::RtkSchema;
use crate::topics::TopicParseError;
use mqtt_channel::MqttMessage;
use mqtt_channel::QoS;
use serde_json::Value as JsonValue;
use tracing::warn;

/// QoS and retain flags per message kind.
///
/// The defaults follow the wire contract: state, attributes and last-will
/// documents are retained at QoS 1; telemetry is fire-and-forget QoS 0;
/// events and command messages are QoS 1, not retained.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub state_qos: QoS,
    pub telemetry_qos: QoS,
    pub event_qos: QoS,
    pub command_qos: QoS,
    pub retain_state: bool,
    pub retain_attr: bool,
    pub retain_lwt: bool,
    pub retain_others: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            state_qos: QoS::AtLeastOnce,
            telemetry_qos: QoS::AtMostOnce,
            event_qos: QoS::AtLeastOnce,
            command_qos: QoS::AtLeastOnce,
            retain_state: true,
            retain_attr: true,
            retain_lwt: true,
            retain_others: false,
        }
    }
}

/// A decoded canonical message, with its addressing and any soft warnings
/// collected along the way.
#[derive(Debug)]
pub struct Decoded {
    pub device: DeviceTopicId,
    pub channel: Channel,
    pub message: RtkMessage,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Topic(#[from] TopicParseError),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SchemaId(#[from] SchemaIdError),

    #[error("Unsupported schema: {schema}")]
    SchemaUnsupported { schema: String },

    #[error("Topic kind {topic_kind:?} does not match payload schema kind {schema_kind:?}")]
    SchemaTopicMismatch {
        topic_kind: String,
        schema_kind: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub struct RtkCodec {
    schema: RtkSchema,
    registry: SchemaRegistry,
    options: CodecOptions,
}

impl RtkCodec {
    pub fn new(schema: RtkSchema, registry: SchemaRegistry) -> Self {
        RtkCodec {
            schema,
            registry,
            options: CodecOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CodecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema(&self) -> &RtkSchema {
        &self.schema
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Serialize a canonical message onto its topic.
    pub fn encode(
        &self,
        device: &DeviceTopicId,
        message: &RtkMessage,
    ) -> Result<MqttMessage, CodecError> {
        let channel = message.channel();
        let schema_kind = message.schema().kind();
        if schema_kind != channel.kind() {
            return Err(CodecError::SchemaTopicMismatch {
                topic_kind: channel.kind().to_string(),
                schema_kind: schema_kind.to_string(),
            });
        }

        let topic = self.schema.topic_for(device, &channel);
        let payload = match message {
            RtkMessage::State(env) => serde_json::to_vec(env)?,
            RtkMessage::Telemetry(env) => serde_json::to_vec(env)?,
            RtkMessage::Event(env) => serde_json::to_vec(env)?,
            RtkMessage::CommandRequest(env) => serde_json::to_vec(env)?,
            RtkMessage::CommandAck(env) => serde_json::to_vec(env)?,
            RtkMessage::CommandResult(env) => serde_json::to_vec(env)?,
            RtkMessage::Attributes(env) => serde_json::to_vec(env)?,
            RtkMessage::LastWill(env) => serde_json::to_vec(env)?,
        };

        let (qos, retain) = self.flags(&channel);
        Ok(MqttMessage::new(&topic, payload)
            .with_qos(qos)
            .with_retain(retain))
    }

    /// Decode a raw MQTT message received on a canonical topic.
    pub fn decode(&self, message: &MqttMessage) -> Result<Decoded, CodecError> {
        let (device, channel) = self.schema.device_channel_of(&message.topic.name)?;
        let value: JsonValue = serde_json::from_slice(message.payload_bytes())?;

        let schema_id: SchemaId = match value.get("schema").and_then(JsonValue::as_str) {
            Some(schema) => schema.parse()?,
            None => {
                return Err(ValidationError::Missing {
                    path: "schema".to_string(),
                }
                .into())
            }
        };

        // When the topic and the payload disagree, the topic wins: the
        // message is routed by its topic kind and the payload is rejected.
        if schema_id.kind() != channel.kind() {
            return Err(CodecError::SchemaTopicMismatch {
                topic_kind: channel.kind().to_string(),
                schema_kind: schema_id.kind().to_string(),
            });
        }

        let mut warnings = Vec::new();
        match self.registry.resolve(&schema_id) {
            SchemaLookup::Exact(descriptor) | SchemaLookup::BaseKind(descriptor) => {
                descriptor.validate(&value)?
            }
            SchemaLookup::KnownMajor => {
                let note = format!("unknown minor version of schema {schema_id}, decoding best-effort");
                warn!(topic = %message.topic, "{note}");
                warnings.push(note);
            }
            SchemaLookup::Unsupported => {
                return Err(CodecError::SchemaUnsupported {
                    schema: schema_id.to_string(),
                })
            }
        }

        let message = self.typed_message(&channel, value, &mut warnings)?;
        if message.device_id() != device.device_id() {
            warnings.push(format!(
                "payload device_id {:?} differs from topic device {:?}",
                message.device_id(),
                device.device_id()
            ));
        }

        Ok(Decoded {
            device,
            channel,
            message,
            warnings,
        })
    }

    fn typed_message(
        &self,
        channel: &Channel,
        value: JsonValue,
        warnings: &mut Vec<String>,
    ) -> Result<RtkMessage, CodecError> {
        let message = match channel {
            Channel::State => RtkMessage::State(serde_json::from_value(value)?),
            Channel::Telemetry { metric } => {
                let env: Envelope<crate::envelope::TelemetryPayload> =
                    serde_json::from_value(value)?;
                if &env.body.metric != metric {
                    warnings.push(format!(
                        "payload metric {:?} differs from topic metric {:?}",
                        env.body.metric, metric
                    ));
                }
                RtkMessage::Telemetry(env)
            }
            Channel::Event { event_type } => {
                let env: Envelope<crate::envelope::EventPayload> = serde_json::from_value(value)?;
                if &env.body.event_type != event_type {
                    warnings.push(format!(
                        "payload event type {:?} differs from topic event type {:?}",
                        env.body.event_type, event_type
                    ));
                }
                RtkMessage::Event(env)
            }
            Channel::Command { direction } => match direction {
                CommandDirection::Request => {
                    RtkMessage::CommandRequest(serde_json::from_value(value)?)
                }
                CommandDirection::Ack => RtkMessage::CommandAck(serde_json::from_value(value)?),
                CommandDirection::Result => {
                    RtkMessage::CommandResult(serde_json::from_value(value)?)
                }
            },
            Channel::Attributes => RtkMessage::Attributes(serde_json::from_value(value)?),
            Channel::LastWill => RtkMessage::LastWill(serde_json::from_value(value)?),
        };
        Ok(message)
    }

    fn flags(&self, channel: &Channel) -> (QoS, bool) {
        let options = &self.options;
        match channel {
            Channel::State => (options.state_qos, options.retain_state),
            Channel::Telemetry { .. } => (options.telemetry_qos, options.retain_others),
            Channel::Event { .. } => (options.event_qos, options.retain_others),
            Channel::Command { .. } => (options.command_qos, options.retain_others),
            Channel::Attributes => (options.state_qos, options.retain_attr),
            Channel::LastWill => (options.state_qos, options.retain_lwt),
        }
    }
}
