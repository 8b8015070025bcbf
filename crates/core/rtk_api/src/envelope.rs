//! Typed payloads and the wire envelope wrapping them.
//!
//! Every canonical message is a JSON document carrying the envelope fields
//! (`schema`, `ts`, `device_id`, optional `trace`) plus the body fields of
//! its kind, flattened at the top level.

use crate::schema::SchemaId;
use crate::topics::Channel;
use crate::topics::CommandDirection;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt::Display;
use std::fmt::Formatter;

/// The envelope common to all canonical messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub schema: SchemaId,

    /// Unix timestamp, in milliseconds.
    pub ts: i64,

    /// Redundant with the topic; kept in the payload for log joins.
    pub device_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,

    #[serde(flatten)]
    pub body: T,
}

/// Correlation identifiers for command flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Retained per-device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub status: DeviceStatus,
    pub health: HealthLevel,

    /// Seconds since the device booted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,

    /// Unix milliseconds of the last activity seen by the device itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Error,
}

/// A scalar telemetry sample. Not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub metric: String,
    pub value: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Unix milliseconds of the sample itself.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// A diagnostic event. Not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub level: EventLevel,
    pub message: String,

    /// Unix milliseconds of the occurrence.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// The body of a `cmd/req` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequestBody {
    pub id: String,
    pub op: String,

    /// The schema the `args` follow, when the operation declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_schema: Option<SchemaId>,

    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub args: JsonValue,

    pub timeout_ms: u64,
    pub expect: CommandExpect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandExpect {
    Ack,
    Result,
}

/// The body of a `cmd/ack` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAckBody {
    pub id: String,
    pub accepted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// The body of a `cmd/res` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResultBody {
    pub id: String,
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Retained free-form device attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttrPayload {
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

/// The last-will testament registered at connect: published by the broker
/// when the device vanishes, superseded by an explicit online state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwtPayload {
    pub status: DeviceStatus,
}

/// A canonical message of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RtkMessage {
    State(Envelope<StatePayload>),
    Telemetry(Envelope<TelemetryPayload>),
    Event(Envelope<EventPayload>),
    CommandRequest(Envelope<CommandRequestBody>),
    CommandAck(Envelope<CommandAckBody>),
    CommandResult(Envelope<CommandResultBody>),
    Attributes(Envelope<AttrPayload>),
    LastWill(Envelope<LwtPayload>),
}

impl RtkMessage {
    /// A state message under the builtin `state/1.0` schema.
    pub fn state(device_id: impl Into<String>, body: StatePayload, ts: i64) -> Self {
        RtkMessage::State(Envelope {
            schema: SchemaId::new("state", 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// A telemetry sample under `telemetry.<metric>/1.0`.
    pub fn telemetry(device_id: impl Into<String>, body: TelemetryPayload, ts: i64) -> Self {
        RtkMessage::Telemetry(Envelope {
            schema: SchemaId::new(format!("telemetry.{}", body.metric), 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// An event under `evt.<type>/1.0`.
    pub fn event(device_id: impl Into<String>, body: EventPayload, ts: i64) -> Self {
        RtkMessage::Event(Envelope {
            schema: SchemaId::new(format!("evt.{}", body.event_type), 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// A command request under the builtin `cmd.req/1.0` schema.
    pub fn command_request(
        device_id: impl Into<String>,
        body: CommandRequestBody,
        ts: i64,
    ) -> Self {
        RtkMessage::CommandRequest(Envelope {
            schema: SchemaId::new("cmd.req", 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// A command acknowledgement under the builtin `cmd.ack/1.0` schema.
    pub fn command_ack(device_id: impl Into<String>, body: CommandAckBody, ts: i64) -> Self {
        RtkMessage::CommandAck(Envelope {
            schema: SchemaId::new("cmd.ack", 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// A command result under the builtin `cmd.res/1.0` schema.
    pub fn command_result(device_id: impl Into<String>, body: CommandResultBody, ts: i64) -> Self {
        RtkMessage::CommandResult(Envelope {
            schema: SchemaId::new("cmd.res", 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body,
        })
    }

    /// The offline testament registered with the broker at connect.
    pub fn offline_lwt(device_id: impl Into<String>, ts: i64) -> Self {
        RtkMessage::LastWill(Envelope {
            schema: SchemaId::new("lwt", 1, 0),
            ts,
            device_id: device_id.into(),
            trace: None,
            body: LwtPayload {
                status: DeviceStatus::Offline,
            },
        })
    }

    /// Attach trace identifiers to this message.
    pub fn with_trace(mut self, trace: Trace) -> Self {
        let slot = match &mut self {
            RtkMessage::State(env) => &mut env.trace,
            RtkMessage::Telemetry(env) => &mut env.trace,
            RtkMessage::Event(env) => &mut env.trace,
            RtkMessage::CommandRequest(env) => &mut env.trace,
            RtkMessage::CommandAck(env) => &mut env.trace,
            RtkMessage::CommandResult(env) => &mut env.trace,
            RtkMessage::Attributes(env) => &mut env.trace,
            RtkMessage::LastWill(env) => &mut env.trace,
        };
        *slot = Some(trace);
        self
    }

    /// The channel this message is published on.
    pub fn channel(&self) -> Channel {
        match self {
            RtkMessage::State(_) => Channel::State,
            RtkMessage::Telemetry(env) => Channel::Telemetry {
                metric: env.body.metric.clone(),
            },
            RtkMessage::Event(env) => Channel::Event {
                event_type: env.body.event_type.clone(),
            },
            RtkMessage::CommandRequest(_) => Channel::Command {
                direction: CommandDirection::Request,
            },
            RtkMessage::CommandAck(_) => Channel::Command {
                direction: CommandDirection::Ack,
            },
            RtkMessage::CommandResult(_) => Channel::Command {
                direction: CommandDirection::Result,
            },
            RtkMessage::Attributes(_) => Channel::Attributes,
            RtkMessage::LastWill(_) => Channel::LastWill,
        }
    }

    pub fn schema(&self) -> &SchemaId {
        match self {
            RtkMessage::State(env) => &env.schema,
            RtkMessage::Telemetry(env) => &env.schema,
            RtkMessage::Event(env) => &env.schema,
            RtkMessage::CommandRequest(env) => &env.schema,
            RtkMessage::CommandAck(env) => &env.schema,
            RtkMessage::CommandResult(env) => &env.schema,
            RtkMessage::Attributes(env) => &env.schema,
            RtkMessage::LastWill(env) => &env.schema,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            RtkMessage::State(env) => &env.device_id,
            RtkMessage::Telemetry(env) => &env.device_id,
            RtkMessage::Event(env) => &env.device_id,
            RtkMessage::CommandRequest(env) => &env.device_id,
            RtkMessage::CommandAck(env) => &env.device_id,
            RtkMessage::CommandResult(env) => &env.device_id,
            RtkMessage::Attributes(env) => &env.device_id,
            RtkMessage::LastWill(env) => &env.device_id,
        }
    }
}

impl Display for EventLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLevel::Info => write!(f, "info"),
            EventLevel::Warning => write!(f, "warning"),
            EventLevel::Error => write!(f, "error"),
            EventLevel::Critical => write!(f, "critical"),
        }
    }
}
