//! The device plugin contract and the registry of plugin constructors.
//!
//! A plugin adapts one locally-attached device to the canonical model:
//! it answers state/health/telemetry queries and handles the commands
//! addressed to its device. `handle_command` must come back quickly with
//! an ack-shaped response; long-running work returns `Pending` and
//! publishes its result later through the [ControllerHandle].
//!
//! Plugins are plain trait objects built by constructors keyed by their
//! `type` string, so configuration can name them without any runtime
//! subclassing machinery.

use async_trait::async_trait;
use mqtt_channel::MqttError;
use mqtt_channel::MqttPublisher;
use rtk_api::clock::Clock;
use rtk_api::codec::CodecError;
use rtk_api::codec::RtkCodec;
use rtk_api::envelope::CommandAckBody;
use rtk_api::envelope::CommandRequestBody;
use rtk_api::envelope::CommandResultBody;
use rtk_api::envelope::Envelope;
use rtk_api::envelope::EventPayload;
use rtk_api::envelope::HealthLevel;
use rtk_api::envelope::RtkMessage;
use rtk_api::envelope::StatePayload;
use rtk_api::envelope::TelemetryPayload;
use rtk_api::topics::DeviceTopicId;
use serde_json::Map;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity a plugin declares about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub plugin_type: String,
    pub version: String,
}

/// The configuration one plugin instance is initialized with.
#[derive(Debug, Clone)]
pub struct PluginInstanceConfig {
    pub name: String,
    pub plugin_type: String,
    pub device: DeviceTopicId,
    pub config: Map<String, JsonValue>,
}

impl PluginInstanceConfig {
    /// A required string entry of the free-form config block.
    pub fn require_str(&self, field: &str) -> Result<&str, PluginError> {
        self.config
            .get(field)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| PluginError::MissingConfig {
                field: field.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Structured plugin health: an overall verdict plus the checks behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginHealth {
    pub status: HealthLevel,

    /// 0.0 (dead) to 1.0 (fully healthy).
    pub score: f64,

    pub checks: Vec<HealthCheck>,
    pub diagnostics: Map<String, JsonValue>,
}

impl PluginHealth {
    pub fn healthy() -> Self {
        PluginHealth {
            status: HealthLevel::Healthy,
            score: 1.0,
            checks: vec![],
            diagnostics: Map::new(),
        }
    }
}

/// What a plugin answers to a command request, within the ack window.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    /// Work done synchronously: ack then result.
    Completed {
        ok: bool,
        result: Option<JsonValue>,
        err: Option<String>,
    },

    /// Work accepted; the result will be published later through the
    /// controller handle.
    Pending { estimated_completion_ms: Option<u64> },

    /// The request is refused: a negative ack.
    Rejected { err: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Missing required config field: {field}")]
    MissingConfig { field: String },

    #[error("Invalid plugin configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("The plugin is not running")]
    NotRunning,

    #[error("{0}")]
    Internal(String),
}

/// The capability set every device adapter implements.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    /// Called exactly once, before `start`.
    async fn initialize(&mut self, config: &PluginInstanceConfig) -> Result<(), PluginError>;

    /// Called exactly once after a successful `initialize`. The handle
    /// outlives the call: keep it for asynchronous publishes.
    async fn start(&mut self, handle: ControllerHandle) -> Result<(), PluginError>;

    /// Called exactly once at shutdown.
    async fn stop(&mut self) -> Result<(), PluginError>;

    async fn state(&self) -> StatePayload;

    async fn health(&self) -> PluginHealth;

    /// The current value of one metric, if the plugin tracks it.
    async fn telemetry(&self, metric: &str) -> Option<TelemetryPayload>;

    /// Answer a command addressed to this plugin's device. Must return
    /// within the ack window (100 ms): anything slower goes `Pending`.
    async fn handle_command(&self, request: &Envelope<CommandRequestBody>) -> CommandResponse;

    /// Merge the given properties into the device state.
    async fn update_state(&self, properties: Map<String, JsonValue>) -> Result<(), PluginError>;
}

/// Failures of a plugin publishing through its handle.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Mqtt(#[from] MqttError),
}

/// The controller-side services handed to a started plugin.
///
/// All publishes go through the controller's bounded egress queue and
/// carry the plugin's device identity.
#[derive(Clone)]
pub struct ControllerHandle {
    device: DeviceTopicId,
    publisher: MqttPublisher,
    codec: Arc<RtkCodec>,
    clock: Arc<dyn Clock>,
}

impl ControllerHandle {
    pub fn new(
        device: DeviceTopicId,
        publisher: MqttPublisher,
        codec: Arc<RtkCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ControllerHandle {
            device,
            publisher,
            codec,
            clock,
        }
    }

    pub fn device(&self) -> &DeviceTopicId {
        &self.device
    }

    pub async fn publish_state(&self, state: StatePayload) -> Result<(), HandleError> {
        let message =
            RtkMessage::state(self.device.device_id(), state, self.clock.now_millis());
        self.publish(&message).await
    }

    pub async fn publish_telemetry(&self, sample: TelemetryPayload) -> Result<(), HandleError> {
        let message =
            RtkMessage::telemetry(self.device.device_id(), sample, self.clock.now_millis());
        self.publish(&message).await
    }

    pub async fn publish_event(&self, event: EventPayload) -> Result<(), HandleError> {
        let message = RtkMessage::event(self.device.device_id(), event, self.clock.now_millis());
        self.publish(&message).await
    }

    /// Publish the acknowledgement of a command request.
    pub async fn publish_ack(&self, ack: CommandAckBody) -> Result<(), HandleError> {
        let message =
            RtkMessage::command_ack(self.device.device_id(), ack, self.clock.now_millis());
        self.publish(&message).await
    }

    /// Publish the deferred result of a previously `Pending` command.
    pub async fn publish_result(&self, result: CommandResultBody) -> Result<(), HandleError> {
        let message =
            RtkMessage::command_result(self.device.device_id(), result, self.clock.now_millis());
        self.publish(&message).await
    }

    async fn publish(&self, message: &RtkMessage) -> Result<(), HandleError> {
        let encoded = self.codec.encode(&self.device, message)?;
        self.publisher.publish(encoded).await?;
        Ok(())
    }
}

pub type PluginConstructor = Box<dyn Fn() -> Box<dyn DevicePlugin> + Send + Sync>;

/// Constructors of the available plugin types, keyed by `type` string.
#[derive(Default)]
pub struct PluginRegistry {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn register(
        &mut self,
        plugin_type: impl Into<String>,
        constructor: impl Fn() -> Box<dyn DevicePlugin> + Send + Sync + 'static,
    ) {
        self.constructors
            .insert(plugin_type.into(), Box::new(constructor));
    }

    pub fn build(&self, plugin_type: &str) -> Option<Box<dyn DevicePlugin>> {
        self.constructors
            .get(plugin_type)
            .map(|constructor| constructor())
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
