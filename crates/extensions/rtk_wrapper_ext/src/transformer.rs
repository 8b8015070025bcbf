//! The wrapper contract: registration data and the transformer trait.

use mqtt_channel::MqttMessage;
use rtk_api::envelope::RtkMessage;
use rtk_api::flex::FlexPayload;
use rtk_api::topics::DeviceTopicId;
use rtk_api::topics::TopicParseError;
use serde_json::Value as JsonValue;

/// What a wrapper declares when registered.
///
/// Registrations are immutable: changing routes means unregistering and
/// registering anew.
#[derive(Debug, Clone)]
pub struct WrapperRegistration {
    pub name: String,
    pub version: String,

    /// Device types this wrapper can address on the way down.
    /// `*` matches any type.
    pub supported_device_types: Vec<String>,

    pub uplink_rules: Vec<RouteRule>,
    pub downlink_rules: Vec<RouteRule>,
}

/// One route of a wrapper: a topic pattern plus payload constraints.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub priority: i32,
    pub topic_pattern: String,
    pub payload_rules: Vec<PayloadRule>,
    pub device_types: Vec<String>,
}

impl RouteRule {
    pub fn new(priority: i32, topic_pattern: impl Into<String>) -> Self {
        RouteRule {
            priority,
            topic_pattern: topic_pattern.into(),
            payload_rules: vec![],
            device_types: vec![],
        }
    }

    pub fn with_payload_rule(mut self, rule: PayloadRule) -> Self {
        self.payload_rules.push(rule);
        self
    }

    pub fn with_device_types(mut self, types: &[&str]) -> Self {
        self.device_types = types.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// A constraint on one payload field, evaluated with [FlexPayload].
#[derive(Debug, Clone)]
pub struct PayloadRule {
    /// Dot-separated path into the payload document.
    pub field_path: String,
    pub expected_type: Option<PayloadType>,
    pub expected_value: Option<JsonValue>,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl PayloadType {
    fn name(&self) -> &'static str {
        match self {
            PayloadType::String => "string",
            PayloadType::Number => "number",
            PayloadType::Bool => "bool",
            PayloadType::Object => "object",
            PayloadType::Array => "array",
        }
    }
}

impl PayloadRule {
    pub fn required(field_path: impl Into<String>) -> Self {
        PayloadRule {
            field_path: field_path.into(),
            expected_type: None,
            expected_value: None,
            required: true,
        }
    }

    pub fn optional(field_path: impl Into<String>) -> Self {
        PayloadRule {
            required: false,
            ..PayloadRule::required(field_path)
        }
    }

    pub fn of_type(mut self, expected: PayloadType) -> Self {
        self.expected_type = Some(expected);
        self
    }

    pub fn equals(mut self, expected: JsonValue) -> Self {
        self.expected_value = Some(expected);
        self
    }

    /// Evaluate this rule against a payload.
    ///
    /// An absent field fails only a `required` rule; a present field must
    /// match the expected type and value when set.
    pub fn matches(&self, payload: &FlexPayload) -> bool {
        let Some(value) = payload.get(&self.field_path) else {
            return !self.required;
        };

        if let Some(expected) = &self.expected_type {
            if payload.type_name(&self.field_path) != Some(expected.name()) {
                return false;
            }
        }

        if let Some(expected) = &self.expected_value {
            if value != expected {
                return false;
            }
        }

        true
    }
}

/// The canonical outcome of an uplink translation.
#[derive(Debug)]
pub struct UplinkOutput {
    pub device: DeviceTopicId,
    pub message: RtkMessage,
}

/// A bidirectional translator between one device dialect and the canonical
/// model.
///
/// Transformers are pure functions over their input plus the configuration
/// captured at registration; they hold no mutable state. An uplink
/// transform must produce a message whose schema the codec registry knows,
/// with a device id derived from the source topic or payload. Anything
/// else is a [TransformError], never a silent drop.
pub trait WrapperTransformer: Send + Sync {
    fn registration(&self) -> WrapperRegistration;

    fn can_handle_uplink(&self, message: &MqttMessage) -> bool;
    fn can_handle_downlink(&self, device_type: &str, message: &RtkMessage) -> bool;

    fn transform_uplink(&self, message: &MqttMessage) -> Result<UplinkOutput, TransformError>;
    fn transform_downlink(
        &self,
        device: &DeviceTopicId,
        message: &RtkMessage,
    ) -> Result<MqttMessage, TransformError>;

    /// Non-fatal findings on an uplink message, for diagnostics.
    fn validate_uplink(&self, message: &MqttMessage) -> Vec<String>;

    /// Non-fatal findings on a downlink message, for diagnostics.
    fn validate_downlink(&self, message: &RtkMessage) -> Vec<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Message not handled by this wrapper: {topic}")]
    NotHandled { topic: String },

    #[error("Cannot derive a device id: {reason}")]
    DeviceId { reason: String },

    #[error("Missing payload field: {path}")]
    MissingField { path: String },

    #[error("Unsupported operation for this dialect: {op}")]
    UnsupportedOperation { op: String },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Topic(#[from] TopicParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> FlexPayload {
        FlexPayload::from_value(json!({
            "state": "ON",
            "brightness": 128,
            "color": {"mode": "rgb"},
        }))
    }

    #[test]
    fn a_required_rule_fails_on_absent_fields() {
        assert!(PayloadRule::required("state").matches(&payload()));
        assert!(!PayloadRule::required("power").matches(&payload()));
        assert!(PayloadRule::optional("power").matches(&payload()));
    }

    #[test]
    fn a_type_rule_fails_on_mismatch() {
        assert!(PayloadRule::required("state")
            .of_type(PayloadType::String)
            .matches(&payload()));
        assert!(!PayloadRule::required("brightness")
            .of_type(PayloadType::String)
            .matches(&payload()));
        assert!(PayloadRule::required("color")
            .of_type(PayloadType::Object)
            .matches(&payload()));
    }

    #[test]
    fn a_value_rule_requires_equality() {
        assert!(PayloadRule::required("state")
            .equals(json!("ON"))
            .matches(&payload()));
        assert!(!PayloadRule::required("state")
            .equals(json!("OFF"))
            .matches(&payload()));
    }

    #[test]
    fn optional_typed_rules_pass_when_absent() {
        assert!(PayloadRule::optional("power")
            .of_type(PayloadType::Bool)
            .matches(&payload()));
    }
}
