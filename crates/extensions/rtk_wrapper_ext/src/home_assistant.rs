//! The Home Assistant wrapper: `homeassistant/<domain>/<object>/...`
//! dialect to canonical state documents, and canonical `set` commands back.

use crate::transformer::PayloadRule;
use crate::transformer::PayloadType;
use crate::transformer::RouteRule;
use crate::transformer::TransformError;
use crate::transformer::UplinkOutput;
use crate::transformer::WrapperRegistration;
use crate::transformer::WrapperTransformer;
use mqtt_channel::MqttMessage;
use mqtt_channel::QoS;
use mqtt_channel::Topic;
use rtk_api::clock::Clock;
use rtk_api::clock::WallClock;
use rtk_api::envelope::DeviceStatus;
use rtk_api::envelope::HealthLevel;
use rtk_api::envelope::RtkMessage;
use rtk_api::envelope::StatePayload;
use rtk_api::flex::FlexPayload;
use rtk_api::topics::DeviceTopicId;
use serde_json::json;
use serde_json::Map;
use serde_json::Value as JsonValue;
use std::sync::Arc;

const WRAPPER_NAME: &str = "homeassistant";
const WRAPPER_VERSION: &str = "1.2.0";

/// Configuration captured at registration: where the wrapped devices land
/// in the canonical topic space, and the clock stamping their envelopes.
pub struct HomeAssistantWrapper {
    tenant: String,
    site: String,
    clock: Arc<dyn Clock>,
}

impl HomeAssistantWrapper {
    pub fn new(tenant: impl Into<String>, site: impl Into<String>) -> Self {
        HomeAssistantWrapper {
            tenant: tenant.into(),
            site: site.into(),
            clock: Arc::new(WallClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The canonical device for a Home Assistant entity, e.g.
    /// `light/living` -> `<tenant>/<site>/light-living`.
    fn device_for(&self, entity: &HaEntity<'_>) -> Result<DeviceTopicId, TransformError> {
        DeviceTopicId::new(
            &self.tenant,
            &self.site,
            format!("{}-{}", entity.domain, entity.object),
        )
        .map_err(|err| TransformError::DeviceId {
            reason: err.to_string(),
        })
    }
}

/// A Home Assistant entity address, parsed from a dialect topic.
#[derive(Debug, PartialEq, Eq)]
struct HaEntity<'a> {
    domain: &'a str,
    object: &'a str,
}

impl<'a> HaEntity<'a> {
    /// Parse `homeassistant/<domain>/<object>/<tail>`, returning the
    /// entity and the tail segment.
    fn from_topic(topic: &'a str) -> Option<(Self, &'a str)> {
        match topic.split('/').collect::<Vec<&str>>()[..] {
            ["homeassistant", domain, object, tail]
                if !domain.is_empty() && !object.is_empty() =>
            {
                Some((HaEntity { domain, object }, tail))
            }
            _ => None,
        }
    }

    /// Recover the entity from a canonical device id, `<domain>-<object>`.
    fn from_device_id(device_id: &'a str) -> Option<Self> {
        let (domain, object) = device_id.split_once('-')?;
        (!domain.is_empty() && !object.is_empty()).then_some(HaEntity { domain, object })
    }
}

fn status_of(state: &str) -> DeviceStatus {
    match state.to_ascii_lowercase().as_str() {
        "on" | "home" | "open" | "online" => DeviceStatus::Online,
        "off" | "unavailable" | "closed" | "offline" => DeviceStatus::Offline,
        _ => DeviceStatus::Degraded,
    }
}

impl WrapperTransformer for HomeAssistantWrapper {
    fn registration(&self) -> WrapperRegistration {
        WrapperRegistration {
            name: WRAPPER_NAME.to_string(),
            version: WRAPPER_VERSION.to_string(),
            supported_device_types: vec![
                "light".to_string(),
                "switch".to_string(),
                "sensor".to_string(),
            ],
            uplink_rules: vec![RouteRule::new(100, "homeassistant/+/+/state")
                .with_payload_rule(PayloadRule::required("state").of_type(PayloadType::String))],
            downlink_rules: vec![RouteRule::new(100, "homeassistant/+/+/set")
                .with_device_types(&["light", "switch", "sensor"])],
        }
    }

    fn can_handle_uplink(&self, message: &MqttMessage) -> bool {
        match HaEntity::from_topic(&message.topic.name) {
            Some((_, "state")) => FlexPayload::from_slice(message.payload_bytes())
                .map(|payload| payload.get_str("state").is_some())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn can_handle_downlink(&self, device_type: &str, message: &RtkMessage) -> bool {
        matches!(device_type, "light" | "switch" | "sensor")
            && matches!(message, RtkMessage::CommandRequest(_))
    }

    fn transform_uplink(&self, message: &MqttMessage) -> Result<UplinkOutput, TransformError> {
        let Some((entity, "state")) = HaEntity::from_topic(&message.topic.name) else {
            return Err(TransformError::NotHandled {
                topic: message.topic.name.clone(),
            });
        };

        let payload = FlexPayload::from_slice(message.payload_bytes())?;
        let state = payload
            .get_str("state")
            .ok_or_else(|| TransformError::MissingField {
                path: "state".to_string(),
            })?;

        // Everything beside the state flag is carried over as properties,
        // with the raw state kept for consumers wanting the dialect value.
        let mut properties = Map::new();
        if let Some(object) = payload.as_value().as_object() {
            for (key, value) in object {
                if key != "state" {
                    properties.insert(key.clone(), value.clone());
                }
            }
        }
        properties.insert("state".to_string(), json!(state.to_ascii_lowercase()));

        let device = self.device_for(&entity)?;
        let body = StatePayload {
            status: status_of(state),
            health: HealthLevel::Healthy,
            uptime: None,
            last_seen: None,
            properties,
        };
        let message = RtkMessage::state(device.device_id(), body, self.clock.now_millis());
        Ok(UplinkOutput { device, message })
    }

    fn transform_downlink(
        &self,
        device: &DeviceTopicId,
        message: &RtkMessage,
    ) -> Result<MqttMessage, TransformError> {
        let RtkMessage::CommandRequest(request) = message else {
            return Err(TransformError::UnsupportedOperation {
                op: format!("{:?}", message.channel()),
            });
        };
        if request.body.op != "set" {
            return Err(TransformError::UnsupportedOperation {
                op: request.body.op.clone(),
            });
        }

        let entity =
            HaEntity::from_device_id(device.device_id()).ok_or_else(|| TransformError::DeviceId {
                reason: format!(
                    "device id {:?} is not of the <domain>-<object> form",
                    device.device_id()
                ),
            })?;

        let args = FlexPayload::from_value(request.body.args.clone());
        let state = args
            .get_str("state")
            .ok_or_else(|| TransformError::MissingField {
                path: "args.state".to_string(),
            })?;

        let mut payload = Map::new();
        payload.insert("state".to_string(), json!(state.to_ascii_uppercase()));
        if let Some(brightness) = args.get_i64("brightness") {
            payload.insert("brightness".to_string(), json!(brightness));
        }

        let topic = Topic::new_unchecked(&format!(
            "homeassistant/{}/{}/set",
            entity.domain, entity.object
        ));
        Ok(
            MqttMessage::new(&topic, JsonValue::Object(payload).to_string())
                .with_qos(QoS::AtLeastOnce),
        )
    }

    fn validate_uplink(&self, message: &MqttMessage) -> Vec<String> {
        let mut findings = Vec::new();
        match HaEntity::from_topic(&message.topic.name) {
            Some((_, "state")) => (),
            _ => findings.push(format!(
                "topic {:?} is not a homeassistant state topic",
                message.topic.name
            )),
        }
        match FlexPayload::from_slice(message.payload_bytes()) {
            Ok(payload) => {
                if payload.get_str("state").is_none() {
                    findings.push("payload has no string `state` field".to_string());
                }
                if payload.has("brightness") && payload.get_f64("brightness").is_none() {
                    findings.push("`brightness` is not numeric".to_string());
                }
            }
            Err(err) => findings.push(format!("payload is not JSON: {err}")),
        }
        findings
    }

    fn validate_downlink(&self, message: &RtkMessage) -> Vec<String> {
        match message {
            RtkMessage::CommandRequest(request) if request.body.op == "set" => {
                let args = FlexPayload::from_value(request.body.args.clone());
                if args.get_str("state").is_none() {
                    vec!["`set` requires a string args.state".to_string()]
                } else {
                    vec![]
                }
            }
            RtkMessage::CommandRequest(request) => {
                vec![format!("unsupported operation {:?}", request.body.op)]
            }
            _ => vec!["only command requests can go downlink".to_string()],
        }
    }
}
