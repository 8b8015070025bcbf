use crate::errors::MqttError;
use crate::topics::Topic;
use rumqttc::Publish;
use rumqttc::QoS;

/// A message to be sent to or received from MQTT.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MqttMessage {
    pub topic: Topic,
    pub payload: Payload,
    pub qos: QoS,
    pub retain: bool,
}

/// A message payload
pub type Payload = Vec<u8>;

impl MqttMessage {
    /// A new message on the given topic, QoS 1, not retained.
    pub fn new<B>(topic: &Topic, payload: B) -> MqttMessage
    where
        B: Into<Payload>,
    {
        MqttMessage {
            topic: topic.clone(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn with_qos(self, qos: QoS) -> Self {
        Self { qos, ..self }
    }

    pub fn with_retain(self, retain: bool) -> Self {
        Self { retain, ..self }
    }

    /// The payload string (unless this payload is not UTF8)
    pub fn payload_str(&self) -> Result<&str, MqttError> {
        let bytes = self.payload_bytes();
        std::str::from_utf8(bytes).map_err(|err| MqttError::new_invalid_utf8_payload(bytes, err))
    }

    /// The bytes of the payload (except any trailing null char)
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload
            .strip_suffix(&[0])
            .unwrap_or(self.payload.as_slice())
    }
}

impl From<MqttMessage> for Publish {
    fn from(msg: MqttMessage) -> Self {
        let mut publish = Publish::new(&msg.topic.name, msg.qos, msg.payload);
        publish.retain = msg.retain;
        publish
    }
}

impl From<Publish> for MqttMessage {
    fn from(publish: Publish) -> Self {
        let Publish {
            topic,
            payload,
            qos,
            retain,
            ..
        } = publish;

        MqttMessage {
            topic: Topic::new_unchecked(&topic),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_null_char_is_stripped() {
        let topic = Topic::new_unchecked("data");
        let message = MqttMessage::new(&topic, &b"123\0"[..]);

        assert_eq!(message.payload_bytes(), b"123");
    }

    #[test]
    fn only_the_last_null_char_is_stripped() {
        let topic = Topic::new_unchecked("data");
        let message = MqttMessage::new(&topic, &b"123\0\0"[..]);

        assert_eq!(message.payload_bytes(), b"123\0");
    }

    #[test]
    fn empty_payload_is_fine() {
        let topic = Topic::new_unchecked("data");
        let message = MqttMessage::new(&topic, &b""[..]);

        assert_eq!(message.payload_bytes(), b"");
        assert_eq!(message.payload_str().unwrap(), "");
    }

    #[test]
    fn non_utf8_payload_is_reported_with_an_excerpt() {
        let topic = Topic::new_unchecked("data");
        let message = MqttMessage::new(&topic, &b"temperature\xc3\x28"[..]);

        let err = message.payload_str().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn retain_and_qos_are_preserved_through_publish() {
        let message = MqttMessage::new(&Topic::new_unchecked("data"), "x")
            .with_qos(QoS::ExactlyOnce)
            .with_retain(true);

        let publish: Publish = message.clone().into();
        let back: MqttMessage = publish.into();
        assert_eq!(back, message);
    }
}
