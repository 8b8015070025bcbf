use rumqttc::ConnectReturnCode;
use rumqttc::SubscribeReasonCode;

/// An MQTT related error
#[derive(thiserror::Error, Debug)]
pub enum MqttError {
    #[error("Invalid topic name: {name:?}")]
    InvalidTopic { name: String },

    #[error("Invalid topic filter: {pattern:?}")]
    InvalidFilter { pattern: String },

    #[error("MQTT client error: {0}")]
    ClientError(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    ConnectionError(#[from] rumqttc::ConnectionError),

    #[error("MQTT connection rejected by the broker: {code:?}")]
    ConnectionRejected { code: ConnectReturnCode },

    #[error("MQTT subscription rejected by the broker")]
    SubscriptionRejected,

    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Invalid UTF8 payload: {from}: {input_excerpt}...")]
    InvalidUtf8Payload {
        input_excerpt: String,
        from: std::str::Utf8Error,
    },

    #[error("The egress queue of the connection stayed full for {timeout_ms} ms: {topic}")]
    PublishBackpressure { topic: String, timeout_ms: u128 },

    #[error("The connection to the MQTT broker has been closed")]
    ClientOffline,
}

impl MqttError {
    pub fn new_invalid_utf8_payload(bytes: &[u8], from: std::str::Utf8Error) -> MqttError {
        const EXCERPT_LEN: usize = 80;
        let index = from.valid_up_to();
        let input = std::str::from_utf8(&bytes[..index]).unwrap_or("");

        MqttError::InvalidUtf8Payload {
            input_excerpt: MqttError::input_prefix(input, EXCERPT_LEN),
            from,
        }
    }

    pub fn maybe_connection_error(ack: &rumqttc::ConnAck) -> Option<MqttError> {
        match ack.code {
            ConnectReturnCode::Success => None,
            code => Some(MqttError::ConnectionRejected { code }),
        }
    }

    pub fn maybe_subscription_error(ack: &rumqttc::SubAck) -> Option<MqttError> {
        ack.return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
            .then_some(MqttError::SubscriptionRejected)
    }

    fn input_prefix(input: &str, len: usize) -> String {
        input
            .chars()
            .filter(|c| !c.is_whitespace())
            .take(len)
            .collect()
    }
}
