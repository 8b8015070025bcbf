use crate::errors::MqttError;
use crate::MqttMessage;
use crate::TopicFilter;
use rumqttc::LastWill;
use rumqttc::TlsConfiguration;
use rumqttc::Transport;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of an MQTT connection
#[derive(Debug, Clone)]
pub struct Config {
    /// The broker to connect to.
    pub broker: BrokerConfig,

    /// The client identifier used for the MQTT session.
    ///
    /// If none is provided, a random identifier is generated on connect
    /// and the session is clean regardless of `clean_session`.
    pub client_id: Option<String>,

    /// Clean the MQTT session upon connect if set to `true`.
    ///
    /// Default: `true`.
    pub clean_session: bool,

    /// Keep-alive interval sent to the broker.
    ///
    /// Default: 60 seconds.
    pub keep_alive: Duration,

    /// The list of topics subscribed to on connect, and re-subscribed to
    /// after every reconnection.
    ///
    /// Default: an empty topic list.
    pub subscriptions: TopicFilter,

    /// Capacity of the bounded egress queue.
    ///
    /// Default: `1024`.
    pub queue_capacity: usize,

    /// How long a publish may wait for room in the egress queue before
    /// failing with `PublishBackpressure`.
    ///
    /// Default: 5 seconds.
    pub publish_timeout: Duration,

    /// Maximum size for a message payload.
    ///
    /// Default: `1024 * 1024`.
    pub max_packet_size: usize,

    /// Last-will message registered with the broker on connect.
    ///
    /// Default: None
    pub last_will: Option<MqttMessage>,

    /// A message published on each (re)connection, once the subscriptions
    /// are established. Typically the retained "online" state announcement
    /// that supersedes the last-will.
    ///
    /// Default: None
    pub initial_message: Option<InitMessageFn>,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT host to connect to
    ///
    /// Default: "localhost"
    pub host: String,

    /// MQTT port to connect to, usually 1883 (insecure) or 8883 (TLS).
    ///
    /// Default: 1883
    pub port: u16,

    /// Username/password authentication.
    pub credentials: Option<Credentials>,

    /// TLS material, loaded from PEM files at connect time.
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// File-based TLS configuration.
///
/// Mirrors the mosquitto model: a CA to authenticate the broker, plus an
/// optional client certificate and key for mutual TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    pub ca_file: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    /// Recognized for config compatibility. The rustls stack offers no
    /// sanctioned insecure mode, so a `true` value is rejected at connect.
    pub insecure_skip_verify: bool,
}

#[derive(Clone)]
pub struct InitMessageFn {
    initfn: Arc<dyn Fn() -> MqttMessage + Send + Sync>,
}

impl InitMessageFn {
    pub fn new(call_back: impl Fn() -> MqttMessage + Sync + Send + 'static) -> InitMessageFn {
        InitMessageFn {
            initfn: Arc::new(call_back),
        }
    }

    pub fn new_init_message(&self) -> MqttMessage {
        (*self.initfn)()
    }
}

impl Debug for InitMessageFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Init message creation function")
    }
}

/// By default a client connects the local MQTT broker.
impl Default for Config {
    fn default() -> Self {
        Config {
            broker: BrokerConfig {
                host: String::from("localhost"),
                port: 1883,
                credentials: None,
                tls: None,
            },
            client_id: None,
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            subscriptions: TopicFilter::empty(),
            queue_capacity: 1024,
            publish_timeout: Duration::from_secs(5),
            max_packet_size: 1024 * 1024,
            last_will: None,
            initial_message: None,
        }
    }
}

impl Config {
    /// Set a custom host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.broker.host = host.into();
        self
    }

    /// Set a custom port
    pub fn with_port(mut self, port: u16) -> Self {
        self.broker.port = port;
        self
    }

    /// Set the client identifier
    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..self
        }
    }

    /// Set username/password credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.broker.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the TLS material
    pub fn with_tls(mut self, tls: TlsFiles) -> Self {
        self.broker.tls = Some(tls);
        self
    }

    /// Set the clean_session flag
    pub fn with_clean_session(self, flag: bool) -> Self {
        Self {
            clean_session: flag,
            ..self
        }
    }

    /// Set the keep-alive interval
    pub fn with_keep_alive(self, keep_alive: Duration) -> Self {
        Self { keep_alive, ..self }
    }

    /// Add a list of topics to subscribe to on connect
    ///
    /// Can be called several times to subscribe to many topics.
    pub fn with_subscriptions(mut self, topics: TopicFilter) -> Self {
        self.subscriptions.add_all(topics);
        self
    }

    /// Set the egress queue capacity
    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    /// Set the publish backpressure timeout
    pub fn with_publish_timeout(self, publish_timeout: Duration) -> Self {
        Self {
            publish_timeout,
            ..self
        }
    }

    /// Set the maximum size for a message payload
    pub fn with_max_packet_size(self, max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            ..self
        }
    }

    /// Set the last will message, published by the broker when the
    /// connection is lost, and by the client itself on a graceful close.
    pub fn with_last_will(self, last_will: MqttMessage) -> Self {
        Self {
            last_will: Some(last_will),
            ..self
        }
    }

    /// Set the initial message
    pub fn with_initial_message(
        self,
        initial_message: impl Fn() -> MqttMessage + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial_message: Some(InitMessageFn::new(initial_message)),
            ..self
        }
    }

    /// Wrap this config into an internal set of options for `rumqttc`.
    pub fn rumqttc_options(&self) -> Result<rumqttc::MqttOptions, MqttError> {
        let client_id = match &self.client_id {
            None => std::iter::repeat_with(fastrand::lowercase)
                .take(10)
                .collect(),
            Some(id) => id.clone(),
        };

        let broker = &self.broker;
        let mut mqtt_options = rumqttc::MqttOptions::new(client_id, &broker.host, broker.port);

        if self.client_id.is_none() {
            // A random session name will never be reused: nothing to resume.
            mqtt_options.set_clean_session(true);
        } else {
            mqtt_options.set_clean_session(self.clean_session);
        }

        if let Some(credentials) = &broker.credentials {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }

        if let Some(tls) = &broker.tls {
            mqtt_options.set_transport(Transport::Tls(tls.to_tls_configuration()?));
        }

        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let Some(last_will) = &self.last_will {
            mqtt_options.set_last_will(LastWill {
                topic: last_will.topic.name.clone(),
                message: last_will.payload_bytes().to_vec().into(),
                qos: last_will.qos,
                retain: last_will.retain,
            });
        }

        Ok(mqtt_options)
    }
}

impl TlsFiles {
    fn to_tls_configuration(&self) -> Result<TlsConfiguration, MqttError> {
        if self.insecure_skip_verify {
            return Err(MqttError::TlsConfig(
                "insecure_skip_verify is not supported by the rustls backend".into(),
            ));
        }

        let ca = std::fs::read(&self.ca_file).map_err(|err| {
            MqttError::TlsConfig(format!("cannot read {}: {err}", self.ca_file.display()))
        })?;

        let client_auth = match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert = std::fs::read(cert_file).map_err(|err| {
                    MqttError::TlsConfig(format!("cannot read {}: {err}", cert_file.display()))
                })?;
                let key = std::fs::read(key_file).map_err(|err| {
                    MqttError::TlsConfig(format!("cannot read {}: {err}", key_file.display()))
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => {
                return Err(MqttError::TlsConfig(
                    "cert_file and key_file must be provided together".into(),
                ))
            }
        };

        Ok(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topic;

    #[test]
    fn default_config_targets_the_local_broker() {
        let config = Config::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn a_last_will_is_handed_to_rumqttc() {
        let lwt = MqttMessage::new(&Topic::new_unchecked("rtk/v1/acme/hq/gw-01/lwt"), "{}")
            .with_retain(true);
        let config = Config::default().with_client_id("rtk-test").with_last_will(lwt);

        let options = config.rumqttc_options().unwrap();
        let last_will = options.last_will().unwrap();
        assert_eq!(last_will.topic, "rtk/v1/acme/hq/gw-01/lwt");
        assert!(last_will.retain);
    }

    #[test]
    fn insecure_skip_verify_is_rejected() {
        let config = Config::default().with_tls(TlsFiles {
            ca_file: "/nonexistent/ca.pem".into(),
            insecure_skip_verify: true,
            ..Default::default()
        });

        let err = config.rumqttc_options().unwrap_err();
        assert!(matches!(err, MqttError::TlsConfig(_)));
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let config = Config::default().with_tls(TlsFiles {
            ca_file: "/nonexistent/ca.pem".into(),
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: None,
            insecure_skip_verify: false,
        });

        assert!(config.rumqttc_options().is_err());
    }
}
