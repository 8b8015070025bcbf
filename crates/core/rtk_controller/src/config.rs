//! Controller configuration: YAML file, `RTK_`-prefixed environment
//! overrides, validation.

use rtk_api::codec::CodecOptions;
use rtk_api::topics::RtkSchema;
use crate::session::SessionConfig;
use mqtt_channel::QoS;
use mqtt_channel::TlsFiles;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("Invalid environment override {var}: {reason}")]
    InvalidEnv { var: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub mqtt: MqttSection,

    #[serde(default)]
    pub rtk: RtkSection,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub wrapper: WrapperSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    /// Broker URI: `mqtt://host:port`, `mqtts://host:port` or `host:port`.
    pub broker: String,

    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default = "default_true")]
    pub clean_session: bool,

    #[serde(default)]
    pub tls: TlsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtkSection {
    pub default_tenant: String,
    pub default_site: String,
    pub topic_prefix: String,
    pub qos: QosSection,
    pub retained: RetainedSection,
}

impl Default for RtkSection {
    fn default() -> Self {
        RtkSection {
            default_tenant: "default".to_string(),
            default_site: "main".to_string(),
            topic_prefix: "rtk/v1".to_string(),
            qos: QosSection::default(),
            retained: RetainedSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosSection {
    pub state: u8,
    pub telemetry: u8,
    pub event: u8,
    pub command: u8,
}

impl Default for QosSection {
    fn default() -> Self {
        QosSection {
            state: 1,
            telemetry: 0,
            event: 1,
            command: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetainedSection {
    pub state: bool,
    pub attr: bool,
    pub lwt: bool,
    pub others: bool,
}

impl Default for RetainedSection {
    fn default() -> Self {
        RetainedSection {
            state: true,
            attr: true,
            lwt: true,
            others: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_concurrent: usize,

    /// Seconds.
    pub timeout: u64,

    /// Seconds.
    pub cleanup_interval: u64,

    /// Seconds terminal sessions stay readable.
    pub cleanup_grace: u64,

    pub auto_cleanup: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            max_concurrent: 100,
            timeout: 15 * 60,
            cleanup_interval: 60,
            cleanup_grace: 5 * 60,
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WrapperSection {
    #[serde(default)]
    pub registry: WrapperRegistrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WrapperRegistrySection {
    pub auto_discovery: bool,

    /// Seconds.
    pub discovery_timeout: u64,

    pub wrappers: Vec<WrapperEntry>,
}

impl Default for WrapperRegistrySection {
    fn default() -> Self {
        WrapperRegistrySection {
            auto_discovery: false,
            discovery_timeout: 30,
            wrappers: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WrapperEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub config_file: Option<PathBuf>,

    #[serde(default = "default_wrapper_priority")]
    pub priority: i32,

    /// Free-form wrapper settings, e.g. the target tenant/site.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: Option<PathBuf>,

    /// Recognized for compatibility; rotation itself is delegated to
    /// logrotate or the init system.
    pub rotation: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: LogLevel::Info,
            format: LogFormat::Text,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub plugin_type: String,

    /// The device id of the plugin's device; defaults to the plugin name.
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_wrapper_priority() -> i32 {
    100
}

impl ControllerConfig {
    /// Load the YAML file, apply `RTK_` environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ControllerConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;

        let env: HashMap<String, String> = std::env::vars().collect();
        config.apply_env_overrides(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized `RTK_` environment overrides.
    ///
    /// The variable name is the dotted option path, upper-cased with `_`
    /// separators: `mqtt.broker` -> `RTK_MQTT_BROKER`.
    pub fn apply_env_overrides(
        &mut self,
        env: &HashMap<String, String>,
    ) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse().map_err(|err| ConfigError::InvalidEnv {
                var: var.to_string(),
                reason: format!("{err}"),
            })
        }

        for (var, value) in env {
            match var.as_str() {
                "RTK_MQTT_BROKER" => self.mqtt.broker = value.clone(),
                "RTK_MQTT_CLIENT_ID" => self.mqtt.client_id = value.clone(),
                "RTK_MQTT_USERNAME" => self.mqtt.username = Some(value.clone()),
                "RTK_MQTT_PASSWORD" => self.mqtt.password = Some(value.clone()),
                "RTK_MQTT_KEEP_ALIVE" => self.mqtt.keep_alive = parsed(var, value)?,
                "RTK_MQTT_CLEAN_SESSION" => self.mqtt.clean_session = parsed(var, value)?,
                "RTK_RTK_DEFAULT_TENANT" => self.rtk.default_tenant = value.clone(),
                "RTK_RTK_DEFAULT_SITE" => self.rtk.default_site = value.clone(),
                "RTK_RTK_TOPIC_PREFIX" => self.rtk.topic_prefix = value.clone(),
                "RTK_SESSION_MAX_CONCURRENT" => {
                    self.session.max_concurrent = parsed(var, value)?
                }
                "RTK_SESSION_TIMEOUT" => self.session.timeout = parsed(var, value)?,
                "RTK_SESSION_CLEANUP_INTERVAL" => {
                    self.session.cleanup_interval = parsed(var, value)?
                }
                "RTK_SESSION_AUTO_CLEANUP" => self.session.auto_cleanup = parsed(var, value)?,
                "RTK_LOGGING_LEVEL" => {
                    self.logging.level = match value.to_ascii_lowercase().as_str() {
                        "trace" => LogLevel::Trace,
                        "debug" => LogLevel::Debug,
                        "info" => LogLevel::Info,
                        "warn" => LogLevel::Warn,
                        "error" => LogLevel::Error,
                        other => {
                            return Err(ConfigError::InvalidEnv {
                                var: var.clone(),
                                reason: format!("unknown log level {other:?}"),
                            })
                        }
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid { reason };

        if self.mqtt.broker.trim().is_empty() {
            return Err(invalid("mqtt.broker is required".to_string()));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(invalid("mqtt.client_id is required".to_string()));
        }
        self.broker_address()?;

        for (name, qos) in [
            ("state", self.rtk.qos.state),
            ("telemetry", self.rtk.qos.telemetry),
            ("event", self.rtk.qos.event),
            ("command", self.rtk.qos.command),
        ] {
            if qos > 2 {
                return Err(invalid(format!("rtk.qos.{name} must be 0, 1 or 2")));
            }
        }

        if self.mqtt.tls.enabled && self.mqtt.tls.ca_file.is_none() {
            return Err(invalid(
                "mqtt.tls.enabled requires mqtt.tls.ca_file".to_string(),
            ));
        }

        if matches!(self.logging.output, LogOutput::File | LogOutput::Both)
            && self.logging.file_path.is_none()
        {
            return Err(invalid(
                "logging.output=file requires logging.file_path".to_string(),
            ));
        }

        for plugin in &self.plugins {
            let device_id = plugin.device_id.as_deref().unwrap_or(&plugin.name);
            if device_id.is_empty() || device_id.contains(['/', '+', '#']) {
                return Err(invalid(format!(
                    "plugin {:?} has an invalid device id {device_id:?}",
                    plugin.name
                )));
            }
        }

        Ok(())
    }

    /// The broker host and port, from the `mqtt.broker` URI.
    pub fn broker_address(&self) -> Result<(String, u16), ConfigError> {
        let uri = self.mqtt.broker.trim();
        let without_scheme = uri
            .strip_prefix("mqtts://")
            .or_else(|| uri.strip_prefix("mqtt://"))
            .or_else(|| uri.strip_prefix("tcp://"))
            .unwrap_or(uri);
        let tls_scheme = uri.starts_with("mqtts://");

        match without_scheme.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
                    reason: format!("mqtt.broker has an invalid port: {uri:?}"),
                })?;
                Ok((host.to_string(), port))
            }
            None if !without_scheme.is_empty() => {
                let default_port = if tls_scheme || self.mqtt.tls.enabled {
                    8883
                } else {
                    1883
                };
                Ok((without_scheme.to_string(), default_port))
            }
            _ => Err(ConfigError::Invalid {
                reason: format!("mqtt.broker is not host[:port]: {uri:?}"),
            }),
        }
    }

    /// The MQTT connection config, without subscriptions or last-will
    /// (the controller adds those).
    pub fn mqtt_channel_config(&self) -> Result<mqtt_channel::Config, ConfigError> {
        let (host, port) = self.broker_address()?;
        let mut config = mqtt_channel::Config::default()
            .with_host(host)
            .with_port(port)
            .with_client_id(&self.mqtt.client_id)
            .with_clean_session(self.mqtt.clean_session)
            .with_keep_alive(Duration::from_secs(self.mqtt.keep_alive));

        if let (Some(username), Some(password)) = (&self.mqtt.username, &self.mqtt.password) {
            config = config.with_credentials(username, password);
        }

        if self.mqtt.tls.enabled {
            let ca_file = self.mqtt.tls.ca_file.clone().ok_or(ConfigError::Invalid {
                reason: "mqtt.tls.enabled requires mqtt.tls.ca_file".to_string(),
            })?;
            config = config.with_tls(TlsFiles {
                ca_file,
                cert_file: self.mqtt.tls.cert_file.clone(),
                key_file: self.mqtt.tls.key_file.clone(),
                insecure_skip_verify: self.mqtt.tls.insecure_skip_verify,
            });
        }

        Ok(config)
    }

    pub fn schema(&self) -> RtkSchema {
        RtkSchema::with_prefix(self.rtk.topic_prefix.clone())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_concurrent: self.session.max_concurrent,
            timeout: Duration::from_secs(self.session.timeout),
            cleanup_interval: Duration::from_secs(self.session.cleanup_interval),
            cleanup_grace: Duration::from_secs(self.session.cleanup_grace),
            auto_cleanup: self.session.auto_cleanup,
        }
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            state_qos: qos_from(self.rtk.qos.state),
            telemetry_qos: qos_from(self.rtk.qos.telemetry),
            event_qos: qos_from(self.rtk.qos.event),
            command_qos: qos_from(self.rtk.qos.command),
            retain_state: self.rtk.retained.state,
            retain_attr: self.rtk.retained.attr,
            retain_lwt: self.rtk.retained.lwt,
            retain_others: self.rtk.retained.others,
        }
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    const MINIMAL: &str = "
mqtt:
  broker: mqtt://localhost:1883
  client_id: rtk-controller
";

    fn minimal() -> ControllerConfig {
        serde_yaml::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn defaults_fill_the_optional_sections() {
        let config = minimal();
        config.validate().unwrap();

        assert_eq!(config.rtk.topic_prefix, "rtk/v1");
        assert_eq!(config.rtk.default_tenant, "default");
        assert_eq!(config.session.max_concurrent, 100);
        assert_eq!(config.session.timeout, 900);
        assert_eq!(config.session.cleanup_interval, 60);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.mqtt.keep_alive, 60);
        assert!(config.mqtt.clean_session);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn the_broker_uri_is_parsed() {
        let mut config = minimal();
        assert_eq!(config.broker_address().unwrap(), ("localhost".to_string(), 1883));

        config.mqtt.broker = "broker.example.com".to_string();
        assert_eq!(
            config.broker_address().unwrap(),
            ("broker.example.com".to_string(), 1883)
        );

        config.mqtt.broker = "mqtts://broker.example.com".to_string();
        assert_eq!(
            config.broker_address().unwrap(),
            ("broker.example.com".to_string(), 8883)
        );

        config.mqtt.broker = "mqtt://broker:not-a-port".to_string();
        assert!(config.broker_address().is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = minimal();
        let env: HashMap<String, String> = [
            ("RTK_MQTT_BROKER", "mqtt://other:1884"),
            ("RTK_SESSION_MAX_CONCURRENT", "7"),
            ("RTK_LOGGING_LEVEL", "debug"),
            ("UNRELATED", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_env_overrides(&env).unwrap();
        assert_eq!(config.mqtt.broker, "mqtt://other:1884");
        assert_eq!(config.session.max_concurrent, 7);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn malformed_env_overrides_are_rejected() {
        let mut config = minimal();
        let env: HashMap<String, String> =
            [("RTK_SESSION_TIMEOUT".to_string(), "soon".to_string())]
                .into_iter()
                .collect();

        assert_matches!(
            config.apply_env_overrides(&env),
            Err(ConfigError::InvalidEnv { var, .. }) if var == "RTK_SESSION_TIMEOUT"
        );
    }

    #[test]
    fn out_of_range_qos_is_invalid() {
        let mut config = minimal();
        config.rtk.qos.event = 3;
        assert_matches!(config.validate(), Err(ConfigError::Invalid { .. }));
    }

    #[test]
    fn tls_requires_a_ca_file() {
        let mut config = minimal();
        config.mqtt.tls.enabled = true;
        assert_matches!(config.validate(), Err(ConfigError::Invalid { .. }));

        config.mqtt.tls.ca_file = Some("/etc/rtk/ca.pem".into());
        config.validate().unwrap();
    }

    #[test]
    fn file_logging_requires_a_path() {
        let mut config = minimal();
        config.logging.output = LogOutput::File;
        assert_matches!(config.validate(), Err(ConfigError::Invalid { .. }));
    }

    #[test]
    fn a_full_config_file_loads() {
        let yaml = r#"
mqtt:
  broker: mqtts://broker.example.com:8883
  client_id: rtk-controller-1
  username: controller
  password: hunter2
  keep_alive: 30
  tls:
    enabled: true
    ca_file: /etc/rtk/ca.pem
rtk:
  default_tenant: acme
  default_site: hq
  qos:
    telemetry: 1
session:
  max_concurrent: 10
  timeout: 120
wrapper:
  registry:
    wrappers:
      - name: homeassistant
        priority: 100
        config:
          tenant: home
          site: main
logging:
  level: warn
  format: json
plugins:
  - name: gw-01
    type: wifi-ap
    config:
      ssid: lab
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.rtk.default_tenant, "acme");
        assert_eq!(config.codec_options().telemetry_qos, QoS::AtLeastOnce);
        assert_eq!(config.session_config().timeout, Duration::from_secs(120));
        assert_eq!(config.wrapper.registry.wrappers[0].name, "homeassistant");
        assert_eq!(config.plugins[0].plugin_type, "wifi-ap");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_files_and_bad_yaml_are_distinct_errors() {
        assert_matches!(
            ControllerConfig::load("/nonexistent/rtk.yaml"),
            Err(ConfigError::Io { .. })
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mqtt: [not, a, mapping").unwrap();
        assert_matches!(
            ControllerConfig::load(file.path()),
            Err(ConfigError::Yaml { .. })
        );
    }
}
