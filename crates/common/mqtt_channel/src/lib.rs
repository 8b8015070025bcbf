//! A library to connect the local MQTT broker and exchange messages over it.
//!
//! The [Connection] struct wraps a `rumqttc` client behind two channels:
//! a stream of received messages and a bounded sink of messages to publish.
//! The connection owns its subscription set and re-establishes it itself
//! after every reconnection, so the broker session state is never relied
//! upon. Publishing applies backpressure once the egress queue is full.

mod backoff;
mod config;
mod connection;
mod errors;
mod messages;
mod topics;

pub use backoff::ExponentialBackoff;
pub use config::BrokerConfig;
pub use config::Config;
pub use config::Credentials;
pub use config::InitMessageFn;
pub use config::TlsFiles;
pub use connection::Connection;
pub use connection::MqttPublisher;
pub use errors::MqttError;
pub use messages::MqttMessage;
pub use messages::Payload;
pub use topics::Topic;
pub use topics::TopicFilter;

pub use rumqttc::QoS;
