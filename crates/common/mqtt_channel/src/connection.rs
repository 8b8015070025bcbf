use crate::backoff::ExponentialBackoff;
use crate::Config;
use crate::MqttError;
use crate::MqttMessage;
use rumqttc::AsyncClient;
use rumqttc::ConnectionError;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::Incoming;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::StateError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::debug;
use tracing::error;
use tracing::info;

/// A connection to some MQTT server
pub struct Connection {
    /// The channel of the input messages received by this connection.
    pub received: mpsc::UnboundedReceiver<MqttMessage>,

    /// The channel of the error messages received by this connection.
    pub errors: mpsc::UnboundedReceiver<MqttError>,

    /// Sink for the messages to be published on this connection.
    publisher: MqttPublisher,

    /// A channel to notify that all the published messages have been actually published.
    pub_done: oneshot::Receiver<()>,
}

/// A cloneable handle publishing through the connection's bounded egress
/// queue.
///
/// When the queue is full, a publish waits up to the configured timeout for
/// room, then fails with [MqttError::PublishBackpressure]. Once the
/// connection is closed, publishes fail with [MqttError::ClientOffline].
#[derive(Clone)]
pub struct MqttPublisher {
    sender: mpsc::Sender<MqttMessage>,
    timeout: Duration,
}

impl MqttPublisher {
    /// A publisher detached from any broker connection, paired with the
    /// receiving end of its queue. For tests and local pipelines.
    pub fn channel(
        capacity: usize,
        timeout: Duration,
    ) -> (MqttPublisher, mpsc::Receiver<MqttMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (MqttPublisher { sender, timeout }, receiver)
    }

    pub async fn publish(&self, message: MqttMessage) -> Result<(), MqttError> {
        let topic = message.topic.name.clone();
        match tokio::time::timeout(self.timeout, self.sender.send(message)).await {
            Err(_) => Err(MqttError::PublishBackpressure {
                topic,
                timeout_ms: self.timeout.as_millis(),
            }),
            Ok(Err(_)) => Err(MqttError::ClientOffline),
            Ok(Ok(())) => Ok(()),
        }
    }
}

impl Connection {
    /// Establish a connection to the MQTT broker defined by the given `config`.
    ///
    /// The connection subscribes to the configured topics and owns that
    /// subscription set: after every reconnection the complete set is
    /// re-established explicitly, whatever the broker retained of the
    /// session. Reconnections are attempted forever, with exponentially
    /// growing delays.
    ///
    /// An outright rejection by the broker (bad credentials, protocol
    /// mismatch) fails the initial connection instead of being retried.
    pub async fn new(config: &Config) -> Result<Connection, MqttError> {
        let (received_sender, received_receiver) = mpsc::unbounded_channel();
        let (published_sender, published_receiver) = mpsc::channel(config.queue_capacity);
        let (error_sender, error_receiver) = mpsc::unbounded_channel();
        let (pub_done_sender, pub_done_receiver) = oneshot::channel();

        let (mqtt_client, event_loop) =
            Connection::open(config, received_sender.clone(), error_sender.clone()).await?;

        tokio::spawn(Connection::receiver_loop(
            mqtt_client.clone(),
            config.clone(),
            event_loop,
            received_sender,
            error_sender.clone(),
        ));
        tokio::spawn(Connection::sender_loop(
            mqtt_client,
            published_receiver,
            error_sender,
            config.last_will.clone(),
            pub_done_sender,
        ));

        Ok(Connection {
            received: received_receiver,
            errors: error_receiver,
            publisher: MqttPublisher {
                sender: published_sender,
                timeout: config.publish_timeout,
            },
            pub_done: pub_done_receiver,
        })
    }

    /// A new handle publishing through this connection.
    pub fn publisher(&self) -> MqttPublisher {
        self.publisher.clone()
    }

    /// Close the connection, draining the egress queue first.
    ///
    /// Any [MqttPublisher] clone still alive keeps the queue open; drop
    /// them before closing to actually terminate the sender loop.
    pub async fn close(self) {
        drop(self.publisher);
        let _ = self.pub_done.await;
    }

    async fn open(
        config: &Config,
        message_sender: mpsc::UnboundedSender<MqttMessage>,
        error_sender: mpsc::UnboundedSender<MqttError>,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        const INSECURE_MQTT_PORT: u16 = 1883;
        const SECURE_MQTT_PORT: u16 = 8883;

        if config.broker.port == SECURE_MQTT_PORT && config.broker.tls.is_none() {
            tracing::warn!("Connecting port 8883 for secure MQTT without any TLS material");
        }
        if config.broker.port == INSECURE_MQTT_PORT && config.broker.tls.is_some() {
            tracing::warn!("Connecting port 1883 for insecure MQTT using a TLS connection");
        }

        let mqtt_options = config.rumqttc_options()?;
        let (mqtt_client, mut event_loop) = AsyncClient::new(mqtt_options, config.queue_capacity);

        info!(
            "MQTT connecting to broker: host={}:{}, client_id={:?}",
            config.broker.host, config.broker.port, config.client_id
        );
        debug!("MQTT config: {config:?}");

        let mut backoff = ExponentialBackoff::default();
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if let Some(err) = MqttError::maybe_connection_error(&ack) {
                        return Err(err);
                    };
                    info!("MQTT connection established");

                    let subscriptions = config.subscriptions.filters();

                    // Without any subscription no SubAck will ever come: done.
                    if subscriptions.is_empty() {
                        break;
                    }

                    Connection::subscribe_to_topics(&mqtt_client, subscriptions).await?
                }

                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if let Some(err) = MqttError::maybe_subscription_error(&ack) {
                        return Err(err);
                    };
                    break;
                }

                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    // Messages can be received before a sub ack
                    let _ = message_sender.send(msg.into());
                }

                Err(err) => {
                    error!(
                        "MQTT: failed to connect to broker at '{host}:{port}': {err}",
                        host = config.broker.host,
                        port = config.broker.port
                    );
                    let should_delay = Connection::pause_on_error(&err);

                    // Errors on send are ignored: the client closed the receiving channel.
                    let _ = error_sender.send(err.into());

                    if should_delay {
                        sleep(backoff.next_delay()).await;
                    }
                }
                _ => (),
            }
        }

        Ok((mqtt_client, event_loop))
    }

    async fn receiver_loop(
        mqtt_client: AsyncClient,
        config: Config,
        mut event_loop: EventLoop,
        message_sender: mpsc::UnboundedSender<MqttMessage>,
        error_sender: mpsc::UnboundedSender<MqttError>,
    ) -> Result<(), MqttError> {
        let mut backoff = ExponentialBackoff::default();
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    // Errors on send are ignored: the client closed the receiving channel.
                    // The loop keeps going though: rumqttc relies on this polling.
                    let _ = message_sender.send(msg.into());
                }

                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if let Some(err) = MqttError::maybe_connection_error(&ack) {
                        error!("MQTT connection error: {err}");
                        let _ = error_sender.send(err);
                        continue;
                    }

                    info!("MQTT connection re-established");
                    backoff.reset();

                    // The broker session state is deliberately not relied
                    // upon: the complete subscription set is re-established
                    // on every connection.
                    let subscriptions = config.subscriptions.filters();
                    if !subscriptions.is_empty() {
                        Connection::subscribe_to_topics(&mqtt_client, subscriptions).await?;
                    }

                    if let Some(ref imsg_fn) = config.initial_message {
                        let message = imsg_fn.new_init_message();
                        mqtt_client
                            .publish(
                                message.topic.name.clone(),
                                message.qos,
                                message.retain,
                                message.payload_bytes().to_vec(),
                            )
                            .await?;
                    }
                }

                Ok(Event::Incoming(Incoming::Disconnect))
                | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT connection closed");
                    break;
                }

                Err(err) => {
                    error!("MQTT connection error: {err}");
                    let delay = Connection::pause_on_error(&err);

                    // Errors on send are ignored: the client closed the receiving channel.
                    let _ = error_sender.send(err.into());

                    if delay {
                        sleep(backoff.next_delay()).await;
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }

    async fn sender_loop(
        mqtt_client: AsyncClient,
        mut messages_receiver: mpsc::Receiver<MqttMessage>,
        error_sender: mpsc::UnboundedSender<MqttError>,
        last_will: Option<MqttMessage>,
        done: oneshot::Sender<()>,
    ) {
        while let Some(message) = messages_receiver.recv().await {
            let payload = Vec::from(message.payload_bytes());
            if let Err(err) = mqtt_client
                .publish(message.topic.name, message.qos, message.retain, payload)
                .await
            {
                let _ = error_sender.send(err.into());
            }
        }

        // The broker doesn't send the last will on a graceful disconnect:
        // it has to be published explicitly first.
        if let Some(last_will) = last_will {
            let payload = Vec::from(last_will.payload_bytes());
            let _ = mqtt_client
                .publish(last_will.topic.name, last_will.qos, last_will.retain, payload)
                .await;
        }
        let _ = mqtt_client.disconnect().await;
        let _ = done.send(());
    }

    pub(crate) fn pause_on_error(err: &ConnectionError) -> bool {
        matches!(
            err,
            rumqttc::ConnectionError::Io(_)
                | rumqttc::ConnectionError::MqttState(StateError::Io(_))
                | rumqttc::ConnectionError::MqttState(_)
        )
    }

    pub(crate) async fn subscribe_to_topics(
        mqtt_client: &AsyncClient,
        subscriptions: Vec<rumqttc::SubscribeFilter>,
    ) -> Result<(), MqttError> {
        mqtt_client
            .subscribe_many(subscriptions)
            .await
            .map_err(MqttError::ClientError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topic;
    use assert_matches::assert_matches;

    fn publisher(capacity: usize, timeout: Duration) -> (MqttPublisher, mpsc::Receiver<MqttMessage>) {
        MqttPublisher::channel(capacity, timeout)
    }

    fn message(text: &str) -> MqttMessage {
        MqttMessage::new(&Topic::new_unchecked("rtk/v1/acme/hq/ap-01/state"), text)
    }

    #[tokio::test(start_paused = true)]
    async fn a_full_queue_applies_backpressure() {
        let (publisher, _receiver) = publisher(1, Duration::from_secs(5));

        publisher.publish(message("first")).await.unwrap();
        let err = publisher.publish(message("second")).await.unwrap_err();

        assert_matches!(err, MqttError::PublishBackpressure { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn publishing_on_a_closed_connection_fails() {
        let (publisher, receiver) = publisher(1, Duration::from_secs(5));
        drop(receiver);

        let err = publisher.publish(message("orphan")).await.unwrap_err();
        assert_matches!(err, MqttError::ClientOffline);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_the_queue_releases_backpressure() {
        let (publisher, mut receiver) = publisher(1, Duration::from_secs(5));
        publisher.publish(message("first")).await.unwrap();

        let slow_consumer = tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            receiver.recv().await
        });

        // Blocks until the consumer makes room, well within the timeout.
        publisher.publish(message("second")).await.unwrap();
        assert!(slow_consumer.await.unwrap().is_some());
    }
}
