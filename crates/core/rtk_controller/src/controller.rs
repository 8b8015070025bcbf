//! Composition of the controller: connect, route, host plugins, shut down.
//!
//! [Controller::connect] builds every component, connects the broker and
//! starts the configured device plugins. [RunningController::run_until]
//! is the steady-state loop: canonical inbound messages go through the
//! codec into the cache/dispatcher/router, non-canonical ones through the
//! wrapper fabric back onto canonical topics. [ControllerApi] is the
//! application-facing surface tying sessions and command dispatch
//! together.

use crate::command::CommandDispatcher;
use crate::command::CommandError;
use crate::command::CommandOptions;
use crate::command::CommandOutcome;
use crate::config::ConfigError;
use crate::config::ControllerConfig;
use crate::plugin::CommandResponse;
use crate::plugin::ControllerHandle;
use crate::plugin::DevicePlugin;
use crate::plugin::PluginInstanceConfig;
use crate::plugin::PluginRegistry;
use crate::router::handler_fn;
use crate::router::SubscriptionRouter;
use crate::session::SessionError;
use crate::session::SessionManager;
use crate::state_cache::DeviceStateCache;
use mqtt_channel::Connection;
use mqtt_channel::MqttError;
use mqtt_channel::MqttMessage;
use mqtt_channel::MqttPublisher;
use mqtt_channel::TopicFilter;
use nanoid::nanoid;
use rtk_api::clock::Clock;
use rtk_api::clock::WallClock;
use rtk_api::codec::RtkCodec;
use rtk_api::envelope::CommandAckBody;
use rtk_api::envelope::CommandResultBody;
use rtk_api::envelope::DeviceStatus;
use rtk_api::envelope::HealthLevel;
use rtk_api::envelope::RtkMessage;
use rtk_api::envelope::StatePayload;
use rtk_api::envelope::Trace;
use rtk_api::schema::SchemaLookup;
use rtk_api::schema::SchemaRegistry;
use rtk_api::topics::ChannelFilter;
use rtk_api::topics::CommandDirection;
use rtk_api::topics::DeviceFilter;
use rtk_api::topics::DeviceTopicId;
use rtk_wrapper_ext::HomeAssistantWrapper;
use rtk_wrapper_ext::WrapperRegistry;
use rtk_wrapper_ext::WrapperTransformer;
use serde_json::Map;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// How long shutdown waits for the egress queue to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] rtk_api::codec::CodecError),

    #[error("Cannot connect to the MQTT broker: {0}")]
    Connect(MqttError),

    #[error("The MQTT connection is gone")]
    ConnectionClosed,
}

/// Dropped-message counters surfaced for diagnostics.
#[derive(Debug, Default)]
pub struct ControllerCounters {
    pub decode_failures: AtomicU64,
    pub no_route: AtomicU64,
    pub transform_failures: AtomicU64,
}

impl ControllerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routing of inbound and outbound messages across codec, wrapper fabric,
/// cache, dispatcher and router.
#[derive(Clone)]
pub struct MessagePipeline {
    codec: Arc<RtkCodec>,
    router: Arc<SubscriptionRouter>,
    dispatcher: Arc<CommandDispatcher>,
    wrappers: Arc<WrapperRegistry>,
    cache: Arc<DeviceStateCache>,
    publisher: MqttPublisher,
    counters: Arc<ControllerCounters>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: Arc<RtkCodec>,
        router: Arc<SubscriptionRouter>,
        dispatcher: Arc<CommandDispatcher>,
        wrappers: Arc<WrapperRegistry>,
        cache: Arc<DeviceStateCache>,
        publisher: MqttPublisher,
        counters: Arc<ControllerCounters>,
    ) -> Self {
        MessagePipeline {
            codec,
            router,
            dispatcher,
            wrappers,
            cache,
            publisher,
            counters,
        }
    }

    /// Route one inbound message.
    ///
    /// Canonical topics go through the codec: state updates feed the
    /// cache, command responses release their waiting dispatch, and every
    /// message fans out to the subscribed handlers. Non-canonical topics
    /// go through the wrapper fabric and come back as canonical publishes.
    pub async fn ingress(&self, message: MqttMessage) {
        if self.codec.schema().is_canonical(&message.topic.name) {
            self.ingress_canonical(message).await
        } else {
            self.ingress_wrapped(message).await
        }
    }

    async fn ingress_canonical(&self, message: MqttMessage) {
        let decoded = match self.codec.decode(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                ControllerCounters::bump(&self.counters.decode_failures);
                warn!(topic = %message.topic, "dropping undecodable message: {err}");
                return;
            }
        };
        for warning in &decoded.warnings {
            warn!(topic = %message.topic, "{warning}");
        }

        match &decoded.message {
            RtkMessage::State(envelope) => self.cache.update(&decoded.device, envelope),
            RtkMessage::CommandAck(envelope) => {
                if !self.dispatcher.handle_ack(envelope.body.clone()) {
                    debug!(command = %envelope.body.id, "ack for no in-flight command");
                }
            }
            RtkMessage::CommandResult(envelope) => {
                if !self.dispatcher.handle_result(envelope.body.clone()) {
                    debug!(command = %envelope.body.id, "result for no in-flight command");
                }
            }
            _ => (),
        }

        self.router.dispatch(&message).await;
    }

    async fn ingress_wrapped(&self, message: MqttMessage) {
        let Some(wrapper) = self.wrappers.resolve_uplink(&message) else {
            ControllerCounters::bump(&self.counters.no_route);
            warn!(topic = %message.topic, "no wrapper route matched, dropping");
            return;
        };

        let output = match wrapper.transformer().transform_uplink(&message) {
            Ok(output) => output,
            Err(err) => {
                self.wrappers.record_failure(wrapper.name());
                ControllerCounters::bump(&self.counters.transform_failures);
                warn!(
                    wrapper = wrapper.name(),
                    topic = %message.topic,
                    "uplink transform failed: {err}"
                );
                return;
            }
        };

        // The contract requires the produced schema to be a known one.
        if matches!(
            self.codec.registry().resolve(output.message.schema()),
            SchemaLookup::Unsupported
        ) {
            self.wrappers.record_failure(wrapper.name());
            ControllerCounters::bump(&self.counters.transform_failures);
            warn!(
                wrapper = wrapper.name(),
                schema = %output.message.schema(),
                "uplink transform produced an unknown schema"
            );
            return;
        }

        let canonical = match self.codec.encode(&output.device, &output.message) {
            Ok(canonical) => canonical,
            Err(err) => {
                self.wrappers.record_failure(wrapper.name());
                ControllerCounters::bump(&self.counters.transform_failures);
                warn!(wrapper = wrapper.name(), "uplink transform unencodable: {err}");
                return;
            }
        };

        self.wrappers.record_success(wrapper.name());
        if let Err(err) = self.publisher.publish(canonical).await {
            warn!(wrapper = wrapper.name(), "republish failed: {err}");
        }
    }

    /// Send a canonical message to a wrapped device of the given type,
    /// translated to its dialect.
    pub async fn downlink(
        &self,
        device_type: &str,
        device: &DeviceTopicId,
        message: &RtkMessage,
    ) -> Result<(), DownlinkError> {
        let wrapper = self
            .wrappers
            .resolve_downlink(device_type)
            .ok_or_else(|| DownlinkError::NoRoute {
                device_type: device_type.to_string(),
            })?;

        let dialect = wrapper
            .transformer()
            .transform_downlink(device, message)
            .inspect_err(|_| self.wrappers.record_failure(wrapper.name()))
            .map_err(|err| DownlinkError::Transform {
                wrapper: wrapper.name().to_string(),
                reason: err.to_string(),
            })?;

        self.wrappers.record_success(wrapper.name());
        self.publisher.publish(dialect).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownlinkError {
    #[error("No wrapper supports device type {device_type:?}")]
    NoRoute { device_type: String },

    #[error("Wrapper {wrapper} failed to translate: {reason}")]
    Transform { wrapper: String, reason: String },

    #[error(transparent)]
    Publish(#[from] MqttError),
}

/// Application-level failures of a session-scoped command.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Command(#[from] CommandError),
}

/// The application-facing surface of a running controller.
#[derive(Clone)]
pub struct ControllerApi {
    sessions: Arc<SessionManager>,
    dispatcher: Arc<CommandDispatcher>,
    pipeline: MessagePipeline,
    cache: Arc<DeviceStateCache>,
}

impl ControllerApi {
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<DeviceStateCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    /// Dispatch a command, recorded as a tool call when a session is
    /// given. The command id, the tool-call id and the trace `req_id` are
    /// all the same identifier.
    pub async fn execute_command(
        &self,
        session_id: Option<&str>,
        device: &DeviceTopicId,
        options: CommandOptions,
    ) -> Result<CommandOutcome, ApiError> {
        let command_id = nanoid!();

        if let Some(session_id) = session_id {
            self.sessions.start_tool_call(
                session_id,
                command_id.clone(),
                options.op.clone(),
                options.args.clone(),
            )?;
        }

        let options = options.with_trace(Trace {
            req_id: Some(command_id.clone()),
            session_id: session_id.map(str::to_string),
        });

        let outcome = self
            .dispatcher
            .dispatch_with_id(command_id.clone(), device, options)
            .await;

        if let Some(session_id) = session_id {
            let record = match &outcome {
                Ok(CommandOutcome::Completed { result, .. }) => self.sessions.complete_tool_call(
                    session_id,
                    &command_id,
                    true,
                    result.clone(),
                    None,
                ),
                Ok(CommandOutcome::Acked { .. }) => {
                    self.sessions
                        .complete_tool_call(session_id, &command_id, true, None, None)
                }
                Err(err) => self.sessions.complete_tool_call(
                    session_id,
                    &command_id,
                    false,
                    None,
                    Some(err.to_string()),
                ),
            };
            if let Err(err) = record {
                warn!(session = session_id, command = %command_id, "tool call not recorded: {err}");
            }
        }

        Ok(outcome?)
    }

    /// Cancel a session and every command still in flight under it.
    pub fn cancel_session(&self, session_id: &str) -> Result<(), SessionError> {
        let open_calls = self.sessions.cancel(session_id)?;
        for command_id in open_calls {
            self.dispatcher.cancel(&command_id);
        }
        Ok(())
    }
}

/// One hosted device plugin, with its subscription and handle.
struct RunningPlugin {
    name: String,
    plugin: Arc<RwLock<Box<dyn DevicePlugin>>>,
    handle: ControllerHandle,
}

/// The controller before connecting: configuration and the pieces that
/// exist without a broker.
pub struct Controller {
    config: ControllerConfig,
    codec: Arc<RtkCodec>,
    router: Arc<SubscriptionRouter>,
    sessions: Arc<SessionManager>,
    wrappers: Arc<WrapperRegistry>,
    cache: Arc<DeviceStateCache>,
    plugin_registry: PluginRegistry,
    counters: Arc<ControllerCounters>,
    clock: Arc<dyn Clock>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        registry: SchemaRegistry,
        plugin_registry: PluginRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let codec = Arc::new(
            RtkCodec::new(config.schema(), registry).with_options(config.codec_options()),
        );
        let clock: Arc<dyn Clock> = Arc::new(WallClock);
        let sessions = Arc::new(SessionManager::new(config.session_config(), clock.clone()));
        let wrappers = Arc::new(build_wrappers(&config)?);

        Ok(Controller {
            codec,
            router: Arc::new(SubscriptionRouter::new()),
            sessions,
            wrappers,
            cache: Arc::new(DeviceStateCache::new()),
            plugin_registry,
            counters: Arc::new(ControllerCounters::default()),
            clock,
            config,
        })
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.router
    }

    /// Connect the broker, subscribe everything, start the plugins.
    pub async fn connect(self) -> Result<RunningController, RuntimeError> {
        let identity = self.identity()?;

        let mut subscriptions = TopicFilter::empty();
        let schema = self.codec.schema();
        subscriptions.add_all(schema.topics(DeviceFilter::AnyDevice, ChannelFilter::State));
        subscriptions.add_all(schema.topics(DeviceFilter::AnyDevice, ChannelFilter::AnyEvent));
        subscriptions.add_all(schema.topics(
            DeviceFilter::AnyDevice,
            ChannelFilter::Command(CommandDirection::Ack),
        ));
        subscriptions.add_all(schema.topics(
            DeviceFilter::AnyDevice,
            ChannelFilter::Command(CommandDirection::Result),
        ));
        for device in self.plugin_devices()? {
            subscriptions.add_all(schema.topics(
                DeviceFilter::Device(device),
                ChannelFilter::Command(CommandDirection::Request),
            ));
        }
        subscriptions.add_all(self.wrappers.uplink_patterns());
        subscriptions.add_all(self.router.subscription_set());

        // The testament and its antidote: the broker reveals a vanished
        // controller, a (re)connect announces it back online.
        let lwt = self.codec.encode(
            &identity,
            &RtkMessage::offline_lwt(identity.device_id(), self.clock.now_millis()),
        )?;
        let online = self.online_state_message(&identity)?;
        let announced = online.clone();

        let mqtt_config = self
            .config
            .mqtt_channel_config()?
            .with_subscriptions(subscriptions)
            .with_last_will(lwt)
            .with_initial_message(move || announced.clone());

        let connection = Connection::new(&mqtt_config)
            .await
            .map_err(RuntimeError::Connect)?;
        let publisher = connection.publisher();
        info!("controller connected as {identity}");

        let dispatcher = Arc::new(CommandDispatcher::new(
            publisher.clone(),
            self.codec.clone(),
            self.clock.clone(),
        ));
        let pipeline = MessagePipeline::new(
            self.codec.clone(),
            self.router.clone(),
            dispatcher.clone(),
            self.wrappers.clone(),
            self.cache.clone(),
            publisher.clone(),
            self.counters.clone(),
        );

        let plugins = self.start_plugins(&publisher).await?;

        // Announce the first online state; reconnections re-announce via
        // the initial message.
        publisher.publish(online).await.map_err(RuntimeError::Connect)?;

        Ok(RunningController {
            identity,
            connection,
            publisher,
            pipeline,
            dispatcher,
            router: self.router,
            sessions: self.sessions,
            cache: self.cache,
            codec: self.codec,
            clock: self.clock,
            plugins,
        })
    }

    fn identity(&self) -> Result<DeviceTopicId, ConfigError> {
        DeviceTopicId::new(
            &self.config.rtk.default_tenant,
            &self.config.rtk.default_site,
            &self.config.mqtt.client_id,
        )
        .map_err(|err| ConfigError::Invalid {
            reason: format!("mqtt.client_id is not usable as a device id: {err}"),
        })
    }

    fn plugin_devices(&self) -> Result<Vec<DeviceTopicId>, ConfigError> {
        self.config
            .plugins
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| {
                let device_id = entry.device_id.as_deref().unwrap_or(&entry.name);
                DeviceTopicId::new(
                    &self.config.rtk.default_tenant,
                    &self.config.rtk.default_site,
                    device_id,
                )
                .map_err(|err| ConfigError::Invalid {
                    reason: format!("plugin {:?}: {err}", entry.name),
                })
            })
            .collect()
    }

    fn online_state_message(&self, identity: &DeviceTopicId) -> Result<MqttMessage, RuntimeError> {
        let state = StatePayload {
            status: DeviceStatus::Online,
            health: HealthLevel::Healthy,
            uptime: None,
            last_seen: Some(self.clock.now_millis()),
            properties: Map::new(),
        };
        let message =
            RtkMessage::state(identity.device_id(), state, self.clock.now_millis());
        Ok(self.codec.encode(identity, &message)?)
    }

    async fn start_plugins(
        &self,
        publisher: &MqttPublisher,
    ) -> Result<Vec<RunningPlugin>, RuntimeError> {
        let mut running = Vec::new();
        for entry in self.config.plugins.iter().filter(|entry| entry.enabled) {
            let device_id = entry.device_id.as_deref().unwrap_or(&entry.name);
            let device = DeviceTopicId::new(
                &self.config.rtk.default_tenant,
                &self.config.rtk.default_site,
                device_id,
            )
            .map_err(|err| ConfigError::Invalid {
                reason: format!("plugin {:?}: {err}", entry.name),
            })?;

            let mut plugin =
                self.plugin_registry
                    .build(&entry.plugin_type)
                    .ok_or_else(|| ConfigError::Invalid {
                        reason: format!(
                            "plugin {:?} has unknown type {:?}",
                            entry.name, entry.plugin_type
                        ),
                    })?;

            let instance = PluginInstanceConfig {
                name: entry.name.clone(),
                plugin_type: entry.plugin_type.clone(),
                device: device.clone(),
                config: entry.config.clone(),
            };
            plugin
                .initialize(&instance)
                .await
                .map_err(|err| ConfigError::Invalid {
                    reason: format!("plugin {:?} failed to initialize: {err}", entry.name),
                })?;

            let handle = ControllerHandle::new(
                device.clone(),
                publisher.clone(),
                self.codec.clone(),
                self.clock.clone(),
            );
            plugin
                .start(handle.clone())
                .await
                .map_err(|err| ConfigError::Invalid {
                    reason: format!("plugin {:?} failed to start: {err}", entry.name),
                })?;
            info!(plugin = %entry.name, device = %device, "plugin started");

            let plugin = Arc::new(RwLock::new(plugin));
            self.subscribe_plugin_commands(&device, plugin.clone(), handle.clone());

            running.push(RunningPlugin {
                name: entry.name.clone(),
                plugin,
                handle,
            });
        }
        Ok(running)
    }

    fn subscribe_plugin_commands(
        &self,
        device: &DeviceTopicId,
        plugin: Arc<RwLock<Box<dyn DevicePlugin>>>,
        handle: ControllerHandle,
    ) {
        let codec = self.codec.clone();
        let filter = codec.schema().topics(
            DeviceFilter::Device(device.clone()),
            ChannelFilter::Command(CommandDirection::Request),
        );

        let handler = handler_fn(format!("plugin:{}", device.device_id()), move |message| {
            let codec = codec.clone();
            let plugin = plugin.clone();
            let handle = handle.clone();
            async move {
                let decoded = codec.decode(&message)?;
                let RtkMessage::CommandRequest(request) = decoded.message else {
                    return Ok(());
                };

                let response = plugin.read().await.handle_command(&request).await;
                let command_id = request.body.id;
                match response {
                    CommandResponse::Rejected { err } => {
                        handle
                            .publish_ack(CommandAckBody {
                                id: command_id,
                                accepted: false,
                                estimated_completion_ms: None,
                                err: Some(err),
                            })
                            .await?
                    }
                    CommandResponse::Pending {
                        estimated_completion_ms,
                    } => {
                        handle
                            .publish_ack(CommandAckBody {
                                id: command_id,
                                accepted: true,
                                estimated_completion_ms,
                                err: None,
                            })
                            .await?
                    }
                    CommandResponse::Completed { ok, result, err } => {
                        handle
                            .publish_ack(CommandAckBody {
                                id: command_id.clone(),
                                accepted: true,
                                estimated_completion_ms: None,
                                err: None,
                            })
                            .await?;
                        handle
                            .publish_result(CommandResultBody {
                                id: command_id,
                                ok,
                                result,
                                err,
                            })
                            .await?
                    }
                }
                Ok(())
            }
        });

        self.router.subscribe(filter, 0, handler);
    }
}

/// A connected controller, routing messages until shut down.
pub struct RunningController {
    identity: DeviceTopicId,
    connection: Connection,
    publisher: MqttPublisher,
    pipeline: MessagePipeline,
    dispatcher: Arc<CommandDispatcher>,
    router: Arc<SubscriptionRouter>,
    sessions: Arc<SessionManager>,
    cache: Arc<DeviceStateCache>,
    codec: Arc<RtkCodec>,
    clock: Arc<dyn Clock>,
    plugins: Vec<RunningPlugin>,
}

impl RunningController {
    pub fn api(&self) -> ControllerApi {
        ControllerApi {
            sessions: self.sessions.clone(),
            dispatcher: self.dispatcher.clone(),
            pipeline: self.pipeline.clone(),
            cache: self.cache.clone(),
        }
    }

    /// The steady-state loop: route inbound messages until the shutdown
    /// token fires or the connection ends.
    pub async fn run_until(mut self, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        let sweeper_cancel = CancellationToken::new();
        let sweeper = self
            .sessions
            .config()
            .auto_cleanup
            .then(|| self.sessions.spawn_sweeper(sweeper_cancel.clone()));

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                received = self.connection.received.recv() => match received {
                    Some(message) => self.pipeline.ingress(message).await,
                    None => break Err(RuntimeError::ConnectionClosed),
                },
                mqtt_error = self.connection.errors.recv() => match mqtt_error {
                    Some(err) => warn!("MQTT: {err}"),
                    None => break Err(RuntimeError::ConnectionClosed),
                }
            }
        };

        info!("controller shutting down");
        sweeper_cancel.cancel();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        for running in &mut self.plugins {
            if let Err(err) = running.plugin.write().await.stop().await {
                warn!(plugin = %running.name, "plugin failed to stop: {err}");
            }
            let stopped = StatePayload {
                status: DeviceStatus::Offline,
                health: HealthLevel::Healthy,
                uptime: None,
                last_seen: Some(self.clock.now_millis()),
                properties: Map::new(),
            };
            let _ = running.handle.publish_state(stopped).await;
        }

        // Leave an explicit offline state: the broker won't publish the
        // testament on a graceful disconnect.
        let offline = StatePayload {
            status: DeviceStatus::Offline,
            health: HealthLevel::Healthy,
            uptime: None,
            last_seen: Some(self.clock.now_millis()),
            properties: Map::new(),
        };
        let offline =
            RtkMessage::state(self.identity.device_id(), offline, self.clock.now_millis());
        if let Ok(encoded) = self.codec.encode(&self.identity, &offline) {
            let _ = self.publisher.publish(encoded).await;
        }

        // Drop every egress handle, then drain within the grace period.
        // Clearing the router releases the plugin handlers and the
        // publisher clones they captured.
        self.router.clear();
        let RunningController {
            connection,
            publisher,
            pipeline,
            dispatcher,
            plugins,
            ..
        } = self;
        drop(publisher);
        drop(pipeline);
        drop(dispatcher);
        drop(plugins);
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, connection.close()).await;

        outcome
    }
}

/// Build the wrapper registry from the configured entries.
fn build_wrappers(config: &ControllerConfig) -> Result<WrapperRegistry, ConfigError> {
    let registry = WrapperRegistry::new();
    for entry in config
        .wrapper
        .registry
        .wrappers
        .iter()
        .filter(|entry| entry.enabled)
    {
        let transformer: Arc<dyn WrapperTransformer> = match entry.name.as_str() {
            "homeassistant" => {
                let tenant = entry
                    .config
                    .get("tenant")
                    .and_then(|value| value.as_str())
                    .unwrap_or(&config.rtk.default_tenant);
                let site = entry
                    .config
                    .get("site")
                    .and_then(|value| value.as_str())
                    .unwrap_or(&config.rtk.default_site);
                Arc::new(HomeAssistantWrapper::new(tenant, site))
            }
            other => {
                return Err(ConfigError::Invalid {
                    reason: format!("unknown wrapper {other:?}"),
                })
            }
        };
        registry
            .register(transformer)
            .map_err(|err| ConfigError::Invalid {
                reason: err.to_string(),
            })?;
    }
    Ok(registry)
}
