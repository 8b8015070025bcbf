//! Command dispatch: publish a request, correlate its ack and result.
//!
//! Each dispatched command gets a per-id completion cell in a sharded
//! in-flight map: a pair of oneshot channels released by the router when
//! the correlating `cmd/ack` / `cmd/res` message arrives, plus a
//! cancellation token. The dispatching future owns the deadlines and is
//! the single place deciding the terminal outcome, so exactly one fires
//! per command.

use mqtt_channel::MqttPublisher;
use nanoid::nanoid;
use rtk_api::clock::Clock;
use rtk_api::codec::RtkCodec;
use rtk_api::envelope::CommandAckBody;
use rtk_api::envelope::CommandExpect;
use rtk_api::envelope::CommandRequestBody;
use rtk_api::envelope::CommandResultBody;
use rtk_api::envelope::RtkMessage;
use rtk_api::envelope::Trace;
use rtk_api::schema::SchemaId;
use rtk_api::topics::DeviceTopicId;
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SHARD_COUNT: usize = 8;

/// The minimum time a device gets to acknowledge a request.
const MIN_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// What a command dispatch is asked to do.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub op: String,
    pub args: JsonValue,
    pub args_schema: Option<SchemaId>,
    pub timeout: Duration,
    pub expect: CommandExpect,
    pub trace: Option<Trace>,
}

impl CommandOptions {
    pub fn new(op: impl Into<String>) -> Self {
        CommandOptions {
            op: op.into(),
            args: JsonValue::Null,
            args_schema: None,
            timeout: Duration::from_secs(30),
            expect: CommandExpect::Result,
            trace: None,
        }
    }

    pub fn with_args(mut self, args: JsonValue) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn expecting(mut self, expect: CommandExpect) -> Self {
        self.expect = expect;
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// The successful end of a command exchange.
#[derive(Debug, PartialEq)]
pub enum CommandOutcome {
    /// The device accepted the request; no result was asked for.
    Acked {
        command_id: String,
        estimated_completion_ms: Option<u64>,
    },

    /// The device completed the request.
    Completed {
        command_id: String,
        result: Option<JsonValue>,
    },
}

/// Why a command exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// The device refused the request.
    Nakked,
    /// No acknowledgement within the ack deadline.
    AckTimeout,
    /// The device reported a failure.
    Failed,
    /// Acknowledged, but no result within the deadline.
    ResultTimeout,
    /// Cancelled by the caller.
    Cancelled,
    /// The request never left: publish failed.
    Publish,
    /// The request could not be encoded.
    Codec,
}

impl Display for CommandErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            CommandErrorKind::Nakked => "nakked",
            CommandErrorKind::AckTimeout => "ack-timeout",
            CommandErrorKind::Failed => "failed",
            CommandErrorKind::ResultTimeout => "result-timeout",
            CommandErrorKind::Cancelled => "cancelled",
            CommandErrorKind::Publish => "publish",
            CommandErrorKind::Codec => "codec",
        };
        f.write_str(kind)
    }
}

/// A failed command exchange, with everything a caller needs to report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
    pub device_id: String,
    pub command_id: String,
}

impl CommandError {
    fn new(
        kind: CommandErrorKind,
        message: impl Into<String>,
        device_id: &str,
        command_id: &str,
    ) -> Self {
        CommandError {
            kind,
            message: message.into(),
            device_id: device_id.to_string(),
            command_id: command_id.to_string(),
        }
    }
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command {} on device {} failed ({}): {}",
            self.command_id, self.device_id, self.kind, self.message
        )
    }
}

impl std::error::Error for CommandError {}

/// The completion cell of one in-flight command.
struct InFlight {
    ack_tx: Option<oneshot::Sender<CommandAckBody>>,
    result_tx: Option<oneshot::Sender<CommandResultBody>>,
    cancel: CancellationToken,
}

/// Issues command requests and correlates their responses.
pub struct CommandDispatcher {
    shards: Vec<Mutex<HashMap<String, InFlight>>>,
    publisher: MqttPublisher,
    codec: Arc<RtkCodec>,
    clock: Arc<dyn Clock>,
}

impl CommandDispatcher {
    pub fn new(publisher: MqttPublisher, codec: Arc<RtkCodec>, clock: Arc<dyn Clock>) -> Self {
        CommandDispatcher {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            publisher,
            codec,
            clock,
        }
    }

    /// Dispatch a command and drive it to its terminal outcome.
    ///
    /// The request is published once, under a fresh URL-safe id; there is
    /// no retry at this layer. The device gets `max(timeout/10, 500ms)` to
    /// acknowledge. An accepted ack carrying an estimate moves the result
    /// deadline to that estimate, capped by the overall timeout.
    pub async fn dispatch(
        &self,
        device: &DeviceTopicId,
        options: CommandOptions,
    ) -> Result<CommandOutcome, CommandError> {
        self.dispatch_with_id(nanoid!(), device, options).await
    }

    /// Dispatch under a caller-chosen id, so the exchange can be tied to
    /// other records (session tool calls) before it starts.
    pub async fn dispatch_with_id(
        &self,
        command_id: String,
        device: &DeviceTopicId,
        options: CommandOptions,
    ) -> Result<CommandOutcome, CommandError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        self.shard(&command_id).lock().unwrap().insert(
            command_id.clone(),
            InFlight {
                ack_tx: Some(ack_tx),
                result_tx: Some(result_tx),
                cancel: cancel.clone(),
            },
        );

        let outcome = self
            .drive(device, &command_id, options, ack_rx, result_rx, cancel)
            .await;

        // Whatever the outcome, the in-flight record is gone afterwards.
        self.remove(&command_id);
        outcome
    }

    /// Cancel an in-flight command: its dispatch returns `Cancelled`.
    pub fn cancel(&self, command_id: &str) -> bool {
        let shard = self.shard(command_id).lock().unwrap();
        match shard.get(command_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Route a received `cmd/ack` to its waiting dispatch.
    ///
    /// Returns false when no command with this id is in flight.
    pub fn handle_ack(&self, ack: CommandAckBody) -> bool {
        let mut shard = self.shard(&ack.id).lock().unwrap();
        match shard.get_mut(&ack.id).and_then(|entry| entry.ack_tx.take()) {
            Some(ack_tx) => ack_tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Route a received `cmd/res` to its waiting dispatch.
    ///
    /// A result arriving before any ack implies the ack: the ack cell is
    /// completed with a synthetic acceptance first.
    pub fn handle_result(&self, result: CommandResultBody) -> bool {
        let mut shard = self.shard(&result.id).lock().unwrap();
        let Some(entry) = shard.get_mut(&result.id) else {
            return false;
        };

        if let Some(ack_tx) = entry.ack_tx.take() {
            let _ = ack_tx.send(CommandAckBody {
                id: result.id.clone(),
                accepted: true,
                estimated_completion_ms: None,
                err: None,
            });
        }

        match entry.result_tx.take() {
            Some(result_tx) => result_tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().len())
            .sum()
    }

    async fn drive(
        &self,
        device: &DeviceTopicId,
        command_id: &str,
        options: CommandOptions,
        mut ack_rx: oneshot::Receiver<CommandAckBody>,
        mut result_rx: oneshot::Receiver<CommandResultBody>,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome, CommandError> {
        let device_id = device.device_id().to_string();
        let timeout_ms = options.timeout.as_millis() as u64;

        let body = CommandRequestBody {
            id: command_id.to_string(),
            op: options.op.clone(),
            args_schema: options.args_schema.clone(),
            args: options.args.clone(),
            timeout_ms,
            expect: options.expect,
        };
        let mut request =
            RtkMessage::command_request(device_id.as_str(), body, self.clock.now_millis());
        if let Some(trace) = options.trace.clone() {
            request = request.with_trace(trace);
        }

        let encoded = self.codec.encode(device, &request).map_err(|err| {
            CommandError::new(CommandErrorKind::Codec, err.to_string(), &device_id, command_id)
        })?;

        let start = Instant::now();
        self.publisher.publish(encoded).await.map_err(|err| {
            CommandError::new(CommandErrorKind::Publish, err.to_string(), &device_id, command_id)
        })?;
        debug!(command = command_id, device = %device_id, op = %options.op, "command dispatched");

        let ack_deadline = start + (options.timeout / 10).max(MIN_ACK_TIMEOUT);
        let ack = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CommandError::new(
                    CommandErrorKind::Cancelled,
                    "cancelled while awaiting ack",
                    &device_id,
                    command_id,
                ))
            }
            _ = sleep_until(ack_deadline) => {
                return Err(CommandError::new(
                    CommandErrorKind::AckTimeout,
                    format!("no ack within {} ms", (ack_deadline - start).as_millis()),
                    &device_id,
                    command_id,
                ))
            }
            ack = &mut ack_rx => match ack {
                Ok(ack) => ack,
                Err(_) => {
                    return Err(CommandError::new(
                        CommandErrorKind::Cancelled,
                        "in-flight record dropped",
                        &device_id,
                        command_id,
                    ))
                }
            },
        };

        if !ack.accepted {
            return Err(CommandError::new(
                CommandErrorKind::Nakked,
                ack.err.unwrap_or_else(|| "request refused".to_string()),
                &device_id,
                command_id,
            ));
        }

        if options.expect == CommandExpect::Ack {
            return Ok(CommandOutcome::Acked {
                command_id: command_id.to_string(),
                estimated_completion_ms: ack.estimated_completion_ms,
            });
        }

        let result_deadline = match ack.estimated_completion_ms {
            Some(estimate) => start + Duration::from_millis(estimate.min(timeout_ms)),
            None => start + options.timeout,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CommandError::new(
                    CommandErrorKind::Cancelled,
                    "cancelled while awaiting result",
                    &device_id,
                    command_id,
                ))
            }
            _ = sleep_until(result_deadline) => {
                return Err(CommandError::new(
                    CommandErrorKind::ResultTimeout,
                    format!("no result within {} ms", (result_deadline - start).as_millis()),
                    &device_id,
                    command_id,
                ))
            }
            result = &mut result_rx => match result {
                Ok(result) => result,
                Err(_) => {
                    return Err(CommandError::new(
                        CommandErrorKind::Cancelled,
                        "in-flight record dropped",
                        &device_id,
                        command_id,
                    ))
                }
            },
        };

        if result.ok {
            Ok(CommandOutcome::Completed {
                command_id: command_id.to_string(),
                result: result.result,
            })
        } else {
            Err(CommandError::new(
                CommandErrorKind::Failed,
                result.err.unwrap_or_else(|| "command failed".to_string()),
                &device_id,
                command_id,
            ))
        }
    }

    fn shard(&self, command_id: &str) -> &Mutex<HashMap<String, InFlight>> {
        let mut hasher = DefaultHasher::new();
        command_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    fn remove(&self, command_id: &str) {
        self.shard(command_id).lock().unwrap().remove(command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rtk_api::clock::FixedClock;
    use rtk_api::schema::SchemaRegistry;
    use rtk_api::topics::RtkSchema;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Harness {
        dispatcher: Arc<CommandDispatcher>,
        requests: mpsc::Receiver<mqtt_channel::MqttMessage>,
    }

    fn harness() -> Harness {
        let (publisher, requests) = MqttPublisher::channel(16, Duration::from_secs(5));
        let codec = Arc::new(RtkCodec::new(
            RtkSchema::default(),
            SchemaRegistry::with_default_schemas(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            publisher,
            codec,
            Arc::new(FixedClock(1_700_000_000_000)),
        ));
        Harness {
            dispatcher,
            requests,
        }
    }

    fn device() -> DeviceTopicId {
        "acme/hq/ap-01".parse().unwrap()
    }

    /// Run a dispatch in the background and hand back the published
    /// request id.
    async fn dispatch(
        harness: &mut Harness,
        options: CommandOptions,
    ) -> (String, JoinHandle<Result<CommandOutcome, CommandError>>) {
        let dispatcher = harness.dispatcher.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(&device(), options).await });

        let request = harness.requests.recv().await.expect("a published request");
        assert_eq!(request.topic.name, "rtk/v1/acme/hq/ap-01/cmd/req");
        let payload: serde_json::Value =
            serde_json::from_slice(request.payload_bytes()).unwrap();
        let id = payload["id"].as_str().unwrap().to_string();
        (id, handle)
    }

    fn ack(id: &str) -> CommandAckBody {
        CommandAckBody {
            id: id.to_string(),
            accepted: true,
            estimated_completion_ms: None,
            err: None,
        }
    }

    fn result_ok(id: &str) -> CommandResultBody {
        CommandResultBody {
            id: id.to_string(),
            ok: true,
            result: Some(json!({"band": "5GHz"})),
            err: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_happy_path_returns_the_result() {
        let mut harness = harness();
        let options = CommandOptions::new("diagnosis.get")
            .with_args(json!({"type": "wifi.roaming"}))
            .with_timeout(Duration::from_secs(15));
        let (id, handle) = dispatch(&mut harness, options).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.dispatcher.handle_ack(ack(&id)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(harness.dispatcher.handle_result(result_ok(&id)));

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Completed {
                command_id: id,
                result: Some(json!({"band": "5GHz"})),
            }
        );
        assert_eq!(harness.dispatcher.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_silent_device_is_an_ack_timeout() {
        let mut harness = harness();
        let started = Instant::now();
        let (_, handle) = dispatch(
            &mut harness,
            CommandOptions::new("diagnosis.get").with_timeout(Duration::from_secs(15)),
        )
        .await;

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::AckTimeout);
        assert_eq!(err.device_id, "ap-01");

        // 10% of 15 s.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(harness.dispatcher.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_timeouts_still_get_the_minimum_ack_window() {
        let mut harness = harness();
        let started = Instant::now();
        let (_, handle) = dispatch(
            &mut harness,
            CommandOptions::new("ping").with_timeout(Duration::from_secs(1)),
        )
        .await;

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::AckTimeout);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn a_nak_fails_the_command() {
        let mut harness = harness();
        let (id, handle) = dispatch(&mut harness, CommandOptions::new("diagnosis.get")).await;

        harness.dispatcher.handle_ack(CommandAckBody {
            id: id.clone(),
            accepted: false,
            estimated_completion_ms: None,
            err: Some("busy".to_string()),
        });

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::Nakked);
        assert_eq!(err.message, "busy");
        assert_eq!(err.command_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn an_ack_estimate_moves_the_result_deadline() {
        let mut harness = harness();
        let started = Instant::now();
        let (id, handle) = dispatch(
            &mut harness,
            CommandOptions::new("diagnosis.get").with_timeout(Duration::from_secs(60)),
        )
        .await;

        harness.dispatcher.handle_ack(CommandAckBody {
            estimated_completion_ms: Some(2_000),
            ..ack(&id)
        });

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::ResultTimeout);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn a_result_before_the_ack_implies_the_ack() {
        let mut harness = harness();
        let (id, handle) = dispatch(&mut harness, CommandOptions::new("diagnosis.get")).await;

        assert!(harness.dispatcher.handle_result(result_ok(&id)));

        let outcome = handle.await.unwrap().unwrap();
        assert_matches!(outcome, CommandOutcome::Completed { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn expecting_only_an_ack_completes_on_the_ack() {
        let mut harness = harness();
        let options = CommandOptions::new("reboot").expecting(CommandExpect::Ack);
        let (id, handle) = dispatch(&mut harness, options).await;

        harness.dispatcher.handle_ack(CommandAckBody {
            estimated_completion_ms: Some(30_000),
            ..ack(&id)
        });

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Acked {
                command_id: id,
                estimated_completion_ms: Some(30_000),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_result_reports_the_device_error() {
        let mut harness = harness();
        let (id, handle) = dispatch(&mut harness, CommandOptions::new("diagnosis.get")).await;

        harness.dispatcher.handle_ack(ack(&id));
        harness.dispatcher.handle_result(CommandResultBody {
            id: id.clone(),
            ok: false,
            result: None,
            err: Some("sensor unavailable".to_string()),
        });

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::Failed);
        assert_eq!(err.message, "sensor unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_a_terminal_outcome() {
        let mut harness = harness();
        let (id, handle) = dispatch(
            &mut harness,
            CommandOptions::new("diagnosis.get").with_timeout(Duration::from_secs(60)),
        )
        .await;

        assert!(harness.dispatcher.cancel(&id));
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, CommandErrorKind::Cancelled);
        assert_eq!(harness.dispatcher.in_flight_count(), 0);

        // Late responses for a finished command find nobody.
        assert!(!harness.dispatcher.handle_ack(ack(&id)));
        assert!(!harness.dispatcher.handle_result(result_ok(&id)));
    }

    #[tokio::test(start_paused = true)]
    async fn responses_for_unknown_ids_are_ignored() {
        let harness = harness();
        assert!(!harness.dispatcher.handle_ack(ack("ghost")));
        assert!(!harness.dispatcher.handle_result(result_ok("ghost")));
    }
}
