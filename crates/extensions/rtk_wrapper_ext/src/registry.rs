//! The wrapper registry: route resolution over copy-on-write snapshots.
//!
//! Registrations are rare and dispatches are constant, so the registry
//! trades O(n) rebuild on register for lock-free reads: every dispatch
//! works on a stable `Arc` snapshot, register/unregister swap in a new
//! one. Wrappers failing repeatedly are quarantined: skipped during
//! resolution until a success or an operator reload.

use crate::transformer::PayloadRule;
use crate::transformer::WrapperRegistration;
use crate::transformer::WrapperTransformer;
use mqtt_channel::MqttMessage;
use mqtt_channel::TopicFilter;
use rtk_api::flex::FlexPayload;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::warn;

/// How many consecutive transform failures quarantine a wrapper.
pub const DEFAULT_QUARANTINE_THRESHOLD: u32 = 5;

/// A wrapper held by the registry.
///
/// The failure counters are shared across snapshots, so quarantine state
/// survives unrelated register/unregister churn.
pub struct RegisteredWrapper {
    registration: WrapperRegistration,
    transformer: Arc<dyn WrapperTransformer>,
    consecutive_failures: AtomicU32,
    quarantined: AtomicBool,
}

impl RegisteredWrapper {
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    pub fn registration(&self) -> &WrapperRegistration {
        &self.registration
    }

    pub fn transformer(&self) -> &Arc<dyn WrapperTransformer> {
        &self.transformer
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }
}

struct UplinkRoute {
    priority: i32,
    filter: TopicFilter,
    payload_rules: Vec<PayloadRule>,
    wrapper: Arc<RegisteredWrapper>,
}

#[derive(Default)]
struct Snapshot {
    wrappers: HashMap<String, Arc<RegisteredWrapper>>,

    /// All uplink routes, sorted by priority descending, wrapper name
    /// ascending: resolution is a linear scan stopping at the first match.
    uplink_routes: Vec<UplinkRoute>,
}

/// Per-wrapper counters for operator diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperStats {
    pub name: String,
    pub consecutive_failures: u32,
    pub quarantined: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A wrapper named {name:?} is already registered")]
    DuplicateWrapper { name: String },

    #[error("Wrapper {name:?} declares an invalid topic pattern: {pattern:?}")]
    InvalidPattern { name: String, pattern: String },
}

pub struct WrapperRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
    quarantine_threshold: u32,
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        WrapperRegistry::new()
    }
}

impl WrapperRegistry {
    pub fn new() -> Self {
        WrapperRegistry {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            quarantine_threshold: DEFAULT_QUARANTINE_THRESHOLD,
        }
    }

    pub fn with_quarantine_threshold(mut self, threshold: u32) -> Self {
        self.quarantine_threshold = threshold;
        self
    }

    /// Register a wrapper under the name of its registration.
    pub fn register(
        &self,
        transformer: Arc<dyn WrapperTransformer>,
    ) -> Result<(), RegistryError> {
        let registration = transformer.registration();
        let name = registration.name.clone();

        for rule in registration
            .uplink_rules
            .iter()
            .chain(registration.downlink_rules.iter())
        {
            if TopicFilter::new(&rule.topic_pattern).is_err() {
                return Err(RegistryError::InvalidPattern {
                    name,
                    pattern: rule.topic_pattern.clone(),
                });
            }
        }

        let mut snapshot = self.snapshot.write().unwrap();
        if snapshot.wrappers.contains_key(&name) {
            return Err(RegistryError::DuplicateWrapper { name });
        }

        let wrapper = Arc::new(RegisteredWrapper {
            registration,
            transformer,
            consecutive_failures: AtomicU32::new(0),
            quarantined: AtomicBool::new(false),
        });

        let mut wrappers = snapshot.wrappers.clone();
        wrappers.insert(name, wrapper);
        *snapshot = Arc::new(Snapshot::rebuild(wrappers));
        Ok(())
    }

    /// Remove a wrapper and all its routes. Atomic: a dispatch sees either
    /// all of the wrapper's routes or none of them.
    pub fn unregister(&self, name: &str) -> bool {
        let mut snapshot = self.snapshot.write().unwrap();
        if !snapshot.wrappers.contains_key(name) {
            return false;
        }
        let mut wrappers = snapshot.wrappers.clone();
        wrappers.remove(name);
        *snapshot = Arc::new(Snapshot::rebuild(wrappers));
        true
    }

    /// Resolve the wrapper handling a non-canonical inbound message.
    ///
    /// Routes are scanned in priority-descending order; the first route
    /// whose topic pattern matches and whose payload rules all hold wins.
    /// Priority ties are broken by wrapper name, so resolution is stable
    /// across restarts.
    pub fn resolve_uplink(&self, message: &MqttMessage) -> Option<Arc<RegisteredWrapper>> {
        let snapshot = self.current();
        let mut payload: Option<Option<FlexPayload>> = None;

        for route in &snapshot.uplink_routes {
            if route.wrapper.is_quarantined() {
                continue;
            }
            if !route.filter.accept_topic(&message.topic) {
                continue;
            }
            if !route.payload_rules.is_empty() {
                let payload = payload.get_or_insert_with(|| {
                    FlexPayload::from_slice(message.payload_bytes()).ok()
                });
                let Some(payload) = payload else {
                    // Not a JSON document: only topic-only routes can match.
                    continue;
                };
                if !route.payload_rules.iter().all(|rule| rule.matches(payload)) {
                    continue;
                }
            }
            return Some(route.wrapper.clone());
        }
        None
    }

    /// Resolve the wrapper addressing a device of the given type.
    ///
    /// Among the wrappers supporting the type (or `*`), the one with the
    /// highest-priority downlink route wins, ties broken by name.
    pub fn resolve_downlink(&self, device_type: &str) -> Option<Arc<RegisteredWrapper>> {
        let snapshot = self.current();
        snapshot
            .wrappers
            .values()
            .filter(|wrapper| !wrapper.is_quarantined())
            .filter(|wrapper| {
                wrapper
                    .registration
                    .supported_device_types
                    .iter()
                    .any(|supported| supported == device_type || supported == "*")
            })
            .max_by(|a, b| {
                let a_priority = best_downlink_priority(a);
                let b_priority = best_downlink_priority(b);
                a_priority
                    .cmp(&b_priority)
                    .then_with(|| b.name().cmp(a.name()))
            })
            .cloned()
    }

    /// Record a failed transform; quarantines the wrapper once the
    /// consecutive failures reach the threshold.
    pub fn record_failure(&self, name: &str) {
        if let Some(wrapper) = self.current().wrappers.get(name) {
            let failures = wrapper.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.quarantine_threshold
                && !wrapper.quarantined.swap(true, Ordering::SeqCst)
            {
                warn!("Wrapper {name:?} quarantined after {failures} consecutive failures");
            }
        }
    }

    /// Record a successful transform; lifts any quarantine.
    pub fn record_success(&self, name: &str) {
        if let Some(wrapper) = self.current().wrappers.get(name) {
            wrapper.consecutive_failures.store(0, Ordering::SeqCst);
            wrapper.quarantined.store(false, Ordering::SeqCst);
        }
    }

    /// Operator reload: lift the quarantine without waiting for a success.
    pub fn reload(&self, name: &str) -> bool {
        match self.current().wrappers.get(name) {
            Some(wrapper) => {
                wrapper.consecutive_failures.store(0, Ordering::SeqCst);
                wrapper.quarantined.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// The union of all uplink topic patterns, for the MQTT subscription.
    pub fn uplink_patterns(&self) -> TopicFilter {
        let snapshot = self.current();
        let mut filter = TopicFilter::empty();
        for route in &snapshot.uplink_routes {
            filter.add_all(route.filter.clone());
        }
        filter
    }

    pub fn stats(&self) -> Vec<WrapperStats> {
        let snapshot = self.current();
        let mut stats: Vec<WrapperStats> = snapshot
            .wrappers
            .values()
            .map(|wrapper| WrapperStats {
                name: wrapper.name().to_string(),
                consecutive_failures: wrapper.consecutive_failures.load(Ordering::SeqCst),
                quarantined: wrapper.is_quarantined(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap().clone()
    }
}

fn best_downlink_priority(wrapper: &RegisteredWrapper) -> i32 {
    wrapper
        .registration
        .downlink_rules
        .iter()
        .map(|rule| rule.priority)
        .max()
        .unwrap_or(i32::MIN)
}

impl Snapshot {
    fn rebuild(wrappers: HashMap<String, Arc<RegisteredWrapper>>) -> Snapshot {
        let mut uplink_routes = Vec::new();
        for wrapper in wrappers.values() {
            for rule in &wrapper.registration.uplink_rules {
                // Patterns were validated at registration.
                uplink_routes.push(UplinkRoute {
                    priority: rule.priority,
                    filter: TopicFilter::new_unchecked(&rule.topic_pattern),
                    payload_rules: rule.payload_rules.clone(),
                    wrapper: wrapper.clone(),
                });
            }
        }
        uplink_routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.wrapper.name().cmp(b.wrapper.name()))
        });
        Snapshot {
            wrappers,
            uplink_routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::RouteRule;
    use crate::transformer::TransformError;
    use crate::transformer::UplinkOutput;
    use mqtt_channel::Topic;
    use rtk_api::envelope::RtkMessage;
    use rtk_api::topics::DeviceTopicId;
    use serde_json::json;

    /// A transformer that only carries its registration, for routing tests.
    struct StubWrapper(WrapperRegistration);

    impl WrapperTransformer for StubWrapper {
        fn registration(&self) -> WrapperRegistration {
            self.0.clone()
        }

        fn can_handle_uplink(&self, _: &MqttMessage) -> bool {
            true
        }

        fn can_handle_downlink(&self, _: &str, _: &RtkMessage) -> bool {
            true
        }

        fn transform_uplink(&self, message: &MqttMessage) -> Result<UplinkOutput, TransformError> {
            Err(TransformError::NotHandled {
                topic: message.topic.name.clone(),
            })
        }

        fn transform_downlink(
            &self,
            _: &DeviceTopicId,
            _: &RtkMessage,
        ) -> Result<MqttMessage, TransformError> {
            unimplemented!("stub")
        }

        fn validate_uplink(&self, _: &MqttMessage) -> Vec<String> {
            vec![]
        }

        fn validate_downlink(&self, _: &RtkMessage) -> Vec<String> {
            vec![]
        }
    }

    fn wrapper(name: &str, priority: i32, pattern: &str) -> Arc<dyn WrapperTransformer> {
        Arc::new(StubWrapper(WrapperRegistration {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            supported_device_types: vec!["light".to_string()],
            uplink_rules: vec![RouteRule::new(priority, pattern)],
            downlink_rules: vec![RouteRule::new(priority, pattern)],
        }))
    }

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage::new(&Topic::new_unchecked(topic), payload)
    }

    #[test]
    fn the_highest_priority_route_wins() {
        let registry = WrapperRegistry::new();
        registry
            .register(wrapper("generic", 10, "homeassistant/#"))
            .unwrap();
        registry
            .register(wrapper("lights", 100, "homeassistant/light/+/state"))
            .unwrap();

        let selected = registry
            .resolve_uplink(&message("homeassistant/light/living/state", "{}"))
            .unwrap();
        assert_eq!(selected.name(), "lights");

        let fallback = registry
            .resolve_uplink(&message("homeassistant/switch/porch/state", "{}"))
            .unwrap();
        assert_eq!(fallback.name(), "generic");
    }

    #[test]
    fn priority_ties_break_on_the_wrapper_name() {
        let registry = WrapperRegistry::new();
        registry.register(wrapper("zeta", 50, "dev/+/state")).unwrap();
        registry.register(wrapper("alpha", 50, "dev/+/state")).unwrap();

        let selected = registry
            .resolve_uplink(&message("dev/x/state", "{}"))
            .unwrap();
        assert_eq!(selected.name(), "alpha");
    }

    #[test]
    fn payload_rules_gate_the_match() {
        let registration = WrapperRegistration {
            name: "ha".to_string(),
            version: "1.0.0".to_string(),
            supported_device_types: vec![],
            uplink_rules: vec![RouteRule::new(100, "homeassistant/+/+/state")
                .with_payload_rule(
                    PayloadRule::required("state").of_type(crate::transformer::PayloadType::String),
                )],
            downlink_rules: vec![],
        };
        let registry = WrapperRegistry::new();
        registry.register(Arc::new(StubWrapper(registration))).unwrap();

        let matching = message(
            "homeassistant/light/living/state",
            &json!({"state": "ON", "brightness": 128}).to_string(),
        );
        assert!(registry.resolve_uplink(&matching).is_some());

        let wrong_type = message(
            "homeassistant/light/living/state",
            &json!({"state": 42}).to_string(),
        );
        assert!(registry.resolve_uplink(&wrong_type).is_none());

        let missing = message("homeassistant/light/living/state", "{}");
        assert!(registry.resolve_uplink(&missing).is_none());

        let not_json = message("homeassistant/light/living/state", "ON");
        assert!(registry.resolve_uplink(&not_json).is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = WrapperRegistry::new();
        registry.register(wrapper("ha", 1, "a/#")).unwrap();
        assert_matches::assert_matches!(
            registry.register(wrapper("ha", 2, "b/#")),
            Err(RegistryError::DuplicateWrapper { .. })
        );
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let registry = WrapperRegistry::new();
        assert_matches::assert_matches!(
            registry.register(wrapper("bad", 1, "a/#/b")),
            Err(RegistryError::InvalidPattern { .. })
        );
    }

    #[test]
    fn unregistration_removes_all_routes() {
        let registry = WrapperRegistry::new();
        registry.register(wrapper("ha", 1, "ha/#")).unwrap();
        assert!(registry.resolve_uplink(&message("ha/x", "{}")).is_some());

        assert!(registry.unregister("ha"));
        assert!(registry.resolve_uplink(&message("ha/x", "{}")).is_none());
        assert!(registry.uplink_patterns().is_empty());
        assert!(!registry.unregister("ha"));
    }

    #[test]
    fn repeated_failures_quarantine_a_wrapper() {
        let registry = WrapperRegistry::new().with_quarantine_threshold(3);
        registry.register(wrapper("flaky", 100, "ha/#")).unwrap();
        registry.register(wrapper("backup", 1, "ha/#")).unwrap();

        for _ in 0..3 {
            registry.record_failure("flaky");
        }

        // The quarantined wrapper is skipped; resolution falls through.
        let selected = registry.resolve_uplink(&message("ha/x", "{}")).unwrap();
        assert_eq!(selected.name(), "backup");

        registry.record_success("flaky");
        let selected = registry.resolve_uplink(&message("ha/x", "{}")).unwrap();
        assert_eq!(selected.name(), "flaky");
    }

    #[test]
    fn an_operator_reload_lifts_the_quarantine() {
        let registry = WrapperRegistry::new().with_quarantine_threshold(1);
        registry.register(wrapper("flaky", 100, "ha/#")).unwrap();

        registry.record_failure("flaky");
        assert!(registry.resolve_uplink(&message("ha/x", "{}")).is_none());

        assert!(registry.reload("flaky"));
        assert!(registry.resolve_uplink(&message("ha/x", "{}")).is_some());
        assert!(!registry.reload("ghost"));
    }

    #[test]
    fn downlink_resolution_follows_the_device_type() {
        let registry = WrapperRegistry::new();
        registry.register(wrapper("lights", 100, "ha/#")).unwrap();

        let any = WrapperRegistration {
            name: "catch-all".to_string(),
            version: "1.0.0".to_string(),
            supported_device_types: vec!["*".to_string()],
            uplink_rules: vec![],
            downlink_rules: vec![RouteRule::new(1, "generic/#")],
        };
        registry.register(Arc::new(StubWrapper(any))).unwrap();

        assert_eq!(registry.resolve_downlink("light").unwrap().name(), "lights");
        assert_eq!(
            registry.resolve_downlink("thermostat").unwrap().name(),
            "catch-all"
        );
        assert!(registry.resolve_downlink("unknown-type").is_some());
    }

    #[test]
    fn stats_expose_quarantine_state() {
        let registry = WrapperRegistry::new().with_quarantine_threshold(2);
        registry.register(wrapper("ha", 1, "ha/#")).unwrap();
        registry.record_failure("ha");

        let stats = registry.stats();
        assert_eq!(
            stats,
            vec![WrapperStats {
                name: "ha".to_string(),
                consecutive_failures: 1,
                quarantined: false,
            }]
        );
    }
}
