//! Topic-based dispatch of inbound messages to subscribed handlers.
//!
//! Every pattern whose MQTT-wildcard match accepts the topic fires its
//! handler, in priority-descending order, insertion order breaking ties.
//! Handlers run one after the other on the delivery task: they are
//! expected to hand off real work and return within the handler budget.
//! A failing handler is logged and isolated; it never prevents the
//! remaining handlers from running.

use async_trait::async_trait;
use mqtt_channel::MqttMessage;
use mqtt_channel::TopicFilter;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// How long a handler may hold the delivery task before it is reported
/// as stalling.
pub const DEFAULT_HANDLER_BUDGET: Duration = Duration::from_millis(50);

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Used in logs and stall reports.
    fn name(&self) -> &str;

    async fn handle(&self, message: MqttMessage) -> Result<(), HandlerError>;
}

/// Wrap an async closure as a [MessageHandler].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MqttMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    struct FnHandler<F> {
        name: String,
        f: F,
    }

    #[async_trait]
    impl<F, Fut> MessageHandler for FnHandler<F>
    where
        F: Fn(MqttMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, message: MqttMessage) -> Result<(), HandlerError> {
            (self.f)(message).await
        }
    }

    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Identifies one subscription; unsubscribing requires the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Route {
    id: u64,
    priority: i32,
    filter: TopicFilter,
    handler: Arc<dyn MessageHandler>,
    stalls: AtomicU64,
    failures: AtomicU64,
}

pub struct SubscriptionRouter {
    /// Sorted by priority descending, insertion order ascending.
    routes: RwLock<Vec<Arc<Route>>>,
    next_id: AtomicU64,
    handler_budget: Duration,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        SubscriptionRouter::new()
    }
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        SubscriptionRouter {
            routes: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            handler_budget: DEFAULT_HANDLER_BUDGET,
        }
    }

    pub fn with_handler_budget(mut self, budget: Duration) -> Self {
        self.handler_budget = budget;
        self
    }

    /// Register a handler for the topics accepted by the filter.
    pub fn subscribe(
        &self,
        filter: TopicFilter,
        priority: i32,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let route = Arc::new(Route {
            id,
            priority,
            filter,
            handler,
            stalls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let mut routes = self.routes.write().unwrap();
        // Insertion order is the id order, so a stable sort on priority
        // keeps the required dispatch order.
        let at = routes
            .partition_point(|existing| existing.priority >= route.priority);
        routes.insert(at, route);
        SubscriptionHandle(id)
    }

    /// Drop every subscription, releasing the handlers and whatever they
    /// capture. Used at shutdown.
    pub fn clear(&self) {
        self.routes.write().unwrap().clear();
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut routes = self.routes.write().unwrap();
        let before = routes.len();
        routes.retain(|route| route.id != handle.0);
        routes.len() < before
    }

    /// Deliver a message to every matching handler. Returns how many
    /// handlers ran.
    pub async fn dispatch(&self, message: &MqttMessage) -> usize {
        let routes: Vec<Arc<Route>> = self.routes.read().unwrap().clone();
        let mut delivered = 0;

        for route in routes {
            if !route.filter.accept_topic(&message.topic) {
                continue;
            }
            delivered += 1;

            let started = Instant::now();
            if let Err(err) = route.handler.handle(message.clone()).await {
                route.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handler = route.handler.name(),
                    topic = %message.topic,
                    "handler failed: {err}"
                );
            }

            let elapsed = started.elapsed();
            if elapsed > self.handler_budget {
                route.stalls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handler = route.handler.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.handler_budget.as_millis() as u64,
                    "handler exceeded its delivery budget"
                );
            }
        }
        delivered
    }

    /// The union of all subscribed patterns, for the MQTT session.
    pub fn subscription_set(&self) -> TopicFilter {
        let routes = self.routes.read().unwrap();
        let mut filter = TopicFilter::empty();
        for route in routes.iter() {
            filter.add_all(route.filter.clone());
        }
        filter
    }

    pub fn stall_count(&self, handle: SubscriptionHandle) -> Option<u64> {
        self.route(handle)
            .map(|route| route.stalls.load(Ordering::Relaxed))
    }

    pub fn failure_count(&self, handle: SubscriptionHandle) -> Option<u64> {
        self.route(handle)
            .map(|route| route.failures.load(Ordering::Relaxed))
    }

    fn route(&self, handle: SubscriptionHandle) -> Option<Arc<Route>> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .find(|route| route.id == handle.0)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_channel::Topic;
    use std::sync::Mutex;

    fn message(topic: &str) -> MqttMessage {
        MqttMessage::new(&Topic::new_unchecked(topic), "{}")
    }

    fn recording_handler(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn MessageHandler> {
        let name_for_log = name.to_string();
        handler_fn(name, move |_| {
            let log = log.clone();
            let name = name_for_log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn handlers_fire_in_priority_then_insertion_order() {
        let router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/+/+/+/state"),
            10,
            recording_handler("low-first", log.clone()),
        );
        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/#"),
            100,
            recording_handler("high", log.clone()),
        );
        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/acme/#"),
            10,
            recording_handler("low-second", log.clone()),
        );

        let delivered = router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert_eq!(delivered, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["high", "low-first", "low-second"]
        );
    }

    #[tokio::test]
    async fn overlapping_patterns_fire_each_handler_once() {
        let router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut filter = TopicFilter::new_unchecked("rtk/v1/#");
        filter.add("rtk/v1/+/+/+/state").unwrap();
        router.subscribe(filter, 0, recording_handler("both-patterns", log.clone()));

        router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert_eq!(*log.lock().unwrap(), vec!["both-patterns"]);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_stop_the_others() {
        let router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let failing = router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/#"),
            100,
            handler_fn("failing", |_| async { Err("boom".into()) }),
        );
        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/#"),
            1,
            recording_handler("survivor", log.clone()),
        );

        router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
        assert_eq!(router.failure_count(failing), Some(1));
    }

    #[tokio::test]
    async fn unmatched_topics_deliver_nowhere() {
        let router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/+/+/+/evt/#"),
            0,
            recording_handler("events", log.clone()),
        );

        let delivered = router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert_eq!(delivered, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_handlers_no_longer_fire() {
        let router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/#"),
            0,
            recording_handler("gone", log.clone()),
        );

        assert!(router.unsubscribe(handle));
        assert!(!router.unsubscribe(handle));

        router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_bump_their_stall_counter() {
        let router = SubscriptionRouter::new();
        let slow = router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/#"),
            0,
            handler_fn("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(())
            }),
        );

        router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        router.dispatch(&message("rtk/v1/acme/hq/ap-01/state")).await;
        assert_eq!(router.stall_count(slow), Some(2));
    }

    #[tokio::test]
    async fn the_subscription_set_is_the_union_of_patterns() {
        let router = SubscriptionRouter::new();
        router.subscribe(
            TopicFilter::new_unchecked("rtk/v1/+/+/+/state"),
            0,
            handler_fn("states", |_| async { Ok(()) }),
        );
        router.subscribe(
            TopicFilter::new_unchecked("homeassistant/+/+/state"),
            0,
            handler_fn("wrapped", |_| async { Ok(()) }),
        );

        let set = router.subscription_set();
        assert!(set.accept_topic_name("rtk/v1/acme/hq/ap-01/state"));
        assert!(set.accept_topic_name("homeassistant/light/living/state"));
        assert!(!set.accept_topic_name("zigbee2mqtt/bulb"));
    }
}
