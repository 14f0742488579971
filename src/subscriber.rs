//! Subscriber: queue binding and per-type callback dispatch
//!
//! Each subscriber owns one queue and one connection. Subscriptions map an
//! event-type pattern (an exact type or a `*`/`?` glob) to a [`Handler`].
//! Deliveries are dispatched one at a time, in arrival order, on the
//! connection's background thread.
//!
//! Acknowledgement policy per delivery:
//!
//! | Situation | Outcome |
//! |---|---|
//! | Unparsable bytes | nack, no requeue |
//! | Schema-invalid, exact `ack = false` subscription | nack, no requeue |
//! | Schema-invalid, any other case | ack |
//! | No matching subscription | ack |
//! | Callback succeeded | ack |
//! | Callback failed, `ack = true` | ack |
//! | Callback failed, `ack = false` | nack with requeue, up to the requeue limit; then nack without requeue |

use crate::activity::Activity;
use crate::broker::{Broker, Delivery};
use crate::connection::{ConnectionManager, ConnectionState, Session};
use crate::error::Result;
use crate::event::Event;
use crate::schema::{self, SchemaRegistry};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[cfg(feature = "amqp")]
use crate::broker::amqp::{AmqpBroker, AmqpConfig};

/// Default number of requeues per event before it is rejected
pub const DEFAULT_REQUEUE_LIMIT: u32 = 1000;

/// Error type returned by user callbacks
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user callbacks
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Something that can process a received event
///
/// `context` is the target id of the event's most recent CONTEXT link.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event, context: Option<&str>) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&Event, Option<&str>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, event: &Event, context: Option<&str>) -> HandlerResult {
        self(event, context)
    }
}

type Callback = Box<dyn Fn(&Event, Option<&str>) -> HandlerResult + Send + Sync>;

/// A subscription handler: a plain callback or an activity
pub enum Handler {
    Callback(Callback),
    Activity(Arc<Activity>),
}

impl Handler {
    /// Wrap a closure or function
    pub fn callback(
        f: impl Fn(&Event, Option<&str>) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self::Callback(Box::new(f))
    }
}

impl EventHandler for Handler {
    fn handle(&self, event: &Event, context: Option<&str>) -> HandlerResult {
        match self {
            Self::Callback(f) => f(event, context),
            Self::Activity(activity) => activity.handle(event, context),
        }
    }
}

impl From<Activity> for Handler {
    fn from(activity: Activity) -> Self {
        Self::Activity(Arc::new(activity))
    }
}

impl From<Arc<Activity>> for Handler {
    fn from(activity: Arc<Activity>) -> Self {
        Self::Activity(activity)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Handler::Callback"),
            Self::Activity(a) => write!(f, "Handler::Activity({})", a.name()),
        }
    }
}

/// A (pattern, handler, ack) registration
#[derive(Debug, Clone)]
pub struct Subscription {
    pattern: String,
    handler: Arc<Handler>,
    ack: bool,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether failed callbacks still acknowledge the message
    pub fn ack(&self) -> bool {
        self.ack
    }

    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.pattern)
    }
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Topic binding key for an event-type pattern
///
/// Exact types bind `eiffel.*.<type>.#`; wildcards bind every Eiffel event
/// and are filtered locally.
pub fn binding_key(pattern: &str) -> String {
    if is_wildcard(pattern) {
        "eiffel.#".to_string()
    } else {
        format!("eiffel.*.{pattern}.#")
    }
}

/// Glob match where `*` matches any run of characters and `?` exactly one
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[derive(Default)]
struct Table {
    subscriptions: Vec<Subscription>,
    followers: HashMap<String, Vec<Arc<Handler>>>,
}

struct Shared {
    name: String,
    queue: String,
    table: Mutex<Table>,
    rebind: Notify,
    requeue_limit: AtomicU32,
    requeues: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Find the subscription for an event type: exact match first, then wildcards
    fn resolve(&self, event_type: &str) -> Option<Subscription> {
        let table = lock(&self.table);
        table
            .subscriptions
            .iter()
            .find(|s| s.pattern == event_type)
            .or_else(|| {
                table
                    .subscriptions
                    .iter()
                    .find(|s| s.is_wildcard() && glob_matches(&s.pattern, event_type))
            })
            .cloned()
    }

    fn binding_keys(&self) -> Vec<String> {
        let table = lock(&self.table);
        let mut keys: Vec<String> = table
            .subscriptions
            .iter()
            .map(|s| binding_key(&s.pattern))
            .collect();
        keys.dedup();
        keys
    }

    async fn bind_all(&self, connection: &ConnectionManager, bound: &mut HashSet<String>) -> Result<()> {
        for key in self.binding_keys() {
            if bound.contains(&key) {
                continue;
            }
            connection.bind(&self.queue, &key).await?;
            tracing::info!(subscriber = %self.name, queue = %self.queue, binding_key = %key, "Bound queue");
            bound.insert(key);
        }
        Ok(())
    }

    async fn dispatch(&self, delivery: Delivery) {
        let (event, document) = match Event::from_wire_document(&delivery.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    subscriber = %self.name,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Rejecting malformed message"
                );
                settle(delivery.nack(false).await);
                return;
            }
        };

        let subscription = self.resolve(event.event_type());

        let violations =
            match schema::global().validate(event.event_type(), event.version(), &document) {
                Ok(violations) => violations,
                Err(e) => vec![crate::error::SchemaViolation::new("meta", e.to_string())],
            };
        if !violations.is_empty() {
            let reject = subscription
                .as_ref()
                .is_some_and(|s| !s.ack && !s.is_wildcard());
            tracing::warn!(
                subscriber = %self.name,
                event_id = %event.id(),
                event_type = %event.event_type(),
                violations = violations.len(),
                first = %violations[0],
                reject,
                "Received invalid event"
            );
            self.forget_requeues(event.id());
            if reject {
                settle(delivery.nack(false).await);
            } else {
                settle(delivery.ack().await);
            }
            return;
        }

        let context = event.context();
        let result = match &subscription {
            Some(subscription) => {
                tracing::debug!(
                    subscriber = %self.name,
                    event_id = %event.id(),
                    pattern = %subscription.pattern,
                    "Dispatching event"
                );
                invoke(&subscription.handler, &event, context)
            }
            None => {
                tracing::debug!(
                    subscriber = %self.name,
                    event_type = %event.event_type(),
                    "No subscription for event type, discarding"
                );
                Ok(())
            }
        };

        self.call_followers(&event, context);

        match (result, subscription) {
            (Ok(()), _) | (Err(_), None) => {
                self.forget_requeues(event.id());
                settle(delivery.ack().await);
            }
            (Err(e), Some(subscription)) if subscription.ack => {
                tracing::error!(
                    subscriber = %self.name,
                    event_id = %event.id(),
                    error = %e,
                    "Callback failed, acknowledging anyway"
                );
                self.forget_requeues(event.id());
                settle(delivery.ack().await);
            }
            (Err(e), Some(_)) => {
                let requeue = self.track_requeue(event.id());
                tracing::error!(
                    subscriber = %self.name,
                    event_id = %event.id(),
                    error = %e,
                    requeue,
                    "Callback failed"
                );
                settle(delivery.nack(requeue).await);
            }
        }
    }

    fn call_followers(&self, event: &Event, context: Option<&str>) {
        let Some(context_id) = context else {
            return;
        };
        let followers = lock(&self.table)
            .followers
            .get(context_id)
            .cloned()
            .unwrap_or_default();
        for follower in followers {
            if let Err(e) = invoke(&follower, event, context) {
                tracing::error!(
                    subscriber = %self.name,
                    context = %context_id,
                    error = %e,
                    "Context follower failed"
                );
            }
        }
    }

    /// Count a requeue; returns false once the limit is exceeded
    fn track_requeue(&self, event_id: &str) -> bool {
        let limit = self.requeue_limit.load(Ordering::Relaxed);
        let mut requeues = lock(&self.requeues);
        let count = requeues.entry(event_id.to_string()).or_insert(0);
        *count += 1;
        if *count > limit {
            tracing::warn!(event_id = %event_id, limit, "Requeue limit reached, rejecting event");
            requeues.remove(event_id);
            false
        } else {
            true
        }
    }

    fn forget_requeues(&self, event_id: &str) {
        lock(&self.requeues).remove(event_id);
    }
}

fn invoke(handler: &Handler, event: &Event, context: Option<&str>) -> HandlerResult {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(event, context))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("callback panicked: {message}").into())
        }
    }
}

fn settle(result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to settle delivery");
    }
}

/// Binds, consumes and dispatches while the channel is live
struct DispatchSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl Session for DispatchSession {
    async fn run(&self, connection: &ConnectionManager) -> Result<()> {
        let shared = &self.shared;
        connection.declare_queue(&shared.queue).await?;

        let mut bound = HashSet::new();
        shared.bind_all(connection, &mut bound).await?;
        let mut deliveries = connection.consume(&shared.queue).await?;
        tracing::info!(subscriber = %shared.name, queue = %shared.queue, "Consuming");

        loop {
            tokio::select! {
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => shared.dispatch(delivery).await,
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::info!(subscriber = %shared.name, "Delivery stream ended");
                        return Ok(());
                    }
                },
                _ = shared.rebind.notified() => shared.bind_all(connection, &mut bound).await?,
            }
        }
    }
}

/// Receives events from one queue and dispatches them to subscriptions
pub struct Subscriber {
    connection: Arc<ConnectionManager>,
    shared: Arc<Shared>,
}

impl Subscriber {
    /// Create a subscriber consuming `queue`; call [`start`](Self::start) to connect
    pub fn new(broker: impl Broker + 'static, queue: impl Into<String>) -> Self {
        Self::with_broker(Arc::new(broker), queue)
    }

    /// Create a subscriber over a shared broker handle
    pub fn with_broker(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let name = format!("subscriber-{queue}");
        Self {
            connection: Arc::new(ConnectionManager::new(name.clone(), broker)),
            shared: Arc::new(Shared {
                name,
                queue,
                table: Mutex::new(Table::default()),
                rebind: Notify::new(),
                requeue_limit: AtomicU32::new(DEFAULT_REQUEUE_LIMIT),
                requeues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a RabbitMQ subscriber
    #[cfg(feature = "amqp")]
    pub fn amqp(config: AmqpConfig, queue: impl Into<String>) -> Result<Self> {
        let interval = config.reconnect_interval();
        Ok(Self::new(AmqpBroker::new(config)?, queue).with_reconnect_interval(interval))
    }

    /// Fixed delay between reconnect attempts
    pub fn with_reconnect_interval(self, interval: Duration) -> Self {
        self.connection.set_reconnect_interval(interval);
        self
    }

    /// Requeues allowed per event for failing `ack = false` subscriptions
    pub fn with_requeue_limit(self, limit: u32) -> Self {
        self.shared.requeue_limit.store(limit, Ordering::Relaxed);
        self
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    /// Register a handler for an event type or glob pattern
    ///
    /// Replaces any subscription with the same pattern. With `ack = false`,
    /// a failing handler makes the message requeue instead of being
    /// acknowledged. The binding is applied immediately when connected, and
    /// on every reconnect.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: impl Into<Handler>, ack: bool) {
        let subscription = Subscription {
            pattern: pattern.into(),
            handler: Arc::new(handler.into()),
            ack,
        };
        tracing::info!(
            subscriber = %self.shared.name,
            pattern = %subscription.pattern,
            ack,
            "Subscribed"
        );

        {
            let mut table = lock(&self.shared.table);
            match table
                .subscriptions
                .iter_mut()
                .find(|s| s.pattern == subscription.pattern)
            {
                Some(existing) => *existing = subscription,
                None => table.subscriptions.push(subscription),
            }
        }
        self.shared.rebind.notify_one();
    }

    /// Remove the subscription for a pattern
    ///
    /// The queue binding stays in place; deliveries that no longer match are
    /// acknowledged and discarded. Returns whether a subscription was removed.
    pub fn unsubscribe(&self, pattern: &str) -> bool {
        let mut table = lock(&self.shared.table);
        let before = table.subscriptions.len();
        table.subscriptions.retain(|s| s.pattern != pattern);
        before != table.subscriptions.len()
    }

    /// Current subscriptions, in registration order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.shared.table).subscriptions.clone()
    }

    /// Call `handler` for every valid event whose context is `context_id`
    ///
    /// Followers of the same context run in registration order.
    pub fn follow(&self, context_id: impl Into<String>, handler: impl Into<Handler>) {
        lock(&self.shared.table)
            .followers
            .entry(context_id.into())
            .or_default()
            .push(Arc::new(handler.into()));
    }

    /// Stop following a context; returns whether any follower was removed
    pub fn unfollow(&self, context_id: &str) -> bool {
        lock(&self.shared.table)
            .followers
            .remove(context_id)
            .is_some()
    }

    /// Start the background connection and apply all subscriptions
    pub fn start(&self) -> Result<()> {
        let session = Arc::new(DispatchSession {
            shared: Arc::clone(&self.shared),
        });
        self.connection.start(session)
    }

    /// Stop consuming (idempotent)
    pub fn stop(&self) {
        self.connection.stop();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Block until the connection reaches `state` or the timeout elapses
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.connection.wait_for_state(state, timeout)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.connection.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{AckOutcome, MemoryBroker};
    use crate::event::CONTEXT;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    fn started_subscriber(broker: &MemoryBroker) -> Subscriber {
        let subscriber =
            Subscriber::new(broker.clone(), "test-queue").with_reconnect_interval(Duration::from_millis(20));
        subscriber.start().unwrap();
        assert!(subscriber.wait_for_state(ConnectionState::Connected, WAIT));
        subscriber
    }

    fn triggered() -> Event {
        let mut event = Event::new("EiffelActivityTriggeredEvent", "4.2.0").unwrap();
        event.data.add("name", "build");
        event
    }

    fn recorder() -> (Arc<Mutex<Vec<(String, Option<String>)>>>, Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Handler::callback(move |event, context| {
            sink.lock()
                .unwrap()
                .push((event.id().to_string(), context.map(str::to_string)));
            Ok(())
        });
        (seen, handler)
    }

    fn inject(broker: &MemoryBroker, event: &Event) {
        broker.inject(&event.routing_key(), &event.to_wire().unwrap());
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("Eiffel*Event", "EiffelActivityStartedEvent"));
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("Eiffel?ctivity*", "EiffelActivityFinishedEvent"));
        assert!(!glob_matches("Eiffel*Event", "EiffelActivityStarted"));
        assert!(!glob_matches("Eiffel?Event", "EiffelXYEvent"));
        assert!(glob_matches("a*b*c", "aXXbYYc"));
    }

    #[test]
    fn test_binding_keys() {
        assert_eq!(
            binding_key("EiffelActivityStartedEvent"),
            "eiffel.*.EiffelActivityStartedEvent.#"
        );
        assert_eq!(binding_key("Eiffel*Event"), "eiffel.#");
    }

    #[test]
    fn test_subscribe_replaces_same_pattern() {
        let broker = MemoryBroker::new();
        let subscriber = Subscriber::new(broker, "q");
        subscriber.subscribe("EiffelActivityStartedEvent", Handler::callback(|_, _| Ok(())), true);
        subscriber.subscribe("EiffelActivityStartedEvent", Handler::callback(|_, _| Ok(())), false);
        subscriber.subscribe("Eiffel*Event", Handler::callback(|_, _| Ok(())), true);

        let subs = subscriber.subscriptions();
        assert_eq!(subs.len(), 2);
        assert!(!subs[0].ack());
        assert!(subs[1].is_wildcard());

        assert!(subscriber.unsubscribe("Eiffel*Event"));
        assert!(!subscriber.unsubscribe("Eiffel*Event"));
    }

    #[test]
    fn test_dispatch_with_context() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, true);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let plain = triggered();
        let mut with_context = triggered();
        let context_id = uuid::Uuid::new_v4().to_string();
        with_context.links.add(CONTEXT, context_id.as_str());
        inject(&broker, &plain);
        inject(&broker, &with_context);

        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], (plain.id().to_string(), None));
        assert_eq!(seen[1], (with_context.id().to_string(), Some(context_id)));
        assert!(wait_until(|| broker.settled().len() == 2));
        assert!(broker.settled().iter().all(|(_, o)| *o == AckOutcome::Ack));
    }

    #[test]
    fn test_binding_applied_before_start() {
        let broker = MemoryBroker::new();
        let subscriber =
            Subscriber::new(broker.clone(), "early").with_reconnect_interval(Duration::from_millis(20));
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, true);
        subscriber.start().unwrap();
        assert!(wait_until(|| broker.bindings("early")
            == vec!["eiffel.*.EiffelActivityTriggeredEvent.#".to_string()]));

        inject(&broker, &triggered());
        assert!(wait_until(|| seen.lock().unwrap().len() == 1));
    }

    #[test]
    fn test_malformed_message_rejected() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("*", handler, true);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        broker.inject("eiffel._.Garbage._._", b"{not json");
        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Nack { requeue: false });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_event_policy() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, false);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let mut invalid = triggered();
        invalid.data.add("name", 5);
        inject(&broker, &invalid);
        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Nack { requeue: false });

        let (_, wildcard) = recorder();
        subscriber.unsubscribe("EiffelActivityTriggeredEvent");
        subscriber.subscribe("Eiffel*", wildcard, false);
        assert!(wait_until(|| broker.bindings("test-queue").len() == 2));
        inject(&broker, &invalid);
        assert!(wait_until(|| broker.settled().len() == 2));
        assert_eq!(broker.settled()[1].1, AckOutcome::Ack);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_event_acked_for_ackable_subscription() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, true);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let mut invalid = triggered();
        invalid.data.add("name", 5);
        inject(&broker, &invalid);
        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Ack);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_top_level_member_is_invalid() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, false);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let event = triggered();
        let mut document = serde_json::to_value(&event).unwrap();
        document["bogus"] = serde_json::json!(1);
        broker.inject(&event.routing_key(), document.to_string().as_bytes());

        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Nack { requeue: false });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unmatched_event_acknowledged() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityStartedEvent", handler, true);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        // deliver directly to the queue through a catch-all binding
        let channel = futures::executor::block_on(broker.connect()).unwrap();
        futures::executor::block_on(channel.bind("test-queue", "#")).unwrap();
        inject(&broker, &triggered());

        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Ack);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_callback_policies() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker).with_requeue_limit(2);
        subscriber.subscribe(
            "EiffelActivityTriggeredEvent",
            Handler::callback(|_, _| Err("boom".into())),
            true,
        );
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        inject(&broker, &triggered());
        assert!(wait_until(|| broker.settled().len() == 1));
        assert_eq!(broker.settled()[0].1, AckOutcome::Ack);

        subscriber.subscribe(
            "EiffelActivityTriggeredEvent",
            Handler::callback(|_, _| panic!("callback exploded")),
            false,
        );
        inject(&broker, &triggered());
        assert!(wait_until(|| broker.settled().len() == 4));
        let outcomes: Vec<AckOutcome> = broker.settled().into_iter().skip(1).map(|(_, o)| o).collect();
        assert_eq!(
            outcomes,
            vec![
                AckOutcome::Nack { requeue: true },
                AckOutcome::Nack { requeue: true },
                AckOutcome::Nack { requeue: false },
            ]
        );
    }

    #[test]
    fn test_requeue_count_cleared_on_every_outcome() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        subscriber.subscribe(
            "EiffelActivityTriggeredEvent",
            Handler::callback(|_, _| Err("boom".into())),
            true,
        );
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let failing = triggered();
        let mut invalid = triggered();
        invalid.data.add("name", 5);
        for event in [&failing, &invalid] {
            assert!(subscriber.shared.track_requeue(event.id()));
        }
        assert_eq!(lock(&subscriber.shared.requeues).len(), 2);

        inject(&broker, &failing);
        inject(&broker, &invalid);
        assert!(wait_until(|| broker.settled().len() == 2));
        assert!(broker.settled().iter().all(|(_, o)| *o == AckOutcome::Ack));
        assert!(lock(&subscriber.shared.requeues).is_empty());
    }

    #[test]
    fn test_follow_and_unfollow() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        subscriber.subscribe("*", Handler::callback(|_, _| Ok(())), true);
        let (followed, follower) = recorder();
        let (also_followed, second) = recorder();
        let context_id = uuid::Uuid::new_v4().to_string();
        subscriber.follow(context_id.clone(), follower);
        subscriber.follow(context_id.clone(), second);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        let mut in_context = triggered();
        in_context.links.add(CONTEXT, context_id.as_str());
        inject(&broker, &triggered());
        inject(&broker, &in_context);
        assert!(wait_until(|| broker.settled().len() == 2));
        assert_eq!(followed.lock().unwrap().len(), 1);
        assert_eq!(followed.lock().unwrap()[0].0, in_context.id());
        assert_eq!(also_followed.lock().unwrap().len(), 1);

        assert!(subscriber.unfollow(&context_id));
        assert!(!subscriber.unfollow(&context_id));
        inject(&broker, &in_context);
        assert!(wait_until(|| broker.settled().len() == 3));
        assert_eq!(followed.lock().unwrap().len(), 1);
        assert_eq!(also_followed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rebinds_after_reconnect() {
        let broker = MemoryBroker::new();
        let subscriber = started_subscriber(&broker);
        let (seen, handler) = recorder();
        subscriber.subscribe("EiffelActivityTriggeredEvent", handler, true);
        assert!(wait_until(|| !broker.bindings("test-queue").is_empty()));

        broker.disconnect();
        assert!(subscriber.wait_for_state(ConnectionState::Disconnected, WAIT));
        broker.restore();
        assert!(subscriber.wait_for_state(ConnectionState::Connected, WAIT));

        inject(&broker, &triggered());
        assert!(wait_until(|| seen.lock().unwrap().len() == 1));
    }
}
