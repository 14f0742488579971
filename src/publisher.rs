//! Publisher: validated, buffered, at-least-once event publishing
//!
//! `send_event` validates the event and appends it to the pending-send
//! buffer; the connection's background thread drains the buffer in FIFO
//! order whenever a channel is live. An event leaves the buffer only after
//! the broker confirmed it. A transient send failure ends the session, the
//! connection manager reconnects, and draining resumes from the same event.

use crate::broker::Broker;
use crate::connection::{ConnectionManager, ConnectionState, Session};
use crate::error::Result;
use crate::event::{Event, Source};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[cfg(feature = "amqp")]
use crate::broker::amqp::{AmqpBroker, AmqpConfig};

/// Events waiting for a confirmed send
struct PendingBuffer {
    events: Mutex<VecDeque<Event>>,

    /// Signalled whenever an event leaves the buffer
    drained: Condvar,

    /// Wakes the drain loop when an event is appended
    wake: Notify,
}

impl PendingBuffer {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) -> usize {
        let len = {
            let mut events = self.lock();
            events.push_back(event);
            events.len()
        };
        self.wake.notify_one();
        len
    }

    fn front(&self) -> Option<Event> {
        self.lock().front().cloned()
    }

    /// Remove the head of the buffer once it has been sent or discarded
    fn pop(&self) {
        self.lock().pop_front();
        self.drained.notify_all();
    }
}

/// Sends buffered events while the channel is live
struct DrainSession {
    buffer: Arc<PendingBuffer>,
}

#[async_trait]
impl Session for DrainSession {
    async fn run(&self, connection: &ConnectionManager) -> Result<()> {
        loop {
            let Some(event) = self.buffer.front() else {
                self.buffer.wake.notified().await;
                continue;
            };

            let routing_key = event.routing_key();
            let payload = match event.to_wire() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(event_id = %event.id(), error = %e, "Discarding unserializable event");
                    self.buffer.pop();
                    continue;
                }
            };

            if let Err(e) = connection.send(&routing_key, &payload).await {
                if e.is_transient() {
                    return Err(e);
                }
                tracing::error!(event_id = %event.id(), error = %e, "Discarding event the broker cannot accept");
                self.buffer.pop();
                continue;
            }
            self.buffer.pop();

            tracing::debug!(
                event_id = %event.id(),
                routing_key = %routing_key,
                "Event published"
            );
        }
    }
}

/// Publishes events through its own connection
///
/// All methods take `&self` and are safe to call from any thread.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    buffer: Arc<PendingBuffer>,
    source: Option<Source>,
}

impl Publisher {
    /// Create a publisher over a broker; call [`start`](Self::start) to connect
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::with_broker(Arc::new(broker))
    }

    /// Create a publisher over a shared broker handle
    pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            connection: Arc::new(ConnectionManager::new("publisher", broker)),
            buffer: Arc::new(PendingBuffer {
                events: Mutex::new(VecDeque::new()),
                drained: Condvar::new(),
                wake: Notify::new(),
            }),
            source: None,
        }
    }

    /// Create a RabbitMQ publisher
    #[cfg(feature = "amqp")]
    pub fn amqp(config: AmqpConfig) -> Result<Self> {
        let interval = config.reconnect_interval();
        Ok(Self::new(AmqpBroker::new(config)?).with_reconnect_interval(interval))
    }

    /// Stamp `meta.source` on every event sent without one
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Fixed delay between reconnect attempts
    pub fn with_reconnect_interval(self, interval: Duration) -> Self {
        self.connection.set_reconnect_interval(interval);
        self
    }

    /// Start the background connection (non-blocking, idempotent)
    pub fn start(&self) -> Result<()> {
        let session = Arc::new(DrainSession {
            buffer: Arc::clone(&self.buffer),
        });
        self.connection.start(session)
    }

    /// Stop the background connection; buffered events stay buffered
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

    /// Validate and queue an event for publishing
    ///
    /// Fails with `InvalidEvent` (nothing is queued) if the event breaks its
    /// schema, or `SchemaNotFound` if no schema exists. Returns once the event
    /// is buffered; delivery to the broker happens in the background.
    pub fn send_event(&self, event: &Event) -> Result<()> {
        let mut event = event.clone();
        if let Some(source) = &self.source {
            if event.meta().get("source").is_none() {
                event.meta_mut().set_source(source);
            }
        }
        event.check()?;

        let event_id = event.id().to_string();
        let routing_key = event.routing_key();
        let pending = self.buffer.push(event);

        tracing::debug!(
            event_id = %event_id,
            routing_key = %routing_key,
            pending,
            "Event queued for publishing"
        );
        Ok(())
    }

    /// Number of events not yet confirmed by the broker
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Snapshot of the events not yet confirmed, oldest first
    pub fn pending_events(&self) -> Vec<Event> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Block until every buffered event is sent or the timeout elapses
    ///
    /// Returns the number of events still pending (0 = fully flushed).
    /// `None` waits without limit.
    pub fn wait_for_unpublished_events(&self, timeout: Option<Duration>) -> usize {
        let guard = self.buffer.lock();
        let guard = match timeout {
            Some(timeout) => {
                self.buffer
                    .drained
                    .wait_timeout_while(guard, timeout, |events| !events.is_empty())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .buffer
                .drained
                .wait_while(guard, |events| !events.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        };
        let remaining = guard.len();
        if remaining > 0 {
            tracing::warn!(remaining, "Timed out waiting for unpublished events");
        }
        remaining
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            tracing::warn!(pending, "Publisher dropped with unpublished events");
        }
        self.connection.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerChannel, DeliveryStream};
    use crate::error::EiffelError;

    const WAIT: Duration = Duration::from_secs(5);

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(broker.clone()).with_reconnect_interval(Duration::from_millis(20))
    }

    fn triggered(name: &str) -> Event {
        let mut event = Event::new("EiffelActivityTriggeredEvent", "4.2.0").unwrap();
        event.data.add("name", name);
        event
    }

    /// Memory broker that permanently refuses the `poison` family
    struct PickyBroker(MemoryBroker);

    struct PickyChannel(Arc<dyn BrokerChannel>);

    #[async_trait]
    impl Broker for PickyBroker {
        async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
            Ok(Arc::new(PickyChannel(self.0.connect().await?)))
        }

        fn name(&self) -> &str {
            "picky"
        }
    }

    #[async_trait]
    impl BrokerChannel for PickyChannel {
        async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
            if routing_key.starts_with("eiffel.poison.") {
                return Err(EiffelError::Config("family 'poison' is not routable".to_string()));
            }
            self.0.publish(routing_key, payload).await
        }

        async fn declare_queue(&self, queue: &str) -> Result<()> {
            self.0.declare_queue(queue).await
        }

        async fn bind(&self, queue: &str, binding_key: &str) -> Result<()> {
            self.0.bind(queue, binding_key).await
        }

        async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
            self.0.consume(queue).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }

        async fn closed(&self) {
            self.0.closed().await
        }
    }

    #[test]
    fn test_send_event_publishes() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.start().unwrap();

        let event = triggered("build");
        publisher.send_event(&event).unwrap();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, event.routing_key());
        assert_eq!(broker.published_events()[0].id(), event.id());
    }

    #[test]
    fn test_invalid_event_is_not_buffered() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let mut event = triggered("build");
        event.data.add("name", 1);
        let err = publisher.send_event(&event).unwrap_err();
        assert!(matches!(err, EiffelError::InvalidEvent { .. }));
        assert_eq!(publisher.pending(), 0);
    }

    #[test]
    fn test_buffered_until_started_in_order() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let events: Vec<Event> = (0..5).map(|i| triggered(&format!("step-{i}"))).collect();
        for event in &events {
            publisher.send_event(event).unwrap();
        }
        assert_eq!(publisher.wait_for_unpublished_events(Some(Duration::ZERO)), 5);
        assert_eq!(publisher.pending_events()[0].id(), events[0].id());

        publisher.start().unwrap();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);

        let sent: Vec<String> = broker
            .published_events()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        let expected: Vec<String> = events.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_drains_after_reconnect() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.start().unwrap();
        assert!(publisher.wait_for_state(ConnectionState::Connected, WAIT));

        broker.disconnect();
        publisher.send_event(&triggered("offline")).unwrap();
        assert!(publisher.wait_for_unpublished_events(Some(Duration::from_millis(100))) >= 1);
        assert!(broker.published().is_empty());

        broker.restore();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn test_idle_publisher_observes_connection_loss() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.start().unwrap();
        assert!(publisher.wait_for_state(ConnectionState::Connected, WAIT));

        broker.disconnect();
        assert!(publisher.wait_for_state(ConnectionState::Disconnected, WAIT));

        broker.restore();
        assert!(publisher.wait_for_state(ConnectionState::Connected, WAIT));
    }

    #[test]
    fn test_outage_mid_drain_keeps_rest_in_order() {
        let broker = MemoryBroker::new();
        broker.disconnect();
        let publisher = publisher(&broker);
        publisher.start().unwrap();

        let events: Vec<Event> = (0..4).map(|i| triggered(&format!("step-{i}"))).collect();
        for event in &events {
            publisher.send_event(event).unwrap();
        }

        broker.disconnect_after(1);
        broker.restore();
        let deadline = std::time::Instant::now() + WAIT;
        while publisher.pending() > 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(!broker.is_online());
        assert_eq!(broker.published().len(), 1);
        let pending: Vec<String> = publisher
            .pending_events()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        let expected: Vec<String> = events[1..].iter().map(|e| e.id().to_string()).collect();
        assert_eq!(pending, expected);

        broker.restore();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);
        let sent: Vec<String> = broker
            .published_events()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        let expected: Vec<String> = events.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_permanent_send_failure_drops_event() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(PickyBroker(broker.clone()))
            .with_reconnect_interval(Duration::from_millis(20));
        publisher.start().unwrap();
        assert!(publisher.wait_for_state(ConnectionState::Connected, WAIT));

        let poison = triggered("poison").with_family("poison");
        let healthy = triggered("healthy");
        publisher.send_event(&poison).unwrap();
        publisher.send_event(&healthy).unwrap();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);

        let sent = broker.published_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), healthy.id());
        assert_eq!(publisher.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_source_stamped_when_missing() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).with_source(Source::new("pipeline").with_host("ci-01"));
        publisher.start().unwrap();

        let stamped = triggered("a");
        let mut own = triggered("b");
        own.meta_mut().set_source(&Source::new("custom"));
        publisher.send_event(&stamped).unwrap();
        publisher.send_event(&own).unwrap();
        assert_eq!(publisher.wait_for_unpublished_events(Some(WAIT)), 0);

        let sources: Vec<Option<String>> = broker
            .published_events()
            .iter()
            .map(|e| e.meta().source().and_then(|s| s.name))
            .collect();
        assert_eq!(
            sources,
            vec![Some("pipeline".to_string()), Some("custom".to_string())]
        );
        assert!(stamped.meta().source().is_none());
    }

    #[test]
    fn test_stop_keeps_buffer() {
        let broker = MemoryBroker::new();
        broker.disconnect();
        let publisher = publisher(&broker);
        publisher.start().unwrap();
        publisher.send_event(&triggered("x")).unwrap();
        publisher.stop();
        publisher.stop();
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
        assert_eq!(publisher.pending(), 1);
    }
}
