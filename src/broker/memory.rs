//! In-memory broker with a single topic exchange
//!
//! Queues are durable for the lifetime of the `MemoryBroker`: bindings and
//! backlog survive `disconnect()`, and unacknowledged deliveries are requeued
//! as redelivered. Useful for tests and single-process setups.

use super::{topic_matches, Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::error::{EiffelError, Result};
use crate::event::Event;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// How a delivery was settled by its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// A message seen by the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct Queue {
    bindings: Vec<String>,
    backlog: VecDeque<Message>,
    consumer: Option<Consumer>,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: Message,
}

struct State {
    online: bool,
    generation: u64,
    next_channel: u64,
    next_tag: u64,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    settled: Vec<(String, AckOutcome)>,

    /// Publishes left before a scheduled outage
    publishes_until_outage: Option<usize>,
}

struct Inner {
    state: Mutex<State>,

    /// Current generation; channels of an older generation are dead
    generation: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(self: &Arc<Self>, state: &mut State, routing_key: &str, payload: &[u8]) {
        state.published.push(PublishedMessage {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.iter().any(|b| topic_matches(b, routing_key)))
            .map(|(name, _)| name.clone())
            .collect();

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.backlog.push_back(Message {
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(state, &name);
        }
    }

    /// Hand queued messages to the queue's consumer, if any
    fn dispatch(self: &Arc<Self>, state: &mut State, queue_name: &str) {
        let generation = state.generation;
        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some((channel, tx)) = queue.consumer.as_ref().map(|c| (c.channel, c.tx.clone()))
            else {
                return;
            };
            let Some(message) = queue.backlog.pop_front() else {
                return;
            };

            let tag = state.next_tag;
            state.next_tag += 1;

            if tx.send(Ok(self.delivery(tag, generation, &message))).is_err() {
                queue.backlog.push_front(message);
                queue.consumer = None;
                return;
            }
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    channel,
                    message,
                },
            );
        }
    }

    fn delivery(self: &Arc<Self>, tag: u64, generation: u64, message: &Message) -> Delivery {
        let on_ack = Arc::clone(self);
        let on_nack = Arc::clone(self);
        Delivery::new(
            message.routing_key.clone(),
            message.payload.clone(),
            message.redelivered,
            move || Box::pin(async move { on_ack.settle(tag, generation, AckOutcome::Ack) }),
            move |requeue| {
                Box::pin(async move {
                    on_nack.settle(tag, generation, AckOutcome::Nack { requeue })
                })
            },
        )
    }

    fn settle(self: &Arc<Self>, tag: u64, generation: u64, outcome: AckOutcome) -> Result<()> {
        let mut state = self.lock();
        if !state.online || state.generation != generation {
            return Err(EiffelError::Ack("channel is closed".to_string()));
        }
        let Some(unacked) = state.unacked.remove(&tag) else {
            return Err(EiffelError::Ack(format!("unknown delivery tag {tag}")));
        };

        state
            .settled
            .push((unacked.message.routing_key.clone(), outcome.clone()));

        if outcome == (AckOutcome::Nack { requeue: true }) {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.backlog.push_front(message);
            }
            self.dispatch(&mut state, &unacked.queue);
        }
        Ok(())
    }

    /// Kill every open channel and refuse new connects
    fn go_offline(&self, state: &mut State) {
        state.online = false;
        state.generation += 1;
        state.publishes_until_outage = None;
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        Self::requeue_unacked(state, |_| true);
        self.generation.send_replace(state.generation);
        tracing::debug!(generation = state.generation, "Memory broker went offline");
    }

    /// Put unacknowledged messages matching `filter` back at the head of their queues
    fn requeue_unacked(state: &mut State, filter: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| filter(u))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.backlog.push_front(message);
                }
            }
        }
    }
}

/// In-memory broker
///
/// Cloning yields another handle to the same exchange.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an online broker with no queues
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    online: true,
                    generation: 0,
                    next_channel: 0,
                    next_tag: 0,
                    queues: HashMap::new(),
                    unacked: HashMap::new(),
                    published: Vec::new(),
                    settled: Vec::new(),
                    publishes_until_outage: None,
                }),
                generation: watch::channel(0).0,
            }),
        }
    }

    /// Simulate a broker outage: every open channel dies and new connects fail
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        self.inner.go_offline(&mut state);
    }

    /// Go offline right after `publishes` more messages were accepted
    pub fn disconnect_after(&self, publishes: usize) {
        let mut state = self.inner.lock();
        if publishes == 0 {
            self.inner.go_offline(&mut state);
        } else {
            state.publishes_until_outage = Some(publishes);
        }
    }

    /// End a simulated outage
    pub fn restore(&self) {
        let mut state = self.inner.lock();
        state.online = true;
        tracing::debug!(generation = state.generation, "Memory broker back online");
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    /// Route a raw message through the exchange as if another client published it
    pub fn inject(&self, routing_key: &str, payload: &[u8]) {
        let mut state = self.inner.lock();
        self.inner.route(&mut state, routing_key, payload);
    }

    /// Every message published to the exchange, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    /// Published messages that parse as events
    pub fn published_events(&self) -> Vec<Event> {
        self.published()
            .iter()
            .filter_map(|m| Event::from_wire(&m.payload).ok())
            .collect()
    }

    /// Settlement of every delivery, in order, keyed by routing key
    pub fn settled(&self) -> Vec<(String, AckOutcome)> {
        self.inner.lock().settled.clone()
    }

    /// Binding keys of a queue
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    /// Messages waiting in a queue (not yet delivered)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.inner.lock();
        if !state.online {
            return Err(EiffelError::Connection("memory broker is offline".to_string()));
        }
        state.next_channel += 1;
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            id: state.next_channel,
            generation: state.generation,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
    generation: u64,
}

impl MemoryChannel {
    fn live(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.inner.lock();
        if !state.online || state.generation != self.generation {
            return Err(EiffelError::Connection("channel is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.live().map_err(|e| EiffelError::Publish {
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        })?;
        self.inner.route(&mut state, routing_key, payload);

        let outage = match state.publishes_until_outage.as_mut() {
            Some(left) => {
                *left -= 1;
                *left == 0
            }
            None => false,
        };
        if outage {
            self.inner.go_offline(&mut state);
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.live()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, binding_key: &str) -> Result<()> {
        let mut state = self.live()?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(EiffelError::Subscribe {
                pattern: binding_key.to_string(),
                reason: format!("queue '{queue}' is not declared"),
            });
        };
        if !q.bindings.iter().any(|b| b == binding_key) {
            q.bindings.push(binding_key.to_string());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let mut state = self.live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            None => {
                return Err(EiffelError::Subscribe {
                    pattern: queue.to_string(),
                    reason: format!("queue '{queue}' is not declared"),
                })
            }
            Some(q) if q.consumer.as_ref().is_some_and(|c| !c.tx.is_closed()) => {
                return Err(EiffelError::Subscribe {
                    pattern: queue.to_string(),
                    reason: format!("queue '{queue}' already has a consumer"),
                })
            }
            Some(q) => {
                q.consumer = Some(Consumer {
                    channel: self.id,
                    tx,
                });
            }
        }
        self.inner.dispatch(&mut state, queue);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.generation != self.generation {
            return Ok(());
        }
        for queue in state.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == self.id) {
                queue.consumer = None;
            }
        }
        let id = self.id;
        Inner::requeue_unacked(&mut state, |u| u.channel == id);
        Ok(())
    }

    async fn closed(&self) {
        let mut generation = self.inner.generation.subscribe();
        let _ = generation.wait_for(|g| *g != self.generation).await;
    }
}
