//! Broker transport abstraction
//!
//! A `Broker` opens channels; a `BrokerChannel` publishes to the configured
//! topic exchange, declares and binds queues, and consumes deliveries. The
//! connection manager owns exactly one channel at a time and never shares it,
//! and watches [`BrokerChannel::closed`] to notice a lost connection while idle.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// Stream of inbound deliveries for one consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Factory for broker channels
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection and channel
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Broker name (e.g., "amqp", "memory")
    fn name(&self) -> &str;
}

/// A live channel to the broker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish a payload to the exchange, returning once the broker confirmed it
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Declare a queue (idempotent)
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Bind a queue to the exchange with a topic binding key (idempotent)
    async fn bind(&self, queue: &str, binding_key: &str) -> Result<()>;

    /// Start consuming from a queue with manual acknowledgement
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Release the channel and its connection
    async fn close(&self) -> Result<()>;

    /// Resolves once the broker side closed the channel or its connection
    async fn closed(&self);
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type NackFn = Box<dyn FnOnce(bool) -> BoxFuture<'static, Result<()>> + Send>;

/// A message pending acknowledgement
pub struct Delivery {
    /// Routing key the message was published with
    pub routing_key: String,

    /// Raw message body
    pub payload: Vec<u8>,

    /// Whether the broker delivered this message before
    pub redelivered: bool,

    ack_fn: AckFn,
    nack_fn: NackFn,
}

impl Delivery {
    /// Create a delivery with ack/nack callbacks
    ///
    /// The nack callback receives the `requeue` flag.
    pub fn new(
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        redelivered: bool,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nack_fn: impl FnOnce(bool) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            redelivered,
            ack_fn: Box::new(ack_fn),
            nack_fn: Box::new(nack_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge, optionally asking the broker to redeliver
    pub async fn nack(self, requeue: bool) -> Result<()> {
        (self.nack_fn)(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Match a routing key against a topic binding key
///
/// Words are dot-separated; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|i| matches(rest, &words[i..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }

    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &words)
}
