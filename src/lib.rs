//! # eiffel-event
//!
//! Schema-validated Eiffel events over a topic-routed message broker.
//!
//! ## Overview
//!
//! `eiffel-event` builds, validates, publishes and receives Eiffel events.
//! Events are checked against bundled schemas before they leave the process,
//! published through a buffer that survives connection loss, and dispatched
//! to per-type callbacks with an explicit acknowledgement policy.
//!
//! ## Quick Start
//!
//! ```rust
//! use eiffel_event::{Event, Handler, MemoryBroker, Publisher, Subscriber};
//!
//! # fn example() -> eiffel_event::Result<()> {
//! let broker = MemoryBroker::new();
//!
//! let subscriber = Subscriber::new(broker.clone(), "my-queue");
//! subscriber.subscribe(
//!     "EiffelActivityTriggeredEvent",
//!     Handler::callback(|event, context| {
//!         println!("{event} (context {context:?})");
//!         Ok(())
//!     }),
//!     true,
//! );
//! subscriber.start()?;
//!
//! let publisher = Publisher::new(broker);
//! publisher.start()?;
//!
//! let mut event = Event::new("EiffelActivityTriggeredEvent", "4.2.0")?;
//! event.data.add("name", "build");
//! publisher.send_event(&event)?;
//! publisher.wait_for_unpublished_events(None);
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory**: In-memory topic exchange for tests and single-process use
//! - **amqp**: RabbitMQ over AMQP 0-9-1 (feature `amqp`, on by default)
//!
//! ## Architecture
//!
//! - **Event**: meta/data/links document with routing key and wire format
//! - **SchemaRegistry**: (type, version) to schema lookup and validation
//! - **ConnectionManager**: one broker channel on a background thread, reconnecting forever
//! - **Publisher**: validate, buffer, send in order
//! - **Subscriber**: bind, consume, dispatch, acknowledge
//! - **Activity**: triggered/started/finished workflow usable as a subscription handler

pub mod activity;
pub mod broker;
pub mod connection;
pub mod error;
pub mod event;
pub mod publisher;
pub mod schema;
pub mod subscriber;

// Re-export core types
pub use activity::{Activity, ActivityLogic, ExecutionType, Trigger, TriggerType};
pub use broker::{Broker, BrokerChannel, Delivery};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{EiffelError, Result, SchemaViolation};
pub use event::{Data, Event, Link, Links, Meta, Source, CONTEXT};
pub use publisher::Publisher;
pub use schema::{EventSchema, MemorySchemaRegistry, SchemaRegistry};
pub use subscriber::{EventHandler, Handler, HandlerError, HandlerResult, Subscriber, Subscription};

// Re-export brokers for convenience
pub use broker::memory::MemoryBroker;
#[cfg(feature = "amqp")]
pub use broker::amqp::{AmqpBroker, AmqpConfig};
