//! # Olympus Bus
//!
//! Messaging substrate for the Olympus gateway: the [`Broker`] boundary the
//! gateway programs against, AMQP-style topic matching, and an in-process
//! implementation for tests and single-node runs.
//!
//! The substrate is deliberately thin. Publishes are fire-and-forget with
//! at-most-once delivery; there are no acks, no redelivery, and no persistent
//! queues. Request/reply correlation is the gateway's job, not the broker's.
//!
//! ## Example
//!
//! ```
//! use olympus_bus::{Broker, ExchangeKind, InMemoryBroker, QueueOptions};
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), olympus_bus::BusError> {
//! let broker = InMemoryBroker::new();
//! let channel = broker.open_channel().await?;
//!
//! channel.declare_exchange("gw.requests", ExchangeKind::Topic).await?;
//! let queue = channel.declare_queue(QueueOptions::named("event-service")).await?;
//! channel.bind_queue(&queue, "gw.requests", "event.#").await?;
//!
//! let mut deliveries = channel.consume(&queue).await?;
//! channel.publish("gw.requests", "event.get", Bytes::from_static(b"{}")).await?;
//!
//! let delivery = deliveries.recv().await.unwrap();
//! assert_eq!(delivery.routing_key, "event.get");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod memory;
pub mod topic;

pub use broker::{
    Broker, BusChannel, BusError, Delivery, DeliveryStream, ExchangeKind, QueueOptions,
};
pub use memory::{InMemoryBroker, InMemoryChannel, DEFAULT_QUEUE_CAPACITY};
pub use topic::TopicPattern;

/// Crate version, surfaced in gateway introspection output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
