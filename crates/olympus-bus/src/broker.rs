//! # Broker Boundary
//!
//! The gateway never assumes a concrete broker; it talks to these traits.
//! The model is deliberately narrow: exchanges route published payloads to
//! bound queues, queues feed consumers, delivery is at-most-once, and
//! there are no request/response semantics. Those are built above this
//! boundary by the gateway's correlation engine.

use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Published to an exchange nobody declared.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// Bound or consumed a queue nobody declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Redeclared an exchange with a different kind.
    #[error("exchange {name} already declared as {existing:?}")]
    ExchangeKindMismatch {
        /// Exchange name in conflict.
        name: String,
        /// Kind recorded by the first declaration.
        existing: ExchangeKind,
    },

    /// A queue already has a consumer attached.
    #[error("queue {0} already has a consumer")]
    ConsumerConflict(String),

    /// The broker (or the channel to it) has shut down.
    #[error("broker channel closed")]
    ChannelClosed,
}

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes on dotted binding patterns (`*`/`#` wildcards).
    Topic,
    /// Routes on exact binding-key equality.
    Direct,
}

/// One payload delivered from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exchange the payload was published to.
    pub exchange: String,
    /// Routing key the publisher used.
    pub routing_key: String,
    /// Raw payload bytes; the gateway treats these as JSON.
    pub payload: Bytes,
}

/// Declaration options for a queue.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    name: Option<String>,
    capacity: Option<usize>,
}

impl QueueOptions {
    /// A durable, shared queue with a fixed name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            capacity: None,
        }
    }

    /// An exclusive queue: the broker generates a unique name and the
    /// declaring channel is expected to be its only consumer.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            name: None,
            capacity: None,
        }
    }

    /// Override the buffered-delivery capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Requested queue name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Requested capacity, if any.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// Connection-level handle to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a logical channel for declarations, publishing and consuming.
    async fn open_channel(&self) -> Result<Box<dyn BusChannel>, BusError>;
}

/// A logical broker channel.
///
/// All methods are infallible on the happy path of an in-memory broker
/// but return [`BusError`] so that a networked implementation can
/// surface connection failures through the same seam.
#[async_trait]
pub trait BusChannel: Send + Sync {
    /// Declare an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError>;

    /// Declare a queue, returning its (possibly generated) name.
    async fn declare_queue(&self, options: QueueOptions) -> Result<String, BusError>;

    /// Bind a queue to an exchange under a binding pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BusError>;

    /// Publish a payload. Returns the number of queues it reached;
    /// zero is not an error, since at-most-once delivery means unrouted
    /// payloads simply vanish.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<usize, BusError>;

    /// Attach the (single) consumer for a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError>;
}

/// Stream of deliveries from one consumed queue.
#[derive(Debug)]
pub struct DeliveryStream {
    receiver: mpsc::Receiver<Delivery>,
}

impl DeliveryStream {
    /// Wrap a receiver handed out by a broker implementation.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Receive the next delivery; `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
