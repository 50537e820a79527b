//! # In-Memory Broker
//!
//! Single-process implementation of the [`Broker`] boundary, used by the
//! test suite and single-node deployments. Faithful to the substrate the
//! gateway assumes: at-most-once delivery (a full or closed queue drops
//! the payload with a warning), topic and direct exchanges, and no
//! acknowledgments.

use crate::broker::{
    Broker, BusChannel, BusError, Delivery, DeliveryStream, ExchangeKind, QueueOptions,
};
use crate::topic::TopicPattern;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default buffered deliveries per queue before backpressure drops.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// In-memory broker. Cheap to clone a handle to via [`Broker::open_channel`];
/// all channels share one routing table.
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    capacity: usize,
    published: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    raw: String,
    pattern: TopicPattern,
    queue: String,
}

struct QueueState {
    sender: mpsc::Sender<Delivery>,
    // Taken by the first (only) consumer.
    receiver: Option<mpsc::Receiver<Delivery>>,
}

impl InMemoryBroker {
    /// Create a broker with the default per-queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a broker with a specific per-queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState::default())),
            capacity,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Per-queue capacity used for new queues without an override.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total publish attempts since creation.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Open a channel without going through the trait object.
    #[must_use]
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel {
            state: Arc::clone(&self.state),
            default_capacity: self.capacity,
            published: Arc::clone(&self.published),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BusChannel>, BusError> {
        Ok(Box::new(self.channel()))
    }
}

/// A logical channel into an [`InMemoryBroker`].
pub struct InMemoryChannel {
    state: Arc<RwLock<BrokerState>>,
    default_capacity: usize,
    published: Arc<AtomicU64>,
}

impl InMemoryChannel {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<mpsc::Sender<Delivery>>, BusError> {
        let state = self.state.read();
        let ex = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let mut hits = Vec::new();
        for binding in &ex.bindings {
            let matched = match ex.kind {
                ExchangeKind::Direct => binding.raw == routing_key,
                ExchangeKind::Topic => binding.pattern.matches(routing_key),
            };
            if matched {
                if let Some(queue) = state.queues.get(&binding.queue) {
                    hits.push(queue.sender.clone());
                }
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl BusChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        let mut state = self.state.write();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BusError::ExchangeKindMismatch {
                name: name.to_string(),
                existing: existing.kind,
            }),
            Some(_) => Ok(()), // idempotent redeclare
            None => {
                debug!(exchange = name, ?kind, "Declared exchange");
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, options: QueueOptions) -> Result<String, BusError> {
        let capacity = options.capacity().unwrap_or(self.default_capacity);
        let name = options
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("q.gen-{}", Uuid::new_v4().simple()));

        let mut state = self.state.write();
        if !state.queues.contains_key(&name) {
            let (sender, receiver) = mpsc::channel(capacity);
            state.queues.insert(
                name.clone(),
                QueueState {
                    sender,
                    receiver: Some(receiver),
                },
            );
            debug!(queue = %name, capacity, "Declared queue");
        }
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BusError> {
        let mut state = self.state.write();
        if !state.queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let duplicate = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.raw == pattern);
        if !duplicate {
            ex.bindings.push(Binding {
                raw: pattern.to_string(),
                pattern: TopicPattern::new(pattern),
                queue: queue.to_string(),
            });
            debug!(queue, exchange, pattern, "Bound queue");
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<usize, BusError> {
        self.published.fetch_add(1, Ordering::Relaxed);

        let senders = self.route(exchange, routing_key)?;
        let mut delivered = 0;
        for sender in senders {
            let delivery = Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            };
            // At-most-once: a full or closed queue loses the payload.
            match sender.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(exchange, routing_key, "Queue full, delivery dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(exchange, routing_key, "Queue consumer gone, delivery dropped");
                }
            }
        }

        if delivered == 0 {
            debug!(exchange, routing_key, "Publish reached no queue");
        }
        Ok(delivered)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError> {
        let mut state = self.state.write();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        let receiver = entry
            .receiver
            .take()
            .ok_or_else(|| BusError::ConsumerConflict(queue.to_string()))?;
        Ok(DeliveryStream::new(receiver))
    }
}
