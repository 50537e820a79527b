//! # Correlation Engine
//!
//! Bridges one-shot callers to the async bus. Outgoing messages are
//! stamped with a correlation ID and the engine's exclusive reply queue;
//! the reply pump consumes that queue and completes the matching pending
//! entry, strictly in arrival order. A periodic sweep is the only other
//! thing that ever removes an entry, so completion is exactly-once by
//! construction.
//!
//! ```text
//! caller ──send_request──▶ [table] ──publish──▶ requests exchange
//!                             ▲                        │
//!                             │                   (services)
//!                          [pump] ◀──consume── reply queue
//! ```

pub mod table;
pub mod validate;

pub use table::{
    CorrelationTable, DuplicateId, EngineStats, InterceptOptions, InterceptOutcome, StatsSnapshot,
    SweepReport,
};
pub use validate::{ReplyValidator, RequiredCountFields, ValidationError};

use self::table::{Disposition, PendingEntry};
use crate::domain::config::GatewayConfig;
use crate::domain::correlation::CorrelationId;
use crate::domain::envelope::{stamped, GatewayReply, WireHeader, STATUS_OUTGOING};
use crate::domain::error::codes;
use bytes::Bytes;
use olympus_bus::{Broker, BusChannel, BusError, Delivery, DeliveryStream, ExchangeKind, QueueOptions};
use serde_json::{json, Map, Value};
use std::panic::Location;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Errors wiring the engine to the broker.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open a broker channel")]
    Channel(#[source] BusError),

    #[error("failed to declare exchange {name}")]
    Exchange {
        name: String,
        #[source]
        source: BusError,
    },

    #[error("failed to set up the reply queue")]
    ReplyQueue(#[source] BusError),

    #[error("failed to start the reply consumer")]
    Consume(#[source] BusError),
}

/// Errors sending one message.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("publish failed")]
    Publish(#[from] BusError),

    #[error("request body could not be serialized")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Duplicate(#[from] DuplicateId),
}

/// The send half of the engine. Cheap to share behind an [`Arc`]; the
/// receive half lives in the [`ReplyPump`] returned alongside it.
pub struct CorrelationEngine {
    channel: Box<dyn BusChannel>,
    requests_exchange: String,
    reply_queue: String,
    table: Arc<CorrelationTable>,
}

impl CorrelationEngine {
    /// Wire up against a broker: declare both exchanges, declare and bind
    /// the exclusive reply queue, and attach its consumer.
    ///
    /// The returned [`ReplyPump`] must be spawned for any reply to ever
    /// complete; the sweep ([`sweep_task`]) must be spawned for any
    /// unanswered entry to ever time out.
    pub async fn connect(
        broker: &dyn Broker,
        config: &GatewayConfig,
    ) -> Result<(Self, ReplyPump), SetupError> {
        let channel = broker.open_channel().await.map_err(SetupError::Channel)?;

        channel
            .declare_exchange(&config.wiring.requests_exchange, ExchangeKind::Topic)
            .await
            .map_err(|source| SetupError::Exchange {
                name: config.wiring.requests_exchange.clone(),
                source,
            })?;
        channel
            .declare_exchange(&config.wiring.replies_exchange, ExchangeKind::Direct)
            .await
            .map_err(|source| SetupError::Exchange {
                name: config.wiring.replies_exchange.clone(),
                source,
            })?;

        // Exclusive queue, bound under its own generated name; the name
        // doubles as the reply routing key stamped into every request.
        let reply_queue = channel
            .declare_queue(QueueOptions::exclusive())
            .await
            .map_err(SetupError::ReplyQueue)?;
        channel
            .bind_queue(&reply_queue, &config.wiring.replies_exchange, &reply_queue)
            .await
            .map_err(SetupError::ReplyQueue)?;
        let deliveries = channel
            .consume(&reply_queue)
            .await
            .map_err(SetupError::Consume)?;

        let table = Arc::new(CorrelationTable::new(
            config.budgets.request,
            config.budgets.intercept,
        ));

        info!(
            requests_exchange = %config.wiring.requests_exchange,
            replies_exchange = %config.wiring.replies_exchange,
            reply_queue = %reply_queue,
            "Correlation engine connected"
        );

        let engine = Self {
            channel,
            requests_exchange: config.wiring.requests_exchange.clone(),
            reply_queue,
            table: Arc::clone(&table),
        };
        Ok((engine, ReplyPump { deliveries, table }))
    }

    /// Fire-and-forget publish. No correlation entry is registered;
    /// `msg_id` 0 is stamped, which the allocator never hands out, so a
    /// stray reply is dropped by the pump. Returns how many queues the
    /// message reached.
    pub async fn publish(&self, routing_key: &str, body: Value) -> Result<usize, SendError> {
        let mut map = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        map.insert("msg_id".to_string(), json!(0));
        map.insert("status".to_string(), json!(STATUS_OUTGOING));
        self.send_raw(routing_key, &Value::Object(map)).await
    }

    /// Send a request on behalf of an HTTP caller. The returned ticket
    /// always resolves: with the mapped reply, or with the fixed 504 once
    /// the sweep gives up on it.
    pub async fn send_request(
        &self,
        routing_key: &str,
        body: Value,
        validator: Option<Arc<dyn ReplyValidator>>,
    ) -> Result<ReplyTicket, SendError> {
        let (id, rx) = self.table.register_request(routing_key, validator);
        let payload = stamped(body, id, &self.reply_queue);
        if let Err(err) = self.send_raw(routing_key, &payload).await {
            self.table.cancel(id);
            return Err(err);
        }
        Ok(ReplyTicket { id, rx })
    }

    /// Start building an intercept send. The builder captures this call
    /// site for timeout diagnostics, so keep the call on the caller's
    /// line rather than behind a helper.
    #[track_caller]
    pub fn build_send(&self, routing_key: impl Into<String>, body: Value) -> SendBuilder<'_> {
        SendBuilder {
            engine: self,
            routing_key: routing_key.into(),
            body,
            name: None,
            budget: None,
            on_timeout: None,
            validator: None,
            origin: Location::caller(),
        }
    }

    /// Watch a caller-allocated ID (see [`Self::allocate_id`]) without
    /// sending anything. The caller stamps and publishes itself.
    #[track_caller]
    pub fn register_intercept(
        &self,
        id: CorrelationId,
        name: &str,
    ) -> Result<InterceptTicket, DuplicateId> {
        let rx = self.table.register_intercept_with_id(id, name)?;
        Ok(InterceptTicket { id, rx })
    }

    /// Mint a correlation ID for the manual registration path.
    pub fn allocate_id(&self) -> CorrelationId {
        self.table.allocate_id()
    }

    /// Name of the exclusive reply queue, stamped as `reply_to`.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn requests_exchange(&self) -> &str {
        &self.requests_exchange
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.table.stats().snapshot()
    }

    pub(crate) fn table_handle(&self) -> Arc<CorrelationTable> {
        Arc::clone(&self.table)
    }

    async fn send_raw(&self, routing_key: &str, payload: &Value) -> Result<usize, SendError> {
        let bytes = serde_json::to_vec(payload)?;
        let delivered = self
            .channel
            .publish(&self.requests_exchange, routing_key, Bytes::from(bytes))
            .await?;
        if delivered == 0 {
            warn!(routing_key, "Request matched no bound queue");
        }
        Ok(delivered)
    }
}

/// Builder for an intercept send; see [`CorrelationEngine::build_send`].
pub struct SendBuilder<'a> {
    engine: &'a CorrelationEngine,
    routing_key: String,
    body: Value,
    name: Option<String>,
    budget: Option<Duration>,
    on_timeout: Option<Box<dyn FnOnce() + Send + Sync>>,
    validator: Option<Arc<dyn ReplyValidator>>,
    origin: &'static Location<'static>,
}

impl<'a> SendBuilder<'a> {
    /// Diagnostic name for the pending entry; defaults to the routing key.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Per-send budget overriding the configured intercept budget.
    #[must_use]
    pub fn timeout(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Hook run if the sweep times the entry out.
    #[must_use]
    pub fn on_timeout(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }

    /// Validator consulted before a success reply resolves the ticket.
    #[must_use]
    pub fn validate(mut self, validator: Arc<dyn ReplyValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Register the entry, stamp the body, and publish it.
    pub async fn submit(self) -> Result<InterceptTicket, SendError> {
        let name = self.name.unwrap_or_else(|| self.routing_key.clone());
        let options = InterceptOptions {
            budget: self.budget,
            on_timeout: self.on_timeout,
            validator: self.validator,
        };
        let (id, rx) = self
            .engine
            .table
            .register_intercept_at(self.origin, &name, options);
        let payload = stamped(self.body, id, &self.engine.reply_queue);
        if let Err(err) = self.engine.send_raw(&self.routing_key, &payload).await {
            self.engine.table.cancel(id);
            return Err(err);
        }
        Ok(InterceptTicket { id, rx })
    }
}

/// Pending HTTP-bound request.
pub struct ReplyTicket {
    id: CorrelationId,
    rx: oneshot::Receiver<GatewayReply>,
}

impl ReplyTicket {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the reply. Infallible: a torn-down engine degrades to the
    /// fixed timeout reply rather than an error the HTTP layer cannot map.
    pub async fn reply(self) -> GatewayReply {
        self.rx.await.unwrap_or_else(|_| GatewayReply::timeout())
    }
}

/// Pending intercept.
pub struct InterceptTicket {
    id: CorrelationId,
    rx: oneshot::Receiver<InterceptOutcome>,
}

impl InterceptTicket {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the outcome; a torn-down engine degrades to `TimedOut`.
    pub async fn outcome(self) -> InterceptOutcome {
        self.rx.await.unwrap_or(InterceptOutcome::TimedOut)
    }
}

/// The single consumer of the reply queue. Replies are handled strictly
/// in arrival order; each one completes (or re-arms) at most one entry.
pub struct ReplyPump {
    deliveries: DeliveryStream,
    table: Arc<CorrelationTable>,
}

impl ReplyPump {
    /// Drive the pump until the broker goes away.
    pub async fn run(mut self) {
        while let Some(delivery) = self.deliveries.recv().await {
            self.handle(delivery).await;
        }
        info!("Reply stream closed; pump exiting");
    }

    async fn handle(&self, delivery: Delivery) {
        let payload: Value = match serde_json::from_slice(&delivery.payload) {
            Ok(value) => value,
            Err(err) => {
                self.table.stats().dropped.fetch_add(1, Ordering::Relaxed);
                warn!(routing_key = %delivery.routing_key, %err, "Dropping undecodable reply");
                return;
            }
        };
        let Some(header) = WireHeader::peel(&payload) else {
            self.table.stats().dropped.fetch_add(1, Ordering::Relaxed);
            warn!(routing_key = %delivery.routing_key, "Dropping reply without a wire header");
            return;
        };

        let id = CorrelationId::from(header.msg_id);
        let Some(entry) = self.table.take(id) else {
            // Late reply after a sweep, or an ID nothing registered.
            self.table.stats().dropped.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Dropping reply with no pending entry");
            return;
        };
        let PendingEntry {
            registered_at,
            budget,
            name,
            origin,
            disposition,
        } = entry;

        match disposition {
            Disposition::Request { reply_tx, validator } => {
                if header.is_success() {
                    if let Some(v) = &validator {
                        if let Err(err) = v.validate(&payload).await {
                            // Put the entry back untouched: the sweep still
                            // owns its timeout, so the caller gets exactly
                            // one completion either way.
                            warn!(
                                correlation_id = %id,
                                name = %name,
                                %err,
                                "Reply failed validation; request stays pending"
                            );
                            self.table.restore(
                                id,
                                PendingEntry {
                                    registered_at,
                                    budget,
                                    name,
                                    origin,
                                    disposition: Disposition::Request { reply_tx, validator },
                                },
                            );
                            return;
                        }
                    }
                }
                let counter = if header.is_success() {
                    &self.table.stats().completed
                } else {
                    &self.table.stats().rejected
                };
                counter.fetch_add(1, Ordering::Relaxed);
                // Release before waking the caller, so a follow-up request
                // sent from the woken task can reuse the ID right away.
                self.table.release_id(id);
                let reply = map_reply(header, payload);
                if reply_tx.send(reply).is_err() {
                    debug!(correlation_id = %id, name = %name, "Request waiter went away before the reply");
                }
            }
            Disposition::Intercept {
                outcome_tx,
                validator,
                ..
            } => {
                let (outcome, counter) = if !header.is_success() {
                    (
                        InterceptOutcome::Rejected {
                            status: header.status,
                            envelope: payload,
                        },
                        &self.table.stats().rejected,
                    )
                } else if let Some(v) = &validator {
                    match v.validate(&payload).await {
                        Ok(()) => (
                            InterceptOutcome::Resolved(payload),
                            &self.table.stats().completed,
                        ),
                        Err(err) => (
                            InterceptOutcome::Invalid {
                                reason: err.to_string(),
                                envelope: payload,
                            },
                            &self.table.stats().rejected,
                        ),
                    }
                } else {
                    (
                        InterceptOutcome::Resolved(payload),
                        &self.table.stats().completed,
                    )
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.table.release_id(id);
                if outcome_tx.send(outcome).is_err() {
                    debug!(correlation_id = %id, name = %name, "Intercept waiter went away before the reply");
                }
            }
        }
    }
}

/// Map a terminal reply onto the HTTP envelope.
///
/// Success keeps the service's `result` array (empty when absent).
/// Failure maps the wire status straight onto HTTP when it is a plausible
/// HTTP error, and onto 502 otherwise.
fn map_reply(header: WireHeader, payload: Value) -> GatewayReply {
    if header.is_success() {
        let result = payload
            .get("result")
            .cloned()
            .unwrap_or_else(|| json!([]));
        return GatewayReply::ok(result);
    }

    let message = payload
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .unwrap_or("upstream service reported a failure")
        .to_string();
    let http_status = if (400..=599).contains(&header.status) {
        header.status as u16
    } else {
        502
    };
    GatewayReply::failed(http_status, codes::SERVICE_FAILURE, message)
}

/// Periodic sweep loop; spawn one per engine. The interval skips missed
/// ticks rather than bursting after a stall.
pub async fn sweep_task(table: Arc<CorrelationTable>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let report = table.sweep();
        if report.total() > 0 {
            debug!(
                requests = report.requests,
                intercepts = report.intercepts,
                "Sweep expired pending entries"
            );
        }
    }
}
