//! # Entity Resolver
//!
//! Fetches single entities from their owning services and hydrates
//! cross-service references: foreign-ID fields are replaced by the full
//! referenced objects before anything is handed back. Venues and acts pull
//! in their owning user; events pull in their venues (which recurse into
//! users), their act, and both review states.
//!
//! Every lookup goes through a per-kind [`TtlNotifyCache`], so concurrent
//! lookups of the same entity collapse into one upstream fetch and repeat
//! lookups inside the TTL never touch the bus.

use crate::cache::{Flight, TtlNotifyCache, WaitError};
use crate::domain::config::CacheConfig;
use crate::domain::entities::{EntityKind, EventRefs, OwnerRef};
use crate::domain::envelope::GatewayReply;
use crate::domain::error::codes;
use crate::engine::{CorrelationEngine, InterceptOutcome, SendError};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a lookup produced no entity.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The owning service rejected the lookup.
    #[error("lookup rejected with status {status}")]
    Failed { status: i64, envelope: Value },

    /// The success reply carried no `result` array.
    #[error("Result was not an array")]
    NotAnArray,

    /// The `result` array did not hold exactly one element. `got: 0` is
    /// the not-found case; see [`ResolveError::is_not_found`].
    #[error("Result had too many or too few elements, expected 1 got {got}")]
    Cardinality { got: usize },

    /// A validator refused the reply.
    #[error("invalid reply: {0}")]
    Invalid(String),

    /// The lookup aged out of the correlation table.
    #[error("lookup timed out")]
    TimedOut,

    #[error(transparent)]
    Send(#[from] SendError),

    /// The entity record did not deserialize into its reference shape.
    #[error("entity record had an unexpected shape")]
    Shape(#[from] serde_json::Error),

    /// Another caller led the coalesced fetch and gave up.
    #[error("coalesced lookup failed before a value was cached")]
    LeaderFailed,

    /// The coalesced wait aged out before the leader finished.
    #[error("coalesced lookup expired")]
    WaitExpired,
}

impl ResolveError {
    /// True for the empty-result case, which callers treat as a missing
    /// entity rather than a fault.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::Cardinality { got: 0 })
    }
}

/// Outcome of a batch lookup: the entities that resolved, and the IDs
/// that turned out not to exist.
#[derive(Debug, Default)]
pub struct Batch {
    pub entities: Vec<Value>,
    pub missing: Vec<String>,
}

impl Batch {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Envelope for the HTTP layer: OK when everything resolved, PARTIAL
    /// with the resolved subset otherwise.
    #[must_use]
    pub fn into_reply(self) -> GatewayReply {
        if self.missing.is_empty() {
            GatewayReply::ok(Value::Array(self.entities))
        } else {
            let message = format!("entities not found: {}", self.missing.join(", "));
            GatewayReply::partial(Value::Array(self.entities), codes::PARTIAL_RESULT, message)
        }
    }
}

/// Cached, hydrating entity lookups over the correlation engine.
pub struct Resolver {
    engine: Arc<CorrelationEngine>,
    caches: [TtlNotifyCache<Value>; 6],
}

impl Resolver {
    #[must_use]
    pub fn new(engine: Arc<CorrelationEngine>, config: &CacheConfig) -> Self {
        let caches = std::array::from_fn(|_| {
            TtlNotifyCache::with_budgets(config.ttl, config.flight_ttl, config.waiter_ttl)
        });
        Self { engine, caches }
    }

    /// Resolve one entity to its hydrated object.
    ///
    /// `caller` is the requesting user's ID, forwarded to the owning
    /// service; cached values are shared across callers.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
    ) -> Result<Value, ResolveError> {
        self.resolve_inner(kind, id.to_string(), caller.to_string())
            .await
    }

    /// Resolve one entity, run `middleware` over the hydrated JSON, and
    /// deserialize the outcome into `T`.
    pub async fn resolve_with<T, F>(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
        middleware: F,
    ) -> Result<T, ResolveError>
    where
        T: DeserializeOwned,
        F: FnOnce(Value) -> Value,
    {
        let raw = self.resolve(kind, id, caller).await?;
        Ok(serde_json::from_value(middleware(raw))?)
    }

    /// Resolve one entity and deserialize the hydrated JSON into `T`.
    pub async fn resolve_as<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
    ) -> Result<T, ResolveError> {
        self.resolve_with(kind, id, caller, |value| value).await
    }

    /// Hydrated user.
    pub async fn resolve_user(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::User, id, caller).await
    }

    /// Hydrated venue, owning user included.
    pub async fn resolve_venue(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::Venue, id, caller).await
    }

    /// Hydrated act, owning user included.
    pub async fn resolve_ents(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::Ents, id, caller).await
    }

    /// Hydrated event: venues, act, and both review states included.
    pub async fn resolve_event(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::Event, id, caller).await
    }

    /// Act review state.
    pub async fn resolve_entstate(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::EntState, id, caller).await
    }

    /// Event review state.
    pub async fn resolve_state(&self, id: &str, caller: &str) -> Result<Value, ResolveError> {
        self.resolve(EntityKind::State, id, caller).await
    }

    /// Resolve a batch of IDs of one kind. IDs that do not exist are
    /// reported in [`Batch::missing`] instead of failing the whole batch;
    /// any other error aborts it.
    pub async fn resolve_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
        caller: &str,
    ) -> Result<Batch, ResolveError> {
        let mut seen = HashSet::new();
        let mut batch = Batch::default();
        // Sequential on purpose: a duplicate ID hits the cache warmed by
        // its first occurrence instead of following a flight that can
        // mask not-found as a leader failure.
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.resolve(kind, id, caller).await {
                Ok(entity) => batch.entities.push(entity),
                Err(err) if err.is_not_found() => batch.missing.push(id.clone()),
                Err(err) => return Err(err),
            }
        }
        Ok(batch)
    }

    /// Fresh cached value for an entity, if any.
    #[must_use]
    pub fn cached(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.cache(kind).get(id)
    }

    /// Total stored cache elements across all kinds, stale ones included.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.caches.iter().map(TtlNotifyCache::len).sum()
    }

    fn cache(&self, kind: EntityKind) -> &TtlNotifyCache<Value> {
        &self.caches[kind.index()]
    }

    // Boxed because hydration recurses (event -> venue -> user).
    fn resolve_inner(
        &self,
        kind: EntityKind,
        id: String,
        caller: String,
    ) -> BoxFuture<'_, Result<Value, ResolveError>> {
        async move {
            match self.cache(kind).join_flight(&id) {
                Flight::Hit(value) => Ok(value),
                Flight::Leader(guard) => match self.fetch_and_hydrate(kind, &id, &caller).await {
                    Ok(value) => {
                        guard.complete(value.clone());
                        Ok(value)
                    }
                    Err(err) => {
                        guard.abandon();
                        Err(err)
                    }
                },
                Flight::Follower(waiter) => match waiter.wait().await {
                    Ok(value) => Ok(value),
                    Err(WaitError::LeaderFailed) => Err(ResolveError::LeaderFailed),
                    Err(WaitError::Expired) => Err(ResolveError::WaitExpired),
                },
            }
        }
        .boxed()
    }

    async fn fetch_and_hydrate(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
    ) -> Result<Value, ResolveError> {
        let raw = self.fetch(kind, id, caller).await?;
        match kind {
            EntityKind::User | EntityKind::EntState | EntityKind::State => Ok(raw),
            EntityKind::Venue | EntityKind::Ents => self.hydrate_owner(raw, caller).await,
            EntityKind::Event => self.hydrate_event(raw, caller).await,
        }
    }

    async fn fetch(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
    ) -> Result<Value, ResolveError> {
        let routing_key = format!("{}.get", kind.as_str());
        let ticket = self
            .engine
            .build_send(&routing_key, json!({"id": id, "caller_id": caller}))
            .name(format!("resolve {kind}/{id}"))
            .submit()
            .await?;
        match ticket.outcome().await {
            InterceptOutcome::Resolved(envelope) => extract_sole_element(envelope),
            InterceptOutcome::Rejected { status, envelope } => {
                Err(ResolveError::Failed { status, envelope })
            }
            InterceptOutcome::Invalid { reason, .. } => Err(ResolveError::Invalid(reason)),
            InterceptOutcome::TimedOut => Err(ResolveError::TimedOut),
        }
    }

    /// Swap a `user_id` field for the resolved `user` object. A missing
    /// owner becomes `user: null` rather than a failure.
    async fn hydrate_owner(&self, mut raw: Value, caller: &str) -> Result<Value, ResolveError> {
        let refs: OwnerRef = serde_json::from_value(raw.clone())?;
        let Some(user_id) = refs.user_id else {
            return Ok(raw);
        };
        let user = self.sub_entity(EntityKind::User, &user_id, caller).await?;
        if let Some(map) = raw.as_object_mut() {
            map.remove("user_id");
            map.insert("user".to_string(), user);
        }
        Ok(raw)
    }

    /// Replace an event's reference fields with resolved objects:
    /// `venue_ids` becomes `venues` (unresolvable venues are dropped),
    /// `ents_id`/`entstate_id`/`state_id` become `ents`/`entstate`/`state`
    /// or `null` when the target no longer exists.
    async fn hydrate_event(&self, mut raw: Value, caller: &str) -> Result<Value, ResolveError> {
        let refs: EventRefs = serde_json::from_value(raw.clone())?;

        let mut venues = Vec::with_capacity(refs.venue_ids.len());
        for venue_id in &refs.venue_ids {
            match self
                .resolve_inner(EntityKind::Venue, venue_id.clone(), caller.to_string())
                .await
            {
                Ok(venue) => venues.push(venue),
                Err(err) if err.is_not_found() => {
                    debug!(%venue_id, "Dropping unresolvable venue from event");
                }
                Err(err) => return Err(err),
            }
        }
        let ents = match &refs.ents_id {
            Some(id) => Some(self.sub_entity(EntityKind::Ents, id, caller).await?),
            None => None,
        };
        let entstate = match &refs.entstate_id {
            Some(id) => Some(self.sub_entity(EntityKind::EntState, id, caller).await?),
            None => None,
        };
        let state = match &refs.state_id {
            Some(id) => Some(self.sub_entity(EntityKind::State, id, caller).await?),
            None => None,
        };

        let Some(map) = raw.as_object_mut() else {
            return Ok(raw);
        };
        if map.remove("venue_ids").is_some() {
            map.insert("venues".to_string(), Value::Array(venues));
        }
        if let Some(ents) = ents {
            map.remove("ents_id");
            map.insert("ents".to_string(), ents);
        }
        if let Some(entstate) = entstate {
            map.remove("entstate_id");
            map.insert("entstate".to_string(), entstate);
        }
        if let Some(state) = state {
            map.remove("state_id");
            map.insert("state".to_string(), state);
        }
        Ok(raw)
    }

    /// Referenced entity, or `null` when it no longer exists.
    async fn sub_entity(
        &self,
        kind: EntityKind,
        id: &str,
        caller: &str,
    ) -> Result<Value, ResolveError> {
        match self
            .resolve_inner(kind, id.to_string(), caller.to_string())
            .await
        {
            Ok(value) => Ok(value),
            Err(err) if err.is_not_found() => Ok(Value::Null),
            Err(err) => Err(err),
        }
    }
}

/// Pull the single entity out of a success envelope.
fn extract_sole_element(mut envelope: Value) -> Result<Value, ResolveError> {
    match envelope.get_mut("result").map(Value::take) {
        Some(Value::Array(mut items)) => match items.len() {
            1 => Ok(items.swap_remove(0)),
            got => Err(ResolveError::Cardinality { got }),
        },
        _ => Err(ResolveError::NotAnArray),
    }
}
