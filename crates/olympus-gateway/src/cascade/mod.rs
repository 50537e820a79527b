//! # Cascading Delete Pipeline
//!
//! Deleting an entity runs three phases: discover what every service in
//! the fleet holds against the target, decide whether deletion is safe
//! (a pure function of the discovery record), and order the relevant
//! services to drop their references. Services that fail to confirm are
//! parked in the [`RetryOutbox`]; the pipeline never blocks the caller on
//! a retry.
//!
//! Pipelines live in an arena for introspection. The arena is only ever
//! touched between awaits, never across them.

pub mod outbox;
pub mod pipeline;
pub mod registry;

pub use outbox::{OutboxEntry, RetryOutbox};
pub use pipeline::{
    decide, ActionState, DeleteDecision, DeleteOutcome, DeleteReport, Dependent, DiscoveryCounts,
    DiscoveryRecord, PipelineId, PipelinePhase, PipelineRecord, RetryBackoff,
};
pub use registry::{service_by_id, service_for, ServiceDescriptor, SERVICES};

use crate::domain::config::DeleteConfig;
use crate::domain::entities::EntityRef;
use crate::engine::{CorrelationEngine, InterceptOutcome, ReplyValidator, RequiredCountFields};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs delete pipelines against the service fleet.
pub struct DeleteManager {
    engine: Arc<CorrelationEngine>,
    outbox: Arc<RetryOutbox>,
    arena: DashMap<PipelineId, PipelineRecord>,
    next_pipeline: AtomicU64,
    discover_budget: Duration,
    action_budget: Duration,
}

impl DeleteManager {
    #[must_use]
    pub fn new(
        engine: Arc<CorrelationEngine>,
        outbox: Arc<RetryOutbox>,
        config: &DeleteConfig,
    ) -> Self {
        Self {
            engine,
            outbox,
            arena: DashMap::new(),
            next_pipeline: AtomicU64::new(0),
            discover_budget: config.discover_budget,
            action_budget: config.action_budget,
        }
    }

    /// Run the whole pipeline for one target.
    ///
    /// Infallible by design: every failure mode maps onto one of the
    /// [`DeleteOutcome`] variants, and nothing is deleted unless every
    /// service answered discovery and none restricted.
    pub async fn delete_entity(&self, target: EntityRef, caller: &str) -> DeleteOutcome {
        let id = PipelineId(self.next_pipeline.fetch_add(1, Ordering::Relaxed) + 1);
        self.arena.insert(
            id,
            PipelineRecord {
                id,
                target: target.clone(),
                caller: caller.to_string(),
                phase: PipelinePhase::Discovering,
                discovery: DiscoveryRecord::default(),
                actions: BTreeMap::new(),
                started_at: Utc::now(),
            },
        );
        info!(pipeline = %id, target = %target, "Delete pipeline started");

        let discovery = self.discover(&target, caller).await;
        let decision = pipeline::decide(&discovery);
        if let Some(mut record) = self.arena.get_mut(&id) {
            record.discovery = discovery;
        }

        match decision {
            DeleteDecision::Incomplete { missing } => {
                warn!(pipeline = %id, ?missing, "Discovery incomplete; refusing the delete");
                self.finish(id);
                DeleteOutcome::DiscoveryIncomplete { missing }
            }
            DeleteDecision::Restricted { dependents } => {
                info!(
                    pipeline = %id,
                    held_by = dependents.len(),
                    "Delete refused by restricting references"
                );
                self.finish(id);
                DeleteOutcome::Restricted { dependents }
            }
            DeleteDecision::Proceed { relevant } => {
                self.dispatch_deletes(id, &target, caller, relevant).await
            }
        }
    }

    /// Pipelines not yet done.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.arena
            .iter()
            .filter(|record| record.phase != PipelinePhase::Done)
            .count()
    }

    /// Every pipeline record, serialized for introspection.
    #[must_use]
    pub fn pipelines(&self) -> Vec<Value> {
        self.arena
            .iter()
            .filter_map(|record| serde_json::to_value(&*record).ok())
            .collect()
    }

    /// Ask every service what it holds against the target. A service that
    /// rejects, answers garbage, or stays silent gets a `None` slot.
    async fn discover(&self, target: &EntityRef, caller: &str) -> DiscoveryRecord {
        let validator: Arc<dyn ReplyValidator> =
            Arc::new(RequiredCountFields::new(&["restrict", "modify"]));
        let started_at = Utc::now();

        let lookups = SERVICES.iter().map(|service| {
            let validator = Arc::clone(&validator);
            async move {
                let key = service.discover_key(target.kind);
                let body = json!({"type": target.kind, "id": &target.id, "caller_id": caller});
                let counts = match self
                    .engine
                    .build_send(&key, body)
                    .name(format!("discover {} for {}", service.id, target))
                    .timeout(self.discover_budget)
                    .validate(validator)
                    .submit()
                    .await
                {
                    Ok(ticket) => match ticket.outcome().await {
                        InterceptOutcome::Resolved(envelope) => {
                            DiscoveryCounts::from_reply(&envelope)
                        }
                        InterceptOutcome::Rejected { status, .. } => {
                            warn!(service = service.id, status, "Discovery rejected");
                            None
                        }
                        InterceptOutcome::Invalid { reason, .. } => {
                            warn!(service = service.id, %reason, "Discovery reply invalid");
                            None
                        }
                        InterceptOutcome::TimedOut => {
                            warn!(service = service.id, "Discovery timed out");
                            None
                        }
                    },
                    Err(err) => {
                        warn!(service = service.id, %err, "Discovery send failed");
                        None
                    }
                };
                (service.id, counts)
            }
        });

        let mut record = DiscoveryRecord {
            started_at: Some(started_at),
            ..Default::default()
        };
        for (service_id, counts) in join_all(lookups).await {
            record.responses.insert(service_id, counts);
        }
        record.finished_at = Some(Utc::now());
        record
    }

    /// Order every relevant service to drop its references, in parallel,
    /// and fold confirmations and failures into the pipeline record.
    async fn dispatch_deletes(
        &self,
        id: PipelineId,
        target: &EntityRef,
        caller: &str,
        relevant: Vec<&'static str>,
    ) -> DeleteOutcome {
        if let Some(mut record) = self.arena.get_mut(&id) {
            record.phase = PipelinePhase::Deleting;
            for &service in &relevant {
                record.actions.insert(service, ActionState::pending());
            }
        }

        let actions = relevant
            .iter()
            .filter_map(|&service_id| registry::service_by_id(service_id))
            .map(|service| async move {
                let key = service.cascade_key(target.kind);
                let body = json!({"type": target.kind, "id": &target.id, "caller_id": caller});
                let result = match self
                    .engine
                    .build_send(&key, body)
                    .name(format!("cascade {} for {}", service.id, target))
                    .timeout(self.action_budget)
                    .submit()
                    .await
                {
                    Ok(ticket) => match ticket.outcome().await {
                        InterceptOutcome::Resolved(_) => Ok(()),
                        InterceptOutcome::Rejected { status, .. } => {
                            Err(format!("delete rejected with status {status}"))
                        }
                        InterceptOutcome::Invalid { reason, .. } => Err(reason),
                        InterceptOutcome::TimedOut => {
                            Err("no delete confirmation before the budget lapsed".to_string())
                        }
                    },
                    Err(err) => Err(err.to_string()),
                };
                (service, result)
            });

        let mut any_failed = false;
        for (service, result) in join_all(actions).await {
            let Some(mut record) = self.arena.get_mut(&id) else {
                break;
            };
            let current = record
                .actions
                .get(service.id)
                .cloned()
                .unwrap_or_else(ActionState::pending);
            match result {
                Ok(()) => {
                    record.actions.insert(service.id, current.succeed());
                }
                Err(error) => {
                    any_failed = true;
                    warn!(
                        pipeline = %id,
                        service = service.id,
                        %error,
                        "Delete action failed; queued for retry"
                    );
                    let attempts = current.attempts() + 1;
                    let next_retry = self.outbox.next_retry_after(attempts);
                    let failed = current.fail(error, next_retry);
                    self.outbox.record(OutboxEntry {
                        pipeline: id,
                        target: target.clone(),
                        service: service.id,
                        routing_key: service.cascade_key(target.kind),
                        errors: failed.errors().to_vec(),
                        attempts,
                        next_retry,
                    });
                    record.actions.insert(service.id, failed);
                }
            }
        }

        let actions = match self.arena.get_mut(&id) {
            Some(mut record) => {
                record.phase = PipelinePhase::Done;
                record.actions.clone()
            }
            None => BTreeMap::new(),
        };
        let report = DeleteReport {
            pipeline: id,
            target: target.clone(),
            actions,
        };

        if any_failed {
            DeleteOutcome::PartiallyFailed { report }
        } else {
            info!(pipeline = %id, target = %target, "Delete pipeline completed");
            DeleteOutcome::Deleted { report }
        }
    }

    fn finish(&self, id: PipelineId) {
        if let Some(mut record) = self.arena.get_mut(&id) {
            record.phase = PipelinePhase::Done;
        }
    }
}
