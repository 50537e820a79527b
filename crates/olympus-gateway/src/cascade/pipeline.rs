//! Delete-pipeline records and the pure decision step.
//!
//! Discovery collects per-service reference counts for the target; the
//! decision is a pure function of that record. Only `modify` references
//! make a service relevant to the delete phase; a single `restrict`
//! reference anywhere refuses the whole pipeline.

use crate::domain::entities::EntityRef;
use crate::domain::envelope::GatewayReply;
use crate::domain::error::codes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Identifier of one delete pipeline, unique per gateway process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PipelineId(pub u64);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference counts one service reported for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoveryCounts {
    /// References that forbid deleting the target.
    pub restrict: u64,
    /// References the service would remove alongside the target.
    pub modify: u64,
}

impl DiscoveryCounts {
    /// Read the counts out of a validated discovery reply.
    #[must_use]
    pub fn from_reply(reply: &Value) -> Option<Self> {
        Some(Self {
            restrict: reply.get("restrict")?.as_u64()?,
            modify: reply.get("modify")?.as_u64()?,
        })
    }
}

/// Discovery phase of one pipeline: a slot per service, `None` until
/// (unless) that service answers usably.
#[derive(Debug, Default, Serialize)]
pub struct DiscoveryRecord {
    pub responses: BTreeMap<&'static str, Option<DiscoveryCounts>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A service holding references that block the delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependent {
    pub service: &'static str,
    pub restrict: u64,
}

/// Verdict of the discovery phase.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteDecision {
    /// At least one service never answered; nothing may be deleted.
    Incomplete { missing: Vec<&'static str> },
    /// Restricting references exist; the delete is refused.
    Restricted { dependents: Vec<Dependent> },
    /// Safe to proceed; only `relevant` services hold anything to remove.
    Proceed { relevant: Vec<&'static str> },
}

/// Decide what a discovery record allows. Completeness is checked before
/// restrictions: an unanswered service could be hiding a restriction, so
/// its silence refuses the pipeline outright.
#[must_use]
pub fn decide(record: &DiscoveryRecord) -> DeleteDecision {
    let missing: Vec<&'static str> = record
        .responses
        .iter()
        .filter(|(_, counts)| counts.is_none())
        .map(|(&service, _)| service)
        .collect();
    if !missing.is_empty() {
        return DeleteDecision::Incomplete { missing };
    }

    let dependents: Vec<Dependent> = record
        .responses
        .iter()
        .filter_map(|(&service, counts)| {
            let counts = counts.as_ref()?;
            (counts.restrict > 0).then(|| Dependent {
                service,
                restrict: counts.restrict,
            })
        })
        .collect();
    if !dependents.is_empty() {
        return DeleteDecision::Restricted { dependents };
    }

    let relevant = record
        .responses
        .iter()
        .filter_map(|(&service, counts)| counts.filter(|c| c.modify > 0).map(|_| service))
        .collect();
    DeleteDecision::Proceed { relevant }
}

/// Per-service progress of the delete phase.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActionState {
    Pending {
        attempts: u32,
    },
    Failed {
        errors: Vec<String>,
        next_retry: DateTime<Utc>,
        attempts: u32,
    },
    Succeeded {
        completed_at: DateTime<Utc>,
        attempts: u32,
    },
}

impl ActionState {
    #[must_use]
    pub fn pending() -> Self {
        ActionState::Pending { attempts: 0 }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            ActionState::Pending { attempts }
            | ActionState::Failed { attempts, .. }
            | ActionState::Succeeded { attempts, .. } => *attempts,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self, ActionState::Succeeded { .. })
    }

    /// Errors accumulated across failed attempts.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        match self {
            ActionState::Failed { errors, .. } => errors,
            _ => &[],
        }
    }

    /// The next attempt confirmed.
    #[must_use]
    pub fn succeed(&self) -> Self {
        ActionState::Succeeded {
            completed_at: Utc::now(),
            attempts: self.attempts() + 1,
        }
    }

    /// The next attempt failed; the error is appended to the history.
    #[must_use]
    pub fn fail(&self, error: impl Into<String>, next_retry: DateTime<Utc>) -> Self {
        let mut errors = self.errors().to_vec();
        errors.push(error.into());
        ActionState::Failed {
            errors,
            next_retry,
            attempts: self.attempts() + 1,
        }
    }
}

/// Doubling backoff for failed delete actions.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryBackoff {
    /// Delay before the next attempt, given how many have failed so far:
    /// `base` after the first failure, doubling per failure, capped.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << doublings).min(self.cap)
    }
}

/// Where a pipeline currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Discovering,
    Deleting,
    Done,
}

/// Arena record for one delete pipeline.
#[derive(Debug, Serialize)]
pub struct PipelineRecord {
    pub id: PipelineId,
    pub target: EntityRef,
    pub caller: String,
    pub phase: PipelinePhase,
    pub discovery: DiscoveryRecord,
    pub actions: BTreeMap<&'static str, ActionState>,
    pub started_at: DateTime<Utc>,
}

/// Final state of one pipeline, as reported to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub pipeline: PipelineId,
    pub target: EntityRef,
    pub actions: BTreeMap<&'static str, ActionState>,
}

/// Caller-visible outcome of a delete.
#[derive(Debug)]
pub enum DeleteOutcome {
    /// Every relevant service confirmed.
    Deleted { report: DeleteReport },
    /// Restricting references exist; nothing was deleted.
    Restricted { dependents: Vec<Dependent> },
    /// Discovery never completed; nothing was deleted.
    DiscoveryIncomplete { missing: Vec<&'static str> },
    /// Some services confirmed, some did not; failed actions are queued
    /// for retry.
    PartiallyFailed { report: DeleteReport },
}

impl DeleteOutcome {
    /// Envelope for the HTTP layer.
    #[must_use]
    pub fn into_reply(self) -> GatewayReply {
        match self {
            DeleteOutcome::Deleted { report } => {
                GatewayReply::ok(json!([report_value(&report)]))
            }
            DeleteOutcome::Restricted { dependents } => {
                let held_by: Vec<String> = dependents
                    .iter()
                    .map(|d| format!("{} ({})", d.service, d.restrict))
                    .collect();
                GatewayReply::failed(
                    409,
                    codes::DEPENDENTS_PRESENT,
                    format!("deletion blocked by: {}", held_by.join(", ")),
                )
            }
            DeleteOutcome::DiscoveryIncomplete { missing } => GatewayReply::failed(
                502,
                codes::DISCOVERY_INCOMPLETE,
                format!("no discovery reply from: {}", missing.join(", ")),
            ),
            DeleteOutcome::PartiallyFailed { report } => GatewayReply::partial(
                json!([report_value(&report)]),
                codes::PARTIAL_DELETE,
                "some services have not confirmed; retries are queued",
            ),
        }
    }
}

fn report_value(report: &DeleteReport) -> Value {
    serde_json::to_value(report).unwrap_or(Value::Null)
}
