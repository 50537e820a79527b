//! Typed reply validators.
//!
//! A validator attached to a pending entry is consulted before the entry
//! completes. For intercepts a failing verdict redirects the reply to the
//! reject outcome; for requests the reply is dropped and the entry stays
//! armed for the sweep.

use async_trait::async_trait;
use serde_json::Value;

/// Verdict on a raw reply envelope, awaited by the delivery pump.
#[async_trait]
pub trait ReplyValidator: Send + Sync {
    async fn validate(&self, reply: &Value) -> Result<(), ValidationError>;
}

/// A failing verdict.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid reply: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Requires every named field to be present and a non-negative integer.
///
/// Discovery replies are checked with
/// `RequiredCountFields::new(&["restrict", "modify"])`.
pub struct RequiredCountFields {
    fields: &'static [&'static str],
}

impl RequiredCountFields {
    #[must_use]
    pub const fn new(fields: &'static [&'static str]) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl ReplyValidator for RequiredCountFields {
    async fn validate(&self, reply: &Value) -> Result<(), ValidationError> {
        for field in self.fields {
            let present = reply.get(field).and_then(Value::as_u64).is_some();
            if !present {
                return Err(ValidationError::new(format!(
                    "field `{field}` missing or not a count"
                )));
            }
        }
        Ok(())
    }
}
