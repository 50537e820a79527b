//! Wire and HTTP envelope conventions.
//!
//! Every broker payload carries a numeric `msg_id` and `status`; status
//! [`STATUS_OK`] is the success sentinel and every other value is failure.
//! Toward the HTTP layer the gateway speaks a fixed envelope:
//! `{status: "OK"|"FAILED"|"PARTIAL", result: [...] | error: {code, message}}`.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::codes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Wire status value meaning success; everything else is failure.
pub const STATUS_OK: i64 = 200;

/// Wire status stamped into outgoing requests.
pub const STATUS_OUTGOING: i64 = 0;

/// The two numeric fields every broker payload must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub msg_id: u64,
    pub status: i64,
}

impl WireHeader {
    /// Peel the header off a parsed delivery. `None` when the payload is
    /// not an object or either field is missing or non-numeric; such
    /// deliveries are dropped, not failed.
    #[must_use]
    pub fn peel(payload: &Value) -> Option<Self> {
        let obj = payload.as_object()?;
        let msg_id = obj.get("msg_id")?.as_u64()?;
        let status = obj.get("status")?.as_i64()?;
        Some(Self { msg_id, status })
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self.status == STATUS_OK
    }
}

/// Stamp correlation fields into an outgoing body.
///
/// The body should be a JSON object; anything else is carried under a
/// `data` key so the header always survives. Pre-existing `msg_id`,
/// `status`, and `reply_to` fields are overwritten.
#[must_use]
pub fn stamped(body: Value, id: CorrelationId, reply_to: &str) -> Value {
    let mut map = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert("msg_id".to_string(), json!(id.as_u64()));
    map.insert("status".to_string(), json!(STATUS_OUTGOING));
    map.insert("reply_to".to_string(), json!(reply_to));
    Value::Object(map)
}

/// Envelope status toward HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Ok,
    Failed,
    Partial,
}

/// Error half of a failed or partial envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Fixed response envelope handed to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEnvelope {
    pub status: EnvelopeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl HttpEnvelope {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            status: EnvelopeStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Failed,
            result: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    #[must_use]
    pub fn partial(result: Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Partial,
            result: Some(result),
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Final outcome for one HTTP call: a status code and the envelope body.
///
/// The HTTP layer is an external collaborator; this is the whole contract
/// it needs from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReply {
    pub http_status: u16,
    pub envelope: HttpEnvelope,
}

impl GatewayReply {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            http_status: 200,
            envelope: HttpEnvelope::ok(result),
        }
    }

    #[must_use]
    pub fn failed(http_status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            envelope: HttpEnvelope::failed(code, message),
        }
    }

    /// The fixed gateway-timeout reply: HTTP 504, code `SERVICE_TIMEOUT`.
    #[must_use]
    pub fn timeout() -> Self {
        Self::failed(
            504,
            codes::SERVICE_TIMEOUT,
            "upstream service did not reply in time",
        )
    }

    #[must_use]
    pub fn partial(result: Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            http_status: 200,
            envelope: HttpEnvelope::partial(result, code, message),
        }
    }

    /// Envelope serialized for the wire.
    #[must_use]
    pub fn body(&self) -> Value {
        serde_json::to_value(&self.envelope).unwrap_or(Value::Null)
    }
}
