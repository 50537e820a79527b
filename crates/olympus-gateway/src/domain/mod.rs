//! Domain types for the gateway.
//!
//! Core vocabulary shared by every component: correlation IDs, entity
//! kinds, wire/HTTP envelopes, configuration, and error codes. The
//! correlation table itself lives in the engine.

pub mod config;
pub mod correlation;
pub mod entities;
pub mod envelope;
pub mod error;

// Re-exports for convenience
pub use config::{ConfigError, GatewayConfig};
pub use correlation::{CorrelationId, IdAllocator};
pub use entities::{EntityKind, EntityRef};
pub use envelope::{
    EnvelopeStatus, ErrorBody, GatewayReply, HttpEnvelope, WireHeader, STATUS_OK, STATUS_OUTGOING,
};
pub use error::{codes, GatewayError};
