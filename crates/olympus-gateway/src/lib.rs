//! # Olympus Gateway
//!
//! Bridges synchronous HTTP callers to a fleet of backend services that
//! only speak asynchronous topic-routed messaging. Callers get exactly
//! one answer for every request, within a bounded time, no matter what
//! the fleet does.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      GATEWAY SERVICE                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  forward()          resolver()            delete_entity()    │
//! │     │                   │                       │            │
//! │     │          ┌────────┴────────┐     ┌────────┴────────┐   │
//! │     │          │  Entity Cache   │     │ Delete Pipeline │   │
//! │     │          │ (TTL + coalesce)│     │ (discover/act)  │   │
//! │     │          └────────┬────────┘     └────────┬────────┘   │
//! │     │                   │                       │            │
//! │  ┌──┴───────────────────┴───────────────────────┴────────┐   │
//! │  │               Correlation Engine                      │   │
//! │  │   pending table · reply pump · timeout sweep          │   │
//! │  └──────────────────────────┬────────────────────────────┘   │
//! └─────────────────────────────┼────────────────────────────────┘
//!                               │
//!                          message bus
//!                               │
//!      ┌──────────┬─────────┬──┴──────┬──────────┬──────────┐
//!      ▼          ▼         ▼         ▼          ▼          ▼
//!  user.hera  venue.    event.     ents.     entstate.   state.
//!             poseidon  dionysus   apollo    artemis     athena
//! ```
//!
//! # Guarantees
//!
//! - Every forwarded request resolves exactly once: with the mapped
//!   reply, or with a 504 once the sweep gives up on it.
//! - Replies are applied strictly in arrival order by a single pump.
//! - Late replies (after a timeout reclaimed the entry) are dropped.
//! - Correlation IDs are reused only after their entry is finished.
//!
//! # Usage
//!
//! ```ignore
//! use olympus_gateway::{GatewayConfig, GatewayService};
//!
//! let service = GatewayService::start(&broker, GatewayConfig::default()).await?;
//! let reply = service.forward("event.get", body).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod cascade;
pub mod domain;
pub mod engine;
pub mod resolve;
pub mod service;

// Re-exports for public API
pub use cascade::{DeleteManager, DeleteOutcome, DeleteReport, RetryOutbox};
pub use domain::config::{ConfigError, GatewayConfig};
pub use domain::entities::{EntityKind, EntityRef};
pub use domain::envelope::{GatewayReply, HttpEnvelope};
pub use domain::error::{codes, GatewayError};
pub use engine::{CorrelationEngine, InterceptOutcome, StatsSnapshot};
pub use resolve::{Batch, ResolveError, Resolver};
pub use service::GatewayService;

/// Crate version, reported in introspection output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
