//! Gateway error vocabulary.
//!
//! Downstream failure detail never leaks to HTTP clients verbatim; it is
//! flattened into the fixed envelope with one of the codes below.

/// Error codes carried in the HTTP envelope's `error.code` field.
pub mod codes {
    /// No reply arrived inside the request budget.
    pub const SERVICE_TIMEOUT: &str = "SERVICE_TIMEOUT";
    /// A downstream service replied with a failure status.
    pub const SERVICE_FAILURE: &str = "SERVICE_FAILURE";
    /// Delete refused: other entities still reference the target.
    pub const DEPENDENTS_PRESENT: &str = "DEPENDENTS_PRESENT";
    /// Delete aborted: not every service answered discovery.
    pub const DISCOVERY_INCOMPLETE: &str = "DISCOVERY_INCOMPLETE";
    /// Some per-service delete actions failed after discovery passed.
    pub const PARTIAL_DELETE: &str = "PARTIAL_DELETE";
    /// Some entries of a batch resolution could not be resolved.
    pub const PARTIAL_RESULT: &str = "PARTIAL_RESULT";
}

/// Fatal gateway-level errors. Per-message trouble never surfaces here;
/// it is logged and dropped at the engine.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration rejected before anything was started.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker wiring failed; the gateway must not serve half-configured.
    #[error("engine setup failed: {0}")]
    Setup(#[from] crate::engine::SetupError),

    /// An outgoing publish failed.
    #[error("send failed: {0}")]
    Send(#[from] crate::engine::SendError),

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    ShuttingDown,
}
