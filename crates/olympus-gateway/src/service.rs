//! # Gateway Service
//!
//! Owns everything with a lifetime: the correlation engine, the reply
//! pump and sweep tasks, the resolver, and the delete manager. The HTTP
//! layer is an external collaborator; it holds a [`GatewayService`] and
//! calls [`forward`](GatewayService::forward),
//! [`delete_entity`](GatewayService::delete_entity) and the
//! [`resolver`](GatewayService::resolver).

use crate::cascade::{DeleteManager, DeleteOutcome, RetryBackoff, RetryOutbox};
use crate::domain::config::GatewayConfig;
use crate::domain::entities::EntityRef;
use crate::domain::envelope::GatewayReply;
use crate::domain::error::GatewayError;
use crate::engine::{sweep_task, CorrelationEngine, StatsSnapshot};
use crate::resolve::Resolver;
use olympus_bus::Broker;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// The running gateway.
pub struct GatewayService {
    config: GatewayConfig,
    engine: Arc<CorrelationEngine>,
    resolver: Arc<Resolver>,
    deletes: Arc<DeleteManager>,
    outbox: Arc<RetryOutbox>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl GatewayService {
    /// Validate the configuration, wire the engine to the broker, and
    /// spawn the reply pump and sweep tasks.
    pub async fn start(broker: &dyn Broker, config: GatewayConfig) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|err| GatewayError::Config(err.to_string()))?;

        let (engine, pump) = CorrelationEngine::connect(broker, &config).await?;
        let engine = Arc::new(engine);
        let tasks = vec![
            tokio::spawn(pump.run()),
            tokio::spawn(sweep_task(
                engine.table_handle(),
                config.budgets.sweep_interval,
            )),
        ];

        let resolver = Arc::new(Resolver::new(Arc::clone(&engine), &config.cache));
        let outbox = Arc::new(RetryOutbox::new(RetryBackoff {
            base: config.delete.retry_backoff_base,
            cap: config.delete.retry_backoff_cap,
        }));
        let deletes = Arc::new(DeleteManager::new(
            Arc::clone(&engine),
            Arc::clone(&outbox),
            &config.delete,
        ));

        info!(
            version = crate::VERSION,
            reply_queue = engine.reply_queue(),
            "Gateway service started"
        );
        Ok(Self {
            config,
            engine,
            resolver,
            deletes,
            outbox,
            tasks: Mutex::new(tasks),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Forward one HTTP request to the fleet and wait for the mapped
    /// reply. Always resolves within the request budget: unanswered
    /// requests come back as the fixed 504.
    pub async fn forward(
        &self,
        routing_key: &str,
        body: Value,
    ) -> Result<GatewayReply, GatewayError> {
        self.check_running()?;
        let ticket = self.engine.send_request(routing_key, body, None).await?;
        Ok(ticket.reply().await)
    }

    /// Run a cascading delete pipeline for one target.
    pub async fn delete_entity(
        &self,
        target: EntityRef,
        caller: &str,
    ) -> Result<DeleteOutcome, GatewayError> {
        self.check_running()?;
        Ok(self.deletes.delete_entity(target, caller).await)
    }

    /// Entity resolver. Lookups only complete while the service is
    /// running; after [`shutdown`](Self::shutdown) they time out.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    #[must_use]
    pub fn outbox(&self) -> &RetryOutbox {
        &self.outbox
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }

    /// One JSON document describing the whole runtime state, for
    /// diagnostics endpoints and tests.
    #[must_use]
    pub fn introspect(&self) -> Value {
        json!({
            "version": crate::VERSION,
            "reply_queue": self.engine.reply_queue(),
            "pending": self.pending_count(),
            "stats": self.stats(),
            "cache_entries": self.resolver.cached_count(),
            "outbox": {
                "queued": self.outbox.len(),
                "entries": self.outbox.snapshot(),
            },
            "pipelines": {
                "active": self.deletes.active_count(),
                "records": self.deletes.pipelines(),
            },
        })
    }

    /// Stop accepting work and abort the background tasks. Waiters still
    /// pending resolve with the fixed timeout reply. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Gateway service stopped");
    }

    fn check_running(&self) -> Result<(), GatewayError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for GatewayService {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
