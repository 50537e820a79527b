//! Shared test rig: scripted fake services over the in-memory broker,
//! reply builders, and a gateway configuration with budgets small enough
//! to exercise timeouts in real time.

use bytes::Bytes;
use olympus_bus::{BusChannel, InMemoryBroker, QueueOptions};
use olympus_gateway::cascade::{ServiceDescriptor, SERVICES};
use olympus_gateway::{GatewayConfig, GatewayService};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Exchange names matching the default wiring.
pub const REQUESTS: &str = "gw.requests";
pub const REPLIES: &str = "gw.replies";

/// Route test logs through the capture writer. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Gateway configuration with millisecond budgets so timeout and TTL
/// paths run inside a test, not a quarter hour.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.budgets.request = Duration::from_millis(120);
    config.budgets.intercept = Duration::from_millis(120);
    config.budgets.sweep_interval = Duration::from_millis(10);
    config.cache.ttl = Duration::from_millis(60);
    config.cache.flight_ttl = Duration::from_millis(500);
    config.cache.waiter_ttl = Duration::from_millis(500);
    config.delete.discover_budget = Duration::from_millis(60);
    config.delete.action_budget = Duration::from_millis(60);
    config.delete.retry_backoff_base = Duration::from_millis(50);
    config.delete.retry_backoff_cap = Duration::from_millis(400);
    config
}

pub async fn start_gateway(broker: &InMemoryBroker, config: GatewayConfig) -> GatewayService {
    init_tracing();
    GatewayService::start(broker, config)
        .await
        .expect("gateway must start against a fresh broker")
}

/// What a fake service sends back for one request.
pub struct ServiceReply {
    pub status: i64,
    pub body: Value,
    pub delay: Duration,
}

impl ServiceReply {
    /// Success reply with an arbitrary body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            delay: Duration::ZERO,
        }
    }

    /// Success reply carrying a CRUD `result` array.
    pub fn rows(rows: Value) -> Self {
        Self::ok(json!({ "result": rows }))
    }

    /// Failure reply with a wire status and an error message.
    pub fn failed(status: i64, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": { "message": message } }),
            delay: Duration::ZERO,
        }
    }

    /// Hold the reply back for `delay` before publishing it.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Discovery answer: how many restricting and modifiable references the
/// service holds against the target.
pub fn discovery_reply(restrict: u64, modify: u64) -> ServiceReply {
    ServiceReply::ok(json!({ "restrict": restrict, "modify": modify }))
}

type Handler = dyn Fn(&str, &Value) -> Option<ServiceReply> + Send + Sync;

/// A scripted backend service. Consumes a named queue bound to the
/// requests exchange, counts everything it sees per routing key, and
/// answers whatever the handler scripts (`None` stays silent).
pub struct FakeService {
    seen: Arc<Mutex<BTreeMap<String, u64>>>,
    task: JoinHandle<()>,
}

impl FakeService {
    /// Bind a fake under `name` to the given topic patterns and start
    /// serving. The queue is bound before this returns, so requests
    /// published afterwards cannot be lost.
    pub async fn spawn<H>(
        broker: &InMemoryBroker,
        name: &str,
        patterns: &[&str],
        handler: H,
    ) -> Self
    where
        H: Fn(&str, &Value) -> Option<ServiceReply> + Send + Sync + 'static,
    {
        let channel = broker.channel();
        let queue = channel
            .declare_queue(QueueOptions::named(name))
            .await
            .expect("queue");
        for pattern in patterns {
            channel
                .bind_queue(&queue, REQUESTS, pattern)
                .await
                .expect("binding");
        }
        let mut deliveries = channel.consume(&queue).await.expect("consumer");

        let seen: Arc<Mutex<BTreeMap<String, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let task = tokio::spawn({
            let seen = Arc::clone(&seen);
            async move {
                while let Some(delivery) = deliveries.recv().await {
                    let Ok(request) = serde_json::from_slice::<Value>(&delivery.payload) else {
                        continue;
                    };
                    *seen
                        .lock()
                        .entry(delivery.routing_key.clone())
                        .or_insert(0) += 1;

                    // Fire-and-forget messages carry no reply queue.
                    let Some(reply_to) = request["reply_to"].as_str().map(str::to_string) else {
                        continue;
                    };
                    let Some(reply) = handler(&delivery.routing_key, &request) else {
                        continue;
                    };
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }

                    let mut body = reply.body;
                    if !body.is_object() {
                        body = json!({ "data": body });
                    }
                    if let Some(map) = body.as_object_mut() {
                        map.insert("msg_id".to_string(), request["msg_id"].clone());
                        map.insert("status".to_string(), json!(reply.status));
                    }
                    let payload = Bytes::from(serde_json::to_vec(&body).expect("reply encodes"));
                    let _ = channel.publish(REPLIES, &reply_to, payload).await;
                }
            }
        });

        Self { seen, task }
    }

    /// Requests seen for one exact routing key.
    pub fn count(&self, routing_key: &str) -> u64 {
        self.seen.lock().get(routing_key).copied().unwrap_or(0)
    }

    /// Requests seen across all routing keys.
    pub fn total(&self) -> u64 {
        self.seen.lock().values().sum()
    }

    /// Requests seen for routing keys passing the filter.
    pub fn count_matching(&self, filter: impl Fn(&str) -> bool) -> u64 {
        self.seen
            .lock()
            .iter()
            .filter(|(key, _)| filter(key))
            .map(|(_, hits)| hits)
            .sum()
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Every backend service, played by one scripted fake each.
pub struct Fleet {
    fakes: Vec<FakeService>,
}

/// Spawn one fake per fleet service, each bound to `{prefix}.#` so it
/// receives lookups, discovery probes, and cascade orders alike. The
/// script sees which service it is playing alongside the routing key
/// and request body; `None` stays silent.
pub async fn spawn_fleet<S>(broker: &InMemoryBroker, script: S) -> Fleet
where
    S: Fn(&ServiceDescriptor, &str, &Value) -> Option<ServiceReply> + Send + Sync + 'static,
{
    let script = Arc::new(script);
    let mut fakes = Vec::with_capacity(SERVICES.len());
    for service in SERVICES {
        let script = Arc::clone(&script);
        let pattern = format!("{}.#", service.prefix);
        let fake = FakeService::spawn(broker, service.id, &[pattern.as_str()], move |key, request| {
            script(&service, key, request)
        })
        .await;
        fakes.push(fake);
    }
    Fleet { fakes }
}

impl Fleet {
    /// The fake playing the service with this ID.
    pub fn service(&self, service_id: &str) -> &FakeService {
        let position = SERVICES
            .iter()
            .position(|service| service.id == service_id)
            .unwrap_or_else(|| panic!("no such service: {service_id}"));
        &self.fakes[position]
    }

    /// Requests seen fleet-wide for routing keys passing the filter.
    pub fn count_matching(&self, filter: impl Fn(&str) -> bool + Copy) -> u64 {
        self.fakes.iter().map(|fake| fake.count_matching(filter)).sum()
    }
}
