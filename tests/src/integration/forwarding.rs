//! Request/reply bridging through the gateway: success and failure
//! mapping, forced timeouts, late replies, and correlation ID reuse.

#[cfg(test)]
mod tests {
    use crate::support::{start_gateway, test_config, FakeService, ServiceReply};
    use olympus_bus::InMemoryBroker;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn forwarded_request_reaches_the_service_and_maps_onto_ok() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let events = FakeService::spawn(&broker, "event-service", &["event.*"], |_, request| {
            assert_eq!(request["filter"], json!("today"));
            Some(ServiceReply::rows(json!([{"id": "ev1"}, {"id": "ev2"}])))
        })
        .await;

        let reply = gateway
            .forward("event.get", json!({"filter": "today"}))
            .await
            .expect("gateway accepts work");

        assert_eq!(reply.http_status, 200);
        let body = reply.body();
        assert_eq!(body["status"], json!("OK"));
        assert_eq!(body["result"], json!([{"id": "ev1"}, {"id": "ev2"}]));
        assert_eq!(events.count("event.get"), 1);
        assert_eq!(gateway.stats().completed, 1);
    }

    #[tokio::test]
    async fn service_failures_map_onto_wire_status_or_502() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let _fleet = FakeService::spawn(&broker, "fleet", &["*.get"], |key, _| {
            Some(match key {
                "event.get" => ServiceReply::failed(404, "no such event"),
                _ => ServiceReply::failed(999, "kernel on fire"),
            })
        })
        .await;

        let not_found = gateway
            .forward("event.get", json!({}))
            .await
            .expect("gateway accepts work");
        assert_eq!(not_found.http_status, 404);
        let body = not_found.body();
        assert_eq!(body["status"], json!("FAILED"));
        assert_eq!(body["error"]["code"], json!("SERVICE_FAILURE"));
        assert_eq!(body["error"]["message"], json!("no such event"));

        // A wire status outside the HTTP range cannot pass through as-is.
        let exotic = gateway
            .forward("venue.get", json!({}))
            .await
            .expect("gateway accepts work");
        assert_eq!(exotic.http_status, 502);
        assert_eq!(exotic.body()["error"]["message"], json!("kernel on fire"));
    }

    #[tokio::test]
    async fn unanswered_request_resolves_with_the_fixed_504() {
        let broker = InMemoryBroker::new();
        let mut config = test_config();
        config.budgets.request = Duration::from_millis(50);
        let gateway = start_gateway(&broker, config).await;
        // Nothing is bound; the request reaches no queue at all.

        let reply = gateway
            .forward("event.get", json!({}))
            .await
            .expect("gateway accepts work");

        assert_eq!(reply.http_status, 504);
        let body = reply.body();
        assert_eq!(body["status"], json!("FAILED"));
        assert_eq!(body["error"]["code"], json!("SERVICE_TIMEOUT"));
        assert_eq!(
            body["error"]["message"],
            json!("upstream service did not reply in time")
        );
        assert_eq!(gateway.stats().timed_out, 1);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_arriving_after_the_sweep_is_dropped() {
        let broker = InMemoryBroker::new();
        let mut config = test_config();
        config.budgets.request = Duration::from_millis(50);
        let gateway = start_gateway(&broker, config).await;
        let _slow = FakeService::spawn(&broker, "slow-service", &["state.*"], |_, _| {
            Some(ServiceReply::rows(json!([])).after(Duration::from_millis(150)))
        })
        .await;

        let reply = gateway
            .forward("state.get", json!({}))
            .await
            .expect("gateway accepts work");
        assert_eq!(reply.http_status, 504);

        // Give the held-back reply time to arrive at the pump.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = gateway.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn correlation_ids_are_reused_once_entries_finish() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;

        let ids: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let _users = FakeService::spawn(&broker, "user-service", &["user.*"], {
            let ids = Arc::clone(&ids);
            move |_, request: &Value| {
                ids.lock().push(request["msg_id"].as_u64().unwrap());
                Some(ServiceReply::rows(json!([{"id": "u1"}])))
            }
        })
        .await;

        for _ in 0..3 {
            let reply = gateway
                .forward("user.get", json!({"id": "u1"}))
                .await
                .expect("gateway accepts work");
            assert_eq!(reply.http_status, 200);
        }

        // Each entry finished before the next began, so the allocator
        // kept handing out the same ID.
        assert_eq!(*ids.lock(), vec![1, 1, 1]);
    }
}
