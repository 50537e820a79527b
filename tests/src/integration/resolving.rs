//! Entity resolution through the gateway: reference hydration across
//! services, TTL caching, coalesced concurrent lookups, and batch
//! shortfalls.

#[cfg(test)]
mod tests {
    use crate::support::{spawn_fleet, start_gateway, test_config, FakeService, ServiceReply};
    use futures::future::join_all;
    use olympus_bus::InMemoryBroker;
    use olympus_gateway::{EntityKind, ResolveError};
    use parking_lot::Mutex;
    use rand::Rng;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn venue_resolution_pulls_in_the_owning_user() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;

        let user_requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let _venues = FakeService::spawn(&broker, "venue-service", &["venue.*"], |_, request| {
            Some(ServiceReply::rows(json!([{
                "id": request["id"],
                "name": "Dockside",
                "user_id": "u9",
            }])))
        })
        .await;
        let users = FakeService::spawn(&broker, "user-service", &["user.*"], {
            let user_requests = Arc::clone(&user_requests);
            move |_, request| {
                user_requests.lock().push(request.clone());
                Some(ServiceReply::rows(json!([{"id": "u9", "name": "Hera"}])))
            }
        })
        .await;

        let venue = gateway
            .resolver()
            .resolve_venue("v1", "caller-7")
            .await
            .expect("venue resolves");

        assert_eq!(venue["id"], json!("v1"));
        assert_eq!(venue["user"], json!({"id": "u9", "name": "Hera"}));
        assert!(venue.get("user_id").is_none());
        assert_eq!(users.count("user.get"), 1);

        // The caller's identity travels with every upstream lookup.
        let seen = user_requests.lock();
        assert_eq!(seen[0]["id"], json!("u9"));
        assert_eq!(seen[0]["caller_id"], json!("caller-7"));
    }

    #[tokio::test]
    async fn event_resolution_hydrates_the_whole_reference_tree() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let fleet = spawn_fleet(&broker, |service, key, request| {
            if !key.ends_with(".get") {
                return None;
            }
            let id = request["id"].as_str().unwrap_or("").to_string();
            Some(match service.prefix {
                "event" => ServiceReply::rows(json!([{
                    "id": id,
                    "name": "Solstice",
                    "venue_ids": ["v1", "v2"],
                    "ents_id": "a1",
                    "entstate_id": "es1",
                    "state_id": "s1",
                }])),
                "venue" => ServiceReply::rows(json!([{"id": id, "user_id": "u1"}])),
                "user" => ServiceReply::rows(json!([{"id": id, "name": "Hera"}])),
                "ents" => ServiceReply::rows(json!([{"id": id, "user_id": "u1"}])),
                _ => ServiceReply::rows(json!([{"id": id, "review": "approved"}])),
            })
        })
        .await;

        let event = gateway
            .resolver()
            .resolve_event("e1", "caller-7")
            .await
            .expect("event resolves");

        assert_eq!(event["venues"].as_array().map(Vec::len), Some(2));
        assert_eq!(event["venues"][0]["id"], json!("v1"));
        assert_eq!(event["venues"][0]["user"]["name"], json!("Hera"));
        assert_eq!(event["venues"][1]["user"]["name"], json!("Hera"));
        assert_eq!(event["ents"]["user"]["id"], json!("u1"));
        assert_eq!(event["entstate"]["id"], json!("es1"));
        assert_eq!(event["state"]["id"], json!("s1"));
        for leftover in ["venue_ids", "ents_id", "entstate_id", "state_id"] {
            assert!(event.get(leftover).is_none(), "{leftover} must be replaced");
        }

        // Both venues and the act share one owner; the cache collapses
        // those into a single user lookup.
        assert_eq!(fleet.service("user.hera").count("user.get"), 1);
        assert_eq!(fleet.service("venue.poseidon").count("venue.get"), 2);
    }

    #[tokio::test]
    async fn vanished_references_are_dropped_or_nulled() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let _fleet = spawn_fleet(&broker, |service, key, request| {
            if !key.ends_with(".get") {
                return None;
            }
            let id = request["id"].as_str().unwrap_or("").to_string();
            if id.starts_with("gone-") {
                return Some(ServiceReply::rows(json!([])));
            }
            Some(match service.prefix {
                "event" => ServiceReply::rows(json!([{
                    "id": id,
                    "venue_ids": ["v1", "gone-v2"],
                    "state_id": "gone-s1",
                }])),
                _ => ServiceReply::rows(json!([{"id": id}])),
            })
        })
        .await;

        let event = gateway
            .resolver()
            .resolve_event("e1", "caller-7")
            .await
            .expect("event resolves");

        // The vanished venue is dropped; the vanished state pins an
        // explicit null so the caller can tell it was looked up.
        assert_eq!(event["venues"], json!([{"id": "v1"}]));
        assert_eq!(event["state"], json!(null));
        assert!(event.get("state_id").is_none());
        assert!(event.get("ents").is_none());
    }

    #[tokio::test]
    async fn malformed_results_reject_the_lookup() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let _users = FakeService::spawn(&broker, "user-service", &["user.*"], |_, request| {
            Some(match request["id"].as_str().unwrap_or("") {
                "twins" => ServiceReply::rows(json!([{"id": "a"}, {"id": "b"}])),
                "shapeless" => ServiceReply::ok(json!({"result": {"id": "u1"}})),
                "ghost" => ServiceReply::rows(json!([])),
                _ => ServiceReply::failed(500, "backing store offline"),
            })
        })
        .await;
        let resolver = gateway.resolver();

        let err = resolver.resolve_user("twins", "c").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Result had too many or too few elements, expected 1 got 2"
        );

        let err = resolver.resolve_user("shapeless", "c").await.unwrap_err();
        assert_eq!(err.to_string(), "Result was not an array");

        let err = resolver.resolve_user("ghost", "c").await.unwrap_err();
        assert!(err.is_not_found());

        let err = resolver.resolve_user("u1", "c").await.unwrap_err();
        assert!(matches!(err, ResolveError::Failed { status: 500, .. }));
    }

    #[tokio::test]
    async fn lookups_inside_the_ttl_skip_the_bus() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let states = FakeService::spawn(&broker, "state-service", &["state.*"], |_, request| {
            Some(ServiceReply::rows(json!([{"id": request["id"]}])))
        })
        .await;
        let resolver = gateway.resolver();

        let first = resolver.resolve_state("s1", "c").await.expect("resolves");
        let second = resolver.resolve_state("s1", "c").await.expect("resolves");
        assert_eq!(first, second);
        assert_eq!(states.count("state.get"), 1);

        // Past the TTL the cached value is stale and the bus is asked again.
        tokio::time::sleep(Duration::from_millis(90)).await;
        resolver.resolve_state("s1", "c").await.expect("resolves");
        assert_eq!(states.count("state.get"), 2);
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce_into_one_fetch() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let users = FakeService::spawn(&broker, "user-service", &["user.*"], |_, request| {
            let jitter = rand::thread_rng().gen_range(10..25);
            Some(
                ServiceReply::rows(json!([{"id": request["id"], "name": "Hera"}]))
                    .after(Duration::from_millis(jitter)),
            )
        })
        .await;
        let resolver = gateway.resolver();

        let results = join_all((0..4).map(|_| resolver.resolve_user("u1", "c"))).await;

        for result in results {
            let user = result.expect("every caller resolves");
            assert_eq!(user["name"], json!("Hera"));
        }
        assert_eq!(users.count("user.get"), 1);
    }

    #[tokio::test]
    async fn batch_resolution_reports_missing_ids_as_partial() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let events = FakeService::spawn(&broker, "event-service", &["event.*"], |_, request| {
            Some(match request["id"].as_str().unwrap_or("") {
                "gone-e2" => ServiceReply::rows(json!([])),
                id => ServiceReply::rows(json!([{"id": id}])),
            })
        })
        .await;
        let ids = vec![
            "e1".to_string(),
            "gone-e2".to_string(),
            "e1".to_string(), // duplicate, answered from the cache
        ];

        let batch = gateway
            .resolver()
            .resolve_batch(EntityKind::Event, &ids, "c")
            .await
            .expect("batch resolves");

        assert!(batch.is_partial());
        assert_eq!(batch.entities, vec![json!({"id": "e1"})]);
        assert_eq!(batch.missing, vec!["gone-e2".to_string()]);
        assert_eq!(events.count("event.get"), 2);

        let reply = batch.into_reply();
        assert_eq!(reply.http_status, 200);
        let body = reply.body();
        assert_eq!(body["status"], json!("PARTIAL"));
        assert_eq!(body["result"], json!([{"id": "e1"}]));
        assert_eq!(body["error"]["code"], json!("PARTIAL_RESULT"));
        assert_eq!(body["error"]["message"], json!("entities not found: gone-e2"));
    }

    #[tokio::test]
    async fn typed_resolution_applies_the_middleware_first() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let _users = FakeService::spawn(&broker, "user-service", &["user.*"], |_, request| {
            Some(ServiceReply::rows(json!([{
                "id": request["id"],
                "name": "Hera",
                "email": "hera@olympus.example",
            }])))
        })
        .await;
        let resolver = gateway.resolver();

        let user: BTreeMap<String, Value> = resolver
            .resolve_as(EntityKind::User, "u1", "c")
            .await
            .expect("record deserializes");
        assert_eq!(user["name"], json!("Hera"));

        // The middleware runs before deserialization, so fields it strips
        // never reach the caller's type.
        let trimmed: Value = resolver
            .resolve_with(EntityKind::User, "u2", "c", |mut value| {
                if let Some(map) = value.as_object_mut() {
                    map.remove("email");
                }
                value
            })
            .await
            .expect("middleware output deserializes");
        assert_eq!(trimmed["id"], json!("u2"));
        assert!(trimmed.get("email").is_none());
    }
}
