//! Cascading deletes through the gateway: discovery fan-out across the
//! fleet, refusal paths, targeted cascades, and the retry outbox.

#[cfg(test)]
mod tests {
    use crate::support::{discovery_reply, spawn_fleet, start_gateway, test_config, ServiceReply};
    use chrono::Utc;
    use olympus_bus::InMemoryBroker;
    use olympus_gateway::cascade::SERVICES;
    use olympus_gateway::{DeleteOutcome, EntityKind, EntityRef};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[tokio::test]
    async fn cascade_reaches_only_services_holding_modify_references() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;

        let cascade_requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let fleet = spawn_fleet(&broker, {
            let cascade_requests = Arc::clone(&cascade_requests);
            move |service, key, request| {
                if key.ends_with(".discover.venue") {
                    let modify = if service.id == "event.dionysus" { 2 } else { 0 };
                    Some(discovery_reply(0, modify))
                } else if key.ends_with(".cascade.venue") {
                    cascade_requests.lock().push(request.clone());
                    Some(ServiceReply::ok(json!({})))
                } else {
                    None
                }
            }
        })
        .await;

        let outcome = gateway
            .delete_entity(EntityRef::new(EntityKind::Venue, "v1"), "u1")
            .await
            .expect("gateway accepts work");

        let report = match outcome {
            DeleteOutcome::Deleted { report } => report,
            other => panic!("expected a clean delete, got {other:?}"),
        };
        assert_eq!(report.actions.len(), 1);
        assert!(report.actions["event.dionysus"].succeeded());
        assert_eq!(report.actions["event.dionysus"].attempts(), 1);

        // Every service was asked; exactly one was told to act.
        for service in &SERVICES {
            let key = format!("{}.discover.venue", service.prefix);
            assert_eq!(fleet.service(service.id).count(&key), 1);
        }
        assert_eq!(fleet.count_matching(|key| key.contains(".cascade.")), 1);
        assert_eq!(fleet.service("event.dionysus").count("event.cascade.venue"), 1);

        // The cascade order names the target and the caller.
        let orders = cascade_requests.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["type"], json!("venue"));
        assert_eq!(orders[0]["id"], json!("v1"));
        assert_eq!(orders[0]["caller_id"], json!("u1"));

        let reply = DeleteOutcome::Deleted { report }.into_reply();
        assert_eq!(reply.http_status, 200);
        assert_eq!(reply.body()["status"], json!("OK"));
        assert!(gateway.outbox().is_empty());
    }

    #[tokio::test]
    async fn restricting_references_refuse_the_whole_delete() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let fleet = spawn_fleet(&broker, |service, key, _request| {
            if !key.ends_with(".discover.venue") {
                return None;
            }
            Some(match service.id {
                "state.athena" => discovery_reply(1, 0),
                "event.dionysus" => discovery_reply(0, 5),
                _ => discovery_reply(0, 0),
            })
        })
        .await;

        let outcome = gateway
            .delete_entity(EntityRef::new(EntityKind::Venue, "v1"), "u1")
            .await
            .expect("gateway accepts work");

        match &outcome {
            DeleteOutcome::Restricted { dependents } => {
                assert_eq!(dependents.len(), 1);
                assert_eq!(dependents[0].service, "state.athena");
                assert_eq!(dependents[0].restrict, 1);
            }
            other => panic!("expected a refusal, got {other:?}"),
        }
        // One restriction anywhere blocks everything, modify holders
        // included: no cascade order leaves the gateway.
        assert_eq!(fleet.count_matching(|key| key.contains(".cascade.")), 0);

        let reply = outcome.into_reply();
        assert_eq!(reply.http_status, 409);
        let body = reply.body();
        assert_eq!(body["status"], json!("FAILED"));
        assert_eq!(body["error"]["code"], json!("DEPENDENTS_PRESENT"));
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("state.athena"), "got: {message}");
    }

    #[tokio::test]
    async fn unanswered_or_garbled_discovery_aborts_the_pipeline() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let fleet = spawn_fleet(&broker, |service, key, _request| {
            if !key.ends_with(".discover.ents") {
                return None;
            }
            match service.id {
                // Stays silent; its discovery slot never fills.
                "entstate.artemis" => None,
                // Answers, but not with usable counts.
                "user.hera" => Some(ServiceReply::ok(json!({"restrict": "many", "modify": 1}))),
                _ => Some(discovery_reply(0, 1)),
            }
        })
        .await;

        let outcome = gateway
            .delete_entity(EntityRef::new(EntityKind::Ents, "a1"), "u1")
            .await
            .expect("gateway accepts work");

        match &outcome {
            DeleteOutcome::DiscoveryIncomplete { missing } => {
                assert_eq!(missing, &["entstate.artemis", "user.hera"]);
            }
            other => panic!("expected an abort, got {other:?}"),
        }
        // Four services volunteered modify references; none may act while
        // the record has holes.
        assert_eq!(fleet.count_matching(|key| key.contains(".cascade.")), 0);

        let reply = outcome.into_reply();
        assert_eq!(reply.http_status, 502);
        let body = reply.body();
        assert_eq!(body["error"]["code"], json!("DISCOVERY_INCOMPLETE"));
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("entstate.artemis"), "got: {message}");
    }

    #[tokio::test]
    async fn unconfirmed_deletes_are_parked_for_retry() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let _fleet = spawn_fleet(&broker, |service, key, _request| {
            if key.ends_with(".discover.user") {
                let holds = matches!(service.id, "venue.poseidon" | "state.athena");
                return Some(discovery_reply(0, u64::from(holds)));
            }
            match key {
                "venue.cascade.user" => Some(ServiceReply::ok(json!({}))),
                "state.cascade.user" => Some(ServiceReply::failed(500, "db busy")),
                _ => None,
            }
        })
        .await;

        let outcome = gateway
            .delete_entity(EntityRef::new(EntityKind::User, "u7"), "admin")
            .await
            .expect("gateway accepts work");

        let report = match outcome {
            DeleteOutcome::PartiallyFailed { report } => report,
            other => panic!("expected a partial failure, got {other:?}"),
        };
        assert!(report.actions["venue.poseidon"].succeeded());
        assert!(!report.actions["state.athena"].succeeded());
        assert_eq!(report.actions["state.athena"].attempts(), 1);

        let queued = gateway.outbox().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].service, "state.athena");
        assert_eq!(queued[0].routing_key, "state.cascade.user");
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[0].errors, ["delete rejected with status 500"]);
        assert!(queued[0].next_retry > Utc::now());

        // Test backoff is milliseconds, so the entry comes due almost
        // immediately and a re-drive can pick it up.
        let due_by = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(gateway.outbox().drain_due(due_by).len(), 1);
        assert!(gateway.outbox().is_empty());

        let reply = DeleteOutcome::PartiallyFailed { report }.into_reply();
        assert_eq!(reply.http_status, 200);
        let body = reply.body();
        assert_eq!(body["status"], json!("PARTIAL"));
        assert_eq!(body["error"]["code"], json!("PARTIAL_DELETE"));
    }

    #[tokio::test]
    async fn unreferenced_targets_delete_without_any_cascade() {
        let broker = InMemoryBroker::new();
        let gateway = start_gateway(&broker, test_config()).await;
        let fleet = spawn_fleet(&broker, |_service, key, _request| {
            key.ends_with(".discover.state").then(|| discovery_reply(0, 0))
        })
        .await;

        let outcome = gateway
            .delete_entity(EntityRef::new(EntityKind::State, "s9"), "admin")
            .await
            .expect("gateway accepts work");

        let report = match outcome {
            DeleteOutcome::Deleted { report } => report,
            other => panic!("expected a clean delete, got {other:?}"),
        };
        assert!(report.actions.is_empty());
        assert_eq!(fleet.count_matching(|key| key.contains(".cascade.")), 0);
    }
}
