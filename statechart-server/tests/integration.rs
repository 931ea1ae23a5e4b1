//! Integration tests: exercise the orchestrator exactly as `main.rs`'s REPL
//! does — register machines from JSON, drive them through the bus, read
//! snapshots back, shut everything down cleanly.

use std::sync::Arc;

use statechart_core::mailbox::Capacity;
use statechart_core::orchestrator::{Orchestrator, RegisterPolicy};
use statechart_core::registry::ActionGuardRegistry;
use statechart_core::{parse_definition, Event, Value};

const TRAFFIC_LIGHT: &str = r#"{
    "id": "light",
    "initial": "red",
    "states": {
        "red": { "on": { "NEXT": { "target": "green" } } },
        "green": { "on": { "NEXT": { "target": "yellow" } } },
        "yellow": { "on": { "NEXT": { "target": "red" } } }
    }
}"#;

const RELAY: &str = r#"{
    "id": "relay",
    "initial": "idle",
    "states": {
        "idle": { "on": { "FORWARD": { "target": "armed" } } },
        "armed": {
            "entry": ["forward_to_light"],
            "on": { "NEXT": { "target": "idle" } }
        }
    }
}"#;

#[tokio::test]
async fn full_lifecycle_through_orchestrator() {
    let orchestrator = Orchestrator::new();
    let registry = Arc::new(ActionGuardRegistry::new());

    let light_def = Arc::new(parse_definition(TRAFFIC_LIGHT).unwrap());
    let light = orchestrator
        .register("light", light_def, registry.clone(), RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
        .await
        .unwrap();
    assert_eq!(light.start().await.unwrap(), "red");

    orchestrator.publish("light", Event::new("NEXT", Value::Null)).await.unwrap();
    // publish is fire-and-forget; give the mailbox a tick to process it.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(light.query_snapshot().await.unwrap().state_string, "green");

    let same_id_rejected = orchestrator
        .register("light", Arc::new(parse_definition(TRAFFIC_LIGHT).unwrap()), registry.clone(), RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
        .await;
    assert!(same_id_rejected.is_err());

    orchestrator.shutdown_all().await;
    assert!(light.query_snapshot().await.is_err());
}

#[tokio::test]
async fn request_send_routes_through_orchestrator_without_cyclic_references() {
    let orchestrator = Orchestrator::new();
    let registry = Arc::new(
        ActionGuardRegistry::new().with_action("forward_to_light", |ctx, _event| {
            ctx.request_send("light", "NEXT", Value::Null);
            Ok(())
        }),
    );

    let light_def = Arc::new(parse_definition(TRAFFIC_LIGHT).unwrap());
    let light = orchestrator
        .register("light", light_def, Arc::new(ActionGuardRegistry::new()), RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
        .await
        .unwrap();
    light.start().await.unwrap();

    let relay_def = Arc::new(parse_definition(RELAY).unwrap());
    let relay = orchestrator
        .register("relay", relay_def, registry, RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
        .await
        .unwrap();
    relay.start().await.unwrap();

    relay.send(Event::new("FORWARD", Value::Null)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(light.query_snapshot().await.unwrap().state_string, "green");

    orchestrator.shutdown_all().await;
}

#[tokio::test]
async fn append_isolation_suffix_avoids_collision() {
    let orchestrator = Orchestrator::new();
    let registry = Arc::new(ActionGuardRegistry::new());
    let def = Arc::new(parse_definition(TRAFFIC_LIGHT).unwrap());

    let first = orchestrator
        .register("light", def.clone(), registry.clone(), RegisterPolicy::AppendIsolationSuffix, Capacity::Unbounded, 16)
        .await
        .unwrap();
    let second = orchestrator
        .register("light", def, registry, RegisterPolicy::AppendIsolationSuffix, Capacity::Unbounded, 16)
        .await
        .unwrap();

    assert_ne!(first.id(), second.id());
    orchestrator.shutdown_all().await;
}
