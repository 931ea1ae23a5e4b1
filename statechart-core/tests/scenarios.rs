//! The six concrete walkthroughs and the cross-cutting invariants: one
//! `Interpreter` per machine, driven directly (no `Orchestrator` — that has
//! its own test suite) so these tests exercise the transition algorithm
//! itself against JSON definitions close to how a user would author them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use statechart_core::registry::ActionGuardRegistry;
use statechart_core::{parse_definition, Capacity, Event, Interpreter, StatechartError, Value};
use tokio::sync::mpsc;

fn spawn(json: &str, registry: ActionGuardRegistry) -> Interpreter {
    let definition = Arc::new(parse_definition(json).expect("valid definition"));
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    Interpreter::spawn("m".to_string(), definition, Arc::new(registry), outbound_tx, Capacity::Unbounded, 64)
}

async fn send(interp: &Interpreter, name: &str) -> String {
    interp.send(Event::new(name, Value::Null)).await.expect("send succeeds")
}

// ---------------------------------------------------------------------
// Scenario 1: traffic light.
// ---------------------------------------------------------------------

const TRAFFIC_LIGHT: &str = r#"{
    "id": "light",
    "initial": "red",
    "states": {
        "red": { "on": { "TIMER": "yellow" } },
        "yellow": { "on": { "TIMER": "green" } },
        "green": { "on": { "TIMER": "red" } }
    }
}"#;

#[tokio::test]
async fn traffic_light_cycles_on_timer() {
    let interp = spawn(TRAFFIC_LIGHT, ActionGuardRegistry::new());
    assert_eq!(interp.start().await.unwrap(), "red");
    assert_eq!(send(&interp, "TIMER").await, "yellow");
    assert_eq!(send(&interp, "TIMER").await, "green");
    assert_eq!(send(&interp, "TIMER").await, "red");
}

// ---------------------------------------------------------------------
// Scenario 2: parallel robot — independent regions, simultaneous activity.
// ---------------------------------------------------------------------

const PARALLEL_ROBOT: &str = r#"{
    "id": "robot",
    "type": "parallel",
    "states": {
        "position": {
            "initial": "home",
            "states": {
                "home": { "on": { "MOVE": "away" } },
                "away": {}
            }
        },
        "hand": {
            "initial": "empty",
            "states": {
                "empty": { "on": { "GRAB": "holding" } },
                "holding": {}
            }
        }
    }
}"#;

#[tokio::test]
async fn parallel_regions_advance_independently() {
    let interp = spawn(PARALLEL_ROBOT, ActionGuardRegistry::new());
    let initial = interp.start().await.unwrap();
    assert!(initial.contains("position.home") && initial.contains("hand.empty"));

    let after_move = send(&interp, "MOVE").await;
    assert!(after_move.contains("position.away"), "{after_move}");
    assert!(after_move.contains("hand.empty"), "{after_move}");

    let after_grab = send(&interp, "GRAB").await;
    assert!(after_grab.contains("position.away"), "{after_grab}");
    assert!(after_grab.contains("hand.holding"), "{after_grab}");
}

// ---------------------------------------------------------------------
// Scenario 3: shallow history.
// ---------------------------------------------------------------------

const SHALLOW_HISTORY: &str = r#"{
    "id": "m",
    "initial": "A",
    "states": {
        "A": {
            "initial": "A1",
            "states": {
                "A1": { "on": { "TO_A2": "A2" } },
                "A2": {},
                "hist": { "type": "history", "history": "shallow" }
            },
            "on": { "TO_B": "B" }
        },
        "B": { "on": { "TO_A_HIST": "A.hist" } }
    }
}"#;

#[tokio::test]
async fn shallow_history_restores_the_remembered_child() {
    let interp = spawn(SHALLOW_HISTORY, ActionGuardRegistry::new());
    assert_eq!(interp.start().await.unwrap(), "A.A1");
    assert_eq!(send(&interp, "TO_A2").await, "A.A2");
    assert_eq!(send(&interp, "TO_B").await, "B");
    // Shallow history remembered A2, not A's declared initial A1.
    assert_eq!(send(&interp, "TO_A_HIST").await, "A.A2");
}

const SHALLOW_HISTORY_WITH_DEFAULT: &str = r#"{
    "id": "m",
    "initial": "B",
    "states": {
        "A": {
            "initial": "A1",
            "states": {
                "A1": {},
                "A2": {},
                "hist": { "type": "history", "history": "shallow", "target": "A2" }
            }
        },
        "B": { "on": { "TO_A_HIST": "A.hist" } }
    }
}"#;

const SHALLOW_HISTORY_NO_DEFAULT: &str = r#"{
    "id": "m",
    "initial": "B",
    "states": {
        "A": {
            "initial": "A1",
            "states": {
                "A1": {},
                "A2": {},
                "hist": { "type": "history", "history": "shallow" }
            }
        },
        "B": { "on": { "TO_A_HIST": "A.hist" } }
    }
}"#;

#[tokio::test]
async fn empty_history_falls_back_to_declared_default_else_initial_child() {
    let with_default = spawn(SHALLOW_HISTORY_WITH_DEFAULT, ActionGuardRegistry::new());
    with_default.start().await.unwrap();
    assert_eq!(send(&with_default, "TO_A_HIST").await, "A.A2");

    let without_default = spawn(SHALLOW_HISTORY_NO_DEFAULT, ActionGuardRegistry::new());
    without_default.start().await.unwrap();
    assert_eq!(send(&without_default, "TO_A_HIST").await, "A.A1");
}

// ---------------------------------------------------------------------
// Scenario 4: deep history.
// ---------------------------------------------------------------------

const DEEP_HISTORY: &str = r#"{
    "id": "m",
    "initial": "A",
    "states": {
        "A": {
            "initial": "A1",
            "states": {
                "A1": {
                    "initial": "A1a",
                    "states": {
                        "A1a": { "on": { "TO_A1b": "A1b" } },
                        "A1b": {}
                    }
                },
                "hist": { "type": "history", "history": "deep" }
            },
            "on": { "TO_B": "B" }
        },
        "B": { "on": { "TO_A_HIST": "A.hist" } }
    }
}"#;

#[tokio::test]
async fn deep_history_restores_the_full_remembered_subtree() {
    let interp = spawn(DEEP_HISTORY, ActionGuardRegistry::new());
    assert_eq!(interp.start().await.unwrap(), "A.A1.A1a");
    assert_eq!(send(&interp, "TO_A1b").await, "A.A1.A1b");
    assert_eq!(send(&interp, "TO_B").await, "B");
    assert_eq!(send(&interp, "TO_A_HIST").await, "A.A1.A1b");
}

// ---------------------------------------------------------------------
// Scenario 5: delayed transition restarts on re-entry.
// ---------------------------------------------------------------------

const DELAYED_REENTRY: &str = r#"{
    "id": "m",
    "initial": "idle",
    "states": {
        "idle": { "on": { "START": "processing" } },
        "processing": {
            "after": { "200": "done" },
            "on": { "BUMP": "processing" }
        },
        "done": {}
    }
}"#;

#[tokio::test]
async fn delayed_transition_restarts_its_clock_on_external_self_transition() {
    let interp = spawn(DELAYED_REENTRY, ActionGuardRegistry::new());
    interp.start().await.unwrap();
    assert_eq!(send(&interp, "START").await, "processing");

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Re-enters "processing" as an external self-transition; the `after`
    // timer armed at START must be cancelled and rearmed from here, not
    // left running toward its original 200ms deadline.
    assert_eq!(send(&interp, "BUMP").await, "processing");

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "processing");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "done");
}

#[tokio::test]
async fn delayed_transition_fires_once_if_never_reentered() {
    let interp = spawn(DELAYED_REENTRY, ActionGuardRegistry::new());
    interp.start().await.unwrap();
    send(&interp, "START").await;

    tokio::time::sleep(Duration::from_millis(260)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "done");

    // No further transitions are scheduled from "done"; waiting longer
    // must not move the machine again.
    tokio::time::sleep(Duration::from_millis(260)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "done");
}

#[tokio::test]
async fn delayed_transition_does_not_fire_if_state_is_exited_first() {
    const SWITCH_AWAY: &str = r#"{
        "id": "m",
        "initial": "idle",
        "states": {
            "idle": { "on": { "START": "processing" } },
            "processing": {
                "after": { "200": "done" },
                "on": { "ABORT": "aborted" }
            },
            "aborted": {},
            "done": {}
        }
    }"#;
    let interp = spawn(SWITCH_AWAY, ActionGuardRegistry::new());
    interp.start().await.unwrap();
    send(&interp, "START").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(send(&interp, "ABORT").await, "aborted");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "aborted");
}

// ---------------------------------------------------------------------
// Scenario 6: a child's null transition overrides the parent's handler.
// ---------------------------------------------------------------------

const NULL_OVERRIDE: &str = r#"{
    "id": "m",
    "initial": "outer",
    "states": {
        "outer": {
            "on": { "SHARED": { "target": "outer", "internal": true, "actions": ["parentHandler"] } },
            "initial": "child1",
            "states": {
                "child1": {
                    "initial": "idle",
                    "states": {
                        "idle": { "on": { "SHARED": null } }
                    }
                }
            }
        }
    }
}"#;

#[tokio::test]
async fn child_null_transition_suppresses_the_parent_handler() {
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_clone = invoked.clone();
    let registry = ActionGuardRegistry::new().with_action("parentHandler", move |_ctx, _event| {
        invoked_clone.store(true, Ordering::SeqCst);
        Ok(())
    });
    let interp = spawn(NULL_OVERRIDE, registry);
    let initial = interp.start().await.unwrap();
    assert_eq!(initial, "outer.child1.idle");

    let after = send(&interp, "SHARED").await;
    assert_eq!(after, "outer.child1.idle");
    assert!(!invoked.load(Ordering::SeqCst), "parent handler must not run when a closer frame claims the event");
}

// ---------------------------------------------------------------------
// Cross-cutting invariants.
// ---------------------------------------------------------------------

#[tokio::test]
async fn start_stop_start_returns_to_the_same_initial_configuration() {
    let interp = spawn(SHALLOW_HISTORY, ActionGuardRegistry::new());
    let first = interp.start().await.unwrap();
    assert_eq!(send(&interp, "TO_A2").await, "A.A2");

    interp.stop().await;
    assert!(interp.query_snapshot().await.is_err(), "a stopped machine rejects queries");

    let second = interp.start().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn repeated_start_while_running_is_idempotent() {
    let interp = spawn(TRAFFIC_LIGHT, ActionGuardRegistry::new());
    let first = interp.start().await.unwrap();
    let second = interp.start().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, "red");
}

#[tokio::test]
async fn shared_ancestor_internal_transition_runs_once_not_once_per_active_region() {
    const SHARED_PARALLEL_ANCESTOR: &str = r#"{
        "id": "m",
        "initial": "outer",
        "states": {
            "outer": {
                "on": { "PING": { "target": "outer", "internal": true, "actions": ["tick"] } },
                "initial": "par",
                "states": {
                    "par": {
                        "type": "parallel",
                        "states": {
                            "r1": { "initial": "a", "states": { "a": {} } },
                            "r2": { "initial": "a", "states": { "a": {} } }
                        }
                    }
                }
            }
        }
    }"#;
    let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let ticks_clone = ticks.clone();
    let registry = ActionGuardRegistry::new().with_action("tick", move |_ctx, _event| {
        ticks_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let interp = spawn(SHARED_PARALLEL_ANCESTOR, registry);
    let initial = interp.start().await.unwrap();
    assert!(initial.contains("r1.a") && initial.contains("r2.a"), "{initial}");

    // Both active leaves (r1.a and r2.a) climb through the same "outer"
    // frame to find PING; the shared frame's action must run exactly once,
    // not once per region that happened to reach it.
    send(&interp, "PING").await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_with_timeout_gives_up_waiting_but_the_event_still_completes() {
    const SLOW: &str = r#"{
        "id": "m",
        "initial": "a",
        "states": {
            "a": { "on": { "GO": { "target": "b", "actions": ["slow"] } } },
            "b": {}
        }
    }"#;
    let registry = ActionGuardRegistry::new().with_action("slow", |_ctx, _event| {
        std::thread::sleep(Duration::from_millis(150));
        Ok(())
    });
    let interp = spawn(SLOW, registry);
    interp.start().await.unwrap();

    let result = interp.send_with_timeout(Event::new("GO", Value::Null), Duration::from_millis(20)).await;
    assert!(matches!(result, Err(StatechartError::Timeout)), "{result:?}");

    // The caller gave up, but the command had already reached the mailbox;
    // the machine still finishes the transition on its own task.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(interp.query_snapshot().await.unwrap().state_string, "b");
}

#[tokio::test]
async fn forbidden_transition_with_failing_guard_falls_through_to_no_transition() {
    const GUARDED: &str = r#"{
        "id": "m",
        "initial": "a",
        "states": {
            "a": { "on": { "GO": [ { "target": "b", "guard": "never" }, null ] } },
            "b": {}
        }
    }"#;
    let registry = ActionGuardRegistry::new().with_guard("never", |_ctx, _event| false);
    let interp = spawn(GUARDED, registry);
    interp.start().await.unwrap();
    // Guard fails on the first descriptor; the second (null) is reached
    // and suppresses handling. The event is still fully processed.
    assert_eq!(send(&interp, "GO").await, "a");
}
