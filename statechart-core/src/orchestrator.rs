//! The event bus: the only legitimate path for inter-machine communication.
//! A single `Inner` struct behind one `tokio::sync::RwLock` holds the whole
//! machine registry, the same shape a small in-memory store takes when it
//! wraps one lock around one piece of shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{Result, StatechartError};
use crate::event::Event;
use crate::interpreter::{Interpreter, OutboundSink};
use crate::mailbox::Capacity;
use crate::model::Definition;
use crate::registry::ActionGuardRegistry;
use crate::snapshot::Value;
use crate::topic::topic_matches;

/// What happens when `register` is called with an id already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterPolicy {
    RejectDuplicate,
    /// Appends a `-<uuid>` suffix to the requested id so concurrent test
    /// runs never collide.
    AppendIsolationSuffix,
}

struct Inner {
    machines: HashMap<String, Interpreter>,
    /// Registration order, for `broadcast` and `shutdown_all`.
    order: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type SubscriberFn = Arc<dyn Fn(&str, &Event) + Send + Sync>;

#[derive(Clone)]
enum SubscriptionKind {
    All,
    Machine(String),
    /// Matched against the target machine id as a slash-delimited topic.
    Topic(String),
}

#[derive(Clone)]
struct Subscription {
    token: SubscriptionToken,
    kind: SubscriptionKind,
    handler: SubscriberFn,
}

/// Registry-and-router for events between named machines. Cheap to clone —
/// every field is an `Arc` or an `mpsc::Sender` — so the background pump
/// task below holds its own copy rather than a reference.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<RwLock<Inner>>,
    subscriptions: Arc<RwLock<Arc<Vec<Subscription>>>>,
    next_sub_id: Arc<AtomicU64>,
    outbound_tx: OutboundSink,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Builds the bus and spawns the task that drains every registered
    /// machine's `request_send` outbox and re-publishes it. An `Interpreter`
    /// only ever holds the sender half of this channel, never a reference
    /// back to the `Orchestrator` itself, which is what keeps action
    /// closures from ever calling back into a machine synchronously.
    pub fn new() -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(String, Event)>();
        let orchestrator = Self {
            inner: Arc::new(RwLock::new(Inner { machines: HashMap::new(), order: Vec::new() })),
            subscriptions: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            next_sub_id: Arc::new(AtomicU64::new(0)),
            outbound_tx,
        };
        let pump = orchestrator.clone();
        tokio::spawn(async move {
            while let Some((target_id, event)) = outbound_rx.recv().await {
                if let Err(err) = pump.publish(&target_id, event).await {
                    tracing::warn!(target = %target_id, %err, "request_send targeted an unregistered machine");
                }
            }
        });
        orchestrator
    }

    /// Spawns and registers a new machine. Returns the caller's handle onto
    /// it, which also serves as the registration's "token" — there is
    /// nothing more to look up it with beyond the id it was actually
    /// registered under (which may differ from the requested one under
    /// `AppendIsolationSuffix`; read it back from `Interpreter::id`).
    pub async fn register(
        &self,
        id: impl Into<String>,
        definition: Arc<Definition>,
        registry: Arc<ActionGuardRegistry>,
        policy: RegisterPolicy,
        mailbox_capacity: Capacity,
        diagnostics_capacity: usize,
    ) -> Result<Interpreter> {
        let mut id = id.into();
        let mut inner = self.inner.write().await;
        if inner.machines.contains_key(&id) {
            match policy {
                RegisterPolicy::RejectDuplicate => return Err(StatechartError::DuplicateId { id }),
                RegisterPolicy::AppendIsolationSuffix => {
                    id = format!("{id}-{}", Uuid::new_v4());
                }
            }
        }
        let interpreter = Interpreter::spawn(id.clone(), definition, registry, self.outbound_tx.clone(), mailbox_capacity, diagnostics_capacity);
        inner.order.push(id.clone());
        inner.machines.insert(id, interpreter.clone());
        Ok(interpreter)
    }

    /// Returns a clone of the handle registered under `id`, if any. Lets a
    /// caller drive an `Interpreter`'s request/reply verbs (`send`,
    /// `query_snapshot`) directly once it knows the id is live, without the
    /// `Orchestrator` needing a bespoke forwarding method for each of them.
    pub async fn interpreter(&self, id: &str) -> Option<Interpreter> {
        self.inner.read().await.machines.get(id).cloned()
    }

    /// Stops the machine, removes it from the registry, and invalidates its
    /// id for future `publish`/`broadcast` targeting. A no-op if the id is
    /// not currently registered.
    pub async fn unregister(&self, id: &str) {
        let interpreter = {
            let mut inner = self.inner.write().await;
            inner.order.retain(|existing| existing != id);
            inner.machines.remove(id)
        };
        if let Some(interpreter) = interpreter {
            interpreter.stop().await;
        }
    }

    /// Stops every registered machine, in registration order, and waits for
    /// each to finish draining its current transition.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.read().await.order.clone();
        for id in ids {
            self.unregister(&id).await;
        }
    }

    /// Enqueues `event` on `target_id`'s mailbox (fire-and-forget — the
    /// caller's own `send`/`await` pairing for a reply, if any, is a
    /// separate concern handled directly against the `Interpreter` handle)
    /// and notifies any matching subscribers.
    pub async fn publish(&self, target_id: &str, event: Event) -> Result<()> {
        let interpreter = {
            let inner = self.inner.read().await;
            inner.machines.get(target_id).cloned()
        };
        let Some(interpreter) = interpreter else {
            return Err(StatechartError::UnknownTarget { id: target_id.to_string() });
        };
        interpreter.send_fire_and_forget(event.clone())?;
        self.notify_subscribers(target_id, &event).await;
        Ok(())
    }

    /// Publishes `event_name`/`payload` to every registered machine in
    /// registration order. Returns how many machines actually accepted the
    /// send (a bounded mailbox under `Reject` can turn this below the total
    /// registered count).
    pub async fn broadcast(&self, event_name: impl Into<String>, payload: Value) -> usize {
        let targets: Vec<(String, Interpreter)> = {
            let inner = self.inner.read().await;
            inner.order.iter().filter_map(|id| inner.machines.get(id).map(|interp| (id.clone(), interp.clone()))).collect()
        };
        let event_name = event_name.into();
        let mut delivered = 0usize;
        for (id, interpreter) in targets {
            let event = Event::new(event_name.clone(), payload.clone());
            if interpreter.send_fire_and_forget(event.clone()).is_ok() {
                delivered += 1;
                self.notify_subscribers(&id, &event).await;
            }
        }
        delivered
    }

    /// Calls `handler(target_id, event)` for every publish/broadcast to any
    /// machine.
    pub async fn subscribe_all<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.push_subscription(SubscriptionKind::All, Arc::new(handler)).await
    }

    /// Calls `handler(target_id, event)` only for publishes/broadcasts
    /// addressed to `id`.
    pub async fn subscribe_machine<F>(&self, id: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.push_subscription(SubscriptionKind::Machine(id.into()), Arc::new(handler)).await
    }

    /// Calls `handler(target_id, event)` whenever the target id matches
    /// `pattern` under the `+`/`#` topic grammar (target ids are treated as
    /// slash-delimited topics, e.g. registering `"robot/arm"` lets a
    /// subscriber match `"robot/#"`).
    pub async fn subscribe_topic<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.push_subscription(SubscriptionKind::Topic(pattern.into()), Arc::new(handler)).await
    }

    /// Cancels a subscription. A no-op if already cancelled.
    pub async fn unsubscribe(&self, token: SubscriptionToken) {
        let mut guard = self.subscriptions.write().await;
        let next: Vec<Subscription> = guard.iter().filter(|sub| sub.token != token).cloned().collect();
        *guard = Arc::new(next);
    }

    async fn push_subscription(&self, kind: SubscriptionKind, handler: SubscriberFn) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_sub_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.subscriptions.write().await;
        let mut next = (**guard).clone();
        next.push(Subscription { token, kind, handler });
        *guard = Arc::new(next);
        token
    }

    async fn notify_subscribers(&self, target_id: &str, event: &Event) {
        let subs = self.subscriptions.read().await.clone();
        for sub in subs.iter() {
            let matches = match &sub.kind {
                SubscriptionKind::All => true,
                SubscriptionKind::Machine(id) => id == target_id,
                SubscriptionKind::Topic(pattern) => topic_matches(pattern, target_id),
            };
            if matches {
                (sub.handler)(target_id, event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_definition;

    fn traffic_light_definition() -> Arc<Definition> {
        let json = serde_json::json!({
            "id": "light",
            "initial": "red",
            "states": {
                "red": { "on": { "NEXT": { "target": "green" } } },
                "green": { "on": { "NEXT": { "target": "red" } } }
            }
        });
        Arc::new(parse_definition(&json.to_string()).unwrap())
    }

    #[tokio::test]
    async fn duplicate_registration_rejected_by_default() {
        let orchestrator = Orchestrator::new();
        let def = traffic_light_definition();
        let registry = Arc::new(ActionGuardRegistry::new());
        orchestrator
            .register("light", def.clone(), registry.clone(), RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
            .await
            .unwrap();
        let err = orchestrator
            .register("light", def, registry, RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16)
            .await
            .unwrap_err();
        assert!(matches!(err, StatechartError::DuplicateId { .. }));
    }

    #[tokio::test]
    async fn publish_to_unknown_id_fails_fast() {
        let orchestrator = Orchestrator::new();
        let err = orchestrator.publish("nope", Event::new("NEXT", Value::Null)).await.unwrap_err();
        assert!(matches!(err, StatechartError::UnknownTarget { .. }));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_machine() {
        let orchestrator = Orchestrator::new();
        let def = traffic_light_definition();
        let registry = Arc::new(ActionGuardRegistry::new());
        let a = orchestrator.register("a", def.clone(), registry.clone(), RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16).await.unwrap();
        let b = orchestrator.register("b", def, registry, RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        let delivered = orchestrator.broadcast("NEXT", Value::Null).await;
        assert_eq!(delivered, 2);
        assert_eq!(a.query_snapshot().await.unwrap().state_string, "green");
        assert_eq!(b.query_snapshot().await.unwrap().state_string, "green");
        orchestrator.shutdown_all().await;
    }

    #[tokio::test]
    async fn topic_subscription_matches_target_id() {
        let orchestrator = Orchestrator::new();
        let def = traffic_light_definition();
        let registry = Arc::new(ActionGuardRegistry::new());
        let robot = orchestrator.register("robot/arm", def, registry, RegisterPolicy::RejectDuplicate, Capacity::Unbounded, 16).await.unwrap();
        robot.start().await.unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        orchestrator.subscribe_topic("robot/#", move |_id, _event| {
            seen_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }).await;
        orchestrator.publish("robot/arm", Event::new("NEXT", Value::Null)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
