use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{ContextSnapshot, OrchestratedContext};
use crate::event::Event;

/// A pure, fast predicate gating a transition. Invoked through
/// `std::panic::catch_unwind` by the interpreter so a throwing guard is
/// treated as `false` rather than aborting the transition.
pub type GuardFn = Arc<dyn Fn(&ContextSnapshot, &Event) -> bool + Send + Sync>;

/// An effectful closure run on entry, exit, or during a transition. May
/// mutate its machine's own context and call `request_send`; must not block.
pub type ActionFn = Arc<dyn Fn(&mut OrchestratedContext, &Event) -> Result<(), String> + Send + Sync>;

/// Per-machine table of named guards and actions, resolved by exact,
/// case-sensitive name. Missing names surface as `UnknownHandler` at
/// `start()`, mirroring how unresolved VM opcodes are rejected before a
/// process instance is allowed to run.
#[derive(Default, Clone)]
pub struct ActionGuardRegistry {
    guards: HashMap<String, GuardFn>,
    actions: HashMap<String, ActionFn>,
}

impl ActionGuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(mut self, name: impl Into<String>, f: impl Fn(&ContextSnapshot, &Event) -> bool + Send + Sync + 'static) -> Self {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    pub fn with_action(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut OrchestratedContext, &Event) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn guard(&self, name: &str) -> Option<&GuardFn> {
        self.guards.get(name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn has_guard(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

impl std::fmt::Debug for ActionGuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGuardRegistry")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}
