use crate::snapshot::Value;

/// A deferred outbound send recorded by an action closure. Forwarded to the
/// Orchestrator only after the transition that produced it commits (step 9
/// of the transition algorithm) — never dispatched synchronously.
#[derive(Debug, Clone)]
pub struct RequestSend {
    pub target_id: String,
    pub event_name: String,
    pub payload: Value,
}

/// Read-only view of a machine's context flags, handed to guard predicates.
/// Guards must be pure: no outbox, no mutation.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    flags: Vec<(String, Value)>,
}

impl ContextSnapshot {
    pub fn new(flags: Vec<(String, Value)>) -> Self {
        Self { flags }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.flags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn as_slice(&self) -> &[(String, Value)] {
        &self.flags
    }
}

/// The mutable argument passed to action closures. Owns the machine's own
/// context flags and the per-transition outbox; actions may not see or touch
/// another machine's state directly.
#[derive(Debug, Default)]
pub struct OrchestratedContext {
    flags: Vec<(String, Value)>,
    outbox: Vec<RequestSend>,
}

impl OrchestratedContext {
    pub fn new(flags: Vec<(String, Value)>) -> Self {
        Self { flags, outbox: Vec::new() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(slot) = self.flags.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.flags.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.flags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Schedules an outbound event. Does not dispatch it — appended to this
    /// transition's outbox, drained by the interpreter after commit.
    pub fn request_send(&mut self, target_id: impl Into<String>, event_name: impl Into<String>, payload: Value) {
        self.outbox.push(RequestSend { target_id: target_id.into(), event_name: event_name.into(), payload });
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::new(self.flags.clone())
    }

    pub fn flags(&self) -> &[(String, Value)] {
        &self.flags
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<RequestSend> {
        std::mem::take(&mut self.outbox)
    }
}
