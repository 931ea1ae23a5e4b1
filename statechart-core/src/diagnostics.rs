use std::collections::VecDeque;

/// Non-fatal events worth surfacing to an operator without failing the
/// transition that produced them: a throwing/missing guard (treated as
/// `false` and skipped) or a forbidden transition that consumed an event
/// without changing configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    GuardFailed { state: String, event: String, guard: String },
    GuardPanicked { state: String, event: String, guard: String },
    TransitionSuppressed { state: String, event: String },
}

/// Bounded append-only ring, in-memory only — no cross-restart durability,
/// just enough history for an operator to see what recently went wrong.
#[derive(Debug, Clone)]
pub struct DiagnosticRing {
    capacity: usize,
    entries: VecDeque<Diagnostic>,
}

impl DiagnosticRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: VecDeque::new() }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(diagnostic);
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for DiagnosticRing {
    fn default() -> Self {
        Self::new(256)
    }
}
