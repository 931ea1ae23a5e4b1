use std::collections::HashMap;

use crate::model::NodeId;

/// What was remembered for one compound ancestor that owns a history child.
#[derive(Debug, Clone)]
pub enum HistoryRecord {
    /// The direct child of the ancestor that was active; normal initial-child
    /// descent resumes from there.
    Shallow(NodeId),
    /// The full set of active leaves within the ancestor's subtree at the
    /// moment of exit.
    Deep(Vec<NodeId>),
}

/// Per-interpreter table of remembered configurations, keyed by the compound
/// ancestor that owns the history pseudo-state. Empty until the first exit;
/// cleared on `stop`.
#[derive(Debug, Default, Clone)]
pub struct HistoryMemory {
    records: HashMap<NodeId, HistoryRecord>,
}

impl HistoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_shallow(&mut self, ancestor: NodeId, direct_child: NodeId) {
        self.records.insert(ancestor, HistoryRecord::Shallow(direct_child));
    }

    pub fn record_deep(&mut self, ancestor: NodeId, leaves: Vec<NodeId>) {
        self.records.insert(ancestor, HistoryRecord::Deep(leaves));
    }

    pub fn get(&self, ancestor: NodeId) -> Option<&HistoryRecord> {
        self.records.get(&ancestor)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
