use std::sync::Arc;

use crate::intern::{Interner, Symbol};

/// Index into a [`Definition`]'s node arena. The tree never grows or shrinks
/// after parsing, so a flat `Vec` arena indexed by this newtype avoids the
/// borrow-checker friction of a recursive `Box` tree while keeping parent
/// ascent and LCA computation O(depth) instead of O(tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Shallow,
    Deep,
}

/// Tagged variant collapsing what would otherwise be an inheritance
/// hierarchy of node kinds into one flat enum.
#[derive(Debug, Clone)]
pub enum StateKind {
    Atomic,
    Compound { initial: NodeId },
    Parallel,
    History {
        kind: HistoryKind,
        default: Option<NodeId>,
    },
    Final,
}

/// One transition candidate attached to an `on` or `after` entry.
///
/// `target.is_none() && guard.is_none()` is a forbidden transition: it
/// consumes the event for the handling leaf without changing configuration.
#[derive(Debug, Clone)]
pub struct TransitionDescriptor {
    pub target: Option<NodeId>,
    pub guard: Option<Symbol>,
    pub actions: Vec<Symbol>,
    pub internal: bool,
}

impl TransitionDescriptor {
    pub fn is_forbidden(&self) -> bool {
        self.target.is_none() && self.guard.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct StateNodeDef {
    pub id: NodeId,
    pub path: Arc<str>,
    pub local_name: Arc<str>,
    pub parent: Option<NodeId>,
    /// Document order. For `Parallel`, these are the region roots.
    pub children: Vec<NodeId>,
    pub kind: StateKind,
    pub entry_actions: Vec<Symbol>,
    pub exit_actions: Vec<Symbol>,
    /// Event name -> ordered transition candidates; first matching guard wins.
    pub on: Vec<(Symbol, Vec<TransitionDescriptor>)>,
    /// Delay in milliseconds -> ordered transition candidates.
    pub after: Vec<(u64, Vec<TransitionDescriptor>)>,
}

impl StateNodeDef {
    pub fn is_atomic_like(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn on_for(&self, event: Symbol) -> Option<&[TransitionDescriptor]> {
        self.on
            .iter()
            .find(|(name, _)| *name == event)
            .map(|(_, list)| list.as_slice())
    }
}

/// Immutable, shared tree parsed from the JSON definition. Frozen once built
/// and freely cloned as an `Arc` across interpreter instances.
#[derive(Debug, Clone)]
pub struct Definition {
    nodes: Vec<StateNodeDef>,
    root: NodeId,
    pub events: Interner,
    pub actions: Interner,
    pub guards: Interner,
}

/// Minimal read-only view over a node arena, implemented both by the frozen
/// [`Definition`] and by the parser's in-progress arena so target-path
/// resolution (`path::resolve_target`) runs identically during parsing
/// (cross-subtree references) and afterwards (none needed, but kept for
/// symmetry/tests).
pub trait TreeLike {
    fn parent_of(&self, id: NodeId) -> Option<NodeId>;
    fn children_of(&self, id: NodeId) -> &[NodeId];
    fn path_of(&self, id: NodeId) -> &str;
    fn local_name_of(&self, id: NodeId) -> &str;
    fn node_count(&self) -> usize;
}

impl TreeLike for Definition {
    fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    fn children_of(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    fn path_of(&self, id: NodeId) -> &str {
        &self.node(id).path
    }

    fn local_name_of(&self, id: NodeId) -> &str {
        &self.node(id).local_name
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Definition {
    pub(crate) fn new(nodes: Vec<StateNodeDef>, root: NodeId, events: Interner, actions: Interner, guards: Interner) -> Self {
        Self { nodes, root, events, actions, guards }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &StateNodeDef {
        &self.nodes[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestors of `id`, nearest first, NOT including `id` itself, ending
    /// at (and including) the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut cur = self.node(id).parent;
        std::iter::from_fn(move || {
            let this = cur?;
            cur = self.node(this).parent;
            Some(this)
        })
    }

    /// `id` and all of its ancestors, nearest first.
    pub fn self_and_ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(id).chain(self.ancestors(id))
    }

    pub fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        self.ancestors(of).any(|a| a == ancestor)
    }

    pub fn is_self_or_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        ancestor == of || self.is_ancestor(ancestor, of)
    }

    /// Least common compound (or parallel/root) ancestor of two nodes.
    pub fn lca(&self, a: NodeId, b: NodeId) -> NodeId {
        let chain_a: Vec<NodeId> = self.self_and_ancestors(a).collect();
        for anc in self.self_and_ancestors(b) {
            if chain_a.contains(&anc) {
                return anc;
            }
        }
        self.root
    }

    /// All descendants of `id` (not including `id`), depth-first,
    /// document order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            for &c in self.node(n).children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    /// Leaf descendants of `id` in a "resting" configuration is computed by
    /// the interpreter (it depends on initial/history); this just tells you
    /// whether a node is a leaf in the tree sense (atomic/final/history).
    pub fn is_leaf_kind(&self, id: NodeId) -> bool {
        matches!(
            self.node(id).kind,
            StateKind::Atomic | StateKind::Final | StateKind::History { .. }
        )
    }

    pub fn dotted_path(&self, id: NodeId) -> &str {
        &self.node(id).path
    }
}
