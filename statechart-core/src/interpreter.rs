//! The per-machine runtime: the hardest subsystem in this crate.
//!
//! Pure transition math is kept separate from async wiring: everything
//! above [`Interpreter`] is plain functions over a [`Configuration`] with no
//! async, no I/O, no mailbox; [`Interpreter`] is the async actor that owns
//! one mailbox task and drives that pure logic to completion for each
//! consumed event.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::context::{ContextSnapshot, OrchestratedContext, RequestSend};
use crate::diagnostics::{Diagnostic, DiagnosticRing};
use crate::error::{Result, StatechartError};
use crate::event::Event;
use crate::history::{HistoryMemory, HistoryRecord};
use crate::intern::Symbol;
use crate::mailbox::{Capacity, Mailbox};
use crate::model::{Definition, NodeId, StateKind, TransitionDescriptor};
use crate::registry::ActionGuardRegistry;
use crate::snapshot::{format_state_string, Snapshot};
use crate::timer::{StateEpoch, TimerHandle, TimerService};

// ---------------------------------------------------------------------
// Configuration: the pure, transport-free active-state set.
// ---------------------------------------------------------------------

/// The active-state set, closed under ancestors: every compound
/// ancestor present has exactly one active child; every parallel ancestor
/// present has every region active. Stored as the full closed set rather
/// than just leaves — ancestor-membership checks during transition
/// resolution are then O(1) instead of requiring a walk back up the tree
/// per query.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    active: BTreeSet<NodeId>,
}

impl Configuration {
    pub fn is_active(&self, node: NodeId) -> bool {
        self.active.contains(&node)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active leaves in document order: nodes with no active child. Document
    /// order falls out of `NodeId` ascending because the parser assigns ids
    /// in preorder (a parent's id is always smaller than any descendant's).
    pub fn leaves(&self, def: &Definition) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .active
            .iter()
            .copied()
            .filter(|&n| !def.node(n).children.iter().any(|c| self.active.contains(c)))
            .collect();
        out.sort_by_key(|n| n.0);
        out
    }

    pub fn state_string(&self, def: &Definition) -> String {
        let leaves = self.leaves(def);
        let paths: Vec<&str> = leaves.iter().map(|&n| def.dotted_path(n)).collect();
        format_state_string(&paths)
    }

    fn install(&mut self, exit: &BTreeSet<NodeId>, enter: &BTreeSet<NodeId>) {
        for n in exit {
            self.active.remove(n);
        }
        for n in enter {
            self.active.insert(*n);
        }
    }
}

// ---------------------------------------------------------------------
// Entry-set / exit-set computation (transition steps 3, 6).
// ---------------------------------------------------------------------

/// Nodes strictly between `ancestor` (exclusive) and `node` (inclusive),
/// root-to-leaf order.
fn chain_between(def: &Definition, ancestor: NodeId, node: NodeId) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let mut cur = node;
    while cur != ancestor {
        chain.push(cur);
        cur = def.node(cur).parent.expect("ancestor must be reachable from node");
    }
    chain.reverse();
    chain
}

/// Default descent into `node`: what gets entered when `node` is reached
/// without an explicit deeper target: for each compound node entered,
/// consult its `initial_child`; for each parallel node entered, enter every
/// region; for each history node entered, consult `HistoryMemory`.
fn default_descent(def: &Definition, history: &HistoryMemory, node: NodeId) -> Vec<NodeId> {
    match &def.node(node).kind {
        StateKind::Atomic | StateKind::Final => vec![node],
        StateKind::Compound { initial } => {
            let mut out = vec![node];
            out.extend(default_descent(def, history, *initial));
            out
        }
        StateKind::Parallel => {
            let mut out = vec![node];
            for &region in &def.node(node).children {
                out.extend(default_descent(def, history, region));
            }
            out
        }
        StateKind::History { default, .. } => {
            let ancestor = def.node(node).parent.expect("history node must have a compound parent");
            match history.get(ancestor) {
                Some(HistoryRecord::Shallow(child)) => default_descent(def, history, *child),
                Some(HistoryRecord::Deep(leaves)) => closure_from_leaves(def, ancestor, leaves),
                None => match default {
                    Some(d) => default_descent(def, history, *d),
                    None => match &def.node(ancestor).kind {
                        StateKind::Compound { initial } => default_descent(def, history, *initial),
                        _ => Vec::new(),
                    },
                },
            }
        }
    }
}

/// Reconstructs the node set strictly between `boundary` and each
/// remembered leaf — used for deep-history replay. The union of ancestor
/// chains from every leaf up to (not including) `boundary` recovers exactly
/// the historical active subtree, including whichever parallel regions were
/// active, without needing to separately re-run any descent logic.
fn closure_from_leaves(def: &Definition, boundary: NodeId, leaves: &[NodeId]) -> Vec<NodeId> {
    let mut set = BTreeSet::new();
    for &leaf in leaves {
        let mut cur = leaf;
        set.insert(cur);
        while cur != boundary {
            cur = def.node(cur).parent.expect("remembered leaf must descend from its history boundary");
            if cur == boundary {
                break;
            }
            set.insert(cur);
        }
    }
    set.into_iter().collect()
}

/// Builds the entry set for a transition from `lca` (exclusive, already
/// active) toward `target`. Walks the explicit chain from `lca` to `target`;
/// any parallel node encountered along that chain gets its other regions
/// entered via `default_descent` (every region must be active once the
/// parallel node is), then `target` itself is resolved via
/// `default_descent` for whatever lies below it.
fn entry_set_for(def: &Definition, history: &HistoryMemory, lca: NodeId, target: NodeId) -> Vec<NodeId> {
    let chain = chain_between(def, lca, target);
    let mut out = Vec::new();
    let mut parent = lca;
    for &node in &chain {
        // A history pseudo-state is target-only: it resolves to a
        // remembered configuration via `default_descent` below but never
        // becomes active itself.
        if !matches!(&def.node(node).kind, StateKind::History { .. }) {
            out.push(node);
        }
        if let StateKind::Parallel = &def.node(parent).kind {
            for &region in &def.node(parent).children {
                if region != node {
                    out.extend(default_descent(def, history, region));
                }
            }
        }
        parent = node;
    }
    out.extend(default_descent(def, history, target));
    out
}

/// Active descendants of `lca` that are not ancestors of `target` — the exit
/// set for a single transition. Deliberately `is_ancestor`
/// rather than `is_self_or_ancestor`: a target that is itself active (the
/// domain node of an external self-transition) must still be exited.
fn exit_set_for(def: &Definition, config: &Configuration, lca: NodeId, target: NodeId) -> BTreeSet<NodeId> {
    config
        .active
        .iter()
        .copied()
        .filter(|&x| def.is_ancestor(lca, x) && !def.is_ancestor(x, target))
        .collect()
}

/// The domain (LCA) used to scope a transition's exit/entry sets. A true
/// external self-transition (`target == source_leaf`) needs the proper
/// ancestor above the state, not the state itself — otherwise `lca(a, a)`
/// returns `a`, which has no descendants of its own, and the state would
/// never actually leave its active set.
fn transition_domain(def: &Definition, source_leaf: NodeId, target: NodeId) -> NodeId {
    if source_leaf == target {
        def.node(source_leaf).parent.unwrap_or(source_leaf)
    } else {
        def.lca(source_leaf, target)
    }
}

// ---------------------------------------------------------------------
// Transition selection (steps 1-2).
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    source_leaf: NodeId,
    frame: NodeId,
    descriptor: TransitionDescriptor,
}

/// Evaluates `on_map[event]` climbing from `leaf` toward the root, stopping
/// at the first ancestor (inclusive of `leaf`) that declares a handler for
/// this event — whether or not any of its guarded descriptors actually
/// matches. That "stop at the nearest declaring frame" rule is what makes a
/// child's `null` handler suppress a parent's handler for the same event.
fn select_for_leaf(
    def: &Definition,
    registry: &ActionGuardRegistry,
    ctx: &ContextSnapshot,
    event: &Event,
    event_sym: Symbol,
    diagnostics: &mut DiagnosticRing,
    leaf: NodeId,
) -> Option<Candidate> {
    for node in def.self_and_ancestors(leaf) {
        let Some(list) = def.node(node).on_for(event_sym) else { continue };
        for descriptor in list {
            let passes = match descriptor.guard {
                None => true,
                Some(guard_sym) => {
                    let guard_name = def.guards.resolve(guard_sym);
                    match registry.guard(guard_name) {
                        Some(f) => match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx, event))) {
                            Ok(result) => result,
                            Err(_) => {
                                diagnostics.push(Diagnostic::GuardPanicked {
                                    state: def.dotted_path(node).to_string(),
                                    event: event.name.clone(),
                                    guard: guard_name.to_string(),
                                });
                                false
                            }
                        },
                        None => {
                            diagnostics.push(Diagnostic::GuardFailed {
                                state: def.dotted_path(node).to_string(),
                                event: event.name.clone(),
                                guard: guard_name.to_string(),
                            });
                            false
                        }
                    }
                }
            };
            if passes {
                if descriptor.is_forbidden() {
                    diagnostics.push(Diagnostic::TransitionSuppressed {
                        state: def.dotted_path(node).to_string(),
                        event: event.name.clone(),
                    });
                }
                return Some(Candidate { source_leaf: leaf, frame: node, descriptor: descriptor.clone() });
            }
        }
        // A handler frame was found but no descriptor's guard passed: this
        // leaf contributes no transition. Do not climb further — the
        // nearest frame already claimed this event.
        return None;
    }
    None
}

/// Resolves every active leaf's candidate independently (step 1), then
/// discards document-order-later candidates that would cross a parallel
/// region boundary another candidate wants to keep intact (step 2).
fn select_transitions(
    def: &Definition,
    registry: &ActionGuardRegistry,
    ctx: &ContextSnapshot,
    event: &Event,
    config: &Configuration,
    diagnostics: &mut DiagnosticRing,
) -> Vec<Candidate> {
    let Some(event_sym) = def.events.get(&event.name) else { return Vec::new() };

    let mut raw = Vec::new();
    let mut seen_frames = BTreeSet::new();
    for leaf in config.leaves(def) {
        if let Some(candidate) = select_for_leaf(def, registry, ctx, event, event_sym, diagnostics, leaf) {
            // The same declaring frame reached from two or more simultaneously
            // active leaves (a shared ancestor above a parallel region) must
            // contribute exactly one candidate — keyed on the frame node
            // itself, not `source_leaf`, which is already unique per leaf and
            // so would never actually dedup anything.
            if seen_frames.insert(candidate.frame) {
                raw.push(candidate);
            }
        }
    }

    let mut accepted: Vec<Candidate> = Vec::new();
    'outer: for candidate in raw {
        if candidate.descriptor.is_forbidden() || candidate.descriptor.internal {
            accepted.push(candidate);
            continue;
        }
        let target = candidate.descriptor.target.expect("non-forbidden descriptor has a target");
        let scope = transition_domain(def, candidate.source_leaf, target);
        for kept in &accepted {
            if kept.descriptor.is_forbidden() || kept.descriptor.internal {
                continue;
            }
            let kept_target = kept.descriptor.target.expect("non-forbidden descriptor has a target");
            let kept_scope = transition_domain(def, kept.source_leaf, kept_target);
            let conflict = def.is_self_or_ancestor(scope, kept.source_leaf) || def.is_self_or_ancestor(kept_scope, candidate.source_leaf);
            if conflict {
                continue 'outer;
            }
        }
        accepted.push(candidate);
    }
    accepted
}

// ---------------------------------------------------------------------
// Action execution.
// ---------------------------------------------------------------------

fn run_action(
    def: &Definition,
    registry: &ActionGuardRegistry,
    ctx: &mut OrchestratedContext,
    event: &Event,
    action_sym: Symbol,
    errors: &mut Vec<(String, String)>,
    state_label: &str,
) {
    let name = def.actions.resolve(action_sym);
    match registry.action(name) {
        Some(f) => {
            if let Err(message) = f(ctx, event) {
                tracing::error!(state = state_label, action = name, %message, "action failed");
                errors.push((state_label.to_string(), message));
            }
        }
        None => {
            let message = format!("no action registered under name '{name}'");
            tracing::error!(state = state_label, action = name, "unresolved action");
            errors.push((state_label.to_string(), message));
        }
    }
}

// ---------------------------------------------------------------------
// The transition algorithm proper, pure except for invoking registered
// action/guard closures.
// ---------------------------------------------------------------------

struct TransitionRun {
    new_state_string: String,
    outbox: Vec<RequestSend>,
    entered_with_after: Vec<NodeId>,
    exited: Vec<NodeId>,
}

#[allow(clippy::too_many_arguments)]
fn apply_transitions(
    def: &Definition,
    registry: &ActionGuardRegistry,
    history: &mut HistoryMemory,
    config: &mut Configuration,
    ctx: &mut OrchestratedContext,
    event: &Event,
    candidates: &[Candidate],
) -> Result<TransitionRun> {
    let external: Vec<&Candidate> = candidates.iter().filter(|c| !c.descriptor.is_forbidden() && !c.descriptor.internal).collect();
    let internal: Vec<&Candidate> = candidates.iter().filter(|c| !c.descriptor.is_forbidden() && c.descriptor.internal).collect();

    if external.is_empty() {
        // Only internal and/or forbidden candidates (or none at all): no
        // reconfiguration, just run internal transitions' own actions.
        let mut errors = Vec::new();
        for candidate in &internal {
            for &action in &candidate.descriptor.actions {
                run_action(def, registry, ctx, event, action, &mut errors, def.dotted_path(candidate.source_leaf));
            }
        }
        if let Some((state, message)) = errors.into_iter().next() {
            return Err(StatechartError::ActionFailedDuringExit { state, message });
        }
        return Ok(TransitionRun {
            new_state_string: config.state_string(def),
            outbox: ctx.take_outbox(),
            entered_with_after: Vec::new(),
            exited: Vec::new(),
        });
    }

    let mut exit_set: BTreeSet<NodeId> = BTreeSet::new();
    let mut entry_set: BTreeSet<NodeId> = BTreeSet::new();
    for candidate in &external {
        let target = candidate.descriptor.target.expect("external candidate has a target");
        let lca = transition_domain(def, candidate.source_leaf, target);
        exit_set.extend(exit_set_for(def, config, lca, target));
        entry_set.extend(entry_set_for(def, history, lca, target));
    }
    // Entry/exit sets may double-count nodes between disjoint candidates'
    // LCAs and the root; that is harmless since both are plain sets.

    // Record history before running any exit action, for every compound
    // ancestor in the exit set that owns a history child.
    for &node in &exit_set {
        let Some(&history_child) = def.node(node).children.iter().find(|&&c| matches!(&def.node(c).kind, StateKind::History { .. })) else {
            continue;
        };
        let kind = match &def.node(history_child).kind {
            StateKind::History { kind, .. } => *kind,
            _ => unreachable!(),
        };
        match kind {
            crate::model::HistoryKind::Shallow => {
                if let Some(&direct_child) = def.node(node).children.iter().find(|&&c| c != history_child && config.is_active(c)) {
                    history.record_shallow(node, direct_child);
                }
            }
            crate::model::HistoryKind::Deep => {
                let leaves: Vec<NodeId> = config.leaves(def).into_iter().filter(|&l| def.is_ancestor(node, l)).collect();
                history.record_deep(node, leaves);
            }
        }
    }

    let mut exit_order: Vec<NodeId> = exit_set.iter().copied().collect();
    exit_order.sort_by_key(|n| std::cmp::Reverse(n.0));

    let mut errors = Vec::new();
    for &node in &exit_order {
        for &action in &def.node(node).exit_actions {
            run_action(def, registry, ctx, event, action, &mut errors, def.dotted_path(node));
        }
    }
    for candidate in external.iter().chain(internal.iter()) {
        for &action in &candidate.descriptor.actions {
            run_action(def, registry, ctx, event, action, &mut errors, def.dotted_path(candidate.source_leaf));
        }
    }

    // Exit set always completes before we fail the transition, leaving the
    // configuration consistent in a post-exit, pre-entry state.
    config.install(&exit_set, &BTreeSet::new());
    if let Some((state, message)) = errors.into_iter().next() {
        return Err(StatechartError::ActionFailedDuringExit { state, message });
    }

    let mut entry_order: Vec<NodeId> = entry_set.iter().copied().collect();
    entry_order.sort_by_key(|n| n.0);

    let mut errors = Vec::new();
    for &node in &entry_order {
        for &action in &def.node(node).entry_actions {
            run_action(def, registry, ctx, event, action, &mut errors, def.dotted_path(node));
        }
    }
    config.install(&BTreeSet::new(), &entry_set);
    if let Some((state, message)) = errors.into_iter().next() {
        return Err(StatechartError::ActionFailedDuringEntry { state, message });
    }

    let entered_with_after: Vec<NodeId> = entry_order.iter().copied().filter(|&n| !def.node(n).after.is_empty()).collect();

    Ok(TransitionRun {
        new_state_string: config.state_string(def),
        outbox: ctx.take_outbox(),
        entered_with_after,
        exited: exit_order,
    })
}

// ---------------------------------------------------------------------
// The async actor.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterStatus {
    Uninitialized,
    Running,
    Fault,
    Stopped,
}

enum Command {
    Start(oneshot::Sender<Result<String>>),
    Send(Event, oneshot::Sender<Result<String>>),
    Deliver(Event),
    AfterFired { state: NodeId, delay_ms: u64, expected_epoch: u64 },
    QuerySnapshot(oneshot::Sender<Result<Snapshot>>),
    Diagnostics(oneshot::Sender<Vec<Diagnostic>>),
    Stop(oneshot::Sender<()>),
}

/// Cheap, cloneable handle onto one running machine. Holds no `Arc` back to
/// an `Orchestrator` — it only knows how to reach its own mailbox.
#[derive(Clone)]
pub struct Interpreter {
    id: Arc<str>,
    mailbox: Mailbox<Command>,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter").field("id", &self.id).finish()
    }
}

/// Forwards `request_send` calls accumulated during a transition to
/// whatever routes them onward — normally an `Orchestrator`'s inbound
/// channel, injected at construction time so `Interpreter` never holds a
/// direct reference to the bus.
pub type OutboundSink = tokio::sync::mpsc::UnboundedSender<(String, Event)>;

impl Interpreter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawns the actor task and returns a handle to it.
    pub fn spawn(
        id: impl Into<Arc<str>>,
        definition: Arc<Definition>,
        registry: Arc<ActionGuardRegistry>,
        outbound: OutboundSink,
        mailbox_capacity: Capacity,
        diagnostics_capacity: usize,
    ) -> Self {
        let id: Arc<str> = id.into();
        let mailbox: Mailbox<Command> = Mailbox::new(id.to_string(), mailbox_capacity);
        let actor_mailbox = mailbox.clone();
        let actor_id = id.clone();
        tokio::spawn(async move {
            let mut state = ActorState {
                id: actor_id,
                def: definition,
                registry,
                outbound,
                mailbox: actor_mailbox,
                status: InterpreterStatus::Uninitialized,
                configuration: Configuration::default(),
                history: HistoryMemory::new(),
                flags: Vec::new(),
                diagnostics: DiagnosticRing::new(diagnostics_capacity),
                timers: HashMap::new(),
            };
            state.run().await;
        });
        Self { id, mailbox }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.try_send(build(tx))?;
        rx.await.map_err(|_| StatechartError::NotRunning)
    }

    pub async fn start(&self) -> Result<String> {
        self.call(Command::Start).await?
    }

    pub async fn send(&self, event: Event) -> Result<String> {
        self.call(|tx| Command::Send(event, tx)).await?
    }

    /// Like [`Self::send`], but gives up waiting for the reply once
    /// `deadline` elapses and returns `Timeout` instead of blocking forever.
    /// The command has already reached the mailbox by the time the deadline
    /// can fire, so the event still runs to completion on the machine's own
    /// task; only the caller's wait is abandoned, not the transition.
    pub async fn send_with_timeout(&self, event: Event, deadline: Duration) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.try_send(Command::Send(event, tx))?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StatechartError::NotRunning),
            Err(_) => Err(StatechartError::Timeout),
        }
    }

    pub fn send_fire_and_forget(&self, event: Event) -> Result<()> {
        self.mailbox.try_send(Command::Deliver(event))
    }

    pub async fn query_snapshot(&self) -> Result<Snapshot> {
        self.call(Command::QuerySnapshot).await?
    }

    pub async fn diagnostics(&self) -> Vec<Diagnostic> {
        self.call(Command::Diagnostics).await.unwrap_or_default()
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.try_send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ActorState {
    id: Arc<str>,
    def: Arc<Definition>,
    registry: Arc<ActionGuardRegistry>,
    outbound: OutboundSink,
    mailbox: Mailbox<Command>,
    status: InterpreterStatus,
    configuration: Configuration,
    history: HistoryMemory,
    flags: Vec<(String, crate::snapshot::Value)>,
    diagnostics: DiagnosticRing,
    timers: HashMap<NodeId, (StateEpoch, Vec<TimerHandle>)>,
}

fn validate_handlers(def: &Definition, registry: &ActionGuardRegistry) -> Result<()> {
    for i in 0..def.len() {
        let node = def.node(NodeId(i as u32));
        for action in node.entry_actions.iter().chain(node.exit_actions.iter()) {
            let name = def.actions.resolve(*action);
            if !registry.has_action(name) {
                return Err(StatechartError::UnknownHandler { name: name.to_string() });
            }
        }
        for (_, list) in node.on.iter().chain(node.after.iter()) {
            for descriptor in list {
                for action in &descriptor.actions {
                    let name = def.actions.resolve(*action);
                    if !registry.has_action(name) {
                        return Err(StatechartError::UnknownHandler { name: name.to_string() });
                    }
                }
                if let Some(guard) = descriptor.guard {
                    let name = def.guards.resolve(guard);
                    if !registry.has_guard(name) {
                        return Err(StatechartError::UnknownHandler { name: name.to_string() });
                    }
                }
            }
        }
    }
    Ok(())
}

impl ActorState {
    async fn run(&mut self) {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                Command::Start(reply) => {
                    let _ = reply.send(self.handle_start());
                }
                Command::Send(event, reply) => {
                    let _ = reply.send(self.handle_event(event));
                }
                Command::Deliver(event) => {
                    let _ = self.handle_event(event);
                }
                Command::AfterFired { state, delay_ms, expected_epoch } => {
                    self.handle_after_fired(state, delay_ms, expected_epoch);
                }
                Command::QuerySnapshot(reply) => {
                    let _ = reply.send(self.handle_query());
                }
                Command::Diagnostics(reply) => {
                    let _ = reply.send(self.diagnostics.snapshot());
                }
                Command::Stop(reply) => {
                    self.handle_stop();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.mailbox.close_and_drain();
    }

    fn handle_start(&mut self) -> Result<String> {
        // Idempotent once running: a repeat call is a no-op success, not
        // an error. `start(); stop(); start()` must also work,
        // so `Stopped` is a valid starting point, not just `Uninitialized`.
        match self.status {
            InterpreterStatus::Running => return Ok(self.configuration.state_string(&self.def)),
            InterpreterStatus::Fault => return Err(StatechartError::Faulted),
            InterpreterStatus::Uninitialized | InterpreterStatus::Stopped => {}
        }
        if let Err(e) = validate_handlers(&self.def, &self.registry) {
            self.status = InterpreterStatus::Fault;
            return Err(e);
        }
        let entry_set: BTreeSet<NodeId> = default_descent(&self.def, &self.history, self.def.root()).into_iter().collect();
        let mut ctx = OrchestratedContext::new(std::mem::take(&mut self.flags));
        let dummy_event = Event::new("xstate.init", crate::snapshot::Value::Null);
        let mut entry_order: Vec<NodeId> = entry_set.iter().copied().collect();
        entry_order.sort_by_key(|n| n.0);
        let mut errors = Vec::new();
        for &node in &entry_order {
            for &action in &self.def.node(node).entry_actions {
                run_action(&self.def, &self.registry, &mut ctx, &dummy_event, action, &mut errors, self.def.dotted_path(node));
            }
        }
        self.configuration.install(&BTreeSet::new(), &entry_set);
        self.flags = ctx.flags().to_vec();
        let outbox = ctx.take_outbox();
        if let Some((state, message)) = errors.into_iter().next() {
            self.status = InterpreterStatus::Fault;
            return Err(StatechartError::ActionFailedDuringEntry { state, message });
        }
        self.status = InterpreterStatus::Running;
        for &node in &entry_order {
            self.schedule_after_timers(node);
        }
        self.drain_outbox(outbox);
        Ok(self.configuration.state_string(&self.def))
    }

    fn handle_event(&mut self, event: Event) -> Result<String> {
        if self.status == InterpreterStatus::Fault {
            return Err(StatechartError::Faulted);
        }
        if self.status != InterpreterStatus::Running {
            return Err(StatechartError::NotRunning);
        }
        let ctx_snapshot = ContextSnapshot::new(self.flags.clone());
        let candidates = select_transitions(&self.def, &self.registry, &ctx_snapshot, &event, &self.configuration, &mut self.diagnostics);
        let mut ctx = OrchestratedContext::new(std::mem::take(&mut self.flags));
        let result = apply_transitions(&self.def, &self.registry, &mut self.history, &mut self.configuration, &mut ctx, &event, &candidates);
        self.flags = ctx.flags().to_vec();
        match result {
            Ok(run) => {
                for &node in &run.exited {
                    self.cancel_timers_for(node);
                }
                for &node in &run.entered_with_after {
                    self.schedule_after_timers(node);
                }
                self.drain_outbox(run.outbox);
                Ok(run.new_state_string)
            }
            Err(e) => {
                self.status = InterpreterStatus::Fault;
                Err(e)
            }
        }
    }

    fn handle_after_fired(&mut self, state: NodeId, delay_ms: u64, expected_epoch: u64) {
        if self.status != InterpreterStatus::Running || !self.configuration.is_active(state) {
            return;
        }
        let Some((epoch, _)) = self.timers.get(&state) else { return };
        if epoch.current() != expected_epoch {
            return; // stale: epoch bumped by an exit/re-entry since this timer was scheduled.
        }
        let Some(list) = self.def.node(state).after.iter().find(|(d, _)| *d == delay_ms).map(|(_, l)| l.clone()) else {
            return;
        };
        let ctx_snapshot = ContextSnapshot::new(self.flags.clone());
        let dummy_event = Event::new("xstate.after", crate::snapshot::Value::Null);
        let mut matched = None;
        for descriptor in &list {
            let passes = match descriptor.guard {
                None => true,
                Some(guard_sym) => {
                    let guard_name = self.def.guards.resolve(guard_sym);
                    match self.registry.guard(guard_name) {
                        Some(f) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&ctx_snapshot, &dummy_event))).unwrap_or(false),
                        None => false,
                    }
                }
            };
            if passes {
                matched = Some(descriptor.clone());
                break;
            }
        }
        let Some(descriptor) = matched else { return };
        let candidate = Candidate { source_leaf: state, frame: state, descriptor };
        let mut ctx = OrchestratedContext::new(std::mem::take(&mut self.flags));
        let result = apply_transitions(&self.def, &self.registry, &mut self.history, &mut self.configuration, &mut ctx, &dummy_event, &[candidate]);
        self.flags = ctx.flags().to_vec();
        match result {
            Ok(run) => {
                for &node in &run.exited {
                    self.cancel_timers_for(node);
                }
                for &node in &run.entered_with_after {
                    self.schedule_after_timers(node);
                }
                self.drain_outbox(run.outbox);
            }
            Err(e) => {
                tracing::error!(machine = %self.id, error = %e, "after-transition faulted");
                self.status = InterpreterStatus::Fault;
            }
        }
    }

    fn handle_query(&self) -> Result<Snapshot> {
        if self.status != InterpreterStatus::Running {
            return Err(StatechartError::NotRunning);
        }
        Ok(Snapshot { state_string: self.configuration.state_string(&self.def), context_data: self.flags.clone() })
    }

    fn handle_stop(&mut self) {
        if self.status == InterpreterStatus::Stopped {
            return;
        }
        let mut order: Vec<NodeId> = self.configuration.active.iter().copied().collect();
        order.sort_by_key(|n| std::cmp::Reverse(n.0));
        let dummy_event = Event::new("xstate.stop", crate::snapshot::Value::Null);
        let mut ctx = OrchestratedContext::new(std::mem::take(&mut self.flags));
        let mut errors = Vec::new();
        for &node in &order {
            for &action in &self.def.node(node).exit_actions {
                run_action(&self.def, &self.registry, &mut ctx, &dummy_event, action, &mut errors, self.def.dotted_path(node));
            }
            self.cancel_timers_for(node);
        }
        self.flags = ctx.flags().to_vec();
        for (state, message) in errors {
            tracing::error!(machine = %self.id, state, message, "exit action failed during stop");
        }
        self.configuration = Configuration::default();
        self.history.clear();
        self.status = InterpreterStatus::Stopped;
    }

    fn schedule_after_timers(&mut self, node: NodeId) {
        let after = self.def.node(node).after.clone();
        if after.is_empty() {
            return;
        }
        let epoch = self.timers.get(&node).map(|(e, _)| e.clone()).unwrap_or_default();
        let expected = epoch.current();
        let handles: Vec<TimerHandle> =
            after.iter().map(|&(delay_ms, _)| self_schedule(&self.mailbox, &epoch, expected, node, delay_ms)).collect();
        self.timers.insert(node, (epoch, handles));
    }

    fn cancel_timers_for(&mut self, node: NodeId) {
        if let Some((epoch, handles)) = self.timers.remove(&node) {
            for handle in handles {
                handle.cancel();
            }
            epoch.bump();
        }
    }

    fn drain_outbox(&self, outbox: Vec<RequestSend>) {
        for send in outbox {
            let event = Event::new(send.event_name, send.payload).with_source(self.id.to_string());
            if self.outbound.send((send.target_id, event)).is_err() {
                tracing::warn!(machine = %self.id, "outbound sink closed; dropping request_send");
            }
        }
    }
}

/// Schedules one `after` timer that re-enters `mailbox` with
/// `Command::AfterFired` once `delay_ms` elapses, unless `epoch` has moved
/// on by then.
fn self_schedule(mailbox: &Mailbox<Command>, epoch: &StateEpoch, expected: u64, node: NodeId, delay_ms: u64) -> TimerHandle {
    let service = TimerService::new();
    let mailbox = mailbox.clone();
    service.schedule(Duration::from_millis(delay_ms), epoch.clone(), expected, move || {
        let _ = mailbox.try_send(Command::AfterFired { state: node, delay_ms, expected_epoch: expected });
    })
}
