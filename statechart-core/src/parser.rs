use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StatechartError};
use crate::intern::{Interner, Symbol};
use crate::model::{Definition, HistoryKind, NodeId, StateKind, StateNodeDef, TransitionDescriptor, TreeLike};
use crate::path;

/// A transition candidate as written in the JSON, before its `target` path
/// string has been resolved against the whole tree.
struct RawTransition {
    target_path: Option<String>,
    target: Option<NodeId>,
    guard: Option<Symbol>,
    actions: Vec<Symbol>,
    internal: bool,
}

impl RawTransition {
    fn forbidden() -> Self {
        Self { target_path: None, target: None, guard: None, actions: Vec::new(), internal: false }
    }

    fn target_only(target: String) -> Self {
        Self { target_path: Some(target), target: None, guard: None, actions: Vec::new(), internal: false }
    }

    fn freeze(self) -> TransitionDescriptor {
        TransitionDescriptor { target: self.target, guard: self.guard, actions: self.actions, internal: self.internal }
    }
}

enum RawKind {
    Atomic,
    Compound { initial: NodeId },
    Parallel,
    History { kind: HistoryKind, default: Option<NodeId> },
    Final,
}

struct RawNode {
    id: NodeId,
    path: Arc<str>,
    local_name: Arc<str>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: RawKind,
    entry_actions: Vec<Symbol>,
    exit_actions: Vec<Symbol>,
    on: Vec<(Symbol, Vec<RawTransition>)>,
    after: Vec<(u64, Vec<RawTransition>)>,
    /// History default-target path, resolved in the second pass once the
    /// whole tree exists (it may reference any node, not just a sibling).
    history_default_path: Option<String>,
}

impl RawNode {
    fn freeze(self) -> StateNodeDef {
        let kind = match self.kind {
            RawKind::Atomic => StateKind::Atomic,
            RawKind::Compound { initial } => StateKind::Compound { initial },
            RawKind::Parallel => StateKind::Parallel,
            RawKind::History { kind, default } => StateKind::History { kind, default },
            RawKind::Final => StateKind::Final,
        };
        StateNodeDef {
            id: self.id,
            path: self.path,
            local_name: self.local_name,
            parent: self.parent,
            children: self.children,
            kind,
            entry_actions: self.entry_actions,
            exit_actions: self.exit_actions,
            on: self
                .on
                .into_iter()
                .map(|(event, list)| (event, list.into_iter().map(RawTransition::freeze).collect()))
                .collect(),
            after: self
                .after
                .into_iter()
                .map(|(delay, list)| (delay, list.into_iter().map(RawTransition::freeze).collect()))
                .collect(),
        }
    }
}

struct RawArena {
    nodes: Vec<RawNode>,
}

impl RawArena {
    fn node(&self, id: NodeId) -> &RawNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut RawNode {
        &mut self.nodes[id.0 as usize]
    }

    fn push(&mut self, node: RawNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

impl TreeLike for RawArena {
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

struct Builder {
    arena: RawArena,
    events: Interner,
    actions: Interner,
    guards: Interner,
}

fn names_from(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    }
}

impl Builder {
    fn parse_transition_obj(&mut self, v: &Value, json_path: &str) -> Result<RawTransition> {
        let target_path = v.get("target").and_then(Value::as_str).map(String::from);
        let guard_val = v.get("guard").and_then(Value::as_str);
        let cond_val = v.get("cond").and_then(Value::as_str);
        let guard_name = match (guard_val, cond_val) {
            (Some(g), Some(c)) => {
                if g != c {
                    tracing::warn!(
                        path = json_path,
                        guard = g,
                        cond = c,
                        "transition declares both 'guard' and 'cond' with differing values; using 'guard'"
                    );
                }
                Some(g)
            }
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        };
        let guard = guard_name.map(|g| self.guards.intern(g));
        let actions = names_from(v, "actions").iter().map(|n| self.actions.intern(n)).collect();
        let internal = v.get("internal").and_then(Value::as_bool).unwrap_or(false);
        Ok(RawTransition { target_path, target: None, guard, actions, internal })
    }

    fn parse_transition_list(&mut self, v: &Value, json_path: &str) -> Result<Vec<RawTransition>> {
        match v {
            Value::Null => Ok(vec![RawTransition::forbidden()]),
            Value::String(s) => Ok(vec![RawTransition::target_only(s.clone())]),
            Value::Object(_) => Ok(vec![self.parse_transition_obj(v, json_path)?]),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(RawTransition::target_only(s.clone())),
                    Value::Object(_) => self.parse_transition_obj(item, json_path),
                    Value::Null => Ok(RawTransition::forbidden()),
                    _ => Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "transition list entries must be a string, object, or null".to_string(),
                    }),
                })
                .collect(),
            _ => Err(StatechartError::MalformedDefinition {
                path: json_path.to_string(),
                message: "an 'on'/'after' entry must be a string, object, array, or null".to_string(),
            }),
        }
    }

    fn parse_on_map(&mut self, value: &Value, json_path: &str) -> Result<Vec<(Symbol, Vec<RawTransition>)>> {
        let mut out = Vec::new();
        if let Some(obj) = value.get("on").and_then(Value::as_object) {
            for (event_name, v) in obj {
                let sym = self.events.intern(event_name);
                let list = self.parse_transition_list(v, &format!("{json_path}.on.{event_name}"))?;
                out.push((sym, list));
            }
        }
        Ok(out)
    }

    fn parse_after_map(&mut self, value: &Value, json_path: &str) -> Result<Vec<(u64, Vec<RawTransition>)>> {
        let mut out = Vec::new();
        if let Some(obj) = value.get("after").and_then(Value::as_object) {
            for (k, v) in obj {
                let delay: u64 = k.parse().map_err(|_| StatechartError::MalformedDefinition {
                    path: format!("{json_path}.after.{k}"),
                    message: format!("delay key '{k}' is not a decimal integer millisecond string"),
                })?;
                let list = self.parse_transition_list(v, &format!("{json_path}.after.{k}"))?;
                out.push((delay, list));
            }
        }
        Ok(out)
    }

    fn build_node(
        &mut self,
        value: &Value,
        parent: Option<NodeId>,
        local_name: Arc<str>,
        path_str: Arc<str>,
        json_path: &str,
    ) -> Result<NodeId> {
        if !value.is_object() {
            return Err(StatechartError::MalformedDefinition {
                path: json_path.to_string(),
                message: "state node must be a JSON object".to_string(),
            });
        }

        let id = self.arena.push(RawNode {
            id: NodeId(0),
            path: path_str.clone(),
            local_name,
            parent,
            children: Vec::new(),
            kind: RawKind::Atomic,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            on: Vec::new(),
            after: Vec::new(),
            history_default_path: None,
        });
        self.arena.node_mut(id).id = id;

        let entry_actions = names_from(value, "entry").iter().map(|n| self.actions.intern(n)).collect();
        let exit_actions = names_from(value, "exit").iter().map(|n| self.actions.intern(n)).collect();
        let on = self.parse_on_map(value, json_path)?;
        let after = self.parse_after_map(value, json_path)?;

        let type_str = value.get("type").and_then(Value::as_str);

        if type_str == Some("final") && !on.is_empty() {
            return Err(StatechartError::MalformedDefinition {
                path: json_path.to_string(),
                message: "a final state must not declare its own 'on' handlers".to_string(),
            });
        }

        {
            let node = self.arena.node_mut(id);
            node.entry_actions = entry_actions;
            node.exit_actions = exit_actions;
            node.on = on;
            node.after = after;
        }

        let mut children = Vec::new();
        if let Some(states) = value.get("states").and_then(Value::as_object) {
            for (name, child_value) in states {
                let child_local: Arc<str> = Arc::from(name.as_str());
                let child_path: Arc<str> =
                    if path_str.is_empty() { child_local.clone() } else { Arc::from(format!("{path_str}.{name}")) };
                let child_json_path = format!("{json_path}.states.{name}");
                let child_id = self.build_node(child_value, Some(id), child_local, child_path, &child_json_path)?;
                children.push(child_id);
            }
        }

        let kind = match type_str {
            Some("parallel") => {
                if value.get("initial").is_some() {
                    return Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "a parallel state must not declare 'initial'".to_string(),
                    });
                }
                if children.len() < 2 {
                    return Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "a parallel state must declare at least two region children".to_string(),
                    });
                }
                RawKind::Parallel
            }
            Some("history") => {
                if !children.is_empty() {
                    return Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "a history state must be leaf-like".to_string(),
                    });
                }
                let parent_is_compound =
                    matches!(parent.map(|p| &self.arena.node(p).kind), Some(RawKind::Compound { .. }));
                if !parent_is_compound {
                    return Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "a history state must appear directly under a compound parent".to_string(),
                    });
                }
                let history_kind = match value.get("history").and_then(Value::as_str) {
                    Some("deep") => HistoryKind::Deep,
                    Some("shallow") | None => HistoryKind::Shallow,
                    Some(other) => {
                        return Err(StatechartError::MalformedDefinition {
                            path: json_path.to_string(),
                            message: format!("unknown history kind '{other}'"),
                        })
                    }
                };
                self.arena.node_mut(id).history_default_path = value.get("target").and_then(Value::as_str).map(String::from);
                RawKind::History { kind: history_kind, default: None }
            }
            Some("final") => RawKind::Final,
            Some(other) => {
                return Err(StatechartError::MalformedDefinition {
                    path: json_path.to_string(),
                    message: format!("unknown state type '{other}'"),
                })
            }
            None if children.is_empty() => RawKind::Atomic,
            None => {
                let non_history: Vec<NodeId> = children
                    .iter()
                    .copied()
                    .filter(|c| !matches!(self.arena.node(*c).kind, RawKind::History { .. }))
                    .collect();
                if non_history.is_empty() {
                    return Err(StatechartError::MalformedDefinition {
                        path: json_path.to_string(),
                        message: "a compound state must declare at least one non-history child".to_string(),
                    });
                }
                let initial = match value.get("initial").and_then(Value::as_str) {
                    Some(name) => children
                        .iter()
                        .copied()
                        .find(|c| &*self.arena.node(*c).local_name == name)
                        .ok_or_else(|| StatechartError::MalformedDefinition {
                            path: format!("{json_path}.initial"),
                            message: format!("'initial' names '{name}', which is not an existing child"),
                        })?,
                    None => non_history[0],
                };
                RawKind::Compound { initial }
            }
        };

        self.arena.node_mut(id).children = children;
        self.arena.node_mut(id).kind = kind;

        Ok(id)
    }

    fn resolve_one(&self, root: NodeId, owner: NodeId, t: &mut RawTransition) -> Result<()> {
        if let Some(p) = &t.target_path {
            let resolved = path::resolve_target(&self.arena, root, owner, p).ok_or_else(|| StatechartError::MalformedDefinition {
                path: self.arena.node(owner).path.to_string(),
                message: format!("transition target '{p}' does not resolve to a state"),
            })?;
            t.target = Some(resolved);
        }
        Ok(())
    }

    fn resolve_node(&mut self, root: NodeId, id: NodeId) -> Result<()> {
        let mut on = std::mem::take(&mut self.arena.node_mut(id).on);
        for (_, list) in on.iter_mut() {
            for t in list.iter_mut() {
                self.resolve_one(root, id, t)?;
            }
        }
        self.arena.node_mut(id).on = on;

        let mut after = std::mem::take(&mut self.arena.node_mut(id).after);
        for (_, list) in after.iter_mut() {
            for t in list.iter_mut() {
                self.resolve_one(root, id, t)?;
            }
        }
        self.arena.node_mut(id).after = after;

        if let Some(default_path) = self.arena.node(id).history_default_path.clone() {
            let resolved =
                path::resolve_target(&self.arena, root, id, &default_path).ok_or_else(|| StatechartError::MalformedDefinition {
                    path: self.arena.node(id).path.to_string(),
                    message: format!("history default target '{default_path}' does not resolve to a state"),
                })?;
            if let RawKind::History { default, .. } = &mut self.arena.node_mut(id).kind {
                *default = Some(resolved);
            }
        }

        Ok(())
    }

    fn resolve_all(&mut self, root: NodeId) -> Result<()> {
        for i in 0..self.arena.nodes.len() {
            self.resolve_node(root, NodeId(i as u32))?;
        }
        Ok(())
    }
}

/// Parses a permissive XState v4/v5-ish JSON dialect into a frozen [`Definition`].
pub fn parse_definition(json: &str) -> Result<Definition> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| StatechartError::MalformedDefinition { path: "$".to_string(), message: e.to_string() })?;

    let root_name: Arc<str> = value.get("id").and_then(Value::as_str).map(Arc::from).unwrap_or_else(|| Arc::from("(root)"));

    let mut builder =
        Builder { arena: RawArena { nodes: Vec::new() }, events: Interner::new(), actions: Interner::new(), guards: Interner::new() };

    let root = builder.build_node(&value, None, root_name, Arc::from(""), "$")?;
    builder.resolve_all(root)?;

    let nodes = builder.arena.nodes.into_iter().map(RawNode::freeze).collect();
    Ok(Definition::new(nodes, root, builder.events, builder.actions, builder.guards))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_traffic_light() {
        let def = parse_definition(
            r#"{
                "id": "light",
                "initial": "red",
                "states": {
                    "red": { "on": { "TIMER": "yellow" } },
                    "yellow": { "on": { "TIMER": "green" } },
                    "green": { "on": { "TIMER": "red" } }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(def.len(), 4);
        match &def.node(def.root()).kind {
            StateKind::Compound { initial } => assert_eq!(def.dotted_path(*initial), "red"),
            _ => panic!("expected compound root"),
        }
    }

    #[test]
    fn rejects_parallel_with_initial() {
        let err = parse_definition(
            r#"{
                "type": "parallel",
                "initial": "a",
                "states": { "a": {}, "b": {} }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, StatechartError::MalformedDefinition { .. }));
    }

    #[test]
    fn rejects_unresolvable_target() {
        let err = parse_definition(
            r#"{
                "initial": "a",
                "states": {
                    "a": { "on": { "GO": "b.c.d" } },
                    "b": { "states": { "c": {} } }
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, StatechartError::MalformedDefinition { .. }));
    }

    #[test]
    fn defaults_initial_to_first_non_history_child() {
        let def = parse_definition(
            r#"{
                "states": {
                    "a": {},
                    "b": {}
                }
            }"#,
        )
        .unwrap();
        match &def.node(def.root()).kind {
            StateKind::Compound { initial } => assert_eq!(def.dotted_path(*initial), "a"),
            _ => panic!("expected compound root"),
        }
    }
}
