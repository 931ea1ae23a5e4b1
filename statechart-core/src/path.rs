use crate::model::{NodeId, TreeLike};

/// Resolves a `target` string written on a transition declared on `owner`
/// (the state node carrying the `on`/`after`/history-default entry).
///
/// A leading `.` denotes a sibling of `owner`'s enclosing
/// compound; a bare identifier is first tried as such a sibling and, failing
/// that, resolved to the machine root; any other dotted path is tried first
/// as an absolute fully-qualified path and, failing that, walked segment by
/// segment from the enclosing compound.
pub fn resolve_target<T: TreeLike>(tree: &T, root: NodeId, owner: NodeId, target: &str) -> Option<NodeId> {
    let enclosing = tree.parent_of(owner).unwrap_or(root);

    if let Some(rest) = target.strip_prefix('.') {
        return resolve_relative(tree, enclosing, rest);
    }

    if !target.contains('.') {
        if let Some(child) = find_child_by_name(tree, enclosing, target) {
            return Some(child);
        }
        return Some(root);
    }

    if let Some(found) = find_by_full_path(tree, target) {
        return Some(found);
    }
    resolve_relative(tree, enclosing, target)
}

fn resolve_relative<T: TreeLike>(tree: &T, start: NodeId, path: &str) -> Option<NodeId> {
    let mut cur = start;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = find_child_by_name(tree, cur, segment)?;
    }
    Some(cur)
}

fn find_child_by_name<T: TreeLike>(tree: &T, parent: NodeId, name: &str) -> Option<NodeId> {
    tree.children_of(parent)
        .iter()
        .copied()
        .find(|&c| tree.local_name_of(c) == name)
}

fn find_by_full_path<T: TreeLike>(tree: &T, path: &str) -> Option<NodeId> {
    (0..tree.node_count())
        .map(|i| NodeId(i as u32))
        .find(|&id| tree.path_of(id) == path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_definition;

    fn traffic_light_json() -> &'static str {
        r#"{
            "id": "light",
            "initial": "red",
            "states": {
                "red": { "on": { "TIMER": "yellow" } },
                "yellow": { "on": { "TIMER": "green" } },
                "green": { "on": { "TIMER": "red" } }
            }
        }"#
    }

    #[test]
    fn bare_sibling_resolves_within_parent() {
        let def = parse_definition(traffic_light_json()).unwrap();
        let red = find_child_by_name(&def, def.root(), "red").unwrap();
        let yellow = find_child_by_name(&def, def.root(), "yellow").unwrap();
        let timer = def.events.get("TIMER").unwrap();
        let on = def.node(red).on_for(timer).unwrap();
        assert_eq!(on[0].target, Some(yellow));
    }

    #[test]
    fn unqualified_non_sibling_falls_back_to_root() {
        let json = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "on": { "GO": "nowhere" } },
                "b": {}
            }
        }"#;
        let def = parse_definition(json).unwrap();
        let a = find_child_by_name(&def, def.root(), "a").unwrap();
        let go = def.events.get("GO").unwrap();
        let on = def.node(a).on_for(go).unwrap();
        assert_eq!(on[0].target, Some(def.root()));
    }
}
