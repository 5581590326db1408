//! Diffing the installed tree against the ideal tree.
//!
//! Both trees are flattened to `location → node` maps and compared path by
//! path. The result is a list of [`Action`]s in dependency-first order.

use super::manifest::Manifest;
use super::tree::{NodeId, Tree};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

/// One change needed to turn the installed tree into the ideal tree.
///
/// `node` ids refer to the ideal tree, `old` ids to the installed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Add(NodeId),
    Update { node: NodeId, old: NodeId },
    /// A symlinked package whose link changed.
    UpdateLinked { node: NodeId, old: NodeId },
    /// Identical content already installed elsewhere.
    Move { node: NodeId, old: NodeId, from: PathBuf },
    Remove(NodeId),
}

impl Action {
    /// The ideal-tree node this action installs, if any.
    #[must_use]
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Add(node)
            | Self::Update { node, .. }
            | Self::UpdateLinked { node, .. }
            | Self::Move { node, .. } => Some(*node),
            Self::Remove(_) => None,
        }
    }

    /// The installed-tree node this action replaces or removes, if any.
    #[must_use]
    pub fn old(&self) -> Option<NodeId> {
        match self {
            Self::Add(_) => None,
            Self::Update { old, .. } | Self::UpdateLinked { old, .. } | Self::Move { old, .. } => {
                Some(*old)
            }
            Self::Remove(old) => Some(*old),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update { .. } => "update",
            Self::UpdateLinked { .. } => "update-linked",
            Self::Move { .. } => "move",
            Self::Remove(_) => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Whether two manifests describe the same installed content.
///
/// Integrities decide when both are known. Otherwise non-registry packages
/// must come from the exact same source, and registry packages compare
/// versions.
#[must_use]
pub fn pkg_are_equiv(a: &Manifest, b: &Manifest) -> bool {
    if let (Some(x), Some(y)) = (&a.integrity, &b.integrity) {
        return x == y;
    }
    if !a.is_registry_sourced() || !b.is_registry_sourced() {
        return a.spec == b.spec && a.resolved == b.resolved;
    }
    a.version == b.version
}

/// Content identity used to detect moves: `name@integrity`, or
/// `name@version` when no integrity is known.
#[must_use]
pub fn unique_id(name: &str, pkg: &Manifest) -> String {
    match &pkg.integrity {
        Some(integrity) => format!("{name}@{integrity}"),
        None => format!("{name}@{}", pkg.version_str()),
    }
}

/// Every live non-root node keyed by location, visited breadth-first.
///
/// Each node is visited once even if the tree is malformed.
#[must_use]
pub fn flatten_tree(tree: &Tree) -> BTreeMap<String, NodeId> {
    let mut flat = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([tree.root()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        for &child in &tree.node(id).children {
            if tree.node(child).removed || seen.contains(&child) {
                continue;
            }
            flat.insert(tree.location(child), child);
            queue.push_back(child);
        }
    }
    flat
}

fn is_bundle_related(tree: &Tree, id: NodeId) -> bool {
    let node = tree.node(id);
    node.from_bundle.is_some() || node.package.has_bundled()
}

/// Compute the actions turning `old` into `new`.
///
/// Packages the user asked for in this run are reinstalled even when the
/// installed copy is equivalent.
#[must_use]
pub fn diff_trees(old: &Tree, new: &Tree) -> Vec<Action> {
    let old_flat = flatten_tree(old);
    let new_flat = flatten_tree(new);

    // Old nodes whose location disappears, by content identity.
    let mut leaving: HashMap<String, Vec<(String, NodeId)>> = HashMap::new();
    for (path, &id) in &old_flat {
        if !new_flat.contains_key(path) && !is_bundle_related(old, id) {
            let node = old.node(id);
            leaving
                .entry(unique_id(&node.name, &node.package))
                .or_default()
                .push((path.clone(), id));
        }
    }

    let mut actions = Vec::new();
    let mut moved_away = HashSet::new();
    for (path, &id) in &new_flat {
        let node = new.node(id);
        match old_flat.get(path) {
            Some(&old_id) => {
                let old_node = old.node(old_id);
                if !pkg_are_equiv(&old_node.package, &node.package) {
                    actions.push(Action::Update { node: id, old: old_id });
                } else if node.is_link || old_node.is_link {
                    if node.is_link != old_node.is_link || node.realpath != old_node.realpath {
                        actions.push(Action::UpdateLinked { node: id, old: old_id });
                    }
                } else if node.user_required {
                    actions.push(Action::Update { node: id, old: old_id });
                }
            }
            None => {
                let candidate = (!is_bundle_related(new, id) && !node.is_link)
                    .then(|| leaving.get_mut(&unique_id(&node.name, &node.package)))
                    .flatten()
                    .and_then(Vec::pop);
                match candidate {
                    Some((_, old_id)) => {
                        moved_away.insert(old_id);
                        actions.push(Action::Move {
                            node: id,
                            old: old_id,
                            from: old.node(old_id).path.clone(),
                        });
                    }
                    None => actions.push(Action::Add(id)),
                }
            }
        }
    }

    // Reverse location order puts every nested package before its parent.
    for (path, &old_id) in old_flat.iter().rev() {
        if !new_flat.contains_key(path) && !moved_away.contains(&old_id) {
            actions.push(Action::Remove(old_id));
        }
    }
    actions
}

/// Order actions so every package comes before the packages that require it.
///
/// Packages required only by the root are visited first, which places them
/// last. Removals keep their deepest-first order at the end.
#[must_use]
pub fn sort_actions(new: &Tree, actions: Vec<Action>) -> Vec<Action> {
    let mut by_node: HashMap<NodeId, usize> = HashMap::new();
    for (i, action) in actions.iter().enumerate() {
        if let Some(node) = action.node() {
            by_node.entry(node).or_insert(i);
        }
    }

    let mut locations: Vec<(bool, String, usize)> = actions
        .iter()
        .enumerate()
        .filter_map(|(i, a)| {
            let node = new.node(a.node()?);
            let top_priority = node.required_by.iter().all(|r| new.node(*r).is_top);
            Some((!top_priority, new.location(node.id), i))
        })
        .collect();
    locations.sort();

    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(actions.len());
    for (_, _, start) in locations {
        let mut stack = vec![(start, false)];
        while let Some((i, expanded)) = stack.pop() {
            if expanded {
                order.push(i);
                continue;
            }
            if !visited.insert(i) {
                continue;
            }
            stack.push((i, true));
            let Some(node) = actions[i].node() else {
                continue;
            };
            let mut requirers: Vec<usize> = new
                .node(node)
                .required_by
                .iter()
                .filter_map(|r| by_node.get(r).copied())
                .filter(|j| !visited.contains(j))
                .collect();
            requirers.sort_by_key(|j| std::cmp::Reverse(new.location(actions[*j].node().unwrap_or(node))));
            stack.extend(requirers.into_iter().map(|j| (j, false)));
        }
    }
    order.reverse();

    let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();
    let mut sorted: Vec<Action> = order.into_iter().filter_map(|i| slots[i].take()).collect();
    sorted.extend(slots.into_iter().flatten());
    sorted
}
