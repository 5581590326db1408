//! Logical edges derived from physical placement.
//!
//! After the physical tree changes (read from disk, hoisted, pruned) the
//! `requires`/`required_by` edges are recomputed by resolving every declared
//! dependency the way Node's module lookup would.

use super::builder::{find_requirement, mark_phantoms};
use super::node::{NodeId, Tree};
use crate::pkg::spec::PackageSpec;
use std::collections::{HashSet, VecDeque};

/// Recompute `requires`, `required_by`, phantom children and missing deps.
///
/// Root `devDependencies` participate when `include_dev` is set. Packages the
/// user asked for stay required by the root.
pub fn compute_logical(tree: &mut Tree, include_dev: bool) {
    let ids: Vec<NodeId> = tree.iter().map(|n| n.id).collect();
    for id in &ids {
        let node = tree.node_mut(*id);
        node.requires.clear();
        node.required_by.clear();
        node.phantom_children.clear();
        node.missing_deps.clear();
        node.missing_dev_deps.clear();
    }

    for id in ids {
        let node = tree.node(id);
        let mut wanted: Vec<(String, String, bool)> = node
            .package
            .runtime_deps()
            .into_iter()
            .map(|(name, range)| (name, range, false))
            .collect();
        if node.is_top && include_dev {
            for (name, range) in &node.package.dev_dependencies {
                if !wanted.iter().any(|(n, _, _)| n == name) {
                    wanted.push((name.clone(), range.clone(), true));
                }
            }
        }
        let base = node.realpath.clone();
        let optional = node.package.optional_dependencies.clone();

        for (name, range, dev) in wanted {
            let found = PackageSpec::from_dep(&name, &range)
                .ok()
                .and_then(|spec| find_requirement(tree, id, &name, &spec, &base));
            match found {
                Some(dep) => {
                    tree.add_requirement(id, dep);
                    mark_phantoms(tree, id, dep);
                }
                None if optional.contains_key(&name) => {}
                None if dev => {
                    tree.node_mut(id).missing_dev_deps.insert(name, range);
                }
                None => {
                    tree.node_mut(id).missing_deps.insert(name, range);
                }
            }
        }
    }

    let root = tree.root();
    let requested: Vec<NodeId> = tree
        .iter()
        .filter(|n| n.user_required && !n.is_top)
        .map(|n| n.id)
        .collect();
    for id in requested {
        tree.add_requirement(root, id);
    }
}

/// Nodes reachable from the root and from user-requested packages.
#[must_use]
pub fn reachable(tree: &Tree) -> HashSet<NodeId> {
    let mut starts = vec![tree.root()];
    starts.extend(tree.iter().filter(|n| n.user_required).map(|n| n.id));
    walk(tree, starts, |_, _| true)
}

/// Like [`reachable`], but failed nodes neither start nor continue a walk.
#[must_use]
pub fn reachable_past_failures(tree: &Tree) -> HashSet<NodeId> {
    let mut starts = vec![tree.root()];
    starts.extend(
        tree.iter()
            .filter(|n| n.user_required && !n.failed)
            .map(|n| n.id),
    );
    walk(tree, starts, |_, to| !tree.node(to).failed)
}

fn walk(
    tree: &Tree,
    starts: Vec<NodeId>,
    follow: impl Fn(NodeId, NodeId) -> bool,
) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<NodeId> = starts.into();
    while let Some(id) = queue.pop_front() {
        if tree.node(id).removed || !seen.insert(id) {
            continue;
        }
        for dep in &tree.node(id).requires {
            if follow(id, *dep) {
                queue.push_back(*dep);
            }
        }
    }
    seen
}

/// Live nodes nothing needs.
///
/// Nodes inside a linked package belong to that package and are never
/// extraneous here. Bundled nodes are kept while their bundler is needed.
#[must_use]
pub fn extraneous(tree: &Tree) -> Vec<NodeId> {
    let keep = reachable(tree);
    tree.iter()
        .filter(|n| !n.is_top && !n.is_in_link && !keep.contains(&n.id))
        .filter(|n| n.from_bundle.map_or(true, |b| !keep.contains(&b)))
        .map(|n| n.id)
        .collect()
}

/// Remove every extraneous node and return the removed ids.
pub fn prune_extraneous(tree: &mut Tree) -> Vec<NodeId> {
    let mut pruned = Vec::new();
    for id in extraneous(tree) {
        if !tree.node(id).removed {
            tree.remove_subtree(id);
            pruned.push(id);
        }
    }
    pruned
}

/// Set `dev_only` and `optional` on every node from the current edges.
///
/// A node is dev-only when no path from the root reaches it without starting
/// at a root `devDependencies` entry, and optional when every path crosses an
/// `optionalDependencies` edge.
pub fn mark_flags(tree: &mut Tree) {
    let root = tree.root();
    let root_pkg = tree.node(root).package.clone();
    let dev_edge = |from: NodeId, to: NodeId| {
        if from != root {
            return false;
        }
        let name = &tree.node(to).name;
        root_pkg.dev_dependencies.contains_key(name) && !root_pkg.runtime_deps().contains_key(name)
    };

    let mut prod_starts = vec![root];
    prod_starts.extend(
        tree.iter()
            .filter(|n| n.user_required && !dev_edge(root, n.id))
            .map(|n| n.id),
    );
    let prod = walk(tree, prod_starts, |from, to| !dev_edge(from, to));

    let all = reachable(tree);
    let required = walk(tree, vec![root], |from, to| {
        !tree.node(from).package.is_optional_dep(&tree.node(to).name)
    });

    let bundlers: Vec<(NodeId, Option<NodeId>)> =
        tree.iter().map(|n| (n.id, n.from_bundle)).collect();
    for (id, bundler) in bundlers {
        if id == root {
            continue;
        }
        // Bundled nodes share their bundler's fate.
        let subject = bundler.filter(|b| !all.contains(&id) && all.contains(b)).unwrap_or(id);
        let dev_only = all.contains(&subject) && !prod.contains(&subject);
        let optional = all.contains(&subject) && !required.contains(&subject);
        let node = tree.node_mut(id);
        node.dev_only = dev_only;
        node.optional = optional;
    }
}
