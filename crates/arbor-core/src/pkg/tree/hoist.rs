//! Dedupe: move nested packages as high as they can go.
//!
//! Each non-top node is first checked for an equivalent copy already visible
//! from its grandparent, which makes the nested copy redundant. Otherwise it is
//! moved to the shallowest level that can take it, as long as nothing below
//! it loses a dependency by the move.

use super::builder::{earliest_installable, find_requirement};
use super::logical::compute_logical;
use super::node::{NodeId, Tree};
use crate::pkg::options::InstallOptions;
use crate::pkg::spec::PackageSpec;
use std::collections::HashSet;
use tracing::debug;

/// What a hoisting pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoistOutcome {
    pub moved: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl HoistOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.removed.is_empty()
    }
}

/// Hoist every node in `tree`, depth-first from the root.
pub fn hoist_children(tree: &mut Tree, opts: &InstallOptions) -> HoistOutcome {
    let include_dev = !opts.production;
    compute_logical(tree, include_dev);

    let mut outcome = HoistOutcome::default();
    let mut seen = HashSet::new();
    let root = tree.root();
    let mut stack: Vec<NodeId> = tree.node(root).children.iter().rev().copied().collect();

    while let Some(id) = stack.pop() {
        let node = tree.node(id);
        if node.removed || !seen.insert(id) || node.from_bundle.is_some() {
            continue;
        }
        if node.is_link {
            continue;
        }
        let Some(parent) = node.parent else {
            continue;
        };

        if !tree.node(parent).is_top && !opts.legacy_bundling {
            if let Some(better) = find_better(tree, id) {
                debug!(
                    name = %tree.node(id).name,
                    from = %tree.location(id),
                    to = %tree.location(better),
                    "dropping duplicate"
                );
                tree.remove_subtree(id);
                compute_logical(tree, include_dev);
                outcome.removed.push(id);
                continue;
            }
            if try_move(tree, opts, id, parent) {
                outcome.moved.push(id);
            }
        }

        stack.extend(tree.node(id).children.iter().rev().copied());
    }
    outcome
}

/// A node visible from the grandparent that every requirer of `id` accepts.
fn find_better(tree: &Tree, id: NodeId) -> Option<NodeId> {
    let node = tree.node(id);
    let grand = tree.node(node.parent?).parent?;

    let mut specs = Vec::new();
    for req in &node.required_by {
        let requirer = tree.node(*req);
        let range = requirer
            .package
            .runtime_deps()
            .get(&node.name)
            .or_else(|| requirer.package.dev_dependencies.get(&node.name))
            .cloned()?;
        specs.push((PackageSpec::from_dep(&node.name, &range).ok()?, requirer.realpath.clone()));
    }
    if specs.is_empty() {
        specs.push((
            PackageSpec::from_dep(&node.name, node.version()).ok()?,
            node.realpath.clone(),
        ));
    }

    let mut agreed = None;
    for (spec, base) in &specs {
        let found = find_requirement(tree, grand, &node.name, spec, base)?;
        if found == id || agreed.is_some_and(|a| a != found) {
            return None;
        }
        agreed = Some(found);
    }
    agreed
}

/// Move `id` up from `parent` if a shallower level takes it without leaving
/// anything in the tree with a new missing dependency.
fn try_move(tree: &mut Tree, opts: &InstallOptions, id: NodeId, parent: NodeId) -> bool {
    let Some(grand) = tree.node(parent).parent else {
        return false;
    };
    let pkg = tree.node(id).package.clone();
    let Some(level) = earliest_installable(tree, opts, parent, grand, &pkg) else {
        return false;
    };
    if level == parent {
        return false;
    }

    let include_dev = !opts.production;
    let before = missing_count(tree);
    tree.move_to(id, level);
    compute_logical(tree, include_dev);
    if missing_count(tree) > before {
        tree.move_to(id, parent);
        compute_logical(tree, include_dev);
        return false;
    }
    debug!(name = %tree.node(id).name, to = %tree.location(id), "hoisted");
    true
}

fn missing_count(tree: &Tree) -> usize {
    tree.iter()
        .map(|n| n.missing_deps.len() + n.missing_dev_deps.len())
        .sum()
}
