//! Decomposing actions into primitive steps.

use super::diff::Action;
use super::error::{warning_codes, Warning};
use super::options::InstallOptions;
use super::tree::{NodeId, Tree};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Primitive steps, in the order their phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Fetch,
    Extract,
    Move,
    Preinstall,
    Build,
    Install,
    Postinstall,
    Finalize,
    UpdateLinked,
    RefreshMetadata,
    Unbuild,
    Remove,
}

impl StepKind {
    /// Every kind in phase order.
    pub const PHASES: [StepKind; 12] = [
        Self::Fetch,
        Self::Extract,
        Self::Move,
        Self::Preinstall,
        Self::Build,
        Self::Install,
        Self::Postinstall,
        Self::Finalize,
        Self::UpdateLinked,
        Self::RefreshMetadata,
        Self::Unbuild,
        Self::Remove,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Move => "move",
            Self::Preinstall => "preinstall",
            Self::Build => "build",
            Self::Install => "install",
            Self::Postinstall => "postinstall",
            Self::Finalize => "finalize",
            Self::UpdateLinked => "update-linked",
            Self::RefreshMetadata => "refresh-metadata",
            Self::Unbuild => "unbuild",
            Self::Remove => "remove",
        }
    }

    /// Whether steps of this kind may run concurrently with each other.
    #[must_use]
    pub fn is_parallel(self) -> bool {
        matches!(
            self,
            Self::Fetch | Self::Extract | Self::Preinstall | Self::RefreshMetadata
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tree a step's node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A node of the ideal tree.
    New(NodeId),
    /// A node of the installed tree.
    Old(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
    pub kind: StepKind,
    pub target: Target,
}

/// Ordered, duplicate-free steps for one run.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Step>,
    seen: HashSet<Step>,
    /// Previous location of every moved node.
    pub moved_from: BTreeMap<NodeId, PathBuf>,
}

impl Plan {
    pub(crate) fn push(&mut self, kind: StepKind, target: Target) {
        let step = Step { kind, target };
        if self.seen.insert(step) {
            self.steps.push(step);
        }
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps of one kind, in plan order.
    pub fn phase(&self, kind: StepKind) -> impl Iterator<Item = Step> + '_ {
        self.steps.iter().copied().filter(move |s| s.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Expand sorted actions into a plan.
#[must_use]
pub fn decompose(new: &Tree, actions: &[Action], opts: &InstallOptions) -> Plan {
    let mut plan = Plan::default();
    for action in actions {
        match action {
            Action::Add(node) => add_steps(&mut plan, new, *node, opts),
            Action::Update { node, old } => {
                plan.push(StepKind::Unbuild, Target::Old(*old));
                plan.push(StepKind::Remove, Target::Old(*old));
                add_steps(&mut plan, new, *node, opts);
            }
            Action::UpdateLinked { node, .. } => {
                plan.push(StepKind::UpdateLinked, Target::New(*node));
            }
            Action::Move { node, from, .. } => {
                plan.moved_from.insert(*node, from.clone());
                let target = Target::New(*node);
                for kind in [
                    StepKind::Move,
                    StepKind::Build,
                    StepKind::Install,
                    StepKind::Postinstall,
                    StepKind::RefreshMetadata,
                ] {
                    plan.push(kind, target);
                }
            }
            Action::Remove(old) => {
                plan.push(StepKind::Unbuild, Target::Old(*old));
                plan.push(StepKind::Remove, Target::Old(*old));
            }
        }
    }
    plan
}

fn add_steps(plan: &mut Plan, new: &Tree, id: NodeId, opts: &InstallOptions) {
    let node = new.node(id);
    let target = Target::New(id);
    let bundled = node.from_bundle.is_some();

    if let Some(bundler) = node.from_bundle {
        plan.push(StepKind::Fetch, Target::New(bundler));
        plan.push(StepKind::Extract, Target::New(bundler));
    } else if !node.is_link {
        plan.push(StepKind::Fetch, target);
        plan.push(StepKind::Extract, target);
    }
    if !bundled || opts.rebuild_bundle {
        for kind in [
            StepKind::Preinstall,
            StepKind::Build,
            StepKind::Install,
            StepKind::Postinstall,
        ] {
            plan.push(kind, target);
        }
    }
    if !(bundled && node.is_link) {
        plan.push(StepKind::Finalize, target);
    }
    plan.push(StepKind::RefreshMetadata, target);
}

/// Drop actions on packages that live inside a symlinked package.
///
/// That content belongs to the link target. A warning is recorded unless the
/// enclosing package is itself being removed.
#[must_use]
pub fn filter_invalid_actions(
    old: &Tree,
    new: &Tree,
    actions: Vec<Action>,
) -> (Vec<Action>, Vec<Warning>) {
    let removing: HashSet<NodeId> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Remove(old) | Action::Update { old, .. } => Some(*old),
            _ => None,
        })
        .collect();

    let mut kept = Vec::with_capacity(actions.len());
    let mut warnings = Vec::new();
    for action in actions {
        let (tree, id) = match action.node() {
            Some(id) => (new, id),
            None => match action.old() {
                Some(id) => (old, id),
                None => {
                    kept.push(action);
                    continue;
                }
            },
        };
        let node = tree.node(id);
        let parent_is_link = node.parent.is_some_and(|p| tree.node(p).is_link);
        if !node.is_in_link && !parent_is_link {
            kept.push(action);
            continue;
        }

        let parent_removed = std::ptr::eq(tree, old)
            && node.parent.is_some_and(|p| removing.contains(&p));
        if !parent_removed {
            let location = tree.location(id);
            warn!(action = %action, path = %location, "skipping action inside a linked package");
            warnings.push(Warning::new(
                warning_codes::SKIPPED,
                format!(
                    "Module is inside a symlinked module: not running {action} {}",
                    node.id_string()
                ),
                location,
            ));
        }
    }
    (kept, warnings)
}
