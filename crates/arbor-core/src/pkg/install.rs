//! Install, prune and dedupe entry points.
//!
//! Each run reads the installed tree from disk, derives the ideal tree,
//! diffs the two and executes the resulting plan. Runs sharing an
//! [`InstallGate`] never write the same package directory at the same time.

use super::diff::{diff_trees, sort_actions, Action};
use super::disk;
use super::error::{PkgError, Warning};
use super::exec::{Executor, InstallGate};
use super::options::InstallOptions;
use super::plan::{decompose, filter_invalid_actions};
use super::shrinkwrap::{Shrinkwrap, PACKAGE_LOCK_NAME};
use super::source::{PackageSource, ScriptRunner};
use super::spec::PackageSpec;
use super::tree::builder::prune_failed;
use super::tree::logical::{extraneous, prune_extraneous};
use super::tree::{hoist_children, NodeId, SavedDep, Tree, TreeBuilder};
use super::validate::{check_peer_invalid, Platform};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Schema version of [`InstallReport`].
pub const INSTALL_REPORT_SCHEMA_VERSION: u32 = 1;

/// One package in an [`InstallReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub version: String,
    /// Tree location, e.g. `/a/b`.
    pub path: String,
    /// Previous version for updates, previous location for moves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Summary of one install, prune or dedupe run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub schema_version: u32,
    pub added: Vec<ReportEntry>,
    pub updated: Vec<ReportEntry>,
    pub moved: Vec<ReportEntry>,
    pub removed: Vec<ReportEntry>,
    /// Optional packages that failed and were left out.
    pub failed: Vec<ReportEntry>,
    pub warnings: Vec<Warning>,
    pub dry_run: bool,
    pub elapsed_ms: u64,
}

impl Default for InstallReport {
    fn default() -> Self {
        Self {
            schema_version: INSTALL_REPORT_SCHEMA_VERSION,
            added: Vec::new(),
            updated: Vec::new(),
            moved: Vec::new(),
            removed: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            dry_run: false,
            elapsed_ms: 0,
        }
    }
}

impl InstallReport {
    /// Whether the run changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.moved.is_empty()
            && self.removed.is_empty()
    }

    fn record(&mut self, old: &Tree, new: &Tree, actions: &[Action], failed: &HashSet<NodeId>) {
        let entry = |tree: &Tree, id: NodeId, from: Option<String>| {
            let node = tree.node(id);
            ReportEntry {
                name: node.name.clone(),
                version: node.version().to_string(),
                path: tree.location(id),
                from,
            }
        };
        for action in actions {
            if action.node().is_some_and(|n| failed.contains(&n)) {
                continue;
            }
            match action {
                Action::Add(n) => self.added.push(entry(new, *n, None)),
                Action::Update { node, old: prev } | Action::UpdateLinked { node, old: prev } => {
                    let from = Some(old.node(*prev).version().to_string());
                    self.updated.push(entry(new, *node, from));
                }
                Action::Move { node, old: prev, .. } => {
                    let from = Some(old.location(*prev));
                    self.moved.push(entry(new, *node, from));
                }
                Action::Remove(prev) => self.removed.push(entry(old, *prev, None)),
            }
        }
        for id in failed {
            self.failed.push(entry(new, *id, None));
        }
        self.failed.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// Drives whole runs against a project directory.
pub struct Installer<S, R> {
    source: S,
    runner: R,
    opts: InstallOptions,
    platform: Platform,
    gate: Arc<InstallGate>,
}

impl<S: PackageSource, R: ScriptRunner> Installer<S, R> {
    #[must_use]
    pub fn new(source: S, runner: R, opts: InstallOptions) -> Self {
        Self {
            source,
            runner,
            opts,
            platform: Platform::detect(),
            gate: Arc::new(InstallGate::new()),
        }
    }

    /// Check engines and `os`/`cpu` against `platform` instead of the host.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Share a gate with other installers in this process.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<InstallGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn options(&self) -> &InstallOptions {
        &self.opts
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    #[must_use]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Install the project at `dir`, plus the packages named in `args`.
    ///
    /// # Errors
    /// Returns an error if an argument is not a valid spec, resolution fails
    /// for a required package, or a required step fails (after rollback).
    pub async fn install(&self, dir: &Path, args: &[String]) -> Result<InstallReport, PkgError> {
        let started = Instant::now();
        let specs = args
            .iter()
            .map(|a| PackageSpec::parse(a))
            .collect::<Result<Vec<_>, _>>()?;

        let old = disk::load_tree(dir)?;
        let root_dir = old.node(old.root()).path.clone();
        let mut ideal = old.clone();

        let lock = if self.opts.lockfile {
            Shrinkwrap::read(&root_dir)?
        } else {
            None
        };
        if let Some((doc, path)) = &lock {
            debug!(path = %path.display(), entries = doc.dependencies.len(), "using lockfile");
            let root = ideal.root();
            ideal.node_mut(root).shrinkwrap = Some(doc.dependencies.clone());
        }

        let scratch = tempfile::Builder::new()
            .prefix(".arbor-")
            .tempdir_in(&root_dir)
            .map_err(|e| PkgError::io_at(&root_dir, &e))?;
        let outcome = TreeBuilder::new(&self.source, &self.opts, &self.platform, scratch.path())
            .build(&mut ideal, &specs)
            .await?;

        let lock_path = lock.map(|(_, path)| path);
        let report = self
            .reconcile(&root_dir, old, ideal, &outcome.saved, lock_path, started)
            .await?;
        drop(scratch);
        Ok(report)
    }

    /// Remove extraneous packages, or only those named in `names`.
    ///
    /// With `production` set, dev-only packages go too.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be read or a removal fails.
    pub async fn prune(&self, dir: &Path, names: &[String]) -> Result<InstallReport, PkgError> {
        let started = Instant::now();
        let old = disk::load_tree(dir)?;
        let root_dir = old.node(old.root()).path.clone();
        let mut ideal = old.clone();

        let mut doomed = extraneous(&ideal);
        if self.opts.production {
            doomed.extend(ideal.iter().filter(|n| n.dev_only && !n.is_top).map(|n| n.id));
        }
        if !names.is_empty() {
            doomed.retain(|id| names.contains(&ideal.node(*id).name));
        }
        for id in doomed {
            if !ideal.node(id).removed {
                ideal.remove_subtree(id);
            }
        }

        self.reconcile(&root_dir, old, ideal, &[], existing_lock(&root_dir), started)
            .await
    }

    /// Hoist duplicated packages as high as their requirers allow.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be read or a step fails.
    pub async fn dedupe(&self, dir: &Path) -> Result<InstallReport, PkgError> {
        let started = Instant::now();
        let old = disk::load_tree(dir)?;
        let root_dir = old.node(old.root()).path.clone();
        let mut ideal = old.clone();

        let hoisted = hoist_children(&mut ideal, &self.opts);
        debug!(
            moved = hoisted.moved.len(),
            removed = hoisted.removed.len(),
            "hoisted"
        );
        prune_extraneous(&mut ideal);

        self.reconcile(&root_dir, old, ideal, &[], existing_lock(&root_dir), started)
            .await
    }

    async fn reconcile(
        &self,
        root_dir: &Path,
        mut old: Tree,
        mut ideal: Tree,
        saved: &[SavedDep],
        lock_path: Option<PathBuf>,
        started: Instant,
    ) -> Result<InstallReport, PkgError> {
        let mut report = InstallReport {
            dry_run: self.opts.dry_run,
            ..InstallReport::default()
        };
        let (mut actions, mut warnings) = self.actions(&old, &ideal);

        if self.opts.dry_run {
            report.record(&old, &ideal, &actions, &HashSet::new());
            report.warnings = ideal.warnings.clone();
            report.warnings.extend(warnings);
            report.elapsed_ms = elapsed_ms(started);
            return Ok(report);
        }

        let guard = self
            .gate
            .acquire_planned(gate_pairs(&old, &ideal, &actions), || {
                // Another run finished in between; plan against what it left.
                old = disk::load_tree(root_dir)?;
                (actions, warnings) = self.actions(&old, &ideal);
                Ok::<_, PkgError>(gate_pairs(&old, &ideal, &actions))
            })
            .await?;

        let plan = decompose(&ideal, &actions, &self.opts);
        debug!(actions = actions.len(), steps = plan.len(), "executing plan");
        let outcome = Executor::new(&self.source, &self.runner, &self.opts, &self.platform)
            .execute(&mut ideal, &old, &plan)
            .await?;

        let failed: HashSet<NodeId> = outcome.failed.iter().copied().collect();
        report.record(&old, &ideal, &actions, &failed);
        prune_failed(&mut ideal);
        if guard.waited() {
            warnings.extend(check_peer_invalid(&ideal));
        }
        drop(guard);

        if self.opts.saves() && !saved.is_empty() {
            save_to_manifest(root_dir, saved)?;
        }
        if self.opts.lockfile {
            let path = lock_path.unwrap_or_else(|| root_dir.join(PACKAGE_LOCK_NAME));
            Shrinkwrap::from_tree(&ideal).write_to(&path)?;
        }

        report.warnings = std::mem::take(&mut ideal.warnings);
        report.warnings.extend(warnings);
        report.warnings.extend(outcome.warnings);
        report.elapsed_ms = elapsed_ms(started);
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            moved = report.moved.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed_ms,
            "install complete"
        );
        Ok(report)
    }

    fn actions(&self, old: &Tree, ideal: &Tree) -> (Vec<Action>, Vec<Warning>) {
        let actions = diff_trees(old, ideal);
        let (actions, warnings) = filter_invalid_actions(old, ideal, actions);
        (sort_actions(ideal, actions), warnings)
    }
}

fn existing_lock(root_dir: &Path) -> Option<PathBuf> {
    Shrinkwrap::read(root_dir).ok().flatten().map(|(_, path)| path)
}

/// `(name, directory)` pairs the actions will write.
fn gate_pairs(old: &Tree, ideal: &Tree, actions: &[Action]) -> Vec<(String, PathBuf)> {
    actions
        .iter()
        .map(|action| match action.node() {
            Some(n) => {
                let node = ideal.node(n);
                (node.name.clone(), node.path.clone())
            }
            None => {
                let node = old.node(action.old().unwrap_or_else(|| old.root()));
                (node.name.clone(), node.path.clone())
            }
        })
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

const DEP_SECTIONS: [&str; 3] = ["dependencies", "devDependencies", "optionalDependencies"];

/// Record saved specs in `package.json`, keeping every other key as it was.
///
/// A name is listed in exactly one section afterwards; each touched section
/// is sorted by name.
fn save_to_manifest(dir: &Path, saved: &[SavedDep]) -> Result<(), PkgError> {
    let path = dir.join("package.json");
    let mut doc: Value = match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| PkgError::manifest(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(e) => return Err(PkgError::io_at(&path, &e)),
    };
    let Some(obj) = doc.as_object_mut() else {
        return Err(PkgError::manifest(format!(
            "{} does not contain a JSON object",
            path.display()
        )));
    };

    for dep in saved {
        for section in DEP_SECTIONS {
            if section == dep.section {
                continue;
            }
            if let Some(Value::Object(deps)) = obj.get_mut(section) {
                deps.remove(&dep.name);
            }
        }
        let section = obj
            .entry(dep.section)
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(deps) = section {
            deps.insert(dep.name.clone(), Value::String(dep.spec.clone()));
            let mut sorted: Vec<(String, Value)> = std::mem::take(deps).into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            deps.extend(sorted);
        }
    }

    let mut out = serde_json::to_string_pretty(&doc)?;
    out.push('\n');
    arbor_util::fs::atomic_write(&path, out.as_bytes()).map_err(|e| PkgError::io_at(&path, &e))
}
