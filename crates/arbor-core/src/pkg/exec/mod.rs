//! Running a plan against the filesystem.
//!
//! Phases run in [`StepKind::PHASES`] order. Steps of a parallel phase run
//! concurrently up to the configured limit; their results are applied one at
//! a time so the tree and the journal only ever see serial updates.
//!
//! A failing step marks its node failed and walks the failure up the
//! requirers. If it stays below an optional edge the node's own changes are
//! undone and the run continues; otherwise every recorded change is undone
//! and the error is returned.

pub mod gate;
pub mod rollback;
mod steps;

pub use gate::{GateGuard, InstallGate};
pub use rollback::{Journal, Undo};

use super::error::{warning_codes, PkgError, Warning};
use super::metadata;
use super::options::InstallOptions;
use super::plan::{Plan, Step, StepKind, Target};
use super::source::{LifecycleStage, PackageSource, ScriptOptions, ScriptRunner};
use super::tree::builder::propagate_failure;
use super::tree::logical::reachable_past_failures;
use super::tree::{NodeId, Tree};
use super::validate::{gate_node, Platform};
use futures::future::LocalBoxFuture;
use futures::{stream, FutureExt, StreamExt};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// What a run left behind besides the filesystem changes.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    /// Ideal-tree nodes that failed and were rolled back.
    pub failed: Vec<NodeId>,
    pub warnings: Vec<Warning>,
}

/// Applies a [`Plan`] using the given collaborators.
pub struct Executor<'a, S, R> {
    source: &'a S,
    runner: &'a R,
    opts: &'a InstallOptions,
    platform: &'a Platform,
}

/// Mutable state of one run.
struct Run {
    /// Extraction targets, set-aside directories and trash.
    staging: TempDir,
    /// `node_modules` of the root; empty directories are pruned up to here.
    modules: PathBuf,
    /// Ideal-tree nodes with at least one step in the plan.
    planned: HashSet<NodeId>,
    extracted: HashSet<NodeId>,
    /// Nodes whose content sits at its final path.
    finalized: HashSet<NodeId>,
    gated: HashSet<NodeId>,
    /// Final path → where the previous occupant was set aside.
    superseded: HashMap<PathBuf, PathBuf>,
    /// Paths whose previous occupant was restored after a failure.
    kept: HashSet<PathBuf>,
    journal: Journal,
    outcome: ExecOutcome,
    counter: usize,
}

impl Run {
    fn scratch_path(&mut self, label: &str) -> PathBuf {
        self.counter += 1;
        self.staging.path().join(format!("{label}-{}", self.counter))
    }

    fn extract_dir(&self, id: NodeId) -> PathBuf {
        self.staging.path().join(format!("pkg-{}", id.0))
    }
}

type Job<'f> = LocalBoxFuture<'f, (NodeId, Result<Option<Undo>, PkgError>)>;

impl<'a, S: PackageSource, R: ScriptRunner> Executor<'a, S, R> {
    pub fn new(
        source: &'a S,
        runner: &'a R,
        opts: &'a InstallOptions,
        platform: &'a Platform,
    ) -> Self {
        Self {
            source,
            runner,
            opts,
            platform,
        }
    }

    /// Execute `plan`, which turns `old` (what is on disk) into `new`.
    ///
    /// Nodes of `new` that fail below an optional edge are marked `failed`
    /// and listed in the outcome.
    ///
    /// # Errors
    /// Returns the first failure that reaches the root or a requested package,
    /// after undoing every change made so far.
    pub async fn execute(
        &self,
        new: &mut Tree,
        old: &Tree,
        plan: &Plan,
    ) -> Result<ExecOutcome, PkgError> {
        if plan.is_empty() {
            return Ok(ExecOutcome::default());
        }

        let modules = new.node(new.root()).path.join("node_modules");
        std::fs::create_dir_all(&modules).map_err(|e| PkgError::io_at(&modules, &e))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&modules)
            .map_err(|e| PkgError::io_at(&modules, &e))?;

        let mut run = Run {
            staging,
            modules,
            planned: plan
                .steps()
                .iter()
                .filter_map(|s| match s.target {
                    Target::New(id) => Some(id),
                    Target::Old(_) => None,
                })
                .collect(),
            extracted: HashSet::new(),
            finalized: HashSet::new(),
            gated: HashSet::new(),
            superseded: HashMap::new(),
            kept: HashSet::new(),
            journal: Journal::new(),
            outcome: ExecOutcome::default(),
            counter: 0,
        };

        for kind in StepKind::PHASES {
            let mut steps: Vec<Step> = plan.phase(kind).collect();
            if steps.is_empty() {
                continue;
            }
            debug!(phase = %kind, steps = steps.len(), "running phase");

            if kind.is_parallel() {
                self.run_parallel(&mut run, new, kind, &steps).await?;
                continue;
            }
            if kind == StepKind::Remove {
                steps.sort_by_key(|step| match step.target {
                    Target::Old(id) => Reverse(old.depth(id)),
                    Target::New(_) => Reverse(0),
                });
            }
            for step in steps {
                self.run_serial(&mut run, new, old, plan, step).await?;
            }
        }

        let Run {
            journal, outcome, ..
        } = run;
        journal.commit();
        info!(
            steps = plan.len(),
            failed = outcome.failed.len(),
            "plan executed"
        );
        Ok(outcome)
    }

    async fn run_parallel(
        &self,
        run: &mut Run,
        new: &mut Tree,
        kind: StepKind,
        steps: &[Step],
    ) -> Result<(), PkgError> {
        let mut jobs: Vec<Job<'a>> = Vec::with_capacity(steps.len());
        for step in steps {
            let Target::New(id) = step.target else {
                continue;
            };
            if !self.prepare(run, new, id, kind)? {
                continue;
            }
            if let Some(job) = self.job(run, new, kind, id) {
                jobs.push(job);
            }
        }

        let mut results: Vec<_> = stream::iter(jobs)
            .buffer_unordered(self.opts.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(id, _)| *id);

        // Journal every completed change before any failure can roll back.
        let mut done = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (id, result) in results {
            match result {
                Ok(undo) => {
                    if kind == StepKind::Extract {
                        run.extracted.insert(id);
                    }
                    if let Some(undo) = undo {
                        run.journal.record(Target::New(id), undo);
                    }
                    done.push(id);
                }
                Err(e) => errors.push((id, e)),
            }
        }
        for (id, e) in errors {
            self.node_failed(run, new, id, kind, e)?;
        }
        for id in done {
            // A sibling's failure may have taken this node down with it.
            if skipped(new, id) {
                run.journal.rollback_node(Target::New(id));
            }
        }
        Ok(())
    }

    fn job(&self, run: &mut Run, tree: &Tree, kind: StepKind, id: NodeId) -> Option<Job<'a>> {
        let node = tree.node(id);
        let source = self.source;
        let runner = self.runner;
        match kind {
            StepKind::Fetch => {
                if node.is_link || node.staged.is_some() {
                    return None;
                }
                let pkg = node.package.clone();
                Some(async move { (id, source.prefetch(&pkg).await.map(|()| None)) }.boxed_local())
            }
            StepKind::Extract => {
                if node.is_link || node.staged.is_some() || node.from_bundle.is_some() {
                    return None;
                }
                let pkg = node.package.clone();
                let dest = run.extract_dir(id);
                Some(
                    async move { (id, source.fetch_and_extract(&pkg, &dest).await.map(|()| None)) }
                        .boxed_local(),
                )
            }
            StepKind::Preinstall => {
                if self.opts.ignore_scripts {
                    return None;
                }
                let pkg = node.package.clone();
                let dir = steps::content_dir(run, tree, id);
                Some(
                    async move {
                        let result = runner
                            .run(&pkg, LifecycleStage::Preinstall, &dir, &ScriptOptions::default())
                            .await;
                        (id, result.map(|()| None))
                    }
                    .boxed_local(),
                )
            }
            StepKind::RefreshMetadata => {
                if node.is_link {
                    return None;
                }
                // Journaled at write time; an earlier node of this phase may fail later.
                let dir = steps::content_dir(run, tree, id);
                let result = metadata::refresh_metadata(tree, id, &dir).map(|previous| {
                    run.journal.record(
                        Target::New(id),
                        Undo::RestoreFile {
                            path: dir.join("package.json"),
                            bytes: previous,
                        },
                    );
                    None::<Undo>
                });
                Some(async move { (id, result) }.boxed_local())
            }
            _ => None,
        }
    }

    async fn run_serial(
        &self,
        run: &mut Run,
        new: &mut Tree,
        old: &Tree,
        plan: &Plan,
        step: Step,
    ) -> Result<(), PkgError> {
        match step.target {
            Target::New(id) => {
                if !self.prepare(run, new, id, step.kind)? {
                    return Ok(());
                }
                let result = match step.kind {
                    StepKind::Move => steps::move_node(run, new, plan, id),
                    StepKind::Build => {
                        if plan.moved_from.contains_key(&id) {
                            steps::link_node_bins(run, new, id)
                        } else {
                            Ok(())
                        }
                    }
                    StepKind::Install => self.lifecycle(run, new, id, LifecycleStage::Install).await,
                    StepKind::Postinstall => {
                        self.lifecycle(run, new, id, LifecycleStage::Postinstall).await
                    }
                    StepKind::Finalize => steps::finalize(run, new, id),
                    StepKind::UpdateLinked => steps::update_linked(run, new, id),
                    StepKind::Fetch
                    | StepKind::Extract
                    | StepKind::Preinstall
                    | StepKind::RefreshMetadata
                    | StepKind::Unbuild
                    | StepKind::Remove => Ok(()),
                };
                if let Err(e) = result {
                    self.node_failed(run, new, id, step.kind, e)?;
                }
                Ok(())
            }
            Target::Old(id) => match step.kind {
                StepKind::Unbuild => {
                    steps::unbuild(run, old, id, self.runner, self.opts).await;
                    Ok(())
                }
                StepKind::Remove => steps::remove(run, old, id).map_err(|e| {
                    warn!(path = %old.node(id).path.display(), error = %e, "remove failed, rolling back");
                    run.journal.rollback_all();
                    e
                }),
                _ => Ok(()),
            },
        }
    }

    async fn lifecycle(
        &self,
        run: &Run,
        tree: &Tree,
        id: NodeId,
        stage: LifecycleStage,
    ) -> Result<(), PkgError> {
        if self.opts.ignore_scripts {
            return Ok(());
        }
        let dir = steps::content_dir(run, tree, id);
        self.runner
            .run(&tree.node(id).package, stage, &dir, &ScriptOptions::default())
            .await
    }

    /// Check installability before a node's first step. Returns whether the
    /// step should run.
    fn prepare(
        &self,
        run: &mut Run,
        new: &mut Tree,
        id: NodeId,
        kind: StepKind,
    ) -> Result<bool, PkgError> {
        if skipped(new, id) {
            return Ok(false);
        }
        if run.gated.insert(id) {
            if let Err(e) = gate_node(new, id, self.platform, self.opts) {
                self.node_failed(run, new, id, kind, e)?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn node_failed(
        &self,
        run: &mut Run,
        new: &mut Tree,
        id: NodeId,
        kind: StepKind,
        err: PkgError,
    ) -> Result<(), PkgError> {
        let label = new.node(id).id_string();
        let location = new.location(id);
        warn!(node = %label, step = %kind, error = %err, "step failed");

        let before: HashSet<NodeId> = new.iter().filter(|n| n.failed).map(|n| n.id).collect();
        let live_before = reachable_past_failures(new);
        if propagate_failure(new, id) {
            run.journal.rollback_all();
            return Err(err);
        }

        // Anything this run was installing only for the failed nodes goes too.
        let live_after = reachable_past_failures(new);
        let orphans: Vec<NodeId> = live_before
            .difference(&live_after)
            .copied()
            .filter(|n| run.planned.contains(n))
            .filter(|n| {
                let node = new.node(*n);
                !node.failed && !node.is_top && !node.is_in_link
            })
            .collect();
        for orphan in orphans {
            debug!(node = %new.node(orphan).id_string(), "dropping dependency of failed node");
            new.node_mut(orphan).failed = true;
        }

        let newly: Vec<NodeId> = new
            .iter()
            .filter(|n| n.failed && !before.contains(&n.id))
            .map(|n| n.id)
            .collect();
        for failed in &newly {
            for n in std::iter::once(*failed).chain(new.descendants(*failed)) {
                run.journal.rollback_node(Target::New(n));
                run.finalized.remove(&n);
                // Whatever was installed at the path before stays there.
                let path = &new.node(n).path;
                run.superseded.remove(path);
                run.kept.insert(path.clone());
            }
        }
        run.outcome.failed.extend(newly);
        run.outcome.warnings.push(Warning::new(
            warning_codes::OPTIONAL_FAILED,
            format!("Skipping optional dependency {label} ({kind} failed): {}", err.message()),
            location,
        ));
        Ok(())
    }
}

/// Whether `id` or one of its ancestors has failed or been dropped.
fn skipped(tree: &Tree, id: NodeId) -> bool {
    tree.node(id).removed || tree.ancestry(id).iter().any(|a| tree.node(*a).failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::diff::{diff_trees, sort_actions};
    use crate::pkg::disk::load_tree;
    use crate::pkg::manifest::Manifest;
    use crate::pkg::memory::MemoryRegistry;
    use crate::pkg::plan::decompose;
    use crate::pkg::source::NoScripts;
    use crate::pkg::tree::TreeBuilder;
    use serde_json::Value;
    use std::path::Path;
    use tempfile::tempdir;

    /// Fails every install-time script of one package.
    struct FailingScripts(&'static str);

    impl ScriptRunner for FailingScripts {
        async fn run(
            &self,
            manifest: &Manifest,
            stage: LifecycleStage,
            _dir: &Path,
            _opts: &ScriptOptions,
        ) -> Result<(), PkgError> {
            if manifest.name.as_deref() == Some(self.0) && stage == LifecycleStage::Postinstall {
                return Err(PkgError::script(self.0, stage.as_str(), "exit code 1"));
            }
            Ok(())
        }
    }

    fn platform() -> Platform {
        Platform::new("linux", "x64", Some("20.0.0"))
    }

    async fn install<R: ScriptRunner>(
        dir: &Path,
        root: &Manifest,
        reg: &MemoryRegistry,
        runner: &R,
    ) -> Result<(Tree, ExecOutcome), PkgError> {
        std::fs::write(dir.join("package.json"), serde_json::to_string_pretty(root)?).unwrap();
        let old = load_tree(dir)?;
        let mut new = old.clone();
        let opts = InstallOptions::default();
        let platform = platform();
        let scratch = tempdir().unwrap();
        TreeBuilder::new(reg, &opts, &platform, scratch.path())
            .build(&mut new, &[])
            .await?;

        let actions = sort_actions(&new, diff_trees(&old, &new));
        let plan = decompose(&new, &actions, &opts);
        let outcome = Executor::new(reg, runner, &opts, &platform)
            .execute(&mut new, &old, &plan)
            .await?;
        Ok((new, outcome))
    }

    fn installed_version(dir: &Path, rel: &str) -> Option<String> {
        let text = std::fs::read_to_string(dir.join(rel).join("package.json")).ok()?;
        let value: Value = serde_json::from_str(&text).ok()?;
        value["version"].as_str().map(String::from)
    }

    fn registry() -> MemoryRegistry {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("c", "^1.0.0"))
            .publish(Manifest::new("a", "2.0.0"))
            .publish(Manifest::new("b", "1.0.0").with_dep("c", "^2.0.0"))
            .publish(Manifest::new("c", "1.0.0"))
            .publish(Manifest::new("c", "2.0.0"))
            .publish(Manifest::new("opt", "1.0.0"));
        reg
    }

    #[tokio::test]
    async fn test_fresh_install_lays_out_tree() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let root = Manifest::new("root", "1.0.0")
            .with_dep("a", "^1.0.0")
            .with_dep("b", "^1.0.0");

        let (_, outcome) = install(dir.path(), &root, &reg, &NoScripts).await.unwrap();
        assert!(outcome.failed.is_empty());

        assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));
        assert_eq!(installed_version(dir.path(), "node_modules/c").as_deref(), Some("1.0.0"));
        assert_eq!(
            installed_version(dir.path(), "node_modules/b/node_modules/c").as_deref(),
            Some("2.0.0")
        );

        let meta: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("node_modules/b/node_modules/c/package.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(meta["_location"], "/b/c");
        assert_eq!(meta["_requiredBy"], serde_json::json!(["/b"]));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("node_modules"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_update_replaces_and_removes() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let first = Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0");
        install(dir.path(), &first, &reg, &NoScripts).await.unwrap();
        assert!(dir.path().join("node_modules/c").exists());

        let second = Manifest::new("root", "1.0.0").with_dep("a", "^2.0.0");
        install(dir.path(), &second, &reg, &NoScripts).await.unwrap();
        assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("2.0.0"));
        assert!(!dir.path().join("node_modules/c").exists());
    }

    #[tokio::test]
    async fn test_optional_script_failure_is_contained() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let root = Manifest::new("root", "1.0.0")
            .with_dep("a", "^1.0.0")
            .with_optional_dep("opt", "^1.0.0");

        let (new, outcome) = install(dir.path(), &root, &reg, &FailingScripts("opt"))
            .await
            .unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert!(new.node(outcome.failed[0]).failed);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::OPTIONAL_FAILED));
        assert!(!dir.path().join("node_modules/opt").exists());
        assert!(dir.path().join("node_modules/a").exists());
    }

    #[tokio::test]
    async fn test_failed_optional_update_keeps_installed_copy() {
        let dir = tempdir().unwrap();
        let mut reg = registry();
        reg.publish(Manifest::new("opt", "2.0.0"));
        let first = Manifest::new("root", "1.0.0").with_optional_dep("opt", "^1.0.0");
        install(dir.path(), &first, &reg, &NoScripts).await.unwrap();

        let second = Manifest::new("root", "1.0.0").with_optional_dep("opt", "^2.0.0");
        let (_, outcome) = install(dir.path(), &second, &reg, &FailingScripts("opt"))
            .await
            .unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(installed_version(dir.path(), "node_modules/opt").as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_required_failure_leaves_disk_untouched() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let first = Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0");
        install(dir.path(), &first, &reg, &NoScripts).await.unwrap();

        let second = Manifest::new("root", "1.0.0")
            .with_dep("a", "^2.0.0")
            .with_dep("b", "^1.0.0");
        let err = install(dir.path(), &second, &reg, &FailingScripts("b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::ESCRIPT);
        assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));
        assert!(dir.path().join("node_modules/c").exists());
        assert!(!dir.path().join("node_modules/b").exists());
    }

    #[tokio::test]
    async fn test_fatal_refresh_failure_restores_sibling_metadata() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let root = Manifest::new("root", "1.0.0")
            .with_dep("a", "^2.0.0")
            .with_dep("opt", "^1.0.0");
        install(dir.path(), &root, &reg, &NoScripts).await.unwrap();

        let mut new = load_tree(dir.path()).unwrap();
        let old = new.clone();
        let a = new.child_named(new.root(), "a").unwrap();
        let opt = new.child_named(new.root(), "opt").unwrap();
        // The lower id runs first in the phase; make that one fail.
        let (failing, sibling) = (a.min(opt), a.max(opt));
        let dir_of = |id: NodeId| new.node(id).path.join("package.json");
        let (failing_meta, sibling_meta) = (dir_of(failing), dir_of(sibling));

        let before = std::fs::read(&sibling_meta).unwrap();
        // A directory where package.json belongs makes the rewrite fail.
        std::fs::remove_file(&failing_meta).unwrap();
        std::fs::create_dir_all(failing_meta.join("blocker")).unwrap();
        new.node_mut(sibling).package.spec = Some("refreshed@spec".into());

        let mut plan = Plan::default();
        plan.push(StepKind::RefreshMetadata, Target::New(failing));
        plan.push(StepKind::RefreshMetadata, Target::New(sibling));
        let opts = InstallOptions::default();
        let platform = platform();
        let err = Executor::new(&reg, &NoScripts, &opts, &platform)
            .execute(&mut new, &old, &plan)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::EFS);
        assert_eq!(std::fs::read(&sibling_meta).unwrap(), before);
    }

    #[tokio::test]
    async fn test_existing_git_checkout_is_not_replaced() {
        let dir = tempdir().unwrap();
        let reg = registry();
        let checkout = dir.path().join("node_modules/c");
        std::fs::create_dir_all(checkout.join(".git")).unwrap();
        std::fs::write(
            checkout.join("package.json"),
            r#"{"name":"c","version":"0.1.0"}"#,
        )
        .unwrap();

        let root = Manifest::new("root", "1.0.0").with_dep("c", "^1.0.0");
        let err = install(dir.path(), &root, &reg, &NoScripts).await.unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::EISGIT);
        assert!(checkout.join(".git").exists());
        assert_eq!(installed_version(dir.path(), "node_modules/c").as_deref(), Some("0.1.0"));
    }
}
