//! Filesystem work of the serial steps.

use super::rollback::{move_package_only, package_entries, Undo};
use super::Run;
use crate::pkg::error::PkgError;
use crate::pkg::link;
use crate::pkg::options::InstallOptions;
use crate::pkg::plan::{Plan, Target};
use crate::pkg::source::{LifecycleStage, ScriptOptions, ScriptRunner};
use crate::pkg::tree::{NodeId, Tree};
use arbor_util::fs::{copy_dir_all, is_empty_dir, move_dir, symlink};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the content of `id` currently lives.
pub(super) fn content_dir(run: &Run, tree: &Tree, id: NodeId) -> PathBuf {
    let node = tree.node(id);
    if node.is_link {
        return node.realpath.clone();
    }
    if run.finalized.contains(&id) {
        return node.path.clone();
    }
    if let Some(staged) = &node.staged {
        return staged.clone();
    }
    if run.extracted.contains(&id) {
        return run.extract_dir(id);
    }
    if let Some(bundler) = node.from_bundle {
        let base = content_dir(run, tree, bundler);
        if let Ok(rel) = node.path.strip_prefix(&tree.node(bundler).path) {
            return base.join(rel);
        }
    }
    node.path.clone()
}

/// Move whatever occupies `dest` into staging so it can be restored.
fn set_aside(run: &mut Run, target: Target, dest: &Path) -> Result<Option<PathBuf>, PkgError> {
    if fs::symlink_metadata(dest).is_err() {
        return Ok(None);
    }
    let backup = run.scratch_path("old");
    move_dir(dest, &backup).map_err(|e| PkgError::io_at(dest, &e))?;
    run.superseded.insert(dest.to_path_buf(), backup.clone());
    run.journal.record(
        target,
        Undo::RestoreBackup {
            dest: dest.to_path_buf(),
            backup: backup.clone(),
        },
    );
    Ok(Some(backup))
}

/// Bring back nested packages the new copy at `dest` does not have itself.
fn restore_children(backup: &Path, dest: &Path) -> Result<(), PkgError> {
    if !fs::symlink_metadata(backup).is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    let from_modules = backup.join("node_modules");
    let to_modules = dest.join("node_modules");
    let mut entries = package_entries(&from_modules).map_err(|e| PkgError::io_at(&from_modules, &e))?;
    entries.push(from_modules.join(".bin"));

    for entry in entries {
        let Ok(rel) = entry.strip_prefix(&from_modules) else {
            continue;
        };
        let target = to_modules.join(rel);
        if fs::symlink_metadata(&entry).is_ok() && fs::symlink_metadata(&target).is_err() {
            move_dir(&entry, &target).map_err(|e| PkgError::io_at(&target, &e))?;
        }
    }
    Ok(())
}

/// Remove empty directories from `dir` upward, stopping at `stop`.
fn prune_empty_parents(mut dir: &Path, stop: &Path) {
    while dir != stop && dir.starts_with(stop) {
        if !is_empty_dir(dir) || fs::remove_dir(dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}

fn refuse_git_dir(dest: &Path) -> Result<(), PkgError> {
    let is_dir = fs::symlink_metadata(dest).is_ok_and(|m| m.is_dir());
    if is_dir && dest.join(".git").exists() {
        return Err(PkgError::is_git(dest));
    }
    Ok(())
}

pub(super) fn link_node_bins(run: &mut Run, tree: &Tree, id: NodeId) -> Result<(), PkgError> {
    let node = tree.node(id);
    if node.package.bin_entries().is_empty() {
        return Ok(());
    }
    let Some(bin_dir) = link::bin_dir_for(&node.path, &node.name) else {
        return Ok(());
    };
    link::link_bins(&node.package, &node.path, &bin_dir)?;
    run.journal.record(
        Target::New(id),
        Undo::UnlinkBins {
            manifest: Box::new(node.package.clone()),
            pkg_dir: node.path.clone(),
            bin_dir,
        },
    );
    Ok(())
}

/// Relocate a package that is already installed elsewhere in the tree.
pub(super) fn move_node(run: &mut Run, tree: &Tree, plan: &Plan, id: NodeId) -> Result<(), PkgError> {
    let Some(from) = plan.moved_from.get(&id) else {
        return Ok(());
    };
    let dest = tree.node(id).path.clone();
    if *from != dest {
        let target = Target::New(id);
        let occupied = fs::symlink_metadata(&dest).is_ok_and(|m| m.file_type().is_symlink())
            || dest.join("package.json").exists();
        if occupied {
            refuse_git_dir(&dest)?;
            set_aside(run, target, &dest)?;
        }
        move_package_only(from, &dest).map_err(|e| PkgError::io_at(from, &e))?;
        run.journal.record(
            target,
            Undo::MoveBack {
                from: dest.clone(),
                to: from.clone(),
            },
        );
        if let Some(parent) = from.parent() {
            prune_empty_parents(parent, &run.modules);
        }
        debug!(from = %from.display(), to = %dest.display(), "moved");
    }
    run.finalized.insert(id);
    Ok(())
}

/// Put a node's content at its final path, setting aside what was there.
pub(super) fn finalize(run: &mut Run, tree: &Tree, id: NodeId) -> Result<(), PkgError> {
    let node = tree.node(id);
    let target = Target::New(id);
    let dest = node.path.clone();
    let src = content_dir(run, tree, id);

    if !node.is_link && src == dest {
        run.finalized.insert(id);
        return link_node_bins(run, tree, id);
    }

    refuse_git_dir(&dest)?;
    let backup = set_aside(run, target, &dest)?;

    if node.is_link {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PkgError::io_at(parent, &e))?;
        }
        symlink(&node.realpath, &dest).map_err(|e| PkgError::io_at(&dest, &e))?;
    } else {
        move_dir(&src, &dest).map_err(|e| PkgError::io_at(&dest, &e))?;
        if let Some(backup) = &backup {
            restore_children(backup, &dest)?;
        }
    }
    if backup.is_none() {
        run.journal.record(target, Undo::RemovePath(dest.clone()));
    }

    run.finalized.insert(id);
    debug!(package = %node.id_string(), path = %dest.display(), "finalized");
    link_node_bins(run, tree, id)
}

/// Repoint a symlinked package, or replace a link with a real copy.
pub(super) fn update_linked(run: &mut Run, tree: &Tree, id: NodeId) -> Result<(), PkgError> {
    let node = tree.node(id);
    let target = Target::New(id);
    let dest = node.path.clone();
    let previous = fs::read_link(&dest)
        .ok()
        .map(|t| dest.parent().map_or_else(|| t.clone(), |p| p.join(&t)));

    let backup = set_aside(run, target, &dest)?;
    if node.is_link {
        symlink(&node.realpath, &dest).map_err(|e| PkgError::io_at(&dest, &e))?;
    } else {
        let Some(previous) = previous else {
            return Err(PkgError::fs(format!(
                "{} is not a link; cannot replace it with a copy",
                dest.display()
            )));
        };
        copy_dir_all(&previous, &dest, |p| !p.ends_with("node_modules"))
            .map_err(|e| PkgError::io_at(&dest, &e))?;
    }
    if backup.is_none() {
        run.journal.record(target, Undo::RemovePath(dest.clone()));
    }
    run.finalized.insert(id);
    debug!(package = %node.id_string(), link = node.is_link, "updated link");
    Ok(())
}

/// Run uninstall scripts and drop bin links of a package about to go away.
///
/// Failures are logged and otherwise ignored.
pub(super) async fn unbuild<R: ScriptRunner>(
    run: &Run,
    old: &Tree,
    id: NodeId,
    runner: &R,
    opts: &InstallOptions,
) {
    let node = old.node(id);
    if run.kept.contains(&node.path) {
        return;
    }
    let superseded = run.superseded.get(&node.path).cloned();
    let dir = superseded.clone().unwrap_or_else(|| {
        if node.is_link {
            node.realpath.clone()
        } else {
            node.path.clone()
        }
    });

    if !opts.ignore_scripts {
        let script_opts = ScriptOptions {
            fail_ok: true,
            ..ScriptOptions::default()
        };
        for stage in [
            LifecycleStage::Preuninstall,
            LifecycleStage::Uninstall,
            LifecycleStage::Postuninstall,
        ] {
            if let Err(e) = runner.run(&node.package, stage, &dir, &script_opts).await {
                warn!(package = %node.id_string(), stage = %stage, error = %e, "uninstall script failed");
            }
        }
    }

    // A package now at the same path owns the bin links.
    if superseded.is_none() {
        if let Some(bin_dir) = link::bin_dir_for(&node.path, &node.name) {
            if let Err(e) = link::unlink_bins(&node.package, &node.path, &bin_dir) {
                warn!(package = %node.id_string(), error = %e, "failed to unlink bins");
            }
        }
    }
}

/// Move an installed package into the trash.
pub(super) fn remove(run: &mut Run, old: &Tree, id: NodeId) -> Result<(), PkgError> {
    let node = old.node(id);
    let path = node.path.clone();
    if run.superseded.contains_key(&path) || run.kept.contains(&path) {
        return Ok(());
    }
    if fs::symlink_metadata(&path).is_err() {
        return Ok(());
    }
    if let Err(e) = refuse_git_dir(&path) {
        warn!(path = %path.display(), "leaving git checkout in place");
        run.outcome
            .warnings
            .push(crate::pkg::error::Warning::from_error(&e, old.location(id)));
        return Ok(());
    }

    let trash = run.scratch_path("trash");
    move_dir(&path, &trash).map_err(|e| PkgError::io_at(&path, &e))?;
    run.journal.record(
        Target::Old(id),
        Undo::RestoreBackup {
            dest: path.clone(),
            backup: trash,
        },
    );
    if let Some(parent) = path.parent() {
        prune_empty_parents(parent, &run.modules);
    }
    debug!(package = %node.id_string(), path = %path.display(), "removed");
    Ok(())
}
