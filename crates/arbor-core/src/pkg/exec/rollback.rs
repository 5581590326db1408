//! Undo journal for destructive filesystem steps.

use crate::pkg::link;
use crate::pkg::manifest::Manifest;
use crate::pkg::plan::Target;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How to reverse one filesystem change.
#[derive(Debug, Clone)]
pub enum Undo {
    /// Something was created at this path.
    RemovePath(PathBuf),
    /// Move the package at `from` back to `to`, leaving `node_modules` in place.
    MoveBack { from: PathBuf, to: PathBuf },
    /// `dest` was set aside at `backup` and possibly replaced.
    RestoreBackup { dest: PathBuf, backup: PathBuf },
    UnlinkBins {
        manifest: Box<Manifest>,
        pkg_dir: PathBuf,
        bin_dir: PathBuf,
    },
    /// A file was rewritten. `None` means it did not exist.
    RestoreFile { path: PathBuf, bytes: Option<Vec<u8>> },
}

impl Undo {
    fn apply(&self) -> io::Result<()> {
        match self {
            Self::RemovePath(path) => arbor_util::fs::remove_path(path),
            Self::MoveBack { from, to } => move_package_only(from, to),
            Self::RestoreBackup { dest, backup } => {
                // Children placed into the new copy go back with the old one.
                let dest_modules = dest.join("node_modules");
                let backup_modules = backup.join("node_modules");
                let is_real_dir = fs::symlink_metadata(dest).is_ok_and(|m| m.is_dir());
                let children = if is_real_dir {
                    package_entries(&dest_modules)?
                } else {
                    Vec::new()
                };
                for entry in children {
                    let target = backup_modules.join(entry.strip_prefix(&dest_modules).map_err(io::Error::other)?);
                    if fs::symlink_metadata(&target).is_err() {
                        arbor_util::fs::move_dir(&entry, &target)?;
                    }
                }
                arbor_util::fs::remove_path(dest)?;
                arbor_util::fs::move_dir(backup, dest)
            }
            Self::UnlinkBins {
                manifest,
                pkg_dir,
                bin_dir,
            } => link::unlink_bins(manifest, pkg_dir, bin_dir).map_err(|e| io::Error::other(e.to_string())),
            Self::RestoreFile { path, bytes } => match bytes {
                Some(bytes) => arbor_util::fs::atomic_write(path, bytes),
                None => arbor_util::fs::remove_path(path),
            },
        }
    }
}

/// Package directories directly inside a `node_modules`, scopes expanded.
pub(crate) fn package_entries(node_modules: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(node_modules) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if name.starts_with('@') && entry.file_type()?.is_dir() {
            for scoped in fs::read_dir(entry.path())? {
                out.push(scoped?.path());
            }
        } else {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Move a package directory without its `node_modules`.
///
/// Everything but `node_modules` moves to `to`; `from` is removed if that
/// leaves it empty.
pub(crate) fn move_package_only(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_name() == "node_modules" {
            continue;
        }
        let dest = to.join(entry.file_name());
        arbor_util::fs::remove_path(&dest)?;
        fs::rename(entry.path(), &dest).or_else(|_| {
            if entry.file_type()?.is_dir() {
                arbor_util::fs::move_dir(&entry.path(), &dest)
            } else {
                fs::copy(entry.path(), &dest)?;
                fs::remove_file(entry.path())
            }
        })?;
    }
    if arbor_util::fs::is_empty_dir(from) {
        fs::remove_dir(from)?;
    }
    Ok(())
}

/// Undo entries in the order they were recorded.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<(Target, Undo)>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: Target, undo: Undo) {
        self.entries.push((target, undo));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Undo every change made for `target`, newest first.
    pub fn rollback_node(&mut self, target: Target) {
        let (mine, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(|(t, _)| *t == target);
        self.entries = rest;
        undo_all(mine);
    }

    /// Undo everything, newest first.
    pub fn rollback_all(&mut self) {
        undo_all(std::mem::take(&mut self.entries));
    }

    /// Forget the journal; the changes stay.
    pub fn commit(self) {
        debug!(entries = self.entries.len(), "committed");
    }
}

fn undo_all(entries: Vec<(Target, Undo)>) {
    for (target, undo) in entries.into_iter().rev() {
        if let Err(e) = undo.apply() {
            warn!(target = ?target, undo = ?undo, error = %e, "rollback step failed");
        }
    }
}
