//! `node_modules/.bin` links.
//!
//! A package's `bin` entries are linked into the `.bin` directory of the
//! `node_modules` that contains it.

use super::error::PkgError;
use super::manifest::Manifest;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The `.bin` directory serving a package installed at `pkg_dir`.
///
/// `node_modules/a` → `node_modules/.bin`, `node_modules/@s/a` → `node_modules/.bin`.
#[must_use]
pub fn bin_dir_for(pkg_dir: &Path, name: &str) -> Option<PathBuf> {
    let mut dir = pkg_dir.parent()?;
    if name.starts_with('@') {
        dir = dir.parent()?;
    }
    Some(dir.join(".bin"))
}

/// Link every `bin` entry of `manifest` into `bin_dir`.
///
/// Existing links with the same name are replaced. Returns the created links.
///
/// # Errors
/// Returns an error if a link cannot be created.
pub fn link_bins(manifest: &Manifest, pkg_dir: &Path, bin_dir: &Path) -> Result<Vec<PathBuf>, PkgError> {
    let entries = manifest.bin_entries();
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(bin_dir).map_err(|e| PkgError::io_at(bin_dir, &e))?;

    let mut links = Vec::with_capacity(entries.len());
    for (bin_name, rel) in entries {
        let target = pkg_dir.join(rel.trim_start_matches("./"));
        let link = bin_dir.join(&bin_name);

        arbor_util::fs::remove_path(&link).map_err(|e| PkgError::io_at(&link, &e))?;
        create_bin_link(&target, &link)?;
        make_executable(&target);

        debug!(bin = %bin_name, target = %target.display(), "linked bin");
        links.push(link);
    }
    Ok(links)
}

/// Remove the `bin` links of `manifest` that point into `pkg_dir`.
///
/// Links owned by some other package are left alone.
///
/// # Errors
/// Returns an error if a link exists but cannot be removed.
pub fn unlink_bins(manifest: &Manifest, pkg_dir: &Path, bin_dir: &Path) -> Result<(), PkgError> {
    for bin_name in manifest.bin_entries().keys() {
        let link = bin_dir.join(bin_name);
        let Ok(target) = fs::read_link(&link) else {
            #[cfg(windows)]
            arbor_util::fs::remove_path(&link.with_extension("cmd"))
                .map_err(|e| PkgError::io_at(&link, &e))?;
            continue;
        };
        if target.starts_with(pkg_dir) {
            arbor_util::fs::remove_path(&link).map_err(|e| PkgError::io_at(&link, &e))?;
        }
    }
    Ok(())
}

/// Bin names of `manifest` that already exist in `bin_dir` and belong to a
/// different package.
#[must_use]
pub fn bin_conflicts(manifest: &Manifest, bin_dir: &Path, own_dir: &Path) -> Vec<String> {
    manifest
        .bin_entries()
        .into_keys()
        .filter(|bin| {
            fs::read_link(bin_dir.join(bin)).is_ok_and(|target| !target.starts_with(own_dir))
        })
        .collect()
}

fn create_bin_link(target: &Path, link: &Path) -> Result<(), PkgError> {
    #[cfg(unix)]
    {
        arbor_util::fs::symlink(target, link).map_err(|e| {
            PkgError::fs(format!(
                "Failed to link {} to {}: {e}",
                link.display(),
                target.display()
            ))
        })
    }

    #[cfg(windows)]
    {
        // cmd shims, since symlinks need elevated rights
        let shim = format!("@\"node\" \"{}\" %*\r\n", target.display());
        fs::write(link.with_extension("cmd"), shim).map_err(|e| PkgError::io_at(link, &e))
    }
}

fn make_executable(target: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(target) {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o111);
            let _ = fs::set_permissions(target, perms);
        }
    }
    #[cfg(not(unix))]
    let _ = target;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::manifest::Bin;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn tool() -> Manifest {
        let mut m = Manifest::new("tool", "1.0.0");
        m.bin = Some(Bin::Map(BTreeMap::from([(
            "tool".to_string(),
            "./cli.js".to_string(),
        )])));
        m
    }

    #[test]
    fn test_bin_dir_for() {
        assert_eq!(
            bin_dir_for(Path::new("/p/node_modules/a"), "a"),
            Some(PathBuf::from("/p/node_modules/.bin"))
        );
        assert_eq!(
            bin_dir_for(Path::new("/p/node_modules/@s/a"), "@s/a"),
            Some(PathBuf::from("/p/node_modules/.bin"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_link_and_unlink_bins() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("node_modules/tool");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("cli.js"), "#!/usr/bin/env node\n").unwrap();
        let bin_dir = dir.path().join("node_modules/.bin");

        let links = link_bins(&tool(), &pkg, &bin_dir).unwrap();
        assert_eq!(links, vec![bin_dir.join("tool")]);
        assert_eq!(fs::read_link(bin_dir.join("tool")).unwrap(), pkg.join("cli.js"));

        // Someone else's package with the same bin name conflicts.
        let other = dir.path().join("node_modules/other");
        assert_eq!(bin_conflicts(&tool(), &bin_dir, &other), vec!["tool"]);
        assert!(bin_conflicts(&tool(), &bin_dir, &pkg).is_empty());

        // Unlinking from the wrong package is a no-op.
        unlink_bins(&tool(), &other, &bin_dir).unwrap();
        assert!(bin_dir.join("tool").symlink_metadata().is_ok());

        unlink_bins(&tool(), &pkg, &bin_dir).unwrap();
        assert!(bin_dir.join("tool").symlink_metadata().is_err());
    }

    #[test]
    fn test_no_bins_is_noop() {
        let dir = tempdir().unwrap();
        let bin_dir = dir.path().join(".bin");
        let links = link_bins(&Manifest::new("a", "1.0.0"), dir.path(), &bin_dir).unwrap();
        assert!(links.is_empty());
        assert!(!bin_dir.exists());
    }
}
