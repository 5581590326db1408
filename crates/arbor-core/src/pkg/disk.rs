//! Reading the installed tree from `node_modules`.

use super::error::PkgError;
use super::manifest::{name_from_path, Manifest};
use super::tree::{logical, NodeId, Tree};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One installed package directory.
#[derive(Debug, Clone)]
pub struct DiskPackage {
    /// Where the package appears (`.../node_modules/<name>`).
    pub dir: PathBuf,
    /// Canonical location, different from `dir` for links.
    pub realpath: PathBuf,
    pub is_link: bool,
    pub manifest: Manifest,
    /// Problem reading `package.json`, if any.
    pub error: Option<PkgError>,
    pub children: Vec<DiskPackage>,
}

impl DiskPackage {
    /// Directory name relative to its `node_modules`, including the scope.
    #[must_use]
    pub fn name(&self) -> String {
        name_from_path(&self.dir)
    }
}

/// Read every package under a `node_modules` directory, sorted by name.
///
/// Dot-directories are skipped, scopes are descended into, and linked
/// packages are followed once per real path. A missing directory is empty.
///
/// # Errors
/// Returns an error if a directory exists but cannot be listed.
pub fn read_node_modules(dir: &Path) -> Result<Vec<DiskPackage>, PkgError> {
    let mut visited = HashSet::new();
    read_level(dir, &mut visited)
}

fn read_level(dir: &Path, visited: &mut HashSet<PathBuf>) -> Result<Vec<DiskPackage>, PkgError> {
    let mut dirs = Vec::new();
    for entry in list_dir(dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if name.starts_with('@') {
            for scoped in list_dir(&entry.path())? {
                if !scoped.file_name().to_string_lossy().starts_with('.') {
                    dirs.push(scoped.path());
                }
            }
        } else {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut packages = Vec::with_capacity(dirs.len());
    for pkg_dir in dirs {
        if let Some(pkg) = read_package(&pkg_dir, visited)? {
            packages.push(pkg);
        }
    }
    Ok(packages)
}

fn list_dir(dir: &Path) -> Result<Vec<fs::DirEntry>, PkgError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(Result::ok).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PkgError::io_at(dir, &e)),
    }
}

fn read_package(
    pkg_dir: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<Option<DiskPackage>, PkgError> {
    let Ok(meta) = fs::symlink_metadata(pkg_dir) else {
        return Ok(None);
    };
    let is_link = meta.file_type().is_symlink();
    let realpath = if is_link {
        match dunce::canonicalize(pkg_dir) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %pkg_dir.display(), error = %e, "dangling link in node_modules");
                return Ok(None);
            }
        }
    } else {
        pkg_dir.to_path_buf()
    };
    if !realpath.is_dir() {
        return Ok(None);
    }

    let (manifest, error) = match Manifest::read_dir(&realpath) {
        Ok(m) => (m, None),
        Err(e) => (Manifest::default(), Some(e)),
    };

    // Links may point back into a tree already being read.
    let children = if is_link && !visited.insert(realpath.clone()) {
        Vec::new()
    } else {
        read_level(&realpath.join("node_modules"), visited)?
    };

    Ok(Some(DiskPackage {
        dir: pkg_dir.to_path_buf(),
        realpath,
        is_link,
        manifest,
        error,
        children,
    }))
}

/// Attach disk packages below `parent`, recursively.
///
/// Every attached node is marked existing. `bundler` marks the nodes as having
/// shipped inside that package; otherwise `_inBundle` manifests are assigned
/// to the nearest enclosing package.
pub fn attach_packages(
    tree: &mut Tree,
    parent: NodeId,
    packages: Vec<DiskPackage>,
    bundler: Option<NodeId>,
) -> Vec<NodeId> {
    let mut attached = Vec::with_capacity(packages.len());
    for pkg in packages {
        let name = pkg.name();
        let location = format!("{}/{name}", tree.location(parent).trim_end_matches('/'));
        if let Some(err) = &pkg.error {
            if !err.is_not_found() {
                tree.warnings
                    .push(super::error::Warning::from_error(err, location.clone()));
            }
        }
        let mut manifest = pkg.manifest;
        let warnings = manifest.normalize(&name, &location);
        tree.warnings.extend(warnings);

        let in_bundle = manifest.in_bundle;
        let id = tree.add_node(manifest, Some(&name));
        {
            let node = tree.node_mut(id);
            node.existing = true;
            node.is_link = pkg.is_link;
            if pkg.is_link {
                node.realpath.clone_from(&pkg.realpath);
            }
        }
        tree.attach(id, parent);

        let from_bundle = bundler.or_else(|| {
            in_bundle.then(|| tree.node(parent).from_bundle.unwrap_or(parent))
        });
        tree.node_mut(id).from_bundle = from_bundle;

        attach_packages(tree, id, pkg.children, bundler);
        attached.push(id);
    }
    attached
}

/// Read the project at `root_dir` and its installed packages.
///
/// A missing `package.json` yields an empty root manifest.
///
/// # Errors
/// Returns an error if the root manifest exists but is invalid, or a
/// `node_modules` directory cannot be listed.
pub fn load_tree(root_dir: &Path) -> Result<Tree, PkgError> {
    let root_dir = dunce::canonicalize(root_dir).unwrap_or_else(|_| root_dir.to_path_buf());
    let manifest = match Manifest::read_dir(&root_dir) {
        Ok(m) => m,
        Err(e) if e.is_not_found() => Manifest::default(),
        Err(e) => return Err(e),
    };

    let mut tree = Tree::new(manifest, &root_dir);
    let root = tree.root();
    let packages = read_node_modules(&root_dir.join("node_modules"))?;
    let attached = attach_packages(&mut tree, root, packages, None);

    logical::compute_logical(&mut tree, true);
    logical::mark_flags(&mut tree);
    debug!(
        root = %root_dir.display(),
        top_level = attached.len(),
        nodes = tree.iter().count(),
        "loaded installed tree"
    );
    Ok(tree)
}
