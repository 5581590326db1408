//! Shrinkwrap / package-lock documents.
//!
//! A shrinkwrap pins the exact resolved tree. It is read before building so
//! that resolution follows the pinned versions, and written afterwards from the
//! ideal tree.
//!
//! ## File Format
//!
//! ```json
//! {
//!   "name": "my-project",
//!   "version": "1.0.0",
//!   "lockfileVersion": 1,
//!   "requires": true,
//!   "dependencies": {
//!     "a": {
//!       "version": "1.0.0",
//!       "resolved": "https://registry.npmjs.org/a/-/a-1.0.0.tgz",
//!       "integrity": "sha512-...",
//!       "requires": { "b": "^1.0.0" },
//!       "dependencies": { "b": { "version": "1.2.0" } }
//!     }
//!   }
//! }
//! ```

use super::error::PkgError;
use super::spec::PackageSpec;
use super::tree::{NodeId, Tree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Lockfile format version written by this crate.
pub const LOCKFILE_VERSION: u32 = 1;

/// Published-package shrinkwrap filename. Takes precedence when both exist.
pub const SHRINKWRAP_NAME: &str = "npm-shrinkwrap.json";

/// Project-local lockfile filename.
pub const PACKAGE_LOCK_NAME: &str = "package-lock.json";

/// One pinned package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShrinkwrapEntry {
    /// A semver version, or a source specifier for non-registry packages.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// The originally requested range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bundled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dev: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requires: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, ShrinkwrapEntry>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !b
}

impl ShrinkwrapEntry {
    /// The spec that reproduces this pin.
    ///
    /// # Errors
    /// Returns an error if the pinned version is not a valid specifier.
    pub fn to_spec(&self, name: &str) -> Result<PackageSpec, PkgError> {
        if semver::Version::parse(&self.version).is_ok() {
            return PackageSpec::from_dep(name, &self.version);
        }
        PackageSpec::from_dep(name, self.resolved.as_deref().unwrap_or(&self.version))
    }

    /// The value recorded in `Node::from_shrinkwrap`.
    #[must_use]
    pub fn pin(&self) -> String {
        self.resolved.clone().unwrap_or_else(|| self.version.clone())
    }
}

/// A whole shrinkwrap document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shrinkwrap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_lockfile_version")]
    pub lockfile_version: u32,
    #[serde(default)]
    pub requires: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, ShrinkwrapEntry>,
}

fn default_lockfile_version() -> u32 {
    LOCKFILE_VERSION
}

impl Shrinkwrap {
    /// Find and read the shrinkwrap for the project at `dir`.
    ///
    /// Returns `Ok(None)` when neither file exists.
    ///
    /// # Errors
    /// Returns `ESHRINKWRAP` if a file exists but cannot be read or parsed.
    pub fn read(dir: &Path) -> Result<Option<(Self, PathBuf)>, PkgError> {
        for file in [SHRINKWRAP_NAME, PACKAGE_LOCK_NAME] {
            let path = dir.join(file);
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                PkgError::shrinkwrap(format!("Failed to read {}: {e}", path.display()))
            })?;
            let doc = Self::from_json(&content).map_err(|e| {
                PkgError::shrinkwrap(format!("{}: {}", path.display(), e.message()))
            })?;
            return Ok(Some((doc, path)));
        }
        Ok(None)
    }

    /// Parse a shrinkwrap document.
    ///
    /// # Errors
    /// Returns `ESHRINKWRAP` if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, PkgError> {
        serde_json::from_str(json)
            .map_err(|e| PkgError::shrinkwrap(format!("Invalid shrinkwrap JSON: {e}")))
    }

    /// Serialize to pretty JSON with a trailing newline.
    ///
    /// # Errors
    /// Returns `ESHRINKWRAP` if serialization fails.
    pub fn to_json(&self) -> Result<String, PkgError> {
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|e| PkgError::shrinkwrap(format!("Failed to serialize shrinkwrap: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    /// Write the shrinkwrap to a path atomically.
    ///
    /// # Errors
    /// Returns `ESHRINKWRAP` if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<(), PkgError> {
        let content = self.to_json()?;
        arbor_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
            PkgError::shrinkwrap(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Snapshot the physical shape of `tree`.
    #[must_use]
    pub fn from_tree(tree: &Tree) -> Self {
        let root = tree.node(tree.root());
        Self {
            name: root.package.name.clone(),
            version: root.package.version.clone(),
            lockfile_version: LOCKFILE_VERSION,
            requires: true,
            dependencies: entries_for(tree, tree.root()),
        }
    }
}

fn entries_for(tree: &Tree, parent: NodeId) -> BTreeMap<String, ShrinkwrapEntry> {
    let mut out = BTreeMap::new();
    for &child in &tree.node(parent).children {
        let node = tree.node(child);
        if node.removed || node.failed {
            continue;
        }
        let version = if node.package.is_registry_sourced() {
            node.package.version_str().to_string()
        } else {
            node.package
                .spec
                .clone()
                .unwrap_or_else(|| node.package.version_str().to_string())
        };

        let entry = ShrinkwrapEntry {
            version,
            resolved: node.package.resolved.clone(),
            integrity: node.package.integrity.clone(),
            from: node.package.from.clone(),
            bundled: node.from_bundle.is_some(),
            dev: node.dev_only,
            optional: node.optional,
            requires: node.package.runtime_deps(),
            dependencies: entries_for(tree, child),
        };
        out.insert(node.name.clone(), entry);
    }
    out
}
