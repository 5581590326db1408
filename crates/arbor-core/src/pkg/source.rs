//! Collaborator contracts: where packages come from, how scripts run, and
//! where fetched artifacts are kept.
//!
//! The engine is generic over these traits. [`crate::pkg::registry::RegistrySource`],
//! [`crate::pkg::scripts::ShellScriptRunner`] and [`crate::pkg::cache::PackageCache`]
//! are the default implementations; [`crate::pkg::memory::MemoryRegistry`] and
//! [`NoScripts`] serve tests and embedders.

use super::error::PkgError;
use super::manifest::Manifest;
use super::spec::PackageSpec;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Resolves specs to manifests and materializes package contents.
///
/// Implementations must tolerate being asked for the same resolved artifact
/// more than once; the engine asks at most once per node.
#[allow(async_fn_in_trait)]
pub trait PackageSource {
    /// Resolve a spec to a manifest annotated with `_resolved`, `_integrity`,
    /// `_from`, `_requested` and `_spec`.
    ///
    /// `base_dir` anchors relative `file:` specs.
    async fn resolve_metadata(
        &self,
        spec: &PackageSpec,
        base_dir: &Path,
    ) -> Result<Manifest, PkgError>;

    /// Make the artifact locally available without extracting it.
    async fn prefetch(&self, manifest: &Manifest) -> Result<(), PkgError> {
        let _ = manifest;
        Ok(())
    }

    /// Write the package contents into `dest`, which must not exist yet.
    async fn fetch_and_extract(&self, manifest: &Manifest, dest: &Path) -> Result<(), PkgError>;
}

/// Lifecycle script stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    Preinstall,
    Install,
    Postinstall,
    Preuninstall,
    Uninstall,
    Postuninstall,
    Prepare,
    Prepublish,
    Test,
}

impl LifecycleStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preinstall => "preinstall",
            Self::Install => "install",
            Self::Postinstall => "postinstall",
            Self::Preuninstall => "preuninstall",
            Self::Uninstall => "uninstall",
            Self::Postuninstall => "postuninstall",
            Self::Prepare => "prepare",
            Self::Prepublish => "prepublish",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options passed to a script run.
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Treat a failing script as success.
    pub fail_ok: bool,
    /// Extra environment variables for the script.
    pub env: BTreeMap<String, String>,
}

/// Runs lifecycle scripts.
#[allow(async_fn_in_trait)]
pub trait ScriptRunner {
    /// Run `stage` for `manifest` in `dir`. Missing scripts are a no-op.
    async fn run(
        &self,
        manifest: &Manifest,
        stage: LifecycleStage,
        dir: &Path,
        opts: &ScriptOptions,
    ) -> Result<(), PkgError>;
}

/// A script runner that never runs anything (`--ignore-scripts`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScripts;

impl ScriptRunner for NoScripts {
    async fn run(
        &self,
        _manifest: &Manifest,
        _stage: LifecycleStage,
        _dir: &Path,
        _opts: &ScriptOptions,
    ) -> Result<(), PkgError> {
        Ok(())
    }
}

/// Content-addressed artifact storage keyed by (name, version, integrity).
pub trait ContentStore {
    /// Directory holding the extracted artifact, if present.
    fn get(&self, name: &str, version: &str, integrity: Option<&str>) -> Option<PathBuf>;

    /// Store an extracted package directory and return its stored location.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be copied into the store.
    fn put(
        &self,
        name: &str,
        version: &str,
        integrity: Option<&str>,
        src: &Path,
    ) -> Result<PathBuf, PkgError>;
}

/// Fill in the underscore fields every resolved manifest carries.
pub fn annotate(manifest: &mut Manifest, spec: &PackageSpec) {
    if manifest.name.as_deref().map_or(true, str::is_empty) && !spec.name.is_empty() {
        manifest.name = Some(spec.name.clone());
    }
    manifest.from = Some(spec.display());
    manifest.spec = Some(spec.raw.clone());
    manifest.requested = Some(serde_json::json!({
        "type": spec.kind.label(),
        "raw": spec.display(),
        "name": manifest.name.clone().unwrap_or_default(),
    }));
}

/// Resolve a `file:` directory spec by reading its manifest.
///
/// The integrity is a BLAKE3 digest of the directory contents (excluding
/// `node_modules`), so an unchanged directory compares equal across runs.
///
/// # Errors
/// `ENOTDIR` if the path is not a directory, `ENOLOCAL` if it has no manifest.
pub fn resolve_directory(spec: &PackageSpec, base_dir: &Path) -> Result<Manifest, PkgError> {
    let Some(dir) = spec.local_path(base_dir) else {
        return Err(PkgError::spec_invalid(format!(
            "Not a directory spec: {}",
            spec.display()
        )));
    };
    if !dir.exists() {
        return Err(PkgError::new(
            super::error::codes::ENOENT,
            format!("No such directory: {}", dir.display()),
        ));
    }
    if !dir.is_dir() {
        return Err(PkgError::not_dir(&dir));
    }
    if !dir.join("package.json").is_file() {
        return Err(PkgError::not_local(&dir));
    }

    let mut manifest = Manifest::read_dir(&dir)?;
    let real = dunce::canonicalize(&dir).unwrap_or(dir);
    let digest = arbor_util::hash::blake3_dir(&real, &["node_modules", ".git"])
        .map_err(|e| PkgError::io_at(&real, &e))?;

    annotate(&mut manifest, spec);
    manifest.resolved = Some(format!("file:{}", real.display()));
    manifest.integrity = Some(format!("blake3-{digest}"));
    Ok(manifest)
}

/// Copy a directory package into `dest`, leaving out its `node_modules`.
///
/// # Errors
/// Returns an error if the copy fails.
pub fn extract_directory(manifest: &Manifest, dest: &Path) -> Result<(), PkgError> {
    let src = manifest
        .resolved
        .as_deref()
        .and_then(|r| r.strip_prefix("file:"))
        .map(PathBuf::from)
        .ok_or_else(|| PkgError::spec_invalid(format!("{} has no local source", manifest.id())))?;

    arbor_util::fs::copy_dir_all(&src, dest, |p| {
        !p.ends_with("node_modules") && !p.ends_with(".git")
    })
    .map_err(|e| PkgError::io_at(dest, &e))
}

/// Whether a manifest was resolved from a local directory.
#[must_use]
pub fn is_directory_source(manifest: &Manifest) -> bool {
    manifest
        .requested
        .as_ref()
        .and_then(|r| r.get("type"))
        .and_then(|t| t.as_str())
        == Some("directory")
}
