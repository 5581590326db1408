//! Package cache management.
//!
//! Extracted packages are stored under the channel cache directory, keyed by
//! name, version and a short digest of the integrity string. Packuments are
//! cached alongside for offline re-resolution.

use super::error::PkgError;
use super::source::ContentStore;
use crate::config::Channel;
use crate::paths::cache_dir;
use std::fs;
use std::path::{Path, PathBuf};

/// Package cache manager.
#[derive(Debug, Clone)]
pub struct PackageCache {
    /// Root directory for the package cache.
    root: PathBuf,
}

impl PackageCache {
    /// Create a new package cache for the given channel.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self::at(cache_dir(channel).join("packages"))
    }

    /// Create a cache rooted at an explicit directory.
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path for a cached packument.
    ///
    /// Scoped package names are URL-encoded.
    #[must_use]
    pub fn packument_path(&self, name: &str) -> PathBuf {
        let encoded = name.replace('/', "%2F");
        self.root.join("packuments").join(format!("{encoded}.json"))
    }

    /// Directory of the extracted package for (name, version, integrity).
    #[must_use]
    pub fn package_dir(&self, name: &str, version: &str, integrity: Option<&str>) -> PathBuf {
        let key = integrity.map_or_else(
            || "none".to_string(),
            |i| arbor_util::hash::blake3_bytes(i.as_bytes())[..16].to_string(),
        );
        let mut dir = self.root.clone();
        // @scope/name nests naturally into two directories.
        dir.push(name);
        dir.push(version);
        dir.push(key);
        dir.push("package");
        dir
    }

    /// Check if a package is already cached.
    #[must_use]
    pub fn is_cached(&self, name: &str, version: &str, integrity: Option<&str>) -> bool {
        self.package_dir(name, version, integrity).is_dir()
    }

    /// Read a cached packument, if any.
    #[must_use]
    pub fn read_packument(&self, name: &str) -> Option<serde_json::Value> {
        let content = fs::read_to_string(self.packument_path(name)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Store a packument.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_packument(&self, name: &str, packument: &serde_json::Value) -> Result<(), PkgError> {
        let path = self.packument_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(packument)?;
        arbor_util::fs::atomic_write(&path, &bytes).map_err(|e| PkgError::io_at(&path, &e))
    }
}

impl ContentStore for PackageCache {
    fn get(&self, name: &str, version: &str, integrity: Option<&str>) -> Option<PathBuf> {
        let dir = self.package_dir(name, version, integrity);
        dir.is_dir().then_some(dir)
    }

    fn put(
        &self,
        name: &str,
        version: &str,
        integrity: Option<&str>,
        src: &Path,
    ) -> Result<PathBuf, PkgError> {
        let dest = self.package_dir(name, version, integrity);
        if dest.is_dir() {
            return Ok(dest);
        }
        let parent = dest
            .parent()
            .ok_or_else(|| PkgError::fs("Cache entry has no parent"))?;
        fs::create_dir_all(parent).map_err(|e| PkgError::io_at(parent, &e))?;

        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(parent)
            .map_err(|e| PkgError::io_at(parent, &e))?;
        let staged = staging.path().join("package");
        arbor_util::fs::copy_dir_all(src, &staged, |p| !p.ends_with(".git"))
            .map_err(|e| PkgError::io_at(&staged, &e))?;

        match fs::rename(&staged, &dest) {
            Ok(()) => Ok(dest),
            Err(_) if dest.is_dir() => Ok(dest),
            Err(e) => Err(PkgError::io_at(&dest, &e)),
        }
    }
}
