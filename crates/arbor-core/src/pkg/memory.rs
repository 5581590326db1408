//! In-memory package source.
//!
//! Serves manifests and file contents from memory, with failure injection and
//! call counters. Directory specs still resolve from disk.

use super::error::PkgError;
use super::manifest::Manifest;
use super::source::{self, PackageSource};
use super::spec::{PackageSpec, SpecKind};
use super::version::Range;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Published {
    manifest: Manifest,
    files: BTreeMap<String, String>,
    bundled: Vec<Manifest>,
}

#[derive(Debug, Default)]
struct Counters {
    resolves: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
}

/// A registry that lives in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    packages: BTreeMap<String, Vec<Published>>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    failing_fetches: HashSet<String>,
    failing_resolves: HashSet<String>,
    fetch_delay: Option<Duration>,
    counters: Mutex<Counters>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a version with just its `package.json`.
    pub fn publish(&mut self, manifest: Manifest) -> &mut Self {
        self.publish_with(manifest, BTreeMap::new(), Vec::new())
    }

    /// Publish a version with extra files and bundled dependencies.
    ///
    /// Bundled manifests are written under the package's own `node_modules`.
    pub fn publish_with(
        &mut self,
        mut manifest: Manifest,
        files: BTreeMap<String, String>,
        bundled: Vec<Manifest>,
    ) -> &mut Self {
        let name = manifest.name.clone().unwrap_or_default();
        let version = manifest.version_str().to_string();
        if manifest.integrity.is_none() {
            manifest.integrity = Some(format!(
                "blake3-{}",
                arbor_util::hash::blake3_bytes(format!("{name}@{version}").as_bytes())
            ));
        }
        if manifest.resolved.is_none() {
            manifest.resolved = Some(format!("memory://{name}/-/{version}.tgz"));
        }
        let versions = self.packages.entry(name).or_default();
        versions.retain(|p| p.manifest.version_str() != version);
        versions.push(Published {
            manifest,
            files,
            bundled,
        });
        self
    }

    /// Point a dist-tag at a version.
    pub fn tag(&mut self, name: &str, tag: &str, version: &str) -> &mut Self {
        self.tags
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), version.to_string());
        self
    }

    /// Make `fetch_and_extract` fail for `name@version`.
    pub fn fail_fetch(&mut self, name: &str, version: &str) -> &mut Self {
        self.failing_fetches.insert(format!("{name}@{version}"));
        self
    }

    /// Make every resolution of `name` fail with a network error.
    pub fn fail_resolve(&mut self, name: &str) -> &mut Self {
        self.failing_resolves.insert(name.to_string());
        self
    }

    /// Sleep before each extraction, to widen race windows in tests.
    pub fn with_fetch_delay(&mut self, delay: Duration) -> &mut Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// How many times `name` was resolved.
    #[must_use]
    pub fn resolve_count(&self, name: &str) -> usize {
        self.counters
            .lock()
            .map(|c| c.resolves.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// How many times `name@version` was extracted.
    #[must_use]
    pub fn fetch_count(&self, name: &str, version: &str) -> usize {
        self.counters
            .lock()
            .map(|c| {
                c.fetches
                    .get(&format!("{name}@{version}"))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn bump(&self, resolve: Option<&str>, fetch: Option<String>) {
        if let Ok(mut c) = self.counters.lock() {
            if let Some(name) = resolve {
                *c.resolves.entry(name.to_string()).or_default() += 1;
            }
            if let Some(id) = fetch {
                *c.fetches.entry(id).or_default() += 1;
            }
        }
    }

    fn pick(&self, spec: &PackageSpec) -> Result<&Published, PkgError> {
        let versions = self
            .packages
            .get(&spec.name)
            .ok_or_else(|| PkgError::not_found(&spec.name))?;

        let highest = |range: &Range| {
            versions
                .iter()
                .filter_map(|p| {
                    semver::Version::parse(p.manifest.version_str())
                        .ok()
                        .filter(|v| range.matches(v))
                        .map(|v| (v, p))
                })
                .max_by(|a, b| a.0.cmp(&b.0))
                .map(|(_, p)| p)
        };

        let found = match &spec.kind {
            SpecKind::Tag(tag) => {
                let tagged = self.tags.get(&spec.name).and_then(|t| t.get(tag));
                match tagged {
                    Some(v) => versions.iter().find(|p| p.manifest.version_str() == v),
                    None if tag == "latest" => highest(&Range::parse("*")?),
                    None => None,
                }
            }
            SpecKind::Version(v) => versions.iter().find(|p| p.manifest.version_str() == v),
            SpecKind::Range(r) => highest(&Range::parse(r)?),
            _ => None,
        };

        found.ok_or_else(|| PkgError::version_not_found(&spec.name, &spec.raw))
    }

    fn find(&self, manifest: &Manifest) -> Option<&Published> {
        let name = manifest.name.as_deref()?;
        self.packages
            .get(name)?
            .iter()
            .find(|p| p.manifest.version_str() == manifest.version_str())
    }
}

impl PackageSource for MemoryRegistry {
    async fn resolve_metadata(
        &self,
        spec: &PackageSpec,
        base_dir: &Path,
    ) -> Result<Manifest, PkgError> {
        self.bump(Some(&spec.name), None);

        if let SpecKind::Directory(_) = spec.kind {
            return source::resolve_directory(spec, base_dir);
        }
        if self.failing_resolves.contains(&spec.name) {
            return Err(PkgError::network(format!(
                "Simulated network failure for {}",
                spec.name
            )));
        }

        let mut manifest = self.pick(spec)?.manifest.clone();
        source::annotate(&mut manifest, spec);
        Ok(manifest)
    }

    async fn fetch_and_extract(&self, manifest: &Manifest, dest: &Path) -> Result<(), PkgError> {
        if source::is_directory_source(manifest) {
            return source::extract_directory(manifest, dest);
        }

        let id = manifest.id();
        self.bump(None, Some(id.clone()));
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_fetches.contains(&id) {
            return Err(PkgError::network(format!("Simulated fetch failure for {id}")));
        }

        let published = self
            .find(manifest)
            .ok_or_else(|| PkgError::not_found(&id))?;

        write_package(dest, &published.manifest, &published.files)?;
        for bundled in &published.bundled {
            let mut bundled = bundled.clone();
            bundled.in_bundle = true;
            let name = bundled.name.clone().unwrap_or_default();
            write_package(
                &dest.join("node_modules").join(name),
                &bundled,
                &BTreeMap::new(),
            )?;
        }
        Ok(())
    }
}

fn write_package(
    dest: &Path,
    manifest: &Manifest,
    files: &BTreeMap<String, String>,
) -> Result<(), PkgError> {
    std::fs::create_dir_all(dest).map_err(|e| PkgError::io_at(dest, &e))?;

    // Underscore fields are install-time metadata, not package contents.
    let mut clean = manifest.clone();
    clean.resolved = None;
    clean.integrity = None;
    let json = serde_json::to_string_pretty(&clean)?;
    std::fs::write(dest.join("package.json"), json).map_err(|e| PkgError::io_at(dest, &e))?;

    for (rel, content) in files {
        let path = dest.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PkgError::io_at(parent, &e))?;
        }
        std::fs::write(&path, content).map_err(|e| PkgError::io_at(&path, &e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> MemoryRegistry {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0"))
            .publish(Manifest::new("a", "1.5.0"))
            .publish(Manifest::new("a", "2.0.0"))
            .tag("a", "legacy", "1.0.0");
        reg
    }

    #[tokio::test]
    async fn test_resolve_highest_in_range() {
        let reg = registry();
        let spec = PackageSpec::from_dep("a", "^1.0.0").unwrap();
        let manifest = reg.resolve_metadata(&spec, Path::new(".")).await.unwrap();
        assert_eq!(manifest.version_str(), "1.5.0");
        assert_eq!(manifest.from.as_deref(), Some("a@^1.0.0"));
        assert!(manifest.integrity.is_some());
        assert_eq!(reg.resolve_count("a"), 1);
    }

    #[tokio::test]
    async fn test_resolve_tags() {
        let reg = registry();
        let spec = PackageSpec::from_dep("a", "legacy").unwrap();
        let manifest = reg.resolve_metadata(&spec, Path::new(".")).await.unwrap();
        assert_eq!(manifest.version_str(), "1.0.0");

        let spec = PackageSpec::from_dep("a", "latest").unwrap();
        let manifest = reg.resolve_metadata(&spec, Path::new(".")).await.unwrap();
        assert_eq!(manifest.version_str(), "2.0.0");
    }

    #[tokio::test]
    async fn test_missing_package_is_enoent() {
        let reg = registry();
        let spec = PackageSpec::from_dep("nope", "*").unwrap();
        let err = reg
            .resolve_metadata(&spec, Path::new("."))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_writes_bundle_and_counts() {
        let mut reg = MemoryRegistry::new();
        reg.publish_with(
            Manifest::new("b", "1.0.0"),
            BTreeMap::from([("index.js".to_string(), "1".to_string())]),
            vec![Manifest::new("inner", "0.1.0")],
        );
        let spec = PackageSpec::from_dep("b", "1.0.0").unwrap();
        let manifest = reg.resolve_metadata(&spec, Path::new(".")).await.unwrap();

        let dir = tempdir().unwrap();
        let dest = dir.path().join("b");
        reg.fetch_and_extract(&manifest, &dest).await.unwrap();

        assert!(dest.join("index.js").exists());
        let inner = Manifest::read_dir(&dest.join("node_modules/inner")).unwrap();
        assert!(inner.in_bundle);
        assert_eq!(reg.fetch_count("b", "1.0.0"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mut reg = registry();
        reg.fail_fetch("a", "2.0.0").fail_resolve("z");

        let spec = PackageSpec::from_dep("z", "*").unwrap();
        let err = reg
            .resolve_metadata(&spec, Path::new("."))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::ENETWORK);

        let spec = PackageSpec::from_dep("a", "2.0.0").unwrap();
        let manifest = reg.resolve_metadata(&spec, Path::new(".")).await.unwrap();
        let dir = tempdir().unwrap();
        assert!(reg
            .fetch_and_extract(&manifest, &dir.path().join("a"))
            .await
            .is_err());
    }
}
