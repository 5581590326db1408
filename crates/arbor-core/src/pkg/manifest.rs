//! Typed `package.json`.
//!
//! Unknown keys survive a read/write cycle through [`Manifest::other`].

use super::error::{warning_codes, PkgError, Warning};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Name → range map as found in `dependencies` and friends.
pub type DepMap = BTreeMap<String, String>;

/// `bundleDependencies` is either a list of names or `true` for all deps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleDependencies {
    All(bool),
    Names(Vec<String>),
}

/// `bin` is either a single path (named after the package) or a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bin {
    Single(String),
    Map(BTreeMap<String, String>),
}

/// A package manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "DepMap::is_empty")]
    pub dependencies: DepMap,
    #[serde(default, skip_serializing_if = "DepMap::is_empty")]
    pub dev_dependencies: DepMap,
    #[serde(default, skip_serializing_if = "DepMap::is_empty")]
    pub optional_dependencies: DepMap,
    #[serde(default, skip_serializing_if = "DepMap::is_empty")]
    pub peer_dependencies: DepMap,
    #[serde(
        default,
        alias = "bundledDependencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub bundle_dependencies: Option<BundleDependencies>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,

    #[serde(rename = "_resolved", default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(rename = "_integrity", default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(rename = "_from", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// `{ "type": "range", "raw": "^1.0.0" }` style description of the request.
    #[serde(rename = "_requested", default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<serde_json::Value>,
    /// The exact source specifier, used to compare non-registry installs.
    #[serde(rename = "_spec", default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(rename = "_requiredBy", default, skip_serializing_if = "Vec::is_empty")]
    pub required_by: Vec<String>,
    #[serde(rename = "_location", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        rename = "_phantomChildren",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub phantom_children: BTreeMap<String, String>,
    #[serde(rename = "_inBundle", default, skip_serializing_if = "std::ops::Not::not")]
    pub in_bundle: bool,

    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    /// Read a manifest from `dir/package.json`.
    ///
    /// # Errors
    /// Returns `ENOENT` if the file is missing and `EMANIFEST` if it does not parse.
    pub fn read_dir(dir: &Path) -> Result<Self, PkgError> {
        let path = dir.join("package.json");
        let content = arbor_util::fs::read_to_string_lossy(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            PkgError::manifest(format!("Invalid package.json at {}: {e}", path.display()))
        })
    }

    /// Build a manifest from a JSON value.
    ///
    /// # Errors
    /// Returns `EMANIFEST` when the value does not have the manifest shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, PkgError> {
        serde_json::from_value(value).map_err(|e| PkgError::manifest(e.to_string()))
    }

    /// Shorthand for tests and in-memory sources.
    #[must_use]
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            version: Some(version.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dep(mut self, name: &str, range: &str) -> Self {
        self.dependencies.insert(name.to_string(), range.to_string());
        self
    }

    #[must_use]
    pub fn with_dev_dep(mut self, name: &str, range: &str) -> Self {
        self.dev_dependencies
            .insert(name.to_string(), range.to_string());
        self
    }

    #[must_use]
    pub fn with_optional_dep(mut self, name: &str, range: &str) -> Self {
        self.optional_dependencies
            .insert(name.to_string(), range.to_string());
        self
    }

    #[must_use]
    pub fn with_peer_dep(mut self, name: &str, range: &str) -> Self {
        self.peer_dependencies
            .insert(name.to_string(), range.to_string());
        self
    }

    #[must_use]
    pub fn with_script(mut self, stage: &str, command: &str) -> Self {
        self.scripts.insert(stage.to_string(), command.to_string());
        self
    }

    #[must_use]
    pub fn with_integrity(mut self, integrity: &str) -> Self {
        self.integrity = Some(integrity.to_string());
        self
    }

    /// The manifest name, or the name implied by `dir` (`node_modules/@s/x` → `@s/x`).
    #[must_use]
    pub fn name_or_from_path(&self, dir: &Path) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        name_from_path(dir)
    }

    /// The version, or an empty string when absent.
    #[must_use]
    pub fn version_str(&self) -> &str {
        self.version.as_deref().unwrap_or("")
    }

    /// `name@version` for log lines and identities.
    #[must_use]
    pub fn id(&self) -> String {
        format!(
            "{}@{}",
            self.name.as_deref().unwrap_or(""),
            self.version_str()
        )
    }

    /// All runtime dependencies: `dependencies` plus `optionalDependencies`.
    ///
    /// Optional entries override regular ones of the same name.
    #[must_use]
    pub fn runtime_deps(&self) -> DepMap {
        let mut deps = self.dependencies.clone();
        for (name, range) in &self.optional_dependencies {
            deps.insert(name.clone(), range.clone());
        }
        deps
    }

    #[must_use]
    pub fn is_optional_dep(&self, name: &str) -> bool {
        self.optional_dependencies.contains_key(name)
    }

    /// Names listed as bundled.
    #[must_use]
    pub fn bundled_names(&self) -> Vec<String> {
        match &self.bundle_dependencies {
            Some(BundleDependencies::All(true)) => self.dependencies.keys().cloned().collect(),
            Some(BundleDependencies::Names(names)) => names.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn has_bundled(&self) -> bool {
        !self.bundled_names().is_empty()
    }

    /// Binary name → relative script path.
    #[must_use]
    pub fn bin_entries(&self) -> BTreeMap<String, String> {
        match &self.bin {
            Some(Bin::Map(map)) => map.clone(),
            Some(Bin::Single(path)) => {
                let name = self.name.as_deref().unwrap_or_default();
                let bin_name = name.rsplit('/').next().unwrap_or(name);
                if bin_name.is_empty() {
                    BTreeMap::new()
                } else {
                    BTreeMap::from([(bin_name.to_string(), path.clone())])
                }
            }
            None => BTreeMap::new(),
        }
    }

    /// Whether this package came from a registry (version, range or tag spec).
    ///
    /// Manifests without a recorded request are treated as registry packages.
    #[must_use]
    pub fn is_registry_sourced(&self) -> bool {
        self.requested
            .as_ref()
            .and_then(|r| r.get("type"))
            .and_then(|t| t.as_str())
            .map_or(true, |t| matches!(t, "version" | "range" | "tag"))
    }

    #[must_use]
    pub fn has_script(&self, stage: &str) -> bool {
        self.scripts.contains_key(stage)
    }

    /// Fill in missing fields and report what had to be fixed.
    ///
    /// `fallback_name` is used when the manifest has no name.
    pub fn normalize(&mut self, fallback_name: &str, location: &str) -> Vec<Warning> {
        let mut warnings = Vec::new();

        if self.name.as_deref().map_or(true, str::is_empty) {
            self.name = Some(fallback_name.to_string());
        }
        if self.version.is_none() {
            warnings.push(Warning::new(
                warning_codes::MANIFEST,
                format!("{}: No version field", self.name.as_deref().unwrap_or("")),
                location,
            ));
        }

        // A dependency listed as optional only installs as optional.
        let optional: Vec<String> = self.optional_dependencies.keys().cloned().collect();
        for name in optional {
            self.dependencies.remove(&name);
        }

        let bad_bins: Vec<String> = self
            .bin_entries()
            .into_iter()
            .filter(|(name, path)| name.contains('/') || name.contains('\\') || path.is_empty())
            .map(|(name, _)| name)
            .collect();
        if !bad_bins.is_empty() {
            if let Some(Bin::Map(map)) = &mut self.bin {
                for name in &bad_bins {
                    map.remove(name);
                }
            }
            warnings.push(Warning::new(
                warning_codes::MANIFEST,
                format!("Invalid bin entries dropped: {}", bad_bins.join(", ")),
                location,
            ));
        }

        warnings
    }
}

/// Derive a package name from its install directory.
///
/// Handles scoped directories (`.../@scope/name`). Falls back to a
/// placeholder when the path has no usable final component.
#[must_use]
pub fn name_from_path(dir: &Path) -> String {
    let mut components = dir
        .components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str());
    let Some(last) = components.next().filter(|s| !s.is_empty() && *s != "/") else {
        return placeholder_name();
    };
    match components.next() {
        Some(scope) if scope.starts_with('@') => format!("{scope}/{last}"),
        _ => last.to_string(),
    }
}

/// Name given to a package with neither a manifest name nor a usable path.
#[must_use]
pub fn placeholder_name() -> String {
    "__unnamed__".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_underscore_fields_and_unknown_keys() {
        let json = serde_json::json!({
            "name": "a",
            "version": "1.0.0",
            "main": "index.js",
            "_resolved": "https://r/a-1.0.0.tgz",
            "_integrity": "sha512-x",
            "_requiredBy": ["/", "#USER"],
            "_location": "/a",
            "_phantomChildren": { "b": "1.0.0" },
            "_inBundle": true
        });
        let manifest = Manifest::from_value(json).unwrap();
        assert_eq!(manifest.resolved.as_deref(), Some("https://r/a-1.0.0.tgz"));
        assert_eq!(manifest.integrity.as_deref(), Some("sha512-x"));
        assert_eq!(manifest.required_by, vec!["/", "#USER"]);
        assert_eq!(manifest.phantom_children["b"], "1.0.0");
        assert!(manifest.in_bundle);
        assert_eq!(manifest.other["main"], "index.js");

        let back = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["main"], "index.js");
        assert_eq!(back["_location"], "/a");
    }

    #[test]
    fn test_bundled_dependencies_forms() {
        let all: Manifest = serde_json::from_value(serde_json::json!({
            "name": "a",
            "dependencies": { "x": "1", "y": "2" },
            "bundleDependencies": true
        }))
        .unwrap();
        assert_eq!(all.bundled_names(), vec!["x", "y"]);

        let listed: Manifest = serde_json::from_value(serde_json::json!({
            "name": "a",
            "bundledDependencies": ["x"]
        }))
        .unwrap();
        assert_eq!(listed.bundled_names(), vec!["x"]);
    }

    #[test]
    fn test_bin_single_uses_unscoped_name() {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "name": "@scope/tool",
            "bin": "cli.js"
        }))
        .unwrap();
        assert_eq!(manifest.bin_entries()["tool"], "cli.js");
    }

    #[test]
    fn test_name_from_path() {
        assert_eq!(
            name_from_path(&PathBuf::from("/p/node_modules/@s/x")),
            "@s/x"
        );
        assert_eq!(name_from_path(&PathBuf::from("/p/node_modules/x")), "x");
        assert_eq!(name_from_path(&PathBuf::from("/")), placeholder_name());
    }

    #[test]
    fn test_normalize_reports_missing_version() {
        let mut manifest = Manifest::default().with_optional_dep("o", "1");
        manifest.dependencies.insert("o".into(), "1".into());
        let warnings = manifest.normalize("fallback", "/x");
        assert_eq!(manifest.name.as_deref(), Some("fallback"));
        assert!(!manifest.dependencies.contains_key("o"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, warning_codes::MANIFEST);
    }

    #[test]
    fn test_runtime_deps_merges_optional() {
        let manifest = Manifest::new("a", "1.0.0")
            .with_dep("b", "^1")
            .with_optional_dep("c", "^2");
        let deps = manifest.runtime_deps();
        assert_eq!(deps.len(), 2);
        assert!(manifest.is_optional_dep("c"));
    }
}
