//! npm registry client and the default [`PackageSource`].

use super::cache::PackageCache;
use super::error::PkgError;
use super::manifest::Manifest;
use super::source::{self, ContentStore, PackageSource};
use super::spec::{PackageSpec, SpecKind};
use super::tarball::{download_tarball, extract_tgz_atomic, read_tgz_manifest, tarball_integrity, MAX_TARBALL_SIZE};
use super::version::resolve_version;
use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "ARBOR_REGISTRY";

/// Registry client for fetching package metadata.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    http: Client,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PkgError::network(format!("Invalid registry URL '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| PkgError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { base_url, http })
    }

    /// Create a client using the registry URL from environment or default.
    ///
    /// # Errors
    /// Returns an error if the client cannot be created.
    pub fn from_env() -> Result<Self, PkgError> {
        let url = std::env::var(REGISTRY_ENV).unwrap_or_else(|_| DEFAULT_REGISTRY.to_string());
        Self::new(&url)
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Get the HTTP client (for reuse in tarball downloads).
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Fetch the packument (package metadata) for a package.
    ///
    /// # Errors
    /// Returns an error if the request fails or the package is not found.
    pub async fn fetch_packument(&self, name: &str) -> Result<serde_json::Value, PkgError> {
        // URL-encode the name for scoped packages
        let encoded_name = if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        };

        let url = self
            .base_url
            .join(&encoded_name)
            .map_err(|e| PkgError::network(format!("Failed to build URL for '{name}': {e}")))?;

        let response = self.http.get(url.as_str()).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }

        if !response.status().is_success() {
            return Err(PkgError::network(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let json: serde_json::Value = response.json().await?;
        Ok(json)
    }
}

/// Look up a dist-tag in a packument.
#[must_use]
pub fn get_dist_tag<'a>(packument: &'a serde_json::Value, tag: &str) -> Option<&'a str> {
    packument.get("dist-tags")?.get(tag)?.as_str()
}

/// Extract the tarball URL for a specific version.
#[must_use]
pub fn get_tarball_url<'a>(packument: &'a serde_json::Value, version: &str) -> Option<&'a str> {
    packument
        .get("versions")?
        .get(version)?
        .get("dist")?
        .get("tarball")?
        .as_str()
}

/// Get all available version strings from a packument.
#[must_use]
pub fn get_versions(packument: &serde_json::Value) -> Vec<&str> {
    packument
        .get("versions")
        .and_then(|v| v.as_object())
        .map(|obj| obj.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Build the manifest for one version of a packument.
///
/// `_resolved` comes from `dist.tarball`, `_integrity` from `dist.integrity`
/// (or `dist.shasum` as `sha1-<hex>`).
///
/// # Errors
/// Returns `ENOENT` if the version is absent, `EMANIFEST` if it is malformed.
pub fn manifest_for_version(
    packument: &serde_json::Value,
    version: &str,
) -> Result<Manifest, PkgError> {
    let name = packument
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let doc = packument
        .get("versions")
        .and_then(|v| v.get(version))
        .ok_or_else(|| PkgError::version_not_found(name, version))?;

    let dist = doc.get("dist").cloned().unwrap_or_default();
    let mut manifest = Manifest::from_value(doc.clone())?;
    manifest.other.remove("dist");
    manifest.resolved = dist
        .get("tarball")
        .and_then(|t| t.as_str())
        .map(String::from);
    manifest.integrity = dist
        .get("integrity")
        .and_then(|t| t.as_str())
        .map(String::from)
        .or_else(|| {
            dist.get("shasum")
                .and_then(|t| t.as_str())
                .map(|s| format!("sha1-{s}"))
        });
    Ok(manifest)
}

/// The default package source: npm registry, tarball URLs, git and local directories.
///
/// Fetched artifacts land in the [`PackageCache`] first and are copied into
/// place from there.
#[derive(Debug)]
pub struct RegistrySource {
    client: RegistryClient,
    cache: PackageCache,
    packuments: Mutex<HashMap<String, Arc<serde_json::Value>>>,
}

impl RegistrySource {
    #[must_use]
    pub fn new(client: RegistryClient, cache: PackageCache) -> Self {
        Self {
            client,
            cache,
            packuments: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    async fn packument(&self, name: &str) -> Result<Arc<serde_json::Value>, PkgError> {
        if let Some(doc) = self.packuments.lock().await.get(name) {
            return Ok(Arc::clone(doc));
        }

        let doc = match self.client.fetch_packument(name).await {
            Ok(doc) => {
                if let Err(e) = self.cache.write_packument(name, &doc) {
                    debug!(name = %name, error = %e, "failed to cache packument");
                }
                doc
            }
            // Offline fallback
            Err(e) if e.code() == super::error::codes::ENETWORK => {
                self.cache.read_packument(name).ok_or(e)?
            }
            Err(e) => return Err(e),
        };

        let doc = Arc::new(doc);
        self.packuments
            .lock()
            .await
            .insert(name.to_string(), Arc::clone(&doc));
        Ok(doc)
    }

    async fn resolve_tarball(&self, spec: &PackageSpec, url: &str, base_dir: &Path) -> Result<Manifest, PkgError> {
        let bytes = if let Some(path) = url.strip_prefix("file:") {
            let path = base_dir.join(path);
            bytes::Bytes::from(std::fs::read(&path).map_err(|e| PkgError::io_at(&path, &e))?)
        } else {
            download_tarball(self.client.http(), url, MAX_TARBALL_SIZE).await?
        };

        let mut manifest = read_tgz_manifest(&bytes)?;
        let integrity = tarball_integrity(&bytes);
        let name = manifest.name_or_from_path(Path::new(&spec.name));
        let dest = self
            .cache
            .package_dir(&name, manifest.version_str(), Some(&integrity));
        extract_tgz_atomic(&bytes, &dest)?;

        source::annotate(&mut manifest, spec);
        manifest.resolved = Some(url.to_string());
        manifest.integrity = Some(integrity);
        Ok(manifest)
    }

    async fn resolve_git(&self, spec: &PackageSpec, url: &str, committish: Option<&str>) -> Result<Manifest, PkgError> {
        let scratch = tempfile::tempdir()?;
        let checkout = scratch.path().join("repo");
        let checkout_str = checkout.to_string_lossy().to_string();

        git(&["clone", "--quiet", url, &checkout_str], scratch.path()).await?;
        if let Some(c) = committish {
            git(&["checkout", "--quiet", c], &checkout).await?;
        }
        let sha = git(&["rev-parse", "HEAD"], &checkout).await?;

        if !checkout.join("package.json").is_file() {
            return Err(PkgError::not_local(&checkout));
        }
        let mut manifest = Manifest::read_dir(&checkout)?;
        let integrity = format!("git-{sha}");
        let name = manifest.name_or_from_path(Path::new(&spec.name));
        self.cache
            .put(&name, manifest.version_str(), Some(&integrity), &checkout)?;

        source::annotate(&mut manifest, spec);
        manifest.resolved = Some(format!("git+{url}#{sha}"));
        manifest.integrity = Some(integrity);
        Ok(manifest)
    }
}

async fn git(args: &[&str], cwd: &Path) -> Result<String, PkgError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| PkgError::network(format!("Failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(PkgError::network(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn hosted_url(host: &str, repo: &str) -> String {
    let domain = match host {
        "gitlab" => "gitlab.com",
        "bitbucket" => "bitbucket.org",
        _ => "github.com",
    };
    format!("https://{domain}/{repo}.git")
}

impl PackageSource for RegistrySource {
    async fn resolve_metadata(
        &self,
        spec: &PackageSpec,
        base_dir: &Path,
    ) -> Result<Manifest, PkgError> {
        debug!(name = %spec.name, spec = %spec.raw, kind = spec.kind.label(), "resolving");
        match &spec.kind {
            SpecKind::Version(_) | SpecKind::Range(_) | SpecKind::Tag(_) => {
                let packument = self.packument(&spec.name).await?;
                let version = resolve_version(&packument, Some(&spec.raw))?;
                let mut manifest = manifest_for_version(&packument, &version)?;
                source::annotate(&mut manifest, spec);
                Ok(manifest)
            }
            SpecKind::Directory(_) => source::resolve_directory(spec, base_dir),
            SpecKind::Tarball(url) => self.resolve_tarball(spec, url, base_dir).await,
            SpecKind::Git { url, committish } => {
                self.resolve_git(spec, url, committish.as_deref()).await
            }
            SpecKind::Hosted {
                host,
                repo,
                committish,
            } => {
                self.resolve_git(spec, &hosted_url(host, repo), committish.as_deref())
                    .await
            }
        }
    }

    async fn prefetch(&self, manifest: &Manifest) -> Result<(), PkgError> {
        if source::is_directory_source(manifest) {
            return Ok(());
        }
        let name = manifest.name.as_deref().unwrap_or_default();
        let integrity = manifest.integrity.as_deref();
        if self.cache.is_cached(name, manifest.version_str(), integrity) {
            return Ok(());
        }
        let url = manifest
            .resolved
            .as_deref()
            .ok_or_else(|| PkgError::not_found(&manifest.id()))?;

        debug!(name = %name, version = %manifest.version_str(), "downloading tarball");
        let bytes = download_tarball(self.client.http(), url, MAX_TARBALL_SIZE).await?;
        let dest = self.cache.package_dir(name, manifest.version_str(), integrity);
        extract_tgz_atomic(&bytes, &dest)
    }

    async fn fetch_and_extract(&self, manifest: &Manifest, dest: &Path) -> Result<(), PkgError> {
        if source::is_directory_source(manifest) {
            return source::extract_directory(manifest, dest);
        }
        self.prefetch(manifest).await?;

        let name = manifest.name.as_deref().unwrap_or_default();
        let cached: PathBuf = self
            .cache
            .get(name, manifest.version_str(), manifest.integrity.as_deref())
            .ok_or_else(|| PkgError::not_found(&manifest.id()))?;
        arbor_util::fs::copy_dir_all(&cached, dest, |_| true).map_err(|e| PkgError::io_at(dest, &e))
    }
}
