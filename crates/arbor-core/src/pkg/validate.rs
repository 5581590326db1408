//! Installability and consistency checks.
//!
//! Engine/platform/self/cycle checks may fail a run; peer and duplicate
//! checks only ever produce [`Warning`]s on the tree.

use super::error::{warning_codes, PkgError, Warning};
use super::manifest::Manifest;
use super::options::InstallOptions;
use super::spec::PackageSpec;
use super::tree::builder::{find_requirement, visible_node};
use super::tree::{Family, NodeId, Tree};
use super::version::satisfies;
use tracing::debug;

/// The environment packages are checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Node-style OS name (`linux`, `darwin`, `win32`, ...).
    pub os: String,
    /// Node-style CPU name (`x64`, `arm64`, `ia32`, ...).
    pub cpu: String,
    /// Version of the JavaScript runtime, if known.
    pub node_version: Option<String>,
}

impl Platform {
    #[must_use]
    pub fn new(os: &str, cpu: &str, node_version: Option<&str>) -> Self {
        Self {
            os: os.to_string(),
            cpu: cpu.to_string(),
            node_version: node_version.map(|v| v.trim_start_matches('v').to_string()),
        }
    }

    /// Detect the running platform. The runtime version comes from `node --version`.
    #[must_use]
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            "windows" => "win32",
            other => other,
        };
        let cpu = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "ia32",
            "powerpc64" => "ppc64",
            other => other,
        };
        let node_version = std::process::Command::new("node")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
        Self::new(os, cpu, node_version.as_deref())
    }
}

/// Check `engines.node` against the platform. Unknown runtime versions pass.
pub fn check_engine(pkg: &Manifest, platform: &Platform) -> Result<(), PkgError> {
    let (Some(wanted), Some(current)) = (pkg.engines.get("node"), &platform.node_version) else {
        return Ok(());
    };
    if satisfies(current, wanted) {
        return Ok(());
    }
    Err(PkgError::unsupported_engine(
        pkg.name.as_deref().unwrap_or_default(),
        pkg.version_str(),
        &format!("node {wanted}"),
        &format!("node {current}"),
    ))
}

/// Check `os` and `cpu` lists (with `!` negations) against the platform.
pub fn check_platform(pkg: &Manifest, platform: &Platform) -> Result<(), PkgError> {
    let os_ok = list_allows(&pkg.os, &platform.os);
    let cpu_ok = list_allows(&pkg.cpu, &platform.cpu);
    if os_ok && cpu_ok {
        return Ok(());
    }
    Err(PkgError::unsupported_platform(
        pkg.name.as_deref().unwrap_or_default(),
        pkg.version_str(),
        &format!("os: {:?}, cpu: {:?}", pkg.os, pkg.cpu),
        &format!("{}/{}", platform.os, platform.cpu),
    ))
}

fn list_allows(list: &[String], current: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    let mut has_positive = false;
    let mut matched = false;
    for entry in list {
        if let Some(negated) = entry.strip_prefix('!') {
            if negated == current {
                return false;
            }
        } else {
            has_positive = true;
            matched |= entry == current || entry == "any";
        }
    }
    !has_positive || matched
}

/// Run the engine and platform checks under the configured strictness.
///
/// Mismatches that are not fatal come back as warnings.
pub fn check_installable(
    pkg: &Manifest,
    platform: &Platform,
    opts: &InstallOptions,
    location: &str,
) -> Result<Vec<Warning>, PkgError> {
    let mut warnings = Vec::new();

    if let Err(e) = check_engine(pkg, platform) {
        if opts.engine_strict && !opts.force {
            return Err(e);
        }
        warnings.push(Warning::new(warning_codes::ENGINE, e.message(), location));
    }
    if let Err(e) = check_platform(pkg, platform) {
        if opts.platform_strict && !opts.force {
            return Err(e);
        }
        warnings.push(Warning::new(warning_codes::PLATFORM, e.message(), location));
    }
    Ok(warnings)
}

/// Refuse to install a package named like the root project.
///
/// With `force` the refusal becomes a warning.
pub fn check_self(root_name: &str, name: &str, force: bool) -> Result<Option<Warning>, PkgError> {
    if root_name != name {
        return Ok(None);
    }
    let err = PkgError::self_dependency(name);
    if force {
        return Ok(Some(Warning::from_error(&err, "/")));
    }
    Err(err)
}

/// Fail if `name@version` already appears among the ancestor frames.
///
/// Under `force` the innermost frame is skipped, tolerating a package
/// installed directly below itself.
pub fn check_cycle(family: &Family, name: &str, version: &str, force: bool) -> Result<(), PkgError> {
    let skip = usize::from(force);
    if family.contains(name, version, skip) {
        return Err(PkgError::cycle(name, version));
    }
    Ok(())
}

/// Ancestor frames of `id`, innermost (its parent) first. The root is not a frame.
#[must_use]
pub fn family_of(tree: &Tree, id: NodeId) -> Family {
    let mut family = Family::new();
    for anc in tree.ancestry(id).into_iter().skip(1).rev() {
        if tree.node(anc).is_top {
            continue;
        }
        let node = tree.node(anc);
        family = family.push(&node.name, node.version());
    }
    family
}

/// Verify installability of `id` once, caching the result on the node.
pub fn gate_node(
    tree: &mut Tree,
    id: NodeId,
    platform: &Platform,
    opts: &InstallOptions,
) -> Result<(), PkgError> {
    if tree.node(id).known_installable {
        return Ok(());
    }
    let location = tree.location(id);
    let node = tree.node(id);
    check_cycle(&family_of(tree, id), &node.name, node.version(), opts.force)?;
    let warnings = check_installable(&node.package, platform, opts, &location)?;

    debug!(name = %node.name, version = %node.version(), "installable");
    tree.warnings.extend(warnings);
    tree.node_mut(id).known_installable = true;
    Ok(())
}

/// Warn about names listed in both `dependencies` and `devDependencies`.
#[must_use]
pub fn dev_prod_duplicates(pkg: &Manifest) -> Vec<Warning> {
    pkg.dev_dependencies
        .keys()
        .filter(|name| pkg.dependencies.contains_key(*name))
        .map(|name| {
            Warning::new(
                warning_codes::DEV_PROD_DUPLICATE,
                format!("{name} is listed in both dependencies and devDependencies"),
                "/",
            )
        })
        .collect()
}

/// Record unmet `peerDependencies` as `missing_peers` plus a root warning.
pub fn validate_all_peer_deps(tree: &mut Tree) {
    let mut found = Vec::new();
    for id in tree.breadth_first() {
        let node = tree.node(id);
        let Some(parent) = node.parent else {
            continue;
        };
        for (peer, range) in &node.package.peer_dependencies {
            let satisfied = PackageSpec::from_dep(peer, range)
                .ok()
                .and_then(|spec| find_requirement(tree, parent, peer, &spec, &node.path))
                .is_some();
            if !satisfied {
                found.push((id, peer.clone(), range.clone()));
            }
        }
    }

    for (id, peer, range) in found {
        let location = tree.location(id);
        let requirer = tree.node(id).id_string();
        tree.node_mut(id).missing_peers.insert(peer.clone(), range.clone());
        tree.warnings.push(Warning::new(
            warning_codes::PEER_MISSING,
            format!("{requirer} requires a peer of {peer}@{range} but none is installed"),
            location,
        ));
    }
}

/// Post-install structural check: a peer that is visible but at the wrong version.
#[must_use]
pub fn check_peer_invalid(tree: &Tree) -> Vec<Warning> {
    let mut warnings = Vec::new();
    for id in tree.breadth_first() {
        let node = tree.node(id);
        let Some(parent) = node.parent else {
            continue;
        };
        for (peer, range) in &node.package.peer_dependencies {
            let Some(installed) = visible_node(tree, parent, peer) else {
                continue;
            };
            let version = tree.node(installed).version();
            if !satisfies(version, range) {
                let err = PkgError::peer_invalid(format!(
                    "{} requires a peer of {peer}@{range} but {peer}@{version} is installed",
                    node.id_string()
                ));
                warnings.push(Warning::from_error(&err, tree.location(id)));
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use std::path::Path;

    fn linux() -> Platform {
        Platform::new("linux", "x64", Some("v18.17.0"))
    }

    #[test]
    fn test_engine_check() {
        let mut pkg = Manifest::new("a", "1.0.0");
        pkg.engines.insert("node".into(), ">=20".into());
        let err = check_engine(&pkg, &linux()).unwrap_err();
        assert_eq!(err.code(), codes::ENOTSUP);

        pkg.engines.insert("node".into(), ">=16".into());
        assert!(check_engine(&pkg, &linux()).is_ok());

        // Unknown runtime version passes.
        let unknown = Platform::new("linux", "x64", None);
        pkg.engines.insert("node".into(), ">=99".into());
        assert!(check_engine(&pkg, &unknown).is_ok());
    }

    #[test]
    fn test_platform_check_with_negation() {
        let mut pkg = Manifest::new("fsevents", "2.0.0");
        pkg.os = vec!["darwin".into()];
        assert_eq!(
            check_platform(&pkg, &linux()).unwrap_err().code(),
            codes::EBADPLATFORM
        );

        pkg.os = vec!["!win32".into()];
        assert!(check_platform(&pkg, &linux()).is_ok());

        pkg.cpu = vec!["!x64".into()];
        assert!(check_platform(&pkg, &linux()).is_err());
    }

    #[test]
    fn test_check_installable_strictness() {
        let mut pkg = Manifest::new("a", "1.0.0");
        pkg.engines.insert("node".into(), ">=20".into());
        pkg.os = vec!["darwin".into()];

        let opts = InstallOptions::default();
        assert!(check_installable(&pkg, &linux(), &opts, "/a").is_err());

        let forced = InstallOptions::default().with_force(true);
        let warnings = check_installable(&pkg, &linux(), &forced, "/a").unwrap();
        assert_eq!(warnings.len(), 2);

        let lax = InstallOptions::default().with_platform_strict(false);
        let warnings = check_installable(&pkg, &linux(), &lax, "/a").unwrap();
        assert_eq!(warnings[0].code, warning_codes::ENGINE);
    }

    #[test]
    fn test_check_self() {
        assert!(check_self("app", "lodash", false).unwrap().is_none());
        assert_eq!(
            check_self("app", "app", false).unwrap_err().code(),
            codes::ENOSELF
        );
        assert!(check_self("app", "app", true).unwrap().is_some());
    }

    #[test]
    fn test_check_cycle_skips_parent_only_under_force() {
        let family = Family::new().push("a", "1.0.0").push("b", "1.0.0");
        assert!(check_cycle(&family, "a", "1.0.0", false).is_err());
        assert!(check_cycle(&family, "a", "1.0.0", true).is_err());
        assert!(check_cycle(&family, "b", "1.0.0", false).is_err());
        assert!(check_cycle(&family, "b", "1.0.0", true).is_ok());
        assert!(check_cycle(&family, "a", "2.0.0", false).is_ok());
    }

    #[test]
    fn test_gate_node_runs_once() {
        let mut tree = Tree::new(Manifest::new("root", "1.0.0"), Path::new("/p"));
        let root = tree.root();
        let mut pkg = Manifest::new("a", "1.0.0");
        pkg.os = vec!["darwin".into()];
        let a = tree.add_node(pkg, None);
        tree.attach(a, root);

        let lax = InstallOptions::default().with_platform_strict(false);
        gate_node(&mut tree, a, &linux(), &lax).unwrap();
        assert!(tree.node(a).known_installable);
        assert_eq!(tree.warnings.len(), 1);

        // Second call reuses the cached result, even under stricter options.
        gate_node(&mut tree, a, &linux(), &InstallOptions::default()).unwrap();
        assert_eq!(tree.warnings.len(), 1);
    }

    #[test]
    fn test_peer_missing_and_invalid() {
        let mut tree = Tree::new(Manifest::new("root", "1.0.0"), Path::new("/p"));
        let root = tree.root();
        let plugin = tree.add_node(
            Manifest::new("plugin", "1.0.0").with_peer_dep("host", "^2.0.0"),
            None,
        );
        tree.attach(plugin, root);

        validate_all_peer_deps(&mut tree);
        assert!(tree.node(plugin).missing_peers.contains_key("host"));
        assert_eq!(tree.warnings[0].code, warning_codes::PEER_MISSING);
        assert!(check_peer_invalid(&tree).is_empty());

        let host = tree.add_node(Manifest::new("host", "1.5.0"), None);
        tree.attach(host, root);
        let invalid = check_peer_invalid(&tree);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].code, codes::EPEERINVALID);
    }

    #[test]
    fn test_dev_prod_duplicates() {
        let pkg = Manifest::new("root", "1.0.0")
            .with_dep("a", "^1.0.0")
            .with_dev_dep("a", "^1.0.0")
            .with_dev_dep("b", "^1.0.0");
        let warnings = dev_prod_duplicates(&pkg);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, warning_codes::DEV_PROD_DUPLICATE);
    }
}
