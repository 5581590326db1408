//! Ideal tree construction.
//!
//! The builder walks a worklist of nodes. For each node it links every
//! dependency that an existing node already satisfies, resolves the rest
//! through the [`PackageSource`] with bounded concurrency, and places each new
//! package at the shallowest level where it does not conflict.

use super::super::diff::pkg_are_equiv;
use super::super::disk;
use super::super::error::{warning_codes, PkgError, Warning};
use super::logical;
use super::super::manifest::Manifest;
use super::super::options::InstallOptions;
use super::super::shrinkwrap::ShrinkwrapEntry;
use super::super::source::PackageSource;
use super::super::spec::{PackageSpec, SpecKind};
use super::super::validate::{self, Platform};
use super::super::version::satisfies;
use super::node::{NodeId, Tree};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use tracing::{debug, info, warn};

/// Which manifest section a dependency came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepKind {
    Prod,
    Dev,
    Optional,
}

/// A requested package recorded into the root manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDep {
    pub section: &'static str,
    pub name: String,
    pub spec: String,
}

/// What a build produced besides the tree itself.
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    /// Nodes created for the user's requested specs.
    pub requested: Vec<NodeId>,
    pub saved: Vec<SavedDep>,
}

/// Builds the ideal tree.
pub struct TreeBuilder<'a, S> {
    source: &'a S,
    opts: &'a InstallOptions,
    platform: &'a Platform,
    /// Where bundling packages are extracted to read their bundles.
    scratch: &'a Path,
}

impl<'a, S: PackageSource> TreeBuilder<'a, S> {
    pub fn new(
        source: &'a S,
        opts: &'a InstallOptions,
        platform: &'a Platform,
        scratch: &'a Path,
    ) -> Self {
        Self {
            source,
            opts,
            platform,
            scratch,
        }
    }

    /// Populate `tree` (usually a clone of the on-disk tree) into the ideal tree.
    ///
    /// Lockfile entries attached to the root are inflated first, then the
    /// user's `requested` specs, then every reachable node's dependencies.
    pub async fn build(
        &self,
        tree: &mut Tree,
        requested: &[PackageSpec],
    ) -> Result<BuildOutcome, PkgError> {
        let root = tree.root();
        self.inflate_shrinkwrap(tree).await?;
        let outcome = self.load_requested_deps(tree, requested).await?;

        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            let node = tree.node(id);
            if node.removed || node.failed || !seen.insert(id) {
                continue;
            }
            let (next, requeue) = self.load_deps(tree, id).await?;
            for r in requeue {
                seen.remove(&r);
                queue.push_back(r);
            }
            queue.extend(next);
        }

        let pruned = logical::prune_extraneous(tree);
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned unreachable nodes");
        }
        validate::validate_all_peer_deps(tree);
        logical::mark_flags(tree);
        let duplicates = validate::dev_prod_duplicates(&tree.node(root).package);
        tree.warnings.extend(duplicates);

        info!(nodes = tree.iter().count(), "ideal tree built");
        Ok(outcome)
    }

    /// Resolve the user's requested specs and hang them off the root.
    ///
    /// A requested package equivalent to the one already at the top level is
    /// reused unless `force` is set.
    pub async fn load_requested_deps(
        &self,
        tree: &mut Tree,
        specs: &[PackageSpec],
    ) -> Result<BuildOutcome, PkgError> {
        let root = tree.root();
        let mut outcome = BuildOutcome::default();
        if specs.is_empty() {
            return Ok(outcome);
        }

        let base = tree.node(root).path.clone();
        let results = self
            .resolve_all(specs.iter().map(|s| (s.name.clone(), s.clone())), &base)
            .await;

        for (spec, result) in results {
            let mut manifest = result?;
            let name = manifest.name_or_from_path(Path::new(&spec.name));
            if let Some(w) = validate::check_self(&tree.node(root).name, &name, self.opts.force)? {
                tree.warnings.push(w);
            }
            tree.warnings
                .extend(manifest.normalize(&name, &format!("/{name}")));

            let existing = tree
                .child_named(root, &name)
                .filter(|e| !self.opts.force && pkg_are_equiv(&tree.node(*e).package, &manifest));
            let id = if let Some(existing) = existing {
                existing
            } else {
                let saved_version = manifest.version_str().to_string();
                let (id, _) = place_node(tree, root, &name, manifest);
                self.inflate_bundle(tree, id).await?;
                debug!(name = %name, version = %saved_version, "requested");
                id
            };

            tree.node_mut(id).user_required = true;
            tree.add_requirement(root, id);
            outcome.requested.push(id);

            if self.opts.saves() {
                let saved = SavedDep {
                    section: self.opts.save_section(),
                    name: name.clone(),
                    spec: save_spec(&spec, tree.node(id).version()),
                };
                record_saved(&mut tree.node_mut(root).package, &saved);
                outcome.saved.push(saved);
            }
        }
        Ok(outcome)
    }

    /// Link or resolve every dependency of `id`.
    ///
    /// Returns the nodes to visit next and the nodes whose requirements must be
    /// recomputed because a package they used was replaced.
    async fn load_deps(
        &self,
        tree: &mut Tree,
        id: NodeId,
    ) -> Result<(Vec<NodeId>, Vec<NodeId>), PkgError> {
        let wanted = self.wanted_deps(tree, id);
        let base = tree.node(id).realpath.clone();

        // Requirements are recomputed from the manifest each visit.
        let old: Vec<NodeId> = tree.node(id).requires.clone();
        for dep in old {
            if !tree.node(dep).user_required || !tree.node(id).is_top {
                tree.remove_requirement(id, dep);
            }
        }

        let mut next = Vec::new();
        let mut requeue = Vec::new();
        let mut to_resolve = Vec::new();
        let mut kinds = BTreeMap::new();

        for (name, range, kind) in wanted {
            if tree.node(id).removed {
                return Ok((Vec::new(), requeue));
            }
            if tree.node(id).is_top
                && tree
                    .child_named(id, &name)
                    .is_some_and(|c| tree.node(c).user_required)
            {
                continue;
            }
            let spec = match PackageSpec::from_dep(&name, &range) {
                Ok(spec) => spec,
                Err(e) => {
                    self.dependency_failed(tree, id, &name, kind, e)?;
                    continue;
                }
            };
            if let Some(found) = find_requirement(tree, id, &name, &spec, &base) {
                tree.add_requirement(id, found);
                mark_phantoms(tree, id, found);
                clear_missing(tree, id, &name);
                next.push(found);
                continue;
            }
            record_missing(tree, id, &name, &range, kind);
            kinds.insert(name.clone(), kind);
            to_resolve.push((name, spec));
        }

        for (spec, result) in self.resolve_all(to_resolve, &base).await {
            if tree.node(id).removed {
                break;
            }
            let name = spec.name.clone();
            let kind = kinds.get(&name).copied().unwrap_or(DepKind::Prod);
            let mut manifest = match result {
                Ok(m) => m,
                Err(e) => {
                    self.dependency_failed(tree, id, &name, kind, e)?;
                    continue;
                }
            };

            let location = format!("{}/{name}", tree.location(id).trim_end_matches('/'));
            tree.warnings.extend(manifest.normalize(&name, &location));

            if kind == DepKind::Optional {
                match validate::check_installable(&manifest, self.platform, self.opts, &location) {
                    Ok(warnings) => tree.warnings.extend(warnings),
                    Err(e) => {
                        warn!(name = %name, error = %e, "skipping optional dependency");
                        tree.warnings.push(Warning::new(
                            warning_codes::SKIPPED,
                            format!("Skipping optional dependency {}: {}", manifest.id(), e.message()),
                            location,
                        ));
                        clear_missing(tree, id, &name);
                        continue;
                    }
                }
            }
            if tree.node(id).is_top {
                if let Some(w) =
                    validate::check_self(&tree.node(id).name, &name, self.opts.force)?
                {
                    tree.warnings.push(w);
                }
            }

            // An ancestor already is this exact package: link to it instead
            // of nesting another copy.
            let ancestor = tree.ancestry(id).into_iter().find(|a| {
                let n = tree.node(*a);
                !n.is_top && n.name == name && n.version() == manifest.version_str()
            });
            if let Some(anc) = ancestor {
                tree.add_requirement(id, anc);
                clear_missing(tree, id, &name);
                continue;
            }

            let place = if self.opts.legacy_bundling {
                id
            } else {
                earliest_installable(tree, self.opts, id, id, &manifest).unwrap_or(id)
            };
            let (child, replaced) = place_node(tree, place, &name, manifest);
            requeue.extend(replaced.into_iter().filter(|r| *r != id));
            tree.add_requirement(id, child);
            mark_phantoms(tree, id, child);
            clear_missing(tree, id, &name);

            if let Err(e) = self.inflate_bundle(tree, child).await {
                tree.remove_subtree(child);
                self.dependency_failed(tree, id, &name, kind, e)?;
                continue;
            }
            debug!(
                name = %name,
                version = %tree.node(child).version(),
                path = %tree.location(child),
                "placed"
            );
            next.push(child);
        }

        Ok((next, requeue))
    }

    /// Dependencies `id` must have, sorted by name.
    fn wanted_deps(&self, tree: &Tree, id: NodeId) -> Vec<(String, String, DepKind)> {
        let node = tree.node(id);
        let pkg = &node.package;
        let mut wanted: BTreeMap<String, (String, DepKind)> = BTreeMap::new();

        if node.is_top && !self.opts.production {
            for (name, range) in &pkg.dev_dependencies {
                wanted.insert(name.clone(), (range.clone(), DepKind::Dev));
            }
        }
        for (name, range) in &pkg.dependencies {
            wanted.insert(name.clone(), (range.clone(), DepKind::Prod));
        }
        if self.opts.include_optional {
            for (name, range) in &pkg.optional_dependencies {
                wanted.insert(name.clone(), (range.clone(), DepKind::Optional));
            }
        }
        wanted
            .into_iter()
            .map(|(name, (range, kind))| (name, range, kind))
            .collect()
    }

    /// Record a dependency that could not be resolved or placed.
    ///
    /// Returns the error when the failure is not contained by an optional edge.
    fn dependency_failed(
        &self,
        tree: &mut Tree,
        id: NodeId,
        name: &str,
        kind: DepKind,
        err: PkgError,
    ) -> Result<(), PkgError> {
        let location = tree.location(id);
        if kind != DepKind::Optional && failed_dependency(tree, id, name) {
            warn!(name = %name, requirer = %location, error = %err, "dependency failed");
            return Err(err);
        }

        warn!(name = %name, requirer = %location, error = %err, "optional dependency failed");
        clear_missing(tree, id, name);
        tree.warnings.push(Warning::new(
            warning_codes::OPTIONAL_FAILED,
            format!("{name}: {err}"),
            location,
        ));
        for failed in prune_failed(tree) {
            debug!(path = %tree.node(failed).path.display(), "dropped failed node");
        }
        Ok(())
    }

    /// Resolve several specs concurrently, returning results in name order.
    async fn resolve_all(
        &self,
        specs: impl IntoIterator<Item = (String, PackageSpec)>,
        base: &Path,
    ) -> Vec<(PackageSpec, Result<Manifest, PkgError>)> {
        let source = self.source;
        let mut results: Vec<_> = stream::iter(specs)
            .map(|(_, spec)| async move {
                let result = source.resolve_metadata(&spec, base).await;
                (spec, result)
            })
            .buffer_unordered(self.opts.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        results
    }

    /// Attach the lockfile entries recorded on the root.
    ///
    /// Pinned entries resolve by their exact version or source. If that fails
    /// the entry's original range is resolved live instead.
    async fn inflate_shrinkwrap(&self, tree: &mut Tree) -> Result<(), PkgError> {
        let root = tree.root();
        let Some(entries) = tree.node_mut(root).shrinkwrap.take() else {
            return Ok(());
        };
        let base = tree.node(root).path.clone();

        let mut frontier: Vec<(NodeId, String, ShrinkwrapEntry)> = entries
            .into_iter()
            .map(|(name, entry)| (root, name, entry))
            .collect();

        while !frontier.is_empty() {
            let mut pending = Vec::new();
            let mut next = Vec::new();

            for (parent, name, entry) in frontier {
                if entry.bundled
                    || (entry.dev && self.opts.production)
                    || (entry.optional && !self.opts.include_optional)
                {
                    continue;
                }
                if let Some(existing) = tree.child_named(parent, &name) {
                    if entry_matches(&tree.node(existing).package, &entry) {
                        tree.node_mut(existing).from_shrinkwrap = Some(entry.pin());
                        push_children(&mut next, existing, &entry);
                        continue;
                    }
                }
                pending.push((parent, name, entry));
            }

            let source = self.source;
            let base = &base;
            let mut resolved: Vec<_> = stream::iter(pending)
                .map(|(parent, name, entry)| async move {
                    let result = resolve_pinned(source, &name, &entry, base).await;
                    (parent, name, entry, result)
                })
                .buffer_unordered(self.opts.concurrency)
                .collect()
                .await;
            resolved.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

            for (parent, name, entry, result) in resolved {
                if tree.node(parent).removed {
                    continue;
                }
                let mut manifest = match result {
                    Ok(m) => m,
                    Err(e) if entry.optional => {
                        tree.warnings.push(Warning::new(
                            warning_codes::OPTIONAL_FAILED,
                            format!("{name}: {e}"),
                            tree.location(parent),
                        ));
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if manifest.integrity.is_none() {
                    manifest.integrity.clone_from(&entry.integrity);
                }
                let location = format!("{}/{name}", tree.location(parent).trim_end_matches('/'));
                tree.warnings.extend(manifest.normalize(&name, &location));

                let (child, _) = place_node(tree, parent, &name, manifest);
                tree.node_mut(child).from_shrinkwrap = Some(entry.pin());
                self.inflate_bundle(tree, child).await?;
                push_children(&mut next, child, &entry);
            }
            frontier = next;
        }
        Ok(())
    }

    /// Extract a bundling package to scratch space and attach its bundle.
    async fn inflate_bundle(&self, tree: &mut Tree, id: NodeId) -> Result<(), PkgError> {
        if !tree.node(id).package.has_bundled() || tree.node(id).staged.is_some() {
            return Ok(());
        }
        let staged = self.scratch.join(format!("bundle-{}", id.0));
        self.source
            .fetch_and_extract(&tree.node(id).package, &staged)
            .await?;

        let packages = disk::read_node_modules(&staged.join("node_modules"))?;
        let attached = disk::attach_packages(tree, id, packages, Some(id));
        tree.node_mut(id).staged = Some(staged);
        debug!(name = %tree.node(id).name, bundled = attached.len(), "inflated bundle");
        Ok(())
    }
}

fn entry_matches(pkg: &Manifest, entry: &ShrinkwrapEntry) -> bool {
    match (&pkg.integrity, &entry.integrity) {
        (Some(a), Some(b)) => a == b,
        _ => {
            pkg.version_str() == entry.version
                || pkg.spec.as_deref() == Some(entry.version.as_str())
        }
    }
}

fn push_children(
    next: &mut Vec<(NodeId, String, ShrinkwrapEntry)>,
    parent: NodeId,
    entry: &ShrinkwrapEntry,
) {
    for (name, child) in &entry.dependencies {
        next.push((parent, name.clone(), child.clone()));
    }
}

async fn resolve_pinned<S: PackageSource>(
    source: &S,
    name: &str,
    entry: &ShrinkwrapEntry,
    base: &Path,
) -> Result<Manifest, PkgError> {
    let pinned = entry.to_spec(name)?;
    match source.resolve_metadata(&pinned, base).await {
        Ok(m) => Ok(m),
        Err(e) => {
            let Some(from) = entry.from.as_deref() else {
                return Err(e);
            };
            warn!(name = %name, error = %e, "pinned entry unavailable, resolving live");
            let live = PackageSpec::parse(from)?;
            source.resolve_metadata(&live, base).await
        }
    }
}

/// Create a node for `pkg` under `place`, replacing a same-named child.
///
/// Returns the new node and the requirers of the replaced one.
fn place_node(tree: &mut Tree, place: NodeId, name: &str, pkg: Manifest) -> (NodeId, Vec<NodeId>) {
    let mut replaced = Vec::new();
    if let Some(old) = tree.child_named(place, name) {
        replaced = tree.node(old).required_by.clone();
        tree.remove_subtree(old);
    }
    let child = tree.add_node(pkg, Some(name));
    tree.attach(child, place);
    (child, replaced)
}

/// Find an existing node that satisfies `spec` for a requirer at `from`.
///
/// Checks `from` itself, then its children, then each ancestor's children.
/// The nearest same-named node decides: if it does not match, nothing above
/// it is considered. Linked packages do not see past their link.
#[must_use]
pub fn find_requirement(
    tree: &Tree,
    from: NodeId,
    name: &str,
    spec: &PackageSpec,
    base: &Path,
) -> Option<NodeId> {
    let mut level = from;
    loop {
        let node = tree.node(level);
        if node.name == name && node.parent.is_some() && !node.removed {
            return does_child_version_match(tree, level, spec, base).then_some(level);
        }
        if let Some(child) = tree.child_named(level, name) {
            if tree.node(child).failed {
                return None;
            }
            return does_child_version_match(tree, child, spec, base).then_some(child);
        }
        if node.is_top || node.is_link {
            return None;
        }
        level = node.parent?;
    }
}

/// The node a module lookup from `from` would find for `name`, matching or not.
#[must_use]
pub fn visible_node(tree: &Tree, from: NodeId, name: &str) -> Option<NodeId> {
    let mut level = from;
    loop {
        if let Some(child) = tree.child_named(level, name) {
            return Some(child);
        }
        let node = tree.node(level);
        if node.is_top || node.is_link {
            return None;
        }
        level = node.parent?;
    }
}

/// Whether an installed node satisfies a request.
///
/// Registry requests compare versions, `*` and tags accept anything, and
/// other sources must match the recorded source exactly.
#[must_use]
pub fn does_child_version_match(tree: &Tree, child: NodeId, spec: &PackageSpec, base: &Path) -> bool {
    let node = tree.node(child);
    let pkg = &node.package;
    match &spec.kind {
        SpecKind::Tag(_) => true,
        SpecKind::Range(r) if r.trim() == "*" || r.is_empty() => true,
        SpecKind::Version(v) | SpecKind::Range(v) => satisfies(pkg.version_str(), v),
        SpecKind::Directory(_) => {
            let Some(dir) = spec.local_path(base) else {
                return false;
            };
            let dir = dunce::canonicalize(&dir).unwrap_or(dir);
            if node.is_link {
                return node.realpath == dir;
            }
            pkg.resolved.as_deref() == Some(format!("file:{}", dir.display()).as_str())
        }
        SpecKind::Git { .. } | SpecKind::Hosted { .. } | SpecKind::Tarball(_) => {
            if node.from_shrinkwrap.is_some() {
                return true;
            }
            pkg.spec.as_deref() == Some(spec.raw.as_str())
                || pkg.from.as_deref() == Some(spec.display().as_str())
        }
    }
}

/// The shallowest level at or above `start` where `pkg` can live.
///
/// Returns `None` when `start` itself cannot take it, in which case the
/// caller nests the package directly below the requirer.
#[must_use]
pub fn earliest_installable(
    tree: &Tree,
    opts: &InstallOptions,
    required_by: NodeId,
    start: NodeId,
    pkg: &Manifest,
) -> Option<NodeId> {
    let name = pkg.name.as_deref().unwrap_or_default();
    let bins = pkg.bin_entries();
    let mut candidate = None;
    let mut level = start;

    loop {
        let node = tree.node(level);

        if tree.child_named(level, name).is_some() {
            return candidate;
        }
        let bin_clash = !bins.is_empty()
            && node.children.iter().any(|c| {
                let child = tree.node(*c);
                !child.removed && child.package.bin_entries().keys().any(|b| bins.contains_key(b))
            });
        if bin_clash {
            return candidate;
        }
        // A level that asks for another version of this name must keep seeing it.
        if level != required_by {
            let wanted = node.package.runtime_deps().get(name).cloned().or_else(|| {
                node.is_top
                    .then(|| node.package.dev_dependencies.get(name).cloned())
                    .flatten()
            });
            if wanted.is_some_and(|range| !accepts(name, &range, pkg)) {
                return candidate;
            }
        }
        if node.phantom_children.contains_key(name) {
            return candidate;
        }

        if node.is_top || node.is_global || node.is_link {
            return Some(level);
        }
        let Some(parent) = node.parent else {
            return Some(level);
        };
        if opts.global_style && tree.node(parent).is_top {
            return Some(level);
        }
        if opts.legacy_bundling {
            return Some(level);
        }
        candidate = Some(level);
        level = parent;
    }
}

fn accepts(name: &str, range: &str, pkg: &Manifest) -> bool {
    match PackageSpec::from_dep(name, range).map(|s| s.kind) {
        Ok(SpecKind::Tag(_)) => true,
        Ok(SpecKind::Version(r) | SpecKind::Range(r)) => satisfies(pkg.version_str(), &r),
        _ => false,
    }
}

/// Record `dep` as a phantom child of every level between `from` and where `dep` lives.
pub fn mark_phantoms(tree: &mut Tree, from: NodeId, dep: NodeId) {
    let Some(home) = tree.node(dep).parent else {
        return;
    };
    let name = tree.node(dep).name.clone();
    for level in tree.ancestry(from) {
        if level == home || tree.is_ancestor(level, home) {
            break;
        }
        if level == dep {
            continue;
        }
        tree.node_mut(level).phantom_children.insert(name.clone(), dep);
    }
}

/// Mark `requirer` failed because its dependency `name` failed.
///
/// Returns `false` when the failure is contained: `name` is an optional
/// dependency of `requirer`, or every path upward passes an optional edge.
/// Returns `true` when it reaches the root or a user-requested package.
pub fn failed_dependency(tree: &mut Tree, requirer: NodeId, name: &str) -> bool {
    if tree.node(requirer).package.is_optional_dep(name) {
        return false;
    }
    propagate_failure(tree, requirer)
}

/// Mark `id` failed and walk the failure up through `required_by`.
///
/// Stops at optional edges. Returns `true` if a root or user-requested node
/// is reached through required edges.
pub fn propagate_failure(tree: &mut Tree, id: NodeId) -> bool {
    let mut stack = vec![id];
    let mut seen = HashSet::new();
    let mut fatal = false;

    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        tree.node_mut(n).failed = true;
        let node = tree.node(n);
        if node.is_top || node.user_required {
            fatal = true;
            continue;
        }
        let name = node.name.clone();
        for req in node.required_by.clone() {
            let requirer = tree.node(req);
            if requirer.package.is_optional_dep(&name) {
                continue;
            }
            stack.push(req);
        }
    }
    fatal
}

/// Drop every failed, non-root node from the tree.
pub fn prune_failed(tree: &mut Tree) -> Vec<NodeId> {
    let failed: Vec<NodeId> = tree
        .iter()
        .filter(|n| n.failed && !n.is_top)
        .map(|n| n.id)
        .collect();
    for id in &failed {
        if !tree.node(*id).removed {
            tree.remove_subtree(*id);
        }
    }
    let root = tree.root();
    tree.node_mut(root).failed = false;
    failed
}

/// The range to write into `package.json` for a requested spec.
#[must_use]
pub fn save_spec(spec: &PackageSpec, version: &str) -> String {
    match &spec.kind {
        SpecKind::Tag(_) | SpecKind::Version(_) => format!("^{version}"),
        SpecKind::Range(r) if r.is_empty() || r == "*" => format!("^{version}"),
        SpecKind::Range(r) => r.clone(),
        _ => spec.raw.clone(),
    }
}

fn record_saved(root: &mut Manifest, saved: &SavedDep) {
    root.dependencies.remove(&saved.name);
    root.dev_dependencies.remove(&saved.name);
    root.optional_dependencies.remove(&saved.name);
    let section = match saved.section {
        "devDependencies" => &mut root.dev_dependencies,
        "optionalDependencies" => &mut root.optional_dependencies,
        _ => &mut root.dependencies,
    };
    section.insert(saved.name.clone(), saved.spec.clone());
}

fn record_missing(tree: &mut Tree, id: NodeId, name: &str, range: &str, kind: DepKind) {
    let node = tree.node_mut(id);
    match kind {
        DepKind::Dev => node.missing_dev_deps.insert(name.to_string(), range.to_string()),
        _ => node.missing_deps.insert(name.to_string(), range.to_string()),
    };
}

fn clear_missing(tree: &mut Tree, id: NodeId, name: &str) {
    let node = tree.node_mut(id);
    node.missing_deps.remove(name);
    node.missing_dev_deps.remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::manifest::Bin;
    use crate::pkg::memory::MemoryRegistry;
    use tempfile::tempdir;

    fn root_tree(pkg: Manifest) -> Tree {
        Tree::new(pkg, Path::new("/proj"))
    }

    fn platform() -> Platform {
        Platform::new("linux", "x64", Some("20.0.0"))
    }

    async fn build(reg: &MemoryRegistry, tree: &mut Tree, opts: &InstallOptions) -> Result<BuildOutcome, PkgError> {
        let scratch = tempdir().unwrap();
        let platform = platform();
        TreeBuilder::new(reg, opts, &platform, scratch.path())
            .build(tree, &[])
            .await
    }

    fn loc(tree: &Tree, name: &str) -> Vec<String> {
        let mut out: Vec<String> = tree
            .iter()
            .filter(|n| n.name == name)
            .map(|n| tree.location(n.id))
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_transitive_deps_hoist_to_top() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.1.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();

        assert_eq!(loc(&tree, "a"), vec!["/a"]);
        assert_eq!(loc(&tree, "b"), vec!["/b"]);
        let a = tree.child_named(tree.root(), "a").unwrap();
        let b = tree.child_named(tree.root(), "b").unwrap();
        assert_eq!(tree.node(b).required_by, vec![a]);
    }

    #[tokio::test]
    async fn test_conflicting_version_nests_under_requirer() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.0.0"))
            .publish(Manifest::new("b", "2.0.0"));

        let mut tree = root_tree(
            Manifest::new("root", "1.0.0")
                .with_dep("a", "^1.0.0")
                .with_dep("b", "^2.0.0"),
        );
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();

        assert_eq!(loc(&tree, "b"), vec!["/a/b", "/b"]);
        let nested = tree
            .iter()
            .find(|n| n.name == "b" && n.version() == "1.0.0")
            .unwrap();
        assert_eq!(tree.location(nested.id), "/a/b");
    }

    #[tokio::test]
    async fn test_cycle_links_to_ancestor() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.0.0").with_dep("a", "^1.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();

        assert_eq!(tree.iter().count(), 3);
        let a = tree.child_named(tree.root(), "a").unwrap();
        let b = tree.child_named(tree.root(), "b").unwrap();
        assert!(tree.node(b).requires.contains(&a));
        assert!(tree.node(a).requires.contains(&b));
        assert_eq!(reg.resolve_count("a"), 1);
    }

    #[tokio::test]
    async fn test_optional_failure_is_contained() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("ok", "1.0.0"));
        reg.fail_resolve("flaky");

        let mut tree = root_tree(
            Manifest::new("root", "1.0.0")
                .with_dep("ok", "*")
                .with_optional_dep("flaky", "^1.0.0"),
        );
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();

        assert!(tree.child_named(tree.root(), "ok").is_some());
        assert!(tree.child_named(tree.root(), "flaky").is_none());
        assert!(tree
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::OPTIONAL_FAILED));
    }

    #[tokio::test]
    async fn test_required_failure_is_fatal() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("gone", "^1.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
        let err = build(&reg, &mut tree, &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failure_below_optional_edge_is_contained() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("opt", "1.0.0").with_dep("gone", "^1.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_optional_dep("opt", "*"));
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();
        assert!(tree.child_named(tree.root(), "opt").is_none());
        assert_eq!(tree.iter().count(), 1);
    }

    #[tokio::test]
    async fn test_global_style_nests_second_level() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
        let opts = InstallOptions::default().with_global_style(true);
        build(&reg, &mut tree, &opts).await.unwrap();
        assert_eq!(loc(&tree, "b"), vec!["/a/b"]);
    }

    #[tokio::test]
    async fn test_legacy_bundling_never_hoists() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.0.0").with_dep("c", "^1.0.0"))
            .publish(Manifest::new("c", "1.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
        let opts = InstallOptions::default().with_legacy_bundling(true);
        build(&reg, &mut tree, &opts).await.unwrap();
        assert_eq!(loc(&tree, "c"), vec!["/a/b/c"]);
    }

    #[tokio::test]
    async fn test_dev_deps_only_for_root_and_skipped_in_production() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dev_dep("never", "*"))
            .publish(Manifest::new("tool", "1.0.0"));

        let pkg = Manifest::new("root", "1.0.0")
            .with_dep("a", "*")
            .with_dev_dep("tool", "*");
        let mut tree = root_tree(pkg.clone());
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();
        let tool = tree.child_named(tree.root(), "tool").unwrap();
        assert!(tree.node(tool).dev_only);
        assert_eq!(reg.resolve_count("never"), 0);

        let mut tree = root_tree(pkg);
        build(&reg, &mut tree, &InstallOptions::default().with_production(true))
            .await
            .unwrap();
        assert!(tree.child_named(tree.root(), "tool").is_none());
    }

    #[tokio::test]
    async fn test_requested_specs_are_user_required_and_saved() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.2.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0"));
        let scratch = tempdir().unwrap();
        let opts = InstallOptions::default().with_save(true);
        let platform = platform();
        let outcome = TreeBuilder::new(&reg, &opts, &platform, scratch.path())
            .build(&mut tree, &[PackageSpec::parse("a").unwrap()])
            .await
            .unwrap();

        let a = tree.child_named(tree.root(), "a").unwrap();
        assert!(tree.node(a).user_required);
        assert_eq!(outcome.saved[0].spec, "^1.2.0");
        assert_eq!(tree.node(tree.root()).package.dependencies["a"], "^1.2.0");
    }

    #[tokio::test]
    async fn test_self_dependency_refused() {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("root", "2.0.0"));

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("root", "*"));
        let err = build(&reg, &mut tree, &InstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::ENOSELF);
    }

    #[tokio::test]
    async fn test_optional_unsupported_platform_is_skipped() {
        let mut reg = MemoryRegistry::new();
        let mut fsevents = Manifest::new("fsevents", "2.0.0");
        fsevents.os = vec!["darwin".into()];
        reg.publish(fsevents);

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_optional_dep("fsevents", "*"));
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();
        assert!(tree.child_named(tree.root(), "fsevents").is_none());
        assert!(tree.warnings.iter().any(|w| w.code == warning_codes::SKIPPED));
    }

    #[tokio::test]
    async fn test_bundled_children_attach_without_resolution() {
        let mut reg = MemoryRegistry::new();
        let mut bundler = Manifest::new("bundler", "1.0.0").with_dep("inner", "^0.1.0");
        bundler.bundle_dependencies =
            Some(crate::pkg::manifest::BundleDependencies::Names(vec!["inner".into()]));
        reg.publish_with(bundler, BTreeMap::new(), vec![Manifest::new("inner", "0.1.0")]);

        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_dep("bundler", "*"));
        build(&reg, &mut tree, &InstallOptions::default()).await.unwrap();

        let bundler = tree.child_named(tree.root(), "bundler").unwrap();
        let inner = tree.child_named(bundler, "inner").unwrap();
        assert_eq!(tree.node(inner).from_bundle, Some(bundler));
        assert!(tree.node(bundler).staged.is_some());
        assert_eq!(reg.resolve_count("inner"), 0);
    }

    #[test]
    fn test_find_requirement_nearest_name_wins() {
        let mut tree = root_tree(Manifest::new("root", "1.0.0"));
        let root = tree.root();
        let a = tree.add_node(Manifest::new("a", "1.0.0"), None);
        let b_top = tree.add_node(Manifest::new("b", "1.0.0"), None);
        let b_nested = tree.add_node(Manifest::new("b", "2.0.0"), None);
        tree.attach(a, root);
        tree.attach(b_top, root);
        tree.attach(b_nested, a);

        let base = Path::new("/proj");
        let v1 = PackageSpec::from_dep("b", "^1.0.0").unwrap();
        let v2 = PackageSpec::from_dep("b", "^2.0.0").unwrap();
        // The nested copy shadows the top-level one.
        assert_eq!(find_requirement(&tree, a, "b", &v1, base), None);
        assert_eq!(find_requirement(&tree, a, "b", &v2, base), Some(b_nested));
        assert_eq!(find_requirement(&tree, root, "b", &v1, base), Some(b_top));
    }

    #[test]
    fn test_earliest_installable_bin_conflict() {
        let mut tree = root_tree(Manifest::new("root", "1.0.0"));
        let root = tree.root();
        let mut owner = Manifest::new("owner", "1.0.0");
        owner.bin = Some(Bin::Single("cli.js".into()));
        let owner_id = tree.add_node(owner, None);
        tree.attach(owner_id, root);
        let a = tree.add_node(Manifest::new("a", "1.0.0"), None);
        tree.attach(a, root);

        let mut clash = Manifest::new("clash", "1.0.0");
        clash.bin = Some(Bin::Map(BTreeMap::from([("owner".into(), "x.js".into())])));
        let opts = InstallOptions::default();
        assert_eq!(earliest_installable(&tree, &opts, a, a, &clash), Some(a));

        let plain = Manifest::new("plain", "1.0.0");
        assert_eq!(earliest_installable(&tree, &opts, a, a, &plain), Some(root));
    }

    #[test]
    fn test_propagate_failure_stops_at_optional_edge() {
        let mut tree = root_tree(Manifest::new("root", "1.0.0").with_optional_dep("a", "*"));
        let root = tree.root();
        let a = tree.add_node(Manifest::new("a", "1.0.0").with_dep("b", "*"), None);
        let b = tree.add_node(Manifest::new("b", "1.0.0"), None);
        tree.attach(a, root);
        tree.attach(b, root);
        tree.add_requirement(root, a);
        tree.add_requirement(a, b);

        assert!(!propagate_failure(&mut tree, b));
        assert!(tree.node(a).failed);
        assert!(!tree.node(root).failed);

        let pruned = prune_failed(&mut tree);
        assert_eq!(pruned.len(), 2);
        assert_eq!(tree.iter().count(), 1);
    }

    #[test]
    fn test_save_spec() {
        let tag = PackageSpec::from_dep("a", "latest").unwrap();
        assert_eq!(save_spec(&tag, "1.2.3"), "^1.2.3");
        let range = PackageSpec::from_dep("a", "~1.2.0").unwrap();
        assert_eq!(save_spec(&range, "1.2.3"), "~1.2.0");
        let dir = PackageSpec::from_dep("a", "file:../a").unwrap();
        assert_eq!(save_spec(&dir, "1.0.0"), "file:../a");
    }
}
