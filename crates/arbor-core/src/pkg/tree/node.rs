//! Arena-backed install tree.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`]. Physical
//! placement (`parent`/`children`) and logical edges (`requires`/`required_by`)
//! are kept separately. Removing a node only flags it, so ids stay stable and a
//! cloned tree shares ids with the tree it was cloned from.

use crate::pkg::error::Warning;
use crate::pkg::manifest::Manifest;
use crate::pkg::shrinkwrap::ShrinkwrapEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Index of a node inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One package instance at one location.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub package: Manifest,

    pub path: PathBuf,
    pub realpath: PathBuf,
    pub parent: Option<NodeId>,
    /// Sorted by name.
    pub children: Vec<NodeId>,

    pub requires: Vec<NodeId>,
    pub required_by: Vec<NodeId>,

    pub is_top: bool,
    pub is_global: bool,
    pub is_link: bool,
    pub is_in_link: bool,
    /// The node whose bundle this one shipped in.
    pub from_bundle: Option<NodeId>,
    /// The resolved specifier pinned by a lockfile entry.
    pub from_shrinkwrap: Option<String>,
    /// Pinned entries for this node's own dependencies.
    pub shrinkwrap: Option<BTreeMap<String, ShrinkwrapEntry>>,
    pub user_required: bool,
    pub failed: bool,
    pub removed: bool,
    pub known_installable: bool,
    /// Read from disk rather than resolved in this run.
    pub existing: bool,
    /// Only reachable through `devDependencies` of the root.
    pub dev_only: bool,
    /// Only reachable through optional edges.
    pub optional: bool,
    /// Contents already extracted while building (bundling packages).
    pub staged: Option<PathBuf>,

    pub phantom_children: BTreeMap<String, NodeId>,
    pub missing_deps: BTreeMap<String, String>,
    pub missing_dev_deps: BTreeMap<String, String>,
    pub missing_peers: BTreeMap<String, String>,
}

impl Node {
    fn blank(id: NodeId, name: String, package: Manifest, path: PathBuf) -> Self {
        Self {
            id,
            name,
            package,
            realpath: path.clone(),
            path,
            parent: None,
            children: Vec::new(),
            requires: Vec::new(),
            required_by: Vec::new(),
            is_top: false,
            is_global: false,
            is_link: false,
            is_in_link: false,
            from_bundle: None,
            from_shrinkwrap: None,
            shrinkwrap: None,
            user_required: false,
            failed: false,
            removed: false,
            known_installable: false,
            existing: false,
            dev_only: false,
            optional: false,
            staged: None,
            phantom_children: BTreeMap::new(),
            missing_deps: BTreeMap::new(),
            missing_dev_deps: BTreeMap::new(),
            missing_peers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.package.version_str()
    }

    /// `name@version`.
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("{}@{}", self.name, self.version())
    }
}

/// The install tree: a root plus every node ever attached under it.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    /// Non-fatal diagnostics collected while building, validating and executing.
    pub warnings: Vec<Warning>,
}

impl Tree {
    /// Create a tree whose root package lives at `path`.
    #[must_use]
    pub fn new(package: Manifest, path: &Path) -> Self {
        let name = package.name_or_from_path(path);
        let mut root = Node::blank(NodeId(0), name, package, path.to_path_buf());
        root.is_top = true;
        Self {
            nodes: vec![root],
            root: NodeId(0),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Number of slots in the arena, removed nodes included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `id` belongs to this arena.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// Live nodes, root first, in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.removed)
    }

    /// Live node ids in breadth-first physical order.
    #[must_use]
    pub fn breadth_first(&self) -> Vec<NodeId> {
        let mut order = vec![self.root];
        let mut i = 0;
        while i < order.len() {
            let id = order[i];
            order.extend(self.node(id).children.iter().copied().filter(|c| !self.node(*c).removed));
            i += 1;
        }
        order
    }

    /// Create a detached node. Attach it with [`Tree::attach`].
    pub fn add_node(&mut self, package: Manifest, name: Option<&str>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = name.map_or_else(
            || {
                package
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(crate::pkg::manifest::placeholder_name)
            },
            ToString::to_string,
        );
        self.nodes.push(Node::blank(id, name, package, PathBuf::new()));
        id
    }

    /// Place `child` physically under `parent`, keeping siblings sorted by name.
    ///
    /// Recomputes paths for the moved subtree and inherits the in-link flag.
    pub fn attach(&mut self, child: NodeId, parent: NodeId) {
        self.detach(child);
        self.node_mut(child).parent = Some(parent);

        let name = self.node(child).name.clone();
        let pos = self
            .node(parent)
            .children
            .partition_point(|c| self.nodes[c.0].name < name);
        self.node_mut(parent).children.insert(pos, child);

        self.refresh_paths(child);
    }

    /// Remove `child` from its parent's children. Logical edges are untouched.
    pub fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.node_mut(child).parent.take() {
            self.node_mut(parent).children.retain(|c| *c != child);
        }
    }

    /// Re-parent `id` under `new_parent`.
    pub fn move_to(&mut self, id: NodeId, new_parent: NodeId) {
        self.attach(id, new_parent);
    }

    /// Flag `id` and everything physically below it as removed, and drop the
    /// logical edges that point into the removed set.
    pub fn remove_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        let mut removed = Vec::new();
        while let Some(n) = stack.pop() {
            removed.push(n);
            stack.extend(self.node(n).children.iter().copied());
        }

        self.detach(id);
        for n in &removed {
            self.node_mut(*n).removed = true;
        }
        for n in removed {
            let requires = std::mem::take(&mut self.node_mut(n).requires);
            for dep in requires {
                self.node_mut(dep).required_by.retain(|r| *r != n);
            }
            let required_by = std::mem::take(&mut self.node_mut(n).required_by);
            for req in required_by {
                self.node_mut(req).requires.retain(|r| *r != n);
            }
        }
    }

    /// Add a `from` requires `to` edge (and the inverse).
    pub fn add_requirement(&mut self, from: NodeId, to: NodeId) {
        if !self.node(from).requires.contains(&to) {
            self.node_mut(from).requires.push(to);
        }
        if !self.node(to).required_by.contains(&from) {
            self.node_mut(to).required_by.push(from);
        }
    }

    /// Drop a `from` requires `to` edge (and the inverse).
    pub fn remove_requirement(&mut self, from: NodeId, to: NodeId) {
        self.node_mut(from).requires.retain(|r| *r != to);
        self.node_mut(to).required_by.retain(|r| *r != from);
    }

    /// Live child of `parent` named `name`.
    #[must_use]
    pub fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).name == name && !self.node(*c).removed)
    }

    /// `id`, its parent, and so on up to the root.
    #[must_use]
    pub fn ancestry(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            chain.push(p);
            cur = self.node(p).parent;
        }
        chain
    }

    /// Whether `ancestor` is `id` or physically above it.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestry(id).contains(&ancestor)
    }

    /// Number of parent links between `id` and the root.
    #[must_use]
    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestry(id).len() - 1
    }

    /// Tree location: `/` for the root, `/a/b` for `node_modules/a/node_modules/b`.
    #[must_use]
    pub fn location(&self, id: NodeId) -> String {
        let chain = self.ancestry(id);
        if chain.len() == 1 {
            return "/".to_string();
        }
        let mut loc = String::new();
        for n in chain.iter().rev().skip(1) {
            loc.push('/');
            loc.push_str(&self.node(*n).name);
        }
        loc
    }

    /// Every live node physically below `id` (excluding `id`), depth-first.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            if self.node(n).removed {
                continue;
            }
            out.push(n);
            stack.extend(self.node(n).children.iter().rev().copied());
        }
        out
    }

    fn refresh_paths(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let Some(parent) = self.node(n).parent else {
                continue;
            };
            let parent_node = self.node(parent);
            let in_link = parent_node.is_link || parent_node.is_in_link;
            let path = parent_node.path.join("node_modules").join(&self.node(n).name);
            let realpath = parent_node
                .realpath
                .join("node_modules")
                .join(&self.node(n).name);

            let node = self.node_mut(n);
            node.path = path;
            if !node.is_link {
                node.realpath = realpath;
            }
            node.is_in_link = in_link;
            stack.extend(node.children.iter().copied());
        }
    }
}
