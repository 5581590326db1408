//! `arbor ls`: print the installed tree.

use arbor_core::pkg::tree::logical::extraneous;
use arbor_core::pkg::{load_tree, NodeId, Tree};
use miette::{IntoDiagnostic, Result};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;

pub fn run(dir: &Path, json: bool) -> Result<()> {
    let tree = load_tree(dir).into_diagnostic()?;
    let extra: HashSet<NodeId> = extraneous(&tree).into_iter().collect();

    if json {
        let out = node_json(&tree, tree.root(), &extra);
        println!("{}", serde_json::to_string_pretty(&out).into_diagnostic()?);
    } else {
        for line in render(&tree, &extra) {
            println!("{line}");
        }
    }
    Ok(())
}

fn live_children(tree: &Tree, id: NodeId) -> Vec<NodeId> {
    let mut children: Vec<NodeId> = tree
        .node(id)
        .children
        .iter()
        .copied()
        .filter(|c| !tree.node(*c).removed)
        .collect();
    children.sort_by(|a, b| tree.node(*a).name.cmp(&tree.node(*b).name));
    children
}

fn node_json(tree: &Tree, id: NodeId, extra: &HashSet<NodeId>) -> Value {
    let node = tree.node(id);
    let mut obj = Map::new();
    if id == tree.root() {
        obj.insert("name".into(), json!(node.name));
    }
    obj.insert("version".into(), json!(node.version()));
    obj.insert("path".into(), json!(node.path));
    if node.is_link {
        obj.insert("link".into(), json!(node.realpath));
    }
    if extra.contains(&id) {
        obj.insert("extraneous".into(), json!(true));
    }
    if !node.missing_deps.is_empty() {
        obj.insert("missing".into(), json!(node.missing_deps));
    }
    if !node.missing_peers.is_empty() {
        obj.insert("peerMissing".into(), json!(node.missing_peers));
    }

    let deps: Map<String, Value> = live_children(tree, id)
        .into_iter()
        .map(|c| (tree.node(c).name.clone(), node_json(tree, c, extra)))
        .collect();
    if !deps.is_empty() {
        obj.insert("dependencies".into(), Value::Object(deps));
    }
    Value::Object(obj)
}

fn render(tree: &Tree, extra: &HashSet<NodeId>) -> Vec<String> {
    let root = tree.node(tree.root());
    let mut lines = vec![format!("{}@{} {}", root.name, root.version(), root.path.display())];
    render_children(tree, tree.root(), "", extra, &mut lines);
    lines
}

fn render_children(
    tree: &Tree,
    id: NodeId,
    prefix: &str,
    extra: &HashSet<NodeId>,
    lines: &mut Vec<String>,
) {
    let node = tree.node(id);
    let mut rows: Vec<(String, Option<NodeId>)> = live_children(tree, id)
        .into_iter()
        .map(|c| (label(tree, c, extra), Some(c)))
        .collect();
    rows.extend(
        node.missing_deps
            .iter()
            .map(|(name, range)| (format!("UNMET DEPENDENCY {name}@{range}"), None)),
    );

    let count = rows.len();
    for (i, (text, child)) in rows.into_iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        lines.push(format!("{prefix}{branch}{text}"));
        if let Some(child) = child {
            let nested = format!("{prefix}{}", if last { "    " } else { "│   " });
            render_children(tree, child, &nested, extra, lines);
        }
    }
}

fn label(tree: &Tree, id: NodeId, extra: &HashSet<NodeId>) -> String {
    let node = tree.node(id);
    let mut text = format!("{}@{}", node.name, node.version());
    if node.is_link {
        text.push_str(&format!(" -> {}", node.realpath.display()));
    }
    if extra.contains(&id) {
        text.push_str(" extraneous");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_pkg(dir: &Path, json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), json).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_pkg(
            root,
            r#"{"name":"root","version":"1.0.0","dependencies":{"a":"^1.0.0","gone":"^2.0.0"}}"#,
        );
        write_pkg(
            &root.join("node_modules/a"),
            r#"{"name":"a","version":"1.0.0","dependencies":{"c":"^1.0.0"}}"#,
        );
        write_pkg(&root.join("node_modules/a/node_modules/c"), r#"{"name":"c","version":"1.0.0"}"#);
        write_pkg(&root.join("node_modules/stray"), r#"{"name":"stray","version":"0.1.0"}"#);
        dir
    }

    #[test]
    fn test_render_marks_problems() {
        let dir = fixture();
        let tree = load_tree(dir.path()).unwrap();
        let extra: HashSet<NodeId> = extraneous(&tree).into_iter().collect();
        let lines = render(&tree, &extra);

        assert!(lines[0].starts_with("root@1.0.0 "));
        assert_eq!(lines[1], "├── a@1.0.0");
        assert_eq!(lines[2], "│   └── c@1.0.0");
        assert_eq!(lines[3], "├── stray@0.1.0 extraneous");
        assert_eq!(lines[4], "└── UNMET DEPENDENCY gone@^2.0.0");
    }

    #[test]
    fn test_node_json_shape() {
        let dir = fixture();
        let tree = load_tree(dir.path()).unwrap();
        let extra: HashSet<NodeId> = extraneous(&tree).into_iter().collect();
        let out = node_json(&tree, tree.root(), &extra);

        assert_eq!(out["name"], "root");
        assert_eq!(out["missing"]["gone"], "^2.0.0");
        assert_eq!(out["dependencies"]["a"]["dependencies"]["c"]["version"], "1.0.0");
        assert_eq!(out["dependencies"]["stray"]["extraneous"], true);
        assert!(out["dependencies"]["a"].get("extraneous").is_none());
    }
}
