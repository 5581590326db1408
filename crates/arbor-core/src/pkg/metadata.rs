//! Install-time fields written into each installed `package.json`.

use super::error::PkgError;
use super::tree::{NodeId, Tree};
use serde_json::{json, Map, Value};
use std::path::Path;

/// `_requiredBy` entries for `id`: requirer locations, sorted.
///
/// Requirers that only list the package in `devDependencies` are prefixed
/// with `#DEV:`, and a direct user request adds `#USER`.
#[must_use]
pub fn required_by_entries(tree: &Tree, id: NodeId) -> Vec<String> {
    let node = tree.node(id);
    let mut entries: Vec<String> = node
        .required_by
        .iter()
        .filter(|r| !tree.node(**r).removed)
        .map(|r| {
            let requirer = &tree.node(*r).package;
            let location = tree.location(*r);
            let dev_only = requirer.dev_dependencies.contains_key(&node.name)
                && !requirer.runtime_deps().contains_key(&node.name);
            if dev_only {
                format!("#DEV:{location}")
            } else {
                location
            }
        })
        .collect();
    if node.user_required {
        entries.push("#USER".to_string());
    }
    entries.sort();
    entries.dedup();
    entries
}

/// Rewrite the install-time fields of `id`'s `package.json` under `dir`.
///
/// Other keys keep their order. Returns the previous file contents, if any,
/// so the write can be undone.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn refresh_metadata(tree: &Tree, id: NodeId, dir: &Path) -> Result<Option<Vec<u8>>, PkgError> {
    let file = dir.join("package.json");
    let previous = std::fs::read(&file).ok();
    let mut doc = previous
        .as_deref()
        .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    apply_fields(tree, id, &mut doc);

    let mut out = serde_json::to_string_pretty(&Value::Object(doc))?;
    out.push('\n');
    arbor_util::fs::atomic_write(&file, out.as_bytes()).map_err(|e| PkgError::io_at(&file, &e))?;
    Ok(previous)
}

fn apply_fields(tree: &Tree, id: NodeId, doc: &mut Map<String, Value>) {
    let node = tree.node(id);
    let pkg = &node.package;

    doc.insert("_requiredBy".into(), json!(required_by_entries(tree, id)));
    doc.insert("_location".into(), json!(tree.location(id)));

    let phantoms: Map<String, Value> = node
        .phantom_children
        .iter()
        .filter(|(_, dep)| !tree.node(**dep).removed)
        .map(|(name, dep)| (name.clone(), json!(tree.node(*dep).version())))
        .collect();
    doc.insert("_phantomChildren".into(), Value::Object(phantoms));

    if node.from_bundle.is_some() {
        doc.insert("_inBundle".into(), json!(true));
    } else {
        doc.remove("_inBundle");
    }

    let optional = [
        ("_resolved", pkg.resolved.as_ref().map(|s| json!(s))),
        ("_integrity", pkg.integrity.as_ref().map(|s| json!(s))),
        ("_from", pkg.from.as_ref().map(|s| json!(s))),
        ("_spec", pkg.spec.as_ref().map(|s| json!(s))),
        ("_requested", pkg.requested.clone()),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            doc.insert(key.into(), value);
        }
    }
}
