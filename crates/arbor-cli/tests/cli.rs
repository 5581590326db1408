//! Integration tests for the `arbor` binary.
//!
//! Every fixture uses `file:` dependencies or an existing `node_modules`,
//! so no test touches the network.

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::{tempdir, TempDir};

fn cargo_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_arbor"))
}

/// Run `arbor` in `dir` with the cache redirected into `home`.
fn arbor(dir: &Path, home: &Path, args: &[&str]) -> Output {
    cargo_bin()
        .args(args)
        .arg("--cwd")
        .arg(dir)
        .env("HOME", home)
        .env("XDG_CACHE_HOME", home.join("cache"))
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run arbor")
}

fn write_pkg(dir: &Path, json: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("package.json"), json).unwrap();
}

/// A project depending on a sibling directory package.
fn local_project() -> (TempDir, std::path::PathBuf) {
    let tmp = tempdir().unwrap();
    let project = tmp.path().join("project");
    write_pkg(
        &project,
        r#"{"name":"project","version":"1.0.0","dependencies":{"lib":"file:../lib"}}"#,
    );
    write_pkg(
        &tmp.path().join("lib"),
        r#"{"name":"lib","version":"0.2.0","bin":{"lib-cli":"cli.js"}}"#,
    );
    fs::write(tmp.path().join("lib/cli.js"), "#!/usr/bin/env node\n").unwrap();
    fs::write(tmp.path().join("lib/index.js"), "module.exports = 1;\n").unwrap();
    (tmp, project)
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn test_version_prints_name() {
    let home = tempdir().unwrap();
    let output = arbor(home.path(), home.path(), &["version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("arbor "));
}

#[test]
fn test_install_local_dependency() {
    let (tmp, project) = local_project();
    let output = arbor(&project, tmp.path(), &["install", "--json"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report = stdout_json(&output);
    assert_eq!(report["schemaVersion"], 1);
    assert_eq!(report["added"][0]["name"], "lib");
    assert_eq!(report["added"][0]["version"], "0.2.0");
    assert_eq!(report["dryRun"], false);

    assert!(project.join("node_modules/lib/index.js").exists());
    assert!(project.join("package-lock.json").exists());
    #[cfg(unix)]
    assert!(fs::symlink_metadata(project.join("node_modules/.bin/lib-cli")).is_ok());

    let installed: Value = serde_json::from_str(
        &fs::read_to_string(project.join("node_modules/lib/package.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(installed["_location"], "/lib");

    // Nothing left to do the second time.
    let again = stdout_json(&arbor(&project, tmp.path(), &["install", "--json"]));
    assert_eq!(again["added"].as_array().unwrap().len(), 0);
    assert_eq!(again["updated"].as_array().unwrap().len(), 0);
}

#[test]
fn test_install_dry_run_touches_nothing() {
    let (tmp, project) = local_project();
    let output = arbor(&project, tmp.path(), &["install", "--dry-run", "--json"]);
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["dryRun"], true);
    assert_eq!(report["added"][0]["name"], "lib");
    assert!(!project.join("node_modules").exists());
    assert!(!project.join("package-lock.json").exists());
}

#[test]
fn test_install_missing_directory_fails() {
    let (tmp, project) = local_project();
    let output = arbor(&project, tmp.path(), &["install", "file:../nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ENOENT"));
    assert!(!project.join("node_modules/nope").exists());
}

#[test]
fn test_ls_json_marks_extraneous() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("project");
    write_pkg(&root, r#"{"name":"project","version":"1.0.0","dependencies":{"a":"^1.0.0"}}"#);
    write_pkg(&root.join("node_modules/a"), r#"{"name":"a","version":"1.0.0"}"#);
    write_pkg(&root.join("node_modules/stray"), r#"{"name":"stray","version":"0.1.0"}"#);

    let output = arbor(&root, tmp.path(), &["ls", "--json"]);
    assert!(output.status.success());
    let tree = stdout_json(&output);
    assert_eq!(tree["name"], "project");
    assert_eq!(tree["dependencies"]["a"]["version"], "1.0.0");
    assert_eq!(tree["dependencies"]["stray"]["extraneous"], true);
}

#[test]
fn test_prune_removes_extraneous() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("project");
    write_pkg(&root, r#"{"name":"project","version":"1.0.0","dependencies":{"a":"^1.0.0"}}"#);
    write_pkg(&root.join("node_modules/a"), r#"{"name":"a","version":"1.0.0"}"#);
    write_pkg(&root.join("node_modules/stray"), r#"{"name":"stray","version":"0.1.0"}"#);

    let output = arbor(&root, tmp.path(), &["prune", "--no-lockfile"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("- stray@0.1.0 /stray"), "{stdout}");
    assert!(!root.join("node_modules/stray").exists());
    assert!(root.join("node_modules/a").exists());
}
