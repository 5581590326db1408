//! End-to-end installs against an in-memory registry and a temp project.

use arbor_core::pkg::manifest::BundleDependencies;
use arbor_core::pkg::{
    pkg_codes, warning_codes, InstallGate, InstallOptions, InstallReport, Installer,
    LifecycleStage, Manifest, MemoryRegistry, PkgError, Platform, ScriptOptions, ScriptRunner,
    Shrinkwrap,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Records every script invocation and fails the configured one.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, LifecycleStage)>>,
    fail: Option<(&'static str, LifecycleStage)>,
}

impl Recorder {
    fn failing(name: &'static str, stage: LifecycleStage) -> Self {
        Self {
            fail: Some((name, stage)),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, LifecycleStage)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ScriptRunner for Recorder {
    async fn run(
        &self,
        manifest: &Manifest,
        stage: LifecycleStage,
        _dir: &Path,
        _opts: &ScriptOptions,
    ) -> Result<(), PkgError> {
        self.calls.lock().unwrap().push((manifest.id(), stage));
        match self.fail {
            Some((name, fail_stage))
                if manifest.name.as_deref() == Some(name) && stage == fail_stage =>
            {
                Err(PkgError::script(name, stage.as_str(), "exit code 1"))
            }
            _ => Ok(()),
        }
    }
}

fn write_root(dir: &Path, manifest: &Manifest) {
    fs::write(
        dir.join("package.json"),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}

fn installed_version(dir: &Path, rel: &str) -> Option<String> {
    let text = fs::read_to_string(dir.join(rel).join("package.json")).ok()?;
    let doc: Value = serde_json::from_str(&text).ok()?;
    doc["version"].as_str().map(str::to_string)
}

fn installer<R: ScriptRunner>(
    reg: MemoryRegistry,
    runner: R,
    opts: InstallOptions,
) -> Installer<MemoryRegistry, R> {
    Installer::new(reg, runner, opts).with_platform(Platform::new("linux", "x64", Some("20.0.0")))
}

fn names(entries: &[arbor_core::pkg::ReportEntry]) -> Vec<String> {
    entries.iter().map(|e| format!("{}@{}", e.name, e.version)).collect()
}

#[tokio::test]
async fn test_fresh_install_hoists_and_adds_dependencies_first() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
        .publish(Manifest::new("b", "1.1.0"));

    let report = installer(reg, Recorder::default(), InstallOptions::default())
        .install(dir.path(), &[])
        .await
        .unwrap();

    assert_eq!(names(&report.added), ["b@1.1.0", "a@1.0.0"]);
    assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));
    assert_eq!(installed_version(dir.path(), "node_modules/b").as_deref(), Some("1.1.0"));
    assert!(!dir.path().join("node_modules/a/node_modules").exists());
}

#[tokio::test]
async fn test_conflicting_version_nests_on_disk() {
    let dir = tempdir().unwrap();
    write_root(
        dir.path(),
        &Manifest::new("root", "1.0.0")
            .with_dep("a", "^1.0.0")
            .with_dep("b", "^2.0.0"),
    );
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
        .publish(Manifest::new("b", "1.0.0"))
        .publish(Manifest::new("b", "2.0.0"));

    installer(reg, Recorder::default(), InstallOptions::default())
        .install(dir.path(), &[])
        .await
        .unwrap();

    assert_eq!(installed_version(dir.path(), "node_modules/b").as_deref(), Some("2.0.0"));
    assert_eq!(
        installed_version(dir.path(), "node_modules/a/node_modules/b").as_deref(),
        Some("1.0.0")
    );
}

#[tokio::test]
async fn test_version_change_updates_in_place_with_scripts() {
    let dir = tempdir().unwrap();
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("foo", "1.0.0"))
        .publish(Manifest::new("foo", "2.0.0"));
    let inst = installer(reg, Recorder::default(), InstallOptions::default());

    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("foo", "1.0.0"));
    inst.install(dir.path(), &[]).await.unwrap();

    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("foo", "2.0.0"));
    let report = inst.install(dir.path(), &[]).await.unwrap();

    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.updated[0].version, "2.0.0");
    assert_eq!(report.updated[0].from.as_deref(), Some("1.0.0"));
    assert!(report.added.is_empty() && report.removed.is_empty());
    assert_eq!(installed_version(dir.path(), "node_modules/foo").as_deref(), Some("2.0.0"));

    let calls = inst_calls(&inst);
    let second_run: Vec<_> = calls
        .iter()
        .skip_while(|(id, _)| id != "foo@2.0.0")
        .cloned()
        .collect();
    assert_eq!(
        second_run,
        [
            ("foo@2.0.0".to_string(), LifecycleStage::Preinstall),
            ("foo@2.0.0".to_string(), LifecycleStage::Install),
            ("foo@2.0.0".to_string(), LifecycleStage::Postinstall),
            ("foo@1.0.0".to_string(), LifecycleStage::Preuninstall),
            ("foo@1.0.0".to_string(), LifecycleStage::Uninstall),
            ("foo@1.0.0".to_string(), LifecycleStage::Postuninstall),
        ]
    );
}

#[tokio::test]
async fn test_named_package_already_installed_is_reinstalled() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0"));
    let inst = installer(reg, Recorder::default(), InstallOptions::default());
    inst.install(dir.path(), &[]).await.unwrap();

    let report = inst.install(dir.path(), &["a".to_string()]).await.unwrap();
    assert!(!report.is_noop());
    assert_eq!(names(&report.updated), ["a@1.0.0"]);
    assert_eq!(report.updated[0].from.as_deref(), Some("1.0.0"));
    assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));

    let postinstalls = inst_calls(&inst)
        .into_iter()
        .filter(|call| *call == ("a@1.0.0".to_string(), LifecycleStage::Postinstall))
        .count();
    assert_eq!(postinstalls, 2);
}

fn inst_calls(inst: &Installer<MemoryRegistry, Recorder>) -> Vec<(String, LifecycleStage)> {
    inst.runner().calls()
}

#[tokio::test]
async fn test_failing_optional_postinstall_is_dropped() {
    let dir = tempdir().unwrap();
    write_root(
        dir.path(),
        &Manifest::new("root", "1.0.0")
            .with_dep("sibling", "^1.0.0")
            .with_optional_dep("opt", "^1.0.0"),
    );
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("opt", "1.0.0"))
        .publish(Manifest::new("sibling", "1.0.0"));

    let report = installer(
        reg,
        Recorder::failing("opt", LifecycleStage::Postinstall),
        InstallOptions::default(),
    )
    .install(dir.path(), &[])
    .await
    .unwrap();

    assert_eq!(names(&report.failed), ["opt@1.0.0"]);
    assert_eq!(names(&report.added), ["sibling@1.0.0"]);
    let optional_warnings: Vec<_> = report
        .warnings
        .iter()
        .filter(|w| w.code == warning_codes::OPTIONAL_FAILED)
        .collect();
    assert_eq!(optional_warnings.len(), 1);
    assert!(!dir.path().join("node_modules/opt").exists());
    assert!(dir.path().join("node_modules/sibling").exists());

    let lock = Shrinkwrap::read(dir.path()).unwrap().unwrap().0;
    assert!(lock.dependencies.contains_key("sibling"));
    assert!(!lock.dependencies.contains_key("opt"));
}

#[tokio::test]
async fn test_failing_optional_takes_its_own_dependencies_with_it() {
    let dir = tempdir().unwrap();
    write_root(
        dir.path(),
        &Manifest::new("root", "1.0.0")
            .with_dep("sibling", "^1.0.0")
            .with_optional_dep("opt", "^1.0.0"),
    );
    let mut reg = MemoryRegistry::new();
    reg.publish(
        Manifest::new("opt", "1.0.0")
            .with_dep("only-opt", "^1.0.0")
            .with_dep("shared", "^1.0.0"),
    )
    .publish(Manifest::new("only-opt", "1.0.0"))
    .publish(Manifest::new("sibling", "1.0.0").with_dep("shared", "^1.0.0"))
    .publish(Manifest::new("shared", "1.0.0"));

    let report = installer(
        reg,
        Recorder::failing("opt", LifecycleStage::Postinstall),
        InstallOptions::default(),
    )
    .install(dir.path(), &[])
    .await
    .unwrap();

    let mut failed = names(&report.failed);
    failed.sort();
    assert_eq!(failed, ["only-opt@1.0.0", "opt@1.0.0"]);
    let mut added = names(&report.added);
    added.sort();
    assert_eq!(added, ["shared@1.0.0", "sibling@1.0.0"]);
    assert!(!dir.path().join("node_modules/only-opt").exists());
    assert!(dir.path().join("node_modules/shared").exists());

    let lock = Shrinkwrap::read(dir.path()).unwrap().unwrap().0;
    assert!(!lock.dependencies.contains_key("only-opt"));
    assert!(lock.dependencies.contains_key("shared"));
}

#[tokio::test]
async fn test_failing_required_script_rolls_back() {
    let dir = tempdir().unwrap();
    write_root(
        dir.path(),
        &Manifest::new("root", "1.0.0")
            .with_dep("good", "^1.0.0")
            .with_dep("bad", "^1.0.0"),
    );
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("good", "1.0.0"))
        .publish(Manifest::new("bad", "1.0.0"));

    let err = installer(
        reg,
        Recorder::failing("bad", LifecycleStage::Install),
        InstallOptions::default(),
    )
    .install(dir.path(), &[])
    .await
    .unwrap_err();

    assert_eq!(err.code(), pkg_codes::ESCRIPT);
    assert!(!dir.path().join("node_modules/good").exists());
    assert!(!dir.path().join("node_modules/bad").exists());
    assert!(!dir.path().join("package-lock.json").exists());
}

#[tokio::test]
async fn test_cycle_resolves_to_ancestor() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
        .publish(Manifest::new("b", "1.0.0").with_dep("a", "^1.0.0"));

    let report = installer(reg, Recorder::default(), InstallOptions::default())
        .install(dir.path(), &[])
        .await
        .unwrap();

    assert_eq!(report.added.len(), 2);
    assert!(!dir.path().join("node_modules/b/node_modules/a").exists());
    assert!(!dir.path().join("node_modules/a/node_modules").exists());
}

#[tokio::test]
async fn test_lockfile_pins_versions() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    fs::write(
        dir.path().join("package-lock.json"),
        r#"{"name":"root","version":"1.0.0","lockfileVersion":1,"requires":true,
            "dependencies":{"a":{"version":"1.0.0"}}}"#,
    )
    .unwrap();
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0"))
        .publish(Manifest::new("a", "1.4.0"));

    installer(reg, Recorder::default(), InstallOptions::default())
        .install(dir.path(), &[])
        .await
        .unwrap();
    assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));

    // Without the lockfile the range picks the newest match.
    let other = tempdir().unwrap();
    write_root(other.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    let mut reg = MemoryRegistry::new();
    reg.publish(Manifest::new("a", "1.0.0"))
        .publish(Manifest::new("a", "1.4.0"));
    installer(reg, Recorder::default(), InstallOptions::default())
        .install(other.path(), &[])
        .await
        .unwrap();
    assert_eq!(installed_version(other.path(), "node_modules/a").as_deref(), Some("1.4.0"));
}

#[tokio::test]
async fn test_bundled_dependencies_come_from_the_bundler() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("bundler", "^1.0.0"));
    let mut bundler = Manifest::new("bundler", "1.0.0").with_dep("inner", "^0.1.0");
    bundler.bundle_dependencies = Some(BundleDependencies::Names(vec!["inner".into()]));
    let mut reg = MemoryRegistry::new();
    reg.publish_with(
        bundler,
        BTreeMap::from([("index.js".to_string(), "module.exports = 1;".to_string())]),
        vec![Manifest::new("inner", "0.1.0")],
    );

    let inst = installer(reg, Recorder::default(), InstallOptions::default());
    inst.install(dir.path(), &[]).await.unwrap();

    assert!(dir.path().join("node_modules/bundler/index.js").exists());
    assert_eq!(
        installed_version(dir.path(), "node_modules/bundler/node_modules/inner").as_deref(),
        Some("0.1.0")
    );
    assert!(!dir.path().join("node_modules/inner").exists());
    assert_eq!(inst.source().resolve_count("inner"), 0);
}

#[tokio::test]
async fn test_dedupe_hoists_nested_copy() {
    let dir = tempdir().unwrap();
    let write = |rel: &str, json: &str| {
        let path = dir.path().join(rel);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("package.json"), json).unwrap();
    };
    write("", r#"{"name":"root","version":"1.0.0","dependencies":{"a":"^1.0.0"}}"#);
    write(
        "node_modules/a",
        r#"{"name":"a","version":"1.0.0","dependencies":{"c":"^1.0.0"}}"#,
    );
    write("node_modules/a/node_modules/c", r#"{"name":"c","version":"1.0.0"}"#);

    let report = installer(
        MemoryRegistry::new(),
        Recorder::default(),
        InstallOptions::default().with_lockfile(false),
    )
    .dedupe(dir.path())
    .await
    .unwrap();

    assert_eq!(names(&report.moved), ["c@1.0.0"]);
    assert_eq!(report.moved[0].from.as_deref(), Some("/a/c"));
    assert!(dir.path().join("node_modules/c/package.json").exists());
    assert!(!dir.path().join("node_modules/a/node_modules/c").exists());
}

#[tokio::test]
async fn test_concurrent_installs_write_once() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("a", "^1.0.0"));
    let registry = || {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("a", "1.0.0").with_dep("b", "^1.0.0"))
            .publish(Manifest::new("b", "1.0.0"))
            .with_fetch_delay(Duration::from_millis(30));
        reg
    };
    let gate = Arc::new(InstallGate::new());
    let first = installer(registry(), Recorder::default(), InstallOptions::default())
        .with_gate(Arc::clone(&gate));
    let second = installer(registry(), Recorder::default(), InstallOptions::default())
        .with_gate(Arc::clone(&gate));

    let (r1, r2): (Result<InstallReport, _>, Result<InstallReport, _>) =
        tokio::join!(first.install(dir.path(), &[]), second.install(dir.path(), &[]));
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    let mut added = [r1.added.len(), r2.added.len()];
    added.sort_unstable();
    assert_eq!(added, [0, 2]);
    let fetches = first.source().fetch_count("a", "1.0.0") + second.source().fetch_count("a", "1.0.0");
    assert_eq!(fetches, 1);
    assert_eq!(installed_version(dir.path(), "node_modules/a").as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_waiting_install_replans_against_the_finished_one() {
    let dir = tempdir().unwrap();
    write_root(dir.path(), &Manifest::new("root", "1.0.0").with_dep("shared", "^1.0.0"));
    let registry = || {
        let mut reg = MemoryRegistry::new();
        reg.publish(Manifest::new("shared", "1.0.0"))
            .publish(Manifest::new("x", "1.0.0"))
            .publish(Manifest::new("y", "1.0.0"))
            .with_fetch_delay(Duration::from_millis(30));
        reg
    };
    let gate = Arc::new(InstallGate::new());
    let first = installer(registry(), Recorder::default(), InstallOptions::default())
        .with_gate(Arc::clone(&gate));
    let second = installer(registry(), Recorder::default(), InstallOptions::default())
        .with_gate(Arc::clone(&gate));

    // Both plan to add `shared`, so one run waits for the other.
    let names_x = ["x".to_string()];
    let names_y = ["y".to_string()];
    let (r1, r2): (Result<InstallReport, _>, Result<InstallReport, _>) = tokio::join!(
        first.install(dir.path(), &names_x),
        second.install(dir.path(), &names_y)
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    // The run that went second saw the other's package as extraneous.
    let (early, late, late_report) = if r1.removed.is_empty() {
        ("x", "y", &r2)
    } else {
        ("y", "x", &r1)
    };
    assert_eq!(names(&late_report.removed), [format!("{early}@1.0.0")]);
    assert!(names(&late_report.added).contains(&format!("{late}@1.0.0")));
    assert!(!dir.path().join("node_modules").join(early).exists());
    assert!(dir.path().join("node_modules").join(late).exists());
    assert_eq!(installed_version(dir.path(), "node_modules/shared").as_deref(), Some("1.0.0"));
}
