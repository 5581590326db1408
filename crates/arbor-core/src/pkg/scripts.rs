//! Lifecycle script execution through the system shell.

use super::error::PkgError;
use super::manifest::Manifest;
use super::source::{LifecycleStage, ScriptOptions, ScriptRunner};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Maximum captured output included in an error message.
const MAX_OUTPUT_SIZE: usize = 4 * 1024;

/// Runs `scripts.<stage>` with `sh -c` (or `cmd /C` on Windows).
///
/// `PATH` is prefixed with every `node_modules/.bin` from the package
/// directory up to the filesystem root.
#[derive(Debug, Clone, Default)]
pub struct ShellScriptRunner {
    /// Extra `PATH` entries placed before the inherited ones.
    extra_path: Vec<PathBuf>,
}

impl ShellScriptRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory to the front of `PATH` for every script.
    #[must_use]
    pub fn with_path(mut self, dir: PathBuf) -> Self {
        self.extra_path.push(dir);
        self
    }

    fn path_env(&self, dir: &Path) -> Option<std::ffi::OsString> {
        let mut paths: Vec<PathBuf> = self.extra_path.clone();
        paths.extend(
            dir.ancestors()
                .map(|d| d.join("node_modules").join(".bin"))
                .filter(|d| d.is_dir()),
        );
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).ok()
    }
}

/// `npm_package_*` and `npm_lifecycle_*` variables for a script run.
#[must_use]
pub fn lifecycle_env(manifest: &Manifest, stage: LifecycleStage) -> Vec<(String, String)> {
    let mut env = vec![
        ("npm_lifecycle_event".to_string(), stage.as_str().to_string()),
        (
            "npm_package_name".to_string(),
            manifest.name.clone().unwrap_or_default(),
        ),
        (
            "npm_package_version".to_string(),
            manifest.version_str().to_string(),
        ),
    ];
    if let Some(script) = manifest.scripts.get(stage.as_str()) {
        env.push(("npm_lifecycle_script".to_string(), script.clone()));
    }
    for (key, value) in &manifest.engines {
        env.push((format!("npm_package_engines_{}", env_key(key)), value.clone()));
    }
    env
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn truncate(s: &[u8]) -> String {
    let text = String::from_utf8_lossy(s);
    let text = text.trim();
    if text.len() <= MAX_OUTPUT_SIZE {
        return text.to_string();
    }
    let mut cut = text.len() - MAX_OUTPUT_SIZE;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &text[cut..])
}

impl ScriptRunner for ShellScriptRunner {
    async fn run(
        &self,
        manifest: &Manifest,
        stage: LifecycleStage,
        dir: &Path,
        opts: &ScriptOptions,
    ) -> Result<(), PkgError> {
        let Some(script) = manifest.scripts.get(stage.as_str()) else {
            return Ok(());
        };
        let name = manifest.name.as_deref().unwrap_or_default();

        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd.exe", "/C")
        } else {
            ("sh", "-c")
        };

        debug!(name = %name, stage = %stage, script = %script, "running lifecycle script");

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg)
            .arg(script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(lifecycle_env(manifest, stage))
            .envs(&opts.env);
        if let Some(path) = self.path_env(dir) {
            cmd.env("PATH", path);
        }

        let outcome = match cmd.output().await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(PkgError::script(
                name,
                stage.as_str(),
                &format!(
                    "exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    truncate(&output.stderr)
                ),
            )),
            Err(e) => Err(PkgError::script(name, stage.as_str(), &e.to_string())),
        };

        match outcome {
            Err(e) if opts.fail_ok => {
                warn!(name = %name, stage = %stage, error = %e, "ignoring failed script");
                Ok(())
            }
            other => other,
        }
    }
}
