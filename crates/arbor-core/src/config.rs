use crate::error::Error;
use crate::pkg::options::InstallOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-project settings file read from the project root.
pub const RC_FILE: &str = ".arborrc.json";

/// Runtime configuration for the arbor CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,

    /// Channel (dev, nightly, stable) - affects cache paths.
    pub channel: Channel,

    /// Install knobs; command-line flags are applied on top.
    pub install: InstallOptions,
}

/// Release channel for cache/data directory namespacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Nightly,
    Dev,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
            Self::Dev => "dev",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
            channel: Channel::default(),
            install: InstallOptions::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Set channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn with_install(mut self, install: InstallOptions) -> Self {
        self.install = install;
        self
    }

    /// Load install options from [`RC_FILE`] in `dir`, if present.
    ///
    /// Keys missing from the file keep their defaults.
    pub fn load_rc(mut self, dir: &Path) -> Result<Self, Error> {
        let path = dir.join(RC_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(source) => return Err(Error::ConfigRead { path, source }),
        };
        self.install =
            serde_json::from_str(&text).map_err(|source| Error::ConfigParse { path, source })?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_rc_missing_keeps_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).load_rc(dir.path()).unwrap();
        assert_eq!(config.install, InstallOptions::default());
    }

    #[test]
    fn test_load_rc_partial_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(RC_FILE),
            r#"{ "globalStyle": true, "concurrency": 4 }"#,
        )
        .unwrap();

        let config = Config::default().load_rc(dir.path()).unwrap();
        assert!(config.install.global_style);
        assert_eq!(config.install.concurrency, 4);
        assert!(config.install.lockfile);
    }

    #[test]
    fn test_load_rc_invalid_json() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(RC_FILE), "{ nope").unwrap();
        let err = Config::default().load_rc(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
