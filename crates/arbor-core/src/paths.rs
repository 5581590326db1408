use crate::config::Channel;
use crate::version::CACHE_LAYOUT_VERSION;
use std::path::{Path, PathBuf};

/// Find the project root by walking up from `cwd` to the nearest `package.json`.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|dir| dir.join("package.json").is_file())
        .map(Path::to_path_buf)
}

/// Environment variable that relocates the package cache.
pub const CACHE_ENV: &str = "ARBOR_CACHE";

/// Package cache for `channel`: `<root>/v{N}/{channel}`.
///
/// `<root>` is `$ARBOR_CACHE` when set, else the platform cache dir
/// (`$XDG_CACHE_HOME/arbor`, `~/Library/Caches/arbor`, `%LOCALAPPDATA%\arbor`).
#[must_use]
pub fn cache_dir(channel: Channel) -> PathBuf {
    cache_root()
        .join(format!("v{CACHE_LAYOUT_VERSION}"))
        .join(channel.as_str())
}

fn cache_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(CACHE_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs_next::cache_dir()
        .map(|p| p.join("arbor"))
        .or_else(|| dirs_next::home_dir().map(|h| h.join(".arbor").join("cache")))
        .unwrap_or_else(|| PathBuf::from(".arbor-cache"))
}
