/// Crate version, baked in at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Layout version of the package cache. A bump moves the cache to a fresh
/// `v{N}` directory instead of reading incompatible entries.
pub const CACHE_LAYOUT_VERSION: u32 = 1;

/// `User-Agent` sent to registries, in npm's `name/version os arch` shape.
#[must_use]
pub fn user_agent() -> String {
    format!(
        "arbor/{VERSION} {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Human-readable version line for `arbor version`.
#[must_use]
pub fn version_string() -> String {
    match option_env!("ARBOR_BUILD_GIT_HASH") {
        Some(hash) => format!("arbor {VERSION} ({hash})"),
        None => format!("arbor {VERSION}"),
    }
}
