use serde::{Deserialize, Serialize};

/// Default number of concurrent fetch/extract/script tasks.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Knobs for one install, prune or dedupe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstallOptions {
    /// Nest dependencies of top-level packages under them instead of hoisting.
    pub global_style: bool,
    /// Never hoist; every dependency nests under its requirer.
    pub legacy_bundling: bool,
    /// Downgrade engine/platform/self-dependency errors to warnings and reinstall
    /// packages the user asks for again.
    pub force: bool,
    /// Treat `engines` mismatches as errors.
    pub engine_strict: bool,
    /// Treat `os`/`cpu` mismatches as errors.
    pub platform_strict: bool,
    /// Skip `devDependencies` of the root and remove dev-only packages.
    pub production: bool,
    pub include_optional: bool,
    /// Record requested packages in `dependencies`.
    pub save: bool,
    pub save_dev: bool,
    pub save_optional: bool,
    /// Run lifecycle scripts for bundled packages too.
    pub rebuild_bundle: bool,
    /// Compute and report actions without touching the filesystem.
    pub dry_run: bool,
    pub ignore_scripts: bool,
    pub concurrency: usize,
    /// Read and write the shrinkwrap / package-lock.
    pub lockfile: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            global_style: false,
            legacy_bundling: false,
            force: false,
            engine_strict: false,
            platform_strict: true,
            production: false,
            include_optional: true,
            save: false,
            save_dev: false,
            save_optional: false,
            rebuild_bundle: true,
            dry_run: false,
            ignore_scripts: false,
            concurrency: DEFAULT_CONCURRENCY,
            lockfile: true,
        }
    }
}

impl InstallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_global_style(mut self, on: bool) -> Self {
        self.global_style = on;
        self
    }

    #[must_use]
    pub fn with_legacy_bundling(mut self, on: bool) -> Self {
        self.legacy_bundling = on;
        self
    }

    #[must_use]
    pub fn with_force(mut self, on: bool) -> Self {
        self.force = on;
        self
    }

    #[must_use]
    pub fn with_engine_strict(mut self, on: bool) -> Self {
        self.engine_strict = on;
        self
    }

    #[must_use]
    pub fn with_platform_strict(mut self, on: bool) -> Self {
        self.platform_strict = on;
        self
    }

    #[must_use]
    pub fn with_production(mut self, on: bool) -> Self {
        self.production = on;
        self
    }

    #[must_use]
    pub fn with_include_optional(mut self, on: bool) -> Self {
        self.include_optional = on;
        self
    }

    #[must_use]
    pub fn with_save(mut self, on: bool) -> Self {
        self.save = on;
        self
    }

    #[must_use]
    pub fn with_save_dev(mut self, on: bool) -> Self {
        self.save_dev = on;
        self
    }

    #[must_use]
    pub fn with_save_optional(mut self, on: bool) -> Self {
        self.save_optional = on;
        self
    }

    #[must_use]
    pub fn with_rebuild_bundle(mut self, on: bool) -> Self {
        self.rebuild_bundle = on;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    #[must_use]
    pub fn with_ignore_scripts(mut self, on: bool) -> Self {
        self.ignore_scripts = on;
        self
    }

    /// Set the task concurrency. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    #[must_use]
    pub fn with_lockfile(mut self, on: bool) -> Self {
        self.lockfile = on;
        self
    }

    /// Whether any `save*` flag is set.
    #[must_use]
    pub fn saves(&self) -> bool {
        self.save || self.save_dev || self.save_optional
    }

    /// The manifest section requested packages are saved into.
    #[must_use]
    pub fn save_section(&self) -> &'static str {
        if self.save_dev {
            "devDependencies"
        } else if self.save_optional {
            "optionalDependencies"
        } else {
            "dependencies"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = InstallOptions::default();
        assert_eq!(opts.concurrency, DEFAULT_CONCURRENCY);
        assert!(opts.lockfile);
        assert!(opts.platform_strict);
        assert!(opts.include_optional);
        assert!(!opts.saves());
    }

    #[test]
    fn test_save_section() {
        assert_eq!(InstallOptions::new().with_save(true).save_section(), "dependencies");
        assert_eq!(
            InstallOptions::new().with_save_dev(true).save_section(),
            "devDependencies"
        );
        assert_eq!(
            InstallOptions::new().with_save_optional(true).save_section(),
            "optionalDependencies"
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: InstallOptions =
            serde_json::from_str(r#"{"globalStyle":true,"concurrency":2}"#).unwrap();
        assert!(opts.global_style);
        assert_eq!(opts.concurrency, 2);
        assert!(opts.lockfile);
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(InstallOptions::new().with_concurrency(0).concurrency, 1);
    }
}
