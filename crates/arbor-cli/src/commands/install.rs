use arbor_core::pkg::InstallOptions;
use arbor_core::Config;
use miette::Result;
use std::path::Path;
use tracing::debug;

pub fn run(
    config: &Config,
    dir: &Path,
    packages: &[String],
    opts: InstallOptions,
    json: bool,
) -> Result<()> {
    debug!(packages = ?packages, dry_run = opts.dry_run, "install");
    let installer = super::installer(config, opts)?;
    super::run_to_report(installer.install(dir, packages), json)
}
