use arbor_core::pkg::InstallOptions;
use arbor_core::Config;
use miette::Result;
use std::path::Path;

pub fn run(
    config: &Config,
    dir: &Path,
    packages: &[String],
    opts: InstallOptions,
    json: bool,
) -> Result<()> {
    let installer = super::installer(config, opts)?;
    super::run_to_report(installer.prune(dir, packages), json)
}
