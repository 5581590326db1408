use arbor_core::pkg::shrinkwrap::LOCKFILE_VERSION;
use arbor_core::pkg::INSTALL_REPORT_SCHEMA_VERSION;
use arbor_core::version::{version_string, CACHE_LAYOUT_VERSION, VERSION};
use miette::{IntoDiagnostic, Result};

pub fn run(json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "version": VERSION,
            "reportSchemaVersion": INSTALL_REPORT_SCHEMA_VERSION,
            "lockfileVersion": LOCKFILE_VERSION,
            "cacheLayout": CACHE_LAYOUT_VERSION,
        });
        println!("{}", serde_json::to_string_pretty(&out).into_diagnostic()?);
    } else {
        println!("{}", version_string());
    }
    Ok(())
}
