pub mod dedupe;
pub mod install;
pub mod ls;
pub mod prune;
pub mod version;

use arbor_core::pkg::{
    InstallOptions, InstallReport, Installer, PackageCache, RegistryClient, RegistrySource,
    ReportEntry, ShellScriptRunner,
};
use arbor_core::Config;
use miette::{IntoDiagnostic, Result};
use std::future::Future;

type DefaultInstaller = Installer<RegistrySource, ShellScriptRunner>;

/// Installer backed by the npm registry and a shell script runner.
fn installer(config: &Config, opts: InstallOptions) -> Result<DefaultInstaller> {
    let client = RegistryClient::from_env().into_diagnostic()?;
    let source = RegistrySource::new(client, PackageCache::new(config.channel));
    Ok(Installer::new(source, ShellScriptRunner::new(), opts))
}

/// Drive one run to completion and print its report.
fn run_to_report<F>(run: F, json: bool) -> Result<()>
where
    F: Future<Output = Result<InstallReport, arbor_core::pkg::PkgError>>,
{
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let report = runtime.block_on(run).into_diagnostic()?;
    print_report(&report, json)
}

fn print_report(report: &InstallReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).into_diagnostic()?
        );
        return Ok(());
    }

    for line in report_lines(report) {
        println!("{line}");
    }
    for warning in &report.warnings {
        eprintln!("! {warning}");
    }
    Ok(())
}

fn report_lines(report: &InstallReport) -> Vec<String> {
    let id = |e: &ReportEntry| format!("{}@{}", e.name, e.version);
    let mut lines = Vec::new();
    for e in &report.added {
        lines.push(format!("+ {} {}", id(e), e.path));
    }
    for e in &report.updated {
        let from = e.from.as_deref().unwrap_or("?");
        lines.push(format!("~ {} {} (was {from})", id(e), e.path));
    }
    for e in &report.moved {
        let from = e.from.as_deref().unwrap_or("?");
        lines.push(format!("> {} {from} -> {}", id(e), e.path));
    }
    for e in &report.removed {
        lines.push(format!("- {} {}", id(e), e.path));
    }
    for e in &report.failed {
        lines.push(format!("x {} {} (optional, skipped)", id(e), e.path));
    }

    let prefix = if report.dry_run { "(dry run) " } else { "" };
    if report.is_noop() && report.failed.is_empty() {
        lines.push(format!("{prefix}up to date in {}ms", report.elapsed_ms));
    } else {
        lines.push(format!(
            "{prefix}added {}, updated {}, moved {}, removed {} in {}ms",
            report.added.len(),
            report.updated.len(),
            report.moved.len(),
            report.removed.len(),
            report.elapsed_ms
        ));
    }
    lines
}
