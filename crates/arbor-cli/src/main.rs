#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use arbor_core::pkg::InstallOptions;
use arbor_core::Config;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(author, version, about = "Install npm packages into node_modules", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v INFO, -vv DEBUG, -vvv TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Install the project's dependencies, plus any named packages
    #[command(visible_alias = "i")]
    Install {
        /// Packages to install (e.g. `lodash`, `react@^18`, `file:../lib`)
        packages: Vec<String>,

        /// Save named packages to `dependencies`
        #[arg(short = 'S', long)]
        save: bool,

        /// Save named packages to `devDependencies`
        #[arg(short = 'D', long)]
        save_dev: bool,

        /// Save named packages to `optionalDependencies`
        #[arg(short = 'O', long)]
        save_optional: bool,

        #[command(flatten)]
        flags: TreeFlags,
    },

    /// Remove extraneous packages
    Prune {
        /// Only remove these packages
        packages: Vec<String>,

        #[command(flatten)]
        flags: TreeFlags,
    },

    /// Hoist duplicated packages as far up the tree as possible
    #[command(visible_alias = "ddp")]
    Dedupe {
        #[command(flatten)]
        flags: TreeFlags,
    },

    /// List installed packages
    #[command(visible_alias = "list")]
    Ls,
}

/// Flags shared by every command that changes `node_modules`.
#[derive(clap::Args, Debug, Default)]
struct TreeFlags {
    /// Skip devDependencies and remove dev-only packages
    #[arg(long)]
    production: bool,

    /// Skip optionalDependencies
    #[arg(long)]
    no_optional: bool,

    /// Nest dependencies under the top-level package that needs them
    #[arg(long)]
    global_style: bool,

    /// Never hoist dependencies
    #[arg(long)]
    legacy_bundling: bool,

    /// Downgrade engine, platform and self-dependency errors to warnings
    #[arg(short, long)]
    force: bool,

    /// Fail on `engines` mismatches
    #[arg(long)]
    engine_strict: bool,

    /// Report what would change without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Do not run lifecycle scripts
    #[arg(long)]
    ignore_scripts: bool,

    /// Neither read nor write package-lock.json / npm-shrinkwrap.json
    #[arg(long)]
    no_lockfile: bool,

    /// Maximum concurrent fetch, extract and script tasks
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,
}

impl TreeFlags {
    /// Apply flags on top of the options loaded from the project.
    fn apply(&self, mut opts: InstallOptions) -> InstallOptions {
        opts.production |= self.production;
        opts.include_optional &= !self.no_optional;
        opts.global_style |= self.global_style;
        opts.legacy_bundling |= self.legacy_bundling;
        opts.force |= self.force;
        opts.engine_strict |= self.engine_strict;
        opts.dry_run |= self.dry_run;
        opts.ignore_scripts |= self.ignore_scripts;
        opts.lockfile &= !self.no_lockfile;
        if let Some(n) = self.concurrency {
            opts = opts.with_concurrency(n);
        }
        opts
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine working directory
    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let root = arbor_core::paths::project_root(&cwd).unwrap_or_else(|| cwd.clone());

    let config = Config::new(cwd.clone())
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json)
        .load_rc(&root)
        .into_diagnostic()?;

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(cli.json),
        Some(Commands::Install {
            packages,
            save,
            save_dev,
            save_optional,
            flags,
        }) => {
            let span = tracing::info_span!("install", cmd = "install", cwd = %root.display());
            let _guard = span.enter();
            let opts = flags
                .apply(config.install.clone())
                .with_save(save || config.install.save)
                .with_save_dev(save_dev || config.install.save_dev)
                .with_save_optional(save_optional || config.install.save_optional);
            commands::install::run(&config, &root, &packages, opts, cli.json)
        }
        Some(Commands::Prune { packages, flags }) => {
            let span = tracing::info_span!("prune", cmd = "prune", cwd = %root.display());
            let _guard = span.enter();
            let opts = flags.apply(config.install.clone());
            commands::prune::run(&config, &root, &packages, opts, cli.json)
        }
        Some(Commands::Dedupe { flags }) => {
            let span = tracing::info_span!("dedupe", cmd = "dedupe", cwd = %root.display());
            let _guard = span.enter();
            let opts = flags.apply(config.install.clone());
            commands::dedupe::run(&config, &root, opts, cli.json)
        }
        Some(Commands::Ls) => commands::ls::run(&root, cli.json),
    }
}
