//! Dependency resolution and install planning.
//!
//! Provides:
//! - Package specifiers, npm semver ranges and typed `package.json` manifests
//! - Reading the installed `node_modules` hierarchy into a [`Tree`]
//! - Building the ideal tree (hoisting, bundles, shrinkwrap pinning)
//! - Diffing installed and ideal trees into ordered actions
//! - Decomposing actions into primitive steps and executing them with rollback
//! - Install, prune and dedupe entry points with a serialisable report
//! - Default collaborators: npm registry, content cache, shell script runner

pub mod cache;
pub mod diff;
pub mod disk;
pub mod error;
pub mod exec;
pub mod install;
pub mod link;
pub mod manifest;
pub mod memory;
pub mod metadata;
pub mod options;
pub mod plan;
pub mod registry;
pub mod scripts;
pub mod shrinkwrap;
pub mod source;
pub mod spec;
pub mod tarball;
pub mod tree;
pub mod validate;
pub mod version;

pub use cache::PackageCache;
pub use diff::{diff_trees, sort_actions, Action};
pub use disk::load_tree;
pub use error::{codes as pkg_codes, warning_codes, PkgError, Warning};
pub use exec::{ExecOutcome, Executor, InstallGate};
pub use install::{InstallReport, Installer, ReportEntry, INSTALL_REPORT_SCHEMA_VERSION};
pub use manifest::Manifest;
pub use memory::MemoryRegistry;
pub use options::{InstallOptions, DEFAULT_CONCURRENCY};
pub use plan::{decompose, Plan, Step, StepKind, Target};
pub use registry::{RegistryClient, RegistrySource, DEFAULT_REGISTRY, REGISTRY_ENV};
pub use scripts::ShellScriptRunner;
pub use shrinkwrap::{Shrinkwrap, ShrinkwrapEntry, PACKAGE_LOCK_NAME, SHRINKWRAP_NAME};
pub use source::{LifecycleStage, NoScripts, PackageSource, ScriptOptions, ScriptRunner};
pub use spec::{PackageSpec, SpecKind};
pub use tree::{hoist_children, Node, NodeId, Tree, TreeBuilder};
pub use validate::Platform;
pub use version::{satisfies, Range};
