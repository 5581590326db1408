//! Package manager error and warning types.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;

/// Package manager error codes.
pub mod codes {
    pub const ECYCLE: &str = "ECYCLE";
    pub const ENOTSUP: &str = "ENOTSUP";
    pub const EBADPLATFORM: &str = "EBADPLATFORM";
    pub const ENOSELF: &str = "ENOSELF";
    pub const EPEERINVALID: &str = "EPEERINVALID";
    pub const EMISSINGFIELD: &str = "EMISSINGFIELD";
    pub const EISGIT: &str = "EISGIT";
    pub const EBADWINPATH: &str = "EBADWINPATH";
    pub const ENOLOCAL: &str = "ENOLOCAL";
    pub const ENOTDIR: &str = "ENOTDIR";
    pub const ENOENT: &str = "ENOENT";
    pub const ENETWORK: &str = "ENETWORK";
    pub const ESPEC: &str = "ESPEC";
    pub const EFS: &str = "EFS";
    pub const ESCRIPT: &str = "ESCRIPT";
    pub const ESHRINKWRAP: &str = "ESHRINKWRAP";
    pub const EMANIFEST: &str = "EMANIFEST";
}

/// Warning codes. These never abort a run.
pub mod warning_codes {
    pub const PEER_MISSING: &str = "EPEERMISSING";
    pub const DEV_PROD_DUPLICATE: &str = "EDUPLICATEDEP";
    pub const ENGINE: &str = "ENOTSUP";
    pub const PLATFORM: &str = "EBADPLATFORM";
    pub const OPTIONAL_FAILED: &str = "EOPTIONALFAIL";
    pub const PEER_INVALID: &str = "EPEERINVALID";
    pub const MANIFEST: &str = "EMANIFEST";
    pub const SKIPPED: &str = "ESKIPPED";
}

/// Package manager error.
#[derive(Debug, Clone)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error came from a missing package or version.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == codes::ENOENT
    }

    #[must_use]
    pub fn cycle(name: &str, version: &str) -> Self {
        Self::new(
            codes::ECYCLE,
            format!("Unresolvable cycle: {name}@{version} is already an ancestor"),
        )
    }

    #[must_use]
    pub fn unsupported_engine(name: &str, version: &str, wanted: &str, current: &str) -> Self {
        Self::new(
            codes::ENOTSUP,
            format!("Unsupported engine for {name}@{version}: wanted {wanted} (current: {current})"),
        )
    }

    #[must_use]
    pub fn unsupported_platform(name: &str, version: &str, wanted: &str, current: &str) -> Self {
        Self::new(
            codes::EBADPLATFORM,
            format!(
                "Unsupported platform for {name}@{version}: wanted {wanted} (current: {current})"
            ),
        )
    }

    #[must_use]
    pub fn self_dependency(name: &str) -> Self {
        Self::new(
            codes::ENOSELF,
            format!("Refusing to install package with name \"{name}\" under a package also called \"{name}\""),
        )
    }

    pub fn peer_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::EPEERINVALID, msg)
    }

    #[must_use]
    pub fn missing_field(field: &str, location: &str) -> Self {
        Self::new(
            codes::EMISSINGFIELD,
            format!("Missing required field \"{field}\" in {location}"),
        )
    }

    #[must_use]
    pub fn is_git(path: &Path) -> Self {
        Self::new(
            codes::EISGIT,
            format!("Appears to be a git repo or submodule: {}", path.display()),
        )
    }

    #[must_use]
    pub fn windows_path(spec: &str) -> Self {
        Self::new(
            codes::EBADWINPATH,
            format!("Cannot install a Windows path on a non-Windows system: {spec}"),
        )
    }

    #[must_use]
    pub fn not_local(path: &Path) -> Self {
        Self::new(
            codes::ENOLOCAL,
            format!("Could not install from {}: no package.json found", path.display()),
        )
    }

    #[must_use]
    pub fn not_dir(path: &Path) -> Self {
        Self::new(
            codes::ENOTDIR,
            format!("Not a directory: {}", path.display()),
        )
    }

    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::ENOENT, format!("Package not found: {name}"))
    }

    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::new(
            codes::ENOENT,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(codes::ENETWORK, msg)
    }

    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::ESPEC, msg)
    }

    pub fn fs(msg: impl Into<String>) -> Self {
        Self::new(codes::EFS, msg)
    }

    #[must_use]
    pub fn script(name: &str, stage: &str, detail: &str) -> Self {
        Self::new(
            codes::ESCRIPT,
            format!("{name} {stage} script failed: {detail}"),
        )
    }

    pub fn shrinkwrap(msg: impl Into<String>) -> Self {
        Self::new(codes::ESHRINKWRAP, msg)
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::new(codes::EMANIFEST, msg)
    }

    /// Attach a path to an I/O error.
    #[must_use]
    pub fn io_at(path: &Path, e: &io::Error) -> Self {
        Self::new(codes::EFS, format!("{}: {e}", path.display()))
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self::new(codes::ENOENT, e.to_string())
        } else {
            Self::new(codes::EFS, e.to_string())
        }
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(codes::ENETWORK, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(codes::ENETWORK, format!("Connection failed: {e}"))
        } else {
            Self::new(codes::ENETWORK, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::EMANIFEST, format!("Invalid JSON: {e}"))
    }
}

/// A non-fatal diagnostic accumulated on the tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: &'static str,
    pub message: String,
    /// Tree location the warning is about (`/` for the root).
    pub location: String,
}

impl Warning {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: location.into(),
        }
    }

    /// Downgrade an error to a warning at `location`.
    #[must_use]
    pub fn from_error(err: &PkgError, location: impl Into<String>) -> Self {
        Self::new(err.code(), err.message().to_string(), location)
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.location, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        let err = PkgError::spec_invalid("bad spec");
        assert_eq!(err.code(), codes::ESPEC);
        assert_eq!(err.to_string(), "ESPEC: bad spec");
    }

    #[test]
    fn test_error_codes_npm_style() {
        let all_codes = [
            codes::ECYCLE,
            codes::ENOTSUP,
            codes::EBADPLATFORM,
            codes::ENOSELF,
            codes::EPEERINVALID,
            codes::EMISSINGFIELD,
            codes::EISGIT,
            codes::EBADWINPATH,
            codes::ENOLOCAL,
            codes::ENOTDIR,
            codes::ENOENT,
            codes::ENETWORK,
            codes::ESPEC,
            codes::EFS,
            codes::ESCRIPT,
            codes::ESHRINKWRAP,
            codes::EMANIFEST,
        ];

        for code in all_codes {
            assert!(code.starts_with('E'), "Error code '{code}' should start with E");
            assert!(
                code.chars().all(|c| c.is_ascii_uppercase()),
                "Error code '{code}' should be uppercase"
            );
        }
    }

    #[test]
    fn test_io_not_found_maps_to_enoent() {
        let err: PkgError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: PkgError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(err.code(), codes::EFS);
    }

    #[test]
    fn test_warning_from_error() {
        let err = PkgError::cycle("a", "1.0.0");
        let warning = Warning::from_error(&err, "/node_modules/a");
        assert_eq!(warning.code, codes::ECYCLE);
        assert_eq!(warning.location, "/node_modules/a");
        assert!(warning.to_string().contains("a@1.0.0"));
    }
}
