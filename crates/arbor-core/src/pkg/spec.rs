//! Package spec parsing.
//!
//! Parses package specifications like:
//! - `react`, `react@18.2.0`, `react@^18.0.0`, `react@next`
//! - `@types/node`, `@types/node@^20`
//! - `file:../lib`, `./lib`, `/abs/lib`
//! - `git+https://host/repo.git#v1`, `github:user/repo`, `user/repo`
//! - `https://host/pkg.tgz`
//!
//! A dependency map value (`"a": "^1.0.0"`) is classified with [`PackageSpec::from_dep`].

use super::error::PkgError;
use std::path::{Path, PathBuf};

/// What kind of source a spec points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecKind {
    /// An exact semver version.
    Version(String),
    /// A semver range (including `*` and the empty range).
    Range(String),
    /// A dist-tag such as `latest` or `next`.
    Tag(String),
    /// A git URL with an optional committish.
    Git {
        url: String,
        committish: Option<String>,
    },
    /// A hosted-git shorthand (`github:user/repo`, `user/repo`).
    Hosted {
        host: String,
        repo: String,
        committish: Option<String>,
    },
    /// A local directory.
    Directory(PathBuf),
    /// A tarball URL or local `.tgz` file.
    Tarball(String),
}

impl SpecKind {
    /// Registry-backed kinds resolve through a packument.
    #[must_use]
    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Version(_) | Self::Range(_) | Self::Tag(_))
    }

    /// Short label used in `_requested.type`.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Version(_) => "version",
            Self::Range(_) => "range",
            Self::Tag(_) => "tag",
            Self::Git { .. } => "git",
            Self::Hosted { .. } => "hosted",
            Self::Directory(_) => "directory",
            Self::Tarball(_) => "remote",
        }
    }
}

/// A parsed package specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name"). Empty when the
    /// spec is a bare path or URL whose manifest has not been read yet.
    pub name: String,
    /// Scope without the @ prefix, if scoped.
    pub scope: Option<String>,
    /// The text after the name (`^1.0.0`, `file:../x`), or the whole input for
    /// nameless specs.
    pub raw: String,
    pub kind: SpecKind,
}

impl PackageSpec {
    /// Parse a package specification string as typed by a user.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // Nameless sources: paths, URLs and hosted shorthands.
        if looks_like_source(input) {
            let kind = classify(input)?;
            return Ok(Self {
                name: String::new(),
                scope: None,
                raw: input.to_string(),
                kind,
            });
        }

        let (name, scope, range) = if input.starts_with('@') {
            split_scoped(input)?
        } else {
            split_unscoped(input)?
        };

        Self::from_dep(&name, range.unwrap_or("")).map(|mut spec| {
            spec.scope = scope;
            spec
        })
    }

    /// Classify the value of a dependency map entry.
    ///
    /// # Errors
    /// Returns an error if the name is invalid or the value is a malformed source.
    pub fn from_dep(name: &str, value: &str) -> Result<Self, PkgError> {
        validate_name(name)?;
        let value = value.trim();
        let kind = classify(value)?;
        let scope = name
            .strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .map(|(scope, _)| scope.to_string());

        Ok(Self {
            name: name.to_string(),
            scope,
            raw: value.to_string(),
            kind,
        })
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// URL-encode the package name for registry requests.
    ///
    /// For scoped packages, encodes the `/` as `%2F`.
    #[must_use]
    pub fn url_encoded_name(&self) -> String {
        if self.is_scoped() {
            self.name.replace('/', "%2F")
        } else {
            self.name.clone()
        }
    }

    /// The range to match installed versions against, if this is a registry spec.
    #[must_use]
    pub fn range(&self) -> Option<&str> {
        match &self.kind {
            SpecKind::Version(v) | SpecKind::Range(v) => Some(v),
            _ => None,
        }
    }

    /// `name@raw`, the form recorded in `_from`.
    #[must_use]
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            self.raw.clone()
        } else if self.raw.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.raw)
        }
    }

    /// Resolve a directory spec relative to `base`.
    #[must_use]
    pub fn local_path(&self, base: &Path) -> Option<PathBuf> {
        match &self.kind {
            SpecKind::Directory(p) if p.is_absolute() => Some(p.clone()),
            SpecKind::Directory(p) => Some(base.join(p)),
            _ => None,
        }
    }
}

fn looks_like_source(input: &str) -> bool {
    input.starts_with("file:")
        || input.starts_with('.')
        || input.starts_with('/')
        || input.starts_with('~')
        || is_windows_path(input)
        || input.contains("://")
        || input.starts_with("git+")
        || input.starts_with("github:")
        || input.starts_with("gitlab:")
        || input.starts_with("bitbucket:")
        || (!input.starts_with('@') && !input.contains('@') && input.contains('/'))
}

fn is_windows_path(input: &str) -> bool {
    let bytes = input.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn classify(value: &str) -> Result<SpecKind, PkgError> {
    if value.is_empty() || value == "*" {
        return Ok(SpecKind::Range("*".to_string()));
    }

    if let Some(path) = value.strip_prefix("file:") {
        return classify_path(path);
    }
    if value.starts_with('.') || value.starts_with('/') || value.starts_with('~') {
        return classify_path(value);
    }
    if is_windows_path(value) {
        if cfg!(windows) {
            return classify_path(value);
        }
        return Err(PkgError::windows_path(value));
    }

    if let Some(rest) = value.strip_prefix("git+") {
        let (url, committish) = split_committish(rest);
        return Ok(SpecKind::Git { url, committish });
    }
    if value.starts_with("git://") || value.starts_with("ssh://") {
        let (url, committish) = split_committish(value);
        return Ok(SpecKind::Git { url, committish });
    }
    for host in ["github", "gitlab", "bitbucket"] {
        if let Some(rest) = value.strip_prefix(host).and_then(|r| r.strip_prefix(':')) {
            return hosted(host, rest);
        }
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Ok(SpecKind::Tarball(value.to_string()));
    }
    if value.ends_with(".tgz") || value.ends_with(".tar.gz") {
        return Ok(SpecKind::Tarball(value.to_string()));
    }

    // user/repo shorthand
    if !value.starts_with('@') && value.contains('/') && !value.contains(' ') {
        return hosted("github", value);
    }

    if semver::Version::parse(value.trim_start_matches(['=', 'v'])).is_ok() {
        return Ok(SpecKind::Version(
            value.trim_start_matches(['=', 'v']).to_string(),
        ));
    }

    if is_tag(value) {
        return Ok(SpecKind::Tag(value.to_string()));
    }

    Ok(SpecKind::Range(value.to_string()))
}

fn classify_path(path: &str) -> Result<SpecKind, PkgError> {
    if path.is_empty() {
        return Err(PkgError::spec_invalid("Empty file: spec"));
    }
    if is_windows_path(path) && !cfg!(windows) {
        return Err(PkgError::windows_path(path));
    }
    if path.ends_with(".tgz") || path.ends_with(".tar.gz") {
        return Ok(SpecKind::Tarball(format!("file:{path}")));
    }
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => dirs_next::home_dir().map_or_else(|| PathBuf::from(path), |h| h.join(rest)),
        None => PathBuf::from(path),
    };
    Ok(SpecKind::Directory(expanded))
}

fn hosted(host: &str, rest: &str) -> Result<SpecKind, PkgError> {
    let (repo, committish) = split_committish(rest);
    let mut parts = repo.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(user), Some(project)) if !user.is_empty() && !project.is_empty() => {
            Ok(SpecKind::Hosted {
                host: host.to_string(),
                repo: format!("{user}/{}", project.trim_end_matches(".git")),
                committish,
            })
        }
        _ => Err(PkgError::spec_invalid(format!(
            "Invalid {host} shorthand: '{rest}'"
        ))),
    }
}

fn split_committish(value: &str) -> (String, Option<String>) {
    match value.split_once('#') {
        Some((url, c)) if !c.is_empty() => (url.to_string(), Some(c.to_string())),
        Some((url, _)) => (url.to_string(), None),
        None => (value.to_string(), None),
    }
}

/// A tag is a bare identifier that cannot be read as a range.
fn is_tag(value: &str) -> bool {
    let first = value.chars().next().unwrap_or('0');
    first.is_ascii_alphabetic()
        && !matches!(value, "x" | "X")
        && !value.starts_with("x.")
        && !value.starts_with("X.")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

type SplitSpec<'a> = (String, Option<String>, Option<&'a str>);

fn split_scoped(input: &str) -> Result<SplitSpec<'_>, PkgError> {
    // Must have at least @scope/name
    let Some(slash_pos) = input.find('/') else {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: missing '/' in '{input}'"
        )));
    };

    if slash_pos == 1 {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: empty scope in '{input}'"
        )));
    }

    let scope = &input[1..slash_pos];
    let after_slash = &input[slash_pos + 1..];

    if after_slash.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: empty name in '{input}'"
        )));
    }

    if let Some(at_pos) = after_slash.find('@') {
        let pkg_name = &after_slash[..at_pos];
        let range = &after_slash[at_pos + 1..];

        if pkg_name.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty name in '{input}'"
            )));
        }
        if range.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid package spec: empty version range in '{input}'"
            )));
        }

        Ok((
            format!("@{scope}/{pkg_name}"),
            Some(scope.to_string()),
            Some(range),
        ))
    } else {
        Ok((input.to_string(), Some(scope.to_string()), None))
    }
}

fn split_unscoped(input: &str) -> Result<SplitSpec<'_>, PkgError> {
    if let Some(at_pos) = input.find('@') {
        let name = &input[..at_pos];
        let range = &input[at_pos + 1..];

        if name.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid package spec: empty name in '{input}'"
            )));
        }
        if range.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid package spec: empty version range in '{input}'"
            )));
        }

        Ok((name.to_string(), None, Some(range)))
    } else {
        Ok((input.to_string(), None, None))
    }
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }

    let bare = match name.strip_prefix('@') {
        Some(rest) => match rest.split_once('/') {
            Some((scope, pkg)) if !scope.is_empty() && !pkg.is_empty() => {
                check_chars(scope, name)?;
                pkg
            }
            _ => {
                return Err(PkgError::spec_invalid(format!(
                    "Invalid scoped package name '{name}'"
                )))
            }
        },
        None => name,
    };

    check_chars(bare, name)
}

fn check_chars(part: &str, name: &str) -> Result<(), PkgError> {
    // Basic validation: no spaces, no special chars except - _ and .
    for c in part.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{name}'"
            )));
        }
    }
    Ok(())
}
