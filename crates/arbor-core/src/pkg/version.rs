//! npm-flavoured semver ranges on top of the `semver` crate.

use super::error::PkgError;
use super::registry::{get_dist_tag, get_versions};
use semver::{Version, VersionReq};

/// A parsed npm range: a set of alternatives joined by `||`.
#[derive(Debug, Clone)]
pub struct Range {
    alternatives: Vec<VersionReq>,
}

impl Range {
    /// Parse an npm range string.
    ///
    /// # Errors
    /// Returns an error if no alternative parses.
    pub fn parse(range: &str) -> Result<Self, PkgError> {
        let range = range.trim();
        if range.is_empty() || range == "*" || range == "x" || range == "X" || range == "latest" {
            return Ok(Self {
                alternatives: vec![VersionReq::STAR],
            });
        }

        let mut alternatives = Vec::new();
        let mut last_err = None;
        for alt in range.split("||").map(str::trim) {
            if alt.is_empty() {
                continue;
            }
            match parse_single(alt) {
                Ok(req) => alternatives.push(req),
                Err(e) => last_err = Some(e),
            }
        }

        if alternatives.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                PkgError::spec_invalid(format!("Invalid version range '{range}': no valid alternatives"))
            }));
        }

        Ok(Self { alternatives })
    }

    /// Whether `version` satisfies any alternative.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Check whether a version string satisfies an npm range.
///
/// Unparseable versions or ranges never satisfy.
#[must_use]
pub fn satisfies(version: &str, range: &str) -> bool {
    let Ok(version) = Version::parse(version.trim_start_matches(['v', '='])) else {
        return false;
    };
    Range::parse(range).is_ok_and(|r| r.matches(&version))
}

/// Pick the version a registry request for `range` resolves to.
///
/// No range means `latest`. Dist-tags and exact versions listed in the
/// packument win outright. Otherwise the `latest` tag is used when it
/// satisfies the range, else the highest satisfying version.
///
/// # Errors
/// `ENOENT` when nothing satisfies, `ESPEC` for a malformed range.
pub fn resolve_version(
    packument: &serde_json::Value,
    range: Option<&str>,
) -> Result<String, PkgError> {
    let name = packument
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown");
    let wanted = range.map(str::trim).filter(|r| !r.is_empty()).unwrap_or("latest");

    if let Some(tagged) = get_dist_tag(packument, wanted) {
        return Ok(tagged.to_string());
    }
    if wanted == "latest" {
        return Err(PkgError::version_not_found(name, "latest (no dist-tags.latest)"));
    }

    let versions = get_versions(packument);
    if versions.contains(&wanted) {
        return Ok(wanted.to_string());
    }

    let range = Range::parse(wanted)?;
    get_dist_tag(packument, "latest")
        .and_then(|l| Version::parse(l).ok())
        .filter(|latest| range.matches(latest))
        .or_else(|| {
            versions
                .iter()
                .filter_map(|v| Version::parse(v).ok())
                .filter(|v| range.matches(v))
                .max()
        })
        .map(|v| v.to_string())
        .ok_or_else(|| PkgError::version_not_found(name, wanted))
}

/// One `||` alternative as a `semver` requirement.
///
/// npm comparators are space separated and may be partial (`1.2`, `1.x`);
/// a bare full version means `=`. `semver` wants comma-separated
/// comparators, so each one is rewritten before parsing.
fn parse_single(alt: &str) -> Result<VersionReq, PkgError> {
    let comparators = match alt.split_once(" - ") {
        Some((lo, hi)) => hyphen_bounds(lo.trim(), hi.trim()),
        None => join_operators(alt).iter().map(|c| desugar(c)).collect(),
    };
    let converted = if comparators.is_empty() {
        ">=0.0.0".to_string()
    } else {
        comparators.join(", ")
    };
    VersionReq::parse(&converted)
        .map_err(|e| PkgError::spec_invalid(format!("Invalid version range '{alt}': {e}")))
}

/// Reattach operators written apart from their version (`>= 1.2`).
fn join_operators(alt: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut op = String::new();
    for token in alt.split_whitespace() {
        if token.chars().all(|c| OPERATOR_CHARS.contains(c)) {
            op.push_str(token);
        } else {
            out.push(format!("{op}{token}"));
            op.clear();
        }
    }
    if !op.is_empty() {
        out.push(op);
    }
    out
}

const OPERATOR_CHARS: &str = "<>=~^";

/// Numeric parts of a possibly partial version; `None` marks a wildcard or
/// missing part. Returns `None` if any part is neither.
fn partial(version: &str) -> Option<[Option<u64>; 3]> {
    let mut parts = [None; 3];
    let mut wild = false;
    for (i, part) in version.split('.').enumerate() {
        if i >= 3 {
            return None;
        }
        match part {
            "x" | "X" | "*" => wild = true,
            n if !wild => parts[i] = Some(n.parse().ok()?),
            _ => return None,
        }
    }
    Some(parts)
}

fn desugar(comparator: &str) -> String {
    let split = comparator
        .find(|c: char| !OPERATOR_CHARS.contains(c))
        .unwrap_or(comparator.len());
    let (op, version) = comparator.split_at(split);
    let version = version.trim_start_matches('v');

    if Version::parse(version).is_ok() {
        let op = if op.is_empty() { "=" } else { op };
        return format!("{op}{version}");
    }
    let Some(parts) = partial(version) else {
        return comparator.to_string();
    };

    match (op, parts) {
        (_, [None, ..]) => ">=0.0.0".to_string(),
        ("" | "=", [Some(m), None, _]) => format!(">={m}.0.0, <{}.0.0", m + 1),
        ("" | "=", [Some(m), Some(n), _]) => format!(">={m}.{n}.0, <{m}.{}.0", n + 1),
        (op, [Some(m), None, _]) => format!("{op}{m}"),
        (op, [Some(m), Some(n), _]) => format!("{op}{m}.{n}"),
    }
}

/// `lo - hi`: partial lower bounds fill with zeros, partial upper bounds
/// exclude the next major or minor.
fn hyphen_bounds(lo: &str, hi: &str) -> Vec<String> {
    let mut out = Vec::new();
    if Version::parse(lo).is_ok() {
        out.push(format!(">={lo}"));
    } else if let Some([Some(m), n, p]) = partial(lo) {
        out.push(format!(">={m}.{}.{}", n.unwrap_or(0), p.unwrap_or(0)));
    } else {
        out.push(format!(">={lo}"));
    }

    if Version::parse(hi).is_ok() {
        out.push(format!("<={hi}"));
    } else {
        match partial(hi) {
            Some([Some(m), None, _]) => out.push(format!("<{}.0.0", m + 1)),
            Some([Some(m), Some(n), _]) => out.push(format!("<{m}.{}.0", n + 1)),
            Some([None, ..]) => {}
            None => out.push(format!("<={hi}")),
        }
    }
    out
}
