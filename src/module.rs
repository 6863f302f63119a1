// Purpose: Core module identity types shared by selection, fetch, and the manifest model.
// Inputs/Outputs: (path, version) pairs; pseudo-version construction for untagged revisions.
// Invariants: A path whose major suffix is /vN only pairs with vN versions; v0/v1 carry no suffix.
// Gotchas: Checksum ledger keys reuse the version field with a "/go.mod" suffix; sort handles it.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::semver;

/// A specific version of a module path. The version is usually a
/// canonical semver string, but the head of a build list may carry an
/// empty version and ledger keys may carry a "/go.mod" suffix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub path: String,
    pub version: String,
}

impl ModuleVersion {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        ModuleVersion {
            path: path.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}@{}", self.path, self.version)
        }
    }
}

/// Sort primarily by path, then by semver order of the version with any
/// "/go.mod" suffix compared last, so ledger rows group naturally.
pub fn sort(list: &mut [ModuleVersion]) {
    list.sort_by(|a, b| {
        if a.path != b.path {
            return a.path.cmp(&b.path);
        }
        let (av, asuf) = split_suffix(&a.version);
        let (bv, bsuf) = split_suffix(&b.version);
        match semver::compare(av, bv) {
            Ordering::Equal => asuf.cmp(bsuf),
            c => c,
        }
    });
}

fn split_suffix(v: &str) -> (&str, &str) {
    match v.find('/') {
        Some(i) => (&v[..i], &v[i..]),
        None => (v, ""),
    }
}

/// Major version suffix of a module path: "v2" for "example.com/m/v2",
/// None for paths on the v0/v1 line.
pub fn path_major(path: &str) -> Option<&str> {
    let i = path.rfind('/')?;
    let last = &path[i + 1..];
    if last.len() < 2 || !last.starts_with('v') {
        return None;
    }
    let digits = &last[1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return None;
    }
    // v0 and v1 are never path suffixes.
    if digits == "0" || digits == "1" {
        return None;
    }
    Some(last)
}

/// Whether version may be selected for path under the major-suffix rule.
pub fn matches_major(path: &str, version: &str) -> bool {
    let m = semver::major(version);
    match path_major(path) {
        Some(want) => m == want,
        None => m == "v0" || m == "v1",
    }
}

const PSEUDO_TIME_LAYOUT: &str = "%Y%m%d%H%M%S";

/// Synthesize a pseudo-version for a commit with no semver tag.
/// major is "v0", "v1", or the path's /vN suffix; short is the
/// shortened revision identifier.
pub fn pseudo_version(major: &str, time: DateTime<Utc>, short: &str) -> String {
    let major = if major.is_empty() { "v0" } else { major };
    format!(
        "{}.0.0-{}-{}",
        major,
        time.format(PSEUDO_TIME_LAYOUT),
        short
    )
}

pub fn is_pseudo_version(v: &str) -> bool {
    let re = Regex::new(r"^v[0-9]+\.0\.0-[0-9]{14}-[0-9a-f]+$").unwrap();
    re.is_match(v)
}

/// Commit time encoded in a pseudo-version, if v is one.
pub fn pseudo_version_time(v: &str) -> Option<DateTime<Utc>> {
    if !is_pseudo_version(v) {
        return None;
    }
    let dash = v.find('-')?;
    let stamp = &v[dash + 1..dash + 15];
    chrono::NaiveDateTime::parse_from_str(stamp, PSEUDO_TIME_LAYOUT)
        .ok()
        .map(|t| t.and_utc())
}
