// Purpose: Uniform capability surface over concrete code-hosting services.
// Inputs/Outputs: Tag listings, revision metadata, file reads, and archives per backend.
// Invariants: Every archive ends up as a zip on local disk regardless of the host's native format.
// Gotchas: Dispatch is a closed enum, not prefix tables; adding a host means adding a variant.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bitbucket::BitbucketRepo;
use super::github::GithubRepo;
use super::gitiles::GitilesRepo;
use super::gopkgin::GopkgInRepo;

// Download size limits.
pub const MAX_GO_MOD: u64 = 16 << 20;
pub const MAX_LICENSE: u64 = 16 << 20;
pub const MAX_ZIP_FILE: u64 = 100 << 20;

/// Metadata for a single revision. The version field is the canonical
/// semver form once the module layer has adapted it; straight from a
/// host it carries the matched tag, or is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RevInfo {
    pub version: String,
    /// Complete identifier in the underlying repository.
    pub name: String,
    /// Shortened identifier, as used in pseudo-versions.
    pub short: String,
    pub time: DateTime<Utc>,
}

/// One code host serving one repository, dispatched by variant.
pub enum CodeHost {
    Github(GithubRepo),
    Bitbucket(BitbucketRepo),
    Gitiles(GitilesRepo),
    GopkgIn(GopkgInRepo),
}

impl CodeHost {
    /// Import path of the repository root.
    pub fn root(&self) -> &str {
        match self {
            CodeHost::Github(r) => r.root(),
            CodeHost::Bitbucket(r) => r.root(),
            CodeHost::Gitiles(r) => r.root(),
            CodeHost::GopkgIn(r) => r.root(),
        }
    }

    /// All tags with the given prefix.
    pub fn tags(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        match self {
            CodeHost::Github(r) => r.tags(prefix),
            CodeHost::Bitbucket(r) => r.tags(prefix),
            CodeHost::Gitiles(r) => r.tags(prefix),
            CodeHost::GopkgIn(r) => r.tags(prefix),
        }
    }

    /// Metadata for any identifier the service understands: commit
    /// hash, branch, or tag.
    pub fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        match self {
            CodeHost::Github(r) => r.stat(rev),
            CodeHost::Bitbucket(r) => r.stat(rev),
            CodeHost::Gitiles(r) => r.stat(rev),
            CodeHost::GopkgIn(r) => r.stat(rev),
        }
    }

    /// Latest revision on the default branch. Only consulted when the
    /// repository has no usable tags.
    pub fn latest(&self) -> anyhow::Result<RevInfo> {
        match self {
            CodeHost::Github(r) => r.latest(),
            CodeHost::Bitbucket(r) => r.latest(),
            CodeHost::Gitiles(r) => r.latest(),
            CodeHost::GopkgIn(r) => r.latest(),
        }
    }

    pub fn read_file(&self, rev: &str, file: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        match self {
            CodeHost::Github(r) => r.read_file(rev, file, max_size),
            CodeHost::Bitbucket(r) => r.read_file(rev, file, max_size),
            CodeHost::Gitiles(r) => r.read_file(rev, file, max_size),
            CodeHost::GopkgIn(r) => r.read_file(rev, file, max_size),
        }
    }

    /// Download an archive of rev into tmpdir as a zip file. Returns
    /// the file path and the subdirectory the host already applied
    /// (empty when the archive covers the whole repository).
    pub fn read_zip(
        &self,
        rev: &str,
        subdir: &str,
        tmpdir: &Path,
        max_size: u64,
    ) -> anyhow::Result<(PathBuf, String)> {
        match self {
            CodeHost::Github(r) => r.read_zip(rev, tmpdir, max_size),
            CodeHost::Bitbucket(r) => r.read_zip(rev, tmpdir, max_size),
            CodeHost::Gitiles(r) => r.read_zip(rev, subdir, tmpdir, max_size),
            CodeHost::GopkgIn(r) => r.read_zip(rev, tmpdir, max_size),
        }
    }
}

pub fn all_hex(rev: &str) -> bool {
    !rev.is_empty()
        && rev
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn shorten_sha1(rev: &str) -> String {
    if all_hex(rev) && rev.len() == 40 {
        rev[..12].to_string()
    } else {
        rev.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_detection() {
        assert!(all_hex("f488df80bcdb"));
        assert!(!all_hex("F488DF80BCDB"));
        assert!(!all_hex("v1.0.0"));
        assert!(!all_hex(""));
    }

    #[test]
    fn sha_shortening() {
        let full = "f488df80bcdbd3e5f5c14b53c999d3d33ac6d1cc";
        assert_eq!(shorten_sha1(full), "f488df80bcdb");
        assert_eq!(shorten_sha1("master"), "master");
        assert_eq!(shorten_sha1("f488df80"), "f488df80");
    }
}
