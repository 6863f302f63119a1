// Backend for gopkg.in/{user}/{pkg}.{vN} paths: requests are served by
// the corresponding github repository, with tags on the vN line
// surfaced in a translated v1 namespace (vN.x.y <-> v1.x.y-gopkgin-vN.x.y)
// so selection stays inside one major line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};

use super::codehost::RevInfo;
use super::github::{self, GithubRepo};
use crate::module::pseudo_version;
use crate::semver;
use crate::web::Client;

pub struct GopkgInRepo {
    gh: GithubRepo,
    root: String,
    major: String,
}

/// Split a gopkg.in path into (root, github repo, major, subdir).
pub fn parse_gopkg_in(path: &str) -> Option<(String, String, String, String)> {
    if !path.starts_with("gopkg.in/") {
        return None;
    }
    let f: Vec<&str> = path.split('/').collect();
    if f.len() >= 2
        && let Some((elem, v)) = dot_v(f[1])
    {
        return Some((
            f[..2].join("/"),
            format!("github.com/go-{elem}/{elem}"),
            v,
            f[2..].join("/"),
        ));
    }
    if f.len() >= 3
        && let Some((elem, v)) = dot_v(f[2])
    {
        return Some((
            f[..3].join("/"),
            format!("github.com/{}/{elem}", f[1]),
            v,
            f[3..].join("/"),
        ));
    }
    None
}

// Split "name.vN" into (name, vN).
fn dot_v(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = name.len();
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    // Need "<elem>.v<digits>" with elem non-empty and no leading zero
    // (except the bare "v0").
    if i < 3 || i >= name.len() || bytes[i - 2] != b'.' || bytes[i - 1] != b'v' {
        return None;
    }
    if bytes[i] == b'0' && name.len() != i + 1 {
        return None;
    }
    Some((name[..i - 2].to_string(), name[i - 1..].to_string()))
}

pub fn lookup(web: &Arc<Client>, path: &str) -> anyhow::Result<GopkgInRepo> {
    let Some((root, repo, major, _subdir)) = parse_gopkg_in(path) else {
        bail!("invalid gopkg.in/ path: {path:?}");
    };
    let gh = github::lookup(web, &repo)?;
    Ok(GopkgInRepo { gh, root, major })
}

/// Surface a native vN tag in the translated v1 namespace.
pub fn convert_tag(major: &str, tag: &str) -> Option<String> {
    let p = format!("{major}.");
    if !tag.starts_with(&p) || !semver::is_valid(tag) {
        return None;
    }
    Some(format!("v1{}-gopkgin-{tag}", &tag[major.len()..]))
}

/// Recover the native tag from a translated version, if it is one.
fn unconvert(major: &str, rev: &str) -> anyhow::Result<String> {
    let Some(i) = rev.find("-gopkgin-") else {
        return Ok(rev.to_string());
    };
    let (fake, real) = (&rev[..i], &rev[i + "-gopkgin-".len()..]);
    if real.starts_with(&format!("{major}.")) && fake == format!("v1{}", &real[major.len()..]) {
        return Ok(real.to_string());
    }
    bail!("malformed gopkgin tag {rev:?}")
}

impl GopkgInRepo {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tags(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let list = self.gh.tags(&format!("{}.", self.major))?;
        Ok(list
            .iter()
            .filter_map(|t| convert_tag(&self.major, t))
            .filter(|t| t.starts_with(prefix))
            .collect())
    }

    pub fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        let gh_rev = unconvert(&self.major, rev)?;
        self.gh.stat(&gh_rev).map(|info| self.convert(info))
    }

    pub fn latest(&self) -> anyhow::Result<RevInfo> {
        // The vN branch carries the line's tip; v0 lives on master.
        let branch = if self.major == "v0" {
            "master"
        } else {
            &self.major
        };
        self.gh.stat(branch).map(|info| self.convert(info))
    }

    pub fn read_file(&self, rev: &str, file: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        let gh_rev = unconvert(&self.major, rev)?;
        self.gh.read_file(&gh_rev, file, max_size)
    }

    pub fn read_zip(
        &self,
        rev: &str,
        tmpdir: &Path,
        max_size: u64,
    ) -> anyhow::Result<(PathBuf, String)> {
        let gh_rev = unconvert(&self.major, rev).context("resolving gopkg.in revision")?;
        self.gh.read_zip(&gh_rev, tmpdir, max_size)
    }

    fn convert(&self, mut info: RevInfo) -> RevInfo {
        if !semver::is_valid(&info.version) {
            return info;
        }
        match convert_tag(&self.major, &info.version) {
            Some(v) => info.version = v,
            None => info.version = pseudo_version("v0", info.time, &info.short),
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_forms() {
        let (root, repo, major, subdir) = parse_gopkg_in("gopkg.in/yaml.v2").unwrap();
        assert_eq!(root, "gopkg.in/yaml.v2");
        assert_eq!(repo, "github.com/go-yaml/yaml");
        assert_eq!(major, "v2");
        assert_eq!(subdir, "");

        let (root, repo, major, subdir) =
            parse_gopkg_in("gopkg.in/user/pkg.v3/sub/dir").unwrap();
        assert_eq!(root, "gopkg.in/user/pkg.v3");
        assert_eq!(repo, "github.com/user/pkg");
        assert_eq!(major, "v3");
        assert_eq!(subdir, "sub/dir");

        assert!(parse_gopkg_in("gopkg.in/noversion").is_none());
        assert!(parse_gopkg_in("example.com/yaml.v2").is_none());
    }

    #[test]
    fn tag_namespace_translation() {
        assert_eq!(
            convert_tag("v2", "v2.1.0").as_deref(),
            Some("v1.1.0-gopkgin-v2.1.0")
        );
        assert_eq!(convert_tag("v2", "v3.0.0"), None);
        assert_eq!(convert_tag("v2", "v2.junk"), None);
    }

    #[test]
    fn tag_translation_round_trips() {
        let translated = convert_tag("v2", "v2.1.0").unwrap();
        assert_eq!(unconvert("v2", &translated).unwrap(), "v2.1.0");
        assert_eq!(unconvert("v2", "deadbeef").unwrap(), "deadbeef");
        assert!(unconvert("v2", "v1.1.0-gopkgin-v3.1.0").is_err());
    }
}
