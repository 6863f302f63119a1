// Backend for the github.com REST surface: /repos/{owner}/{repo} plus
// tags, refs, commits, contents, and zipball endpoints.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::codehost::{RevInfo, all_hex, shorten_sha1};
use crate::web::Client;

pub struct GithubRepo {
    web: Arc<Client>,
    owner: String,
    repo: String,
    root: String,
}

#[derive(Deserialize)]
struct RepoMeta {
    full_name: String,
}

#[derive(Deserialize)]
struct Commit {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    committer: Signature,
}

#[derive(Deserialize)]
struct Signature {
    date: String,
}

pub fn lookup(web: &Arc<Client>, path: &str) -> anyhow::Result<GithubRepo> {
    let f: Vec<&str> = path.split('/').collect();
    if f.len() < 3 || f[0] != "github.com" {
        bail!("github repo must be github.com/org/project");
    }
    let root = format!("github.com/{}/{}", f[1], f[2]);
    lookup_at(web, &root, f[1], f[2])
}

/// Look up a repository whose module root differs from its hosting
/// location (custom-domain discovery lands here).
pub fn lookup_at(
    web: &Arc<Client>,
    root: &str,
    owner: &str,
    repo: &str,
) -> anyhow::Result<GithubRepo> {
    // Detect moved, renamed, or wrong-case repositories up front;
    // the other API calls would quietly follow the rename.
    let meta: RepoMeta = web.get_json(&format!("{}/repos/{owner}/{repo}", api_base()))?;
    let my_full_name = format!("{owner}/{repo}");
    if my_full_name != meta.full_name {
        let why = if my_full_name.eq_ignore_ascii_case(&meta.full_name) {
            "wrong case"
        } else {
            "moved"
        };
        bail!(
            "module path of repo is github.com/{}, not {root} ({why})",
            meta.full_name
        );
    }
    Ok(GithubRepo {
        web: Arc::clone(web),
        owner: owner.to_string(),
        repo: repo.to_string(),
        root: root.to_string(),
    })
}

fn api_base() -> String {
    "https://api.github.com".to_string()
}

impl GithubRepo {
    pub fn root(&self) -> &str {
        &self.root
    }

    fn api(&self, rest: &str) -> String {
        format!("{}/repos/{}/{}/{rest}", api_base(), self.owner, self.repo)
    }

    pub fn tags(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Tag {
            name: String,
        }
        let mut tags = Vec::new();
        let mut url = self.api("tags");
        loop {
            let (page, links): (Vec<Tag>, _) = self.web.get_json_paged(&url)?;
            for t in page {
                if t.name.starts_with(prefix) {
                    tags.push(t.name);
                }
            }
            let last = url.clone();
            match links.iter().find(|l| l.rel == "next" && l.url != last) {
                Some(next) => url = next.url.clone(),
                None => break,
            }
        }
        Ok(tags)
    }

    pub fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        let mut rev = rev.to_string();
        let mut tag = String::new();
        if !all_hex(&rev) {
            tag = rev.clone();
            rev = self.resolve_ref(&tag)?;
        }
        let commits: Vec<Commit> = self
            .web
            .get_json(&self.api(&format!("commits?sha={rev}&per_page=2")))?;
        let Some(c) = commits.first() else {
            bail!("no commits");
        };
        if !c.sha.starts_with(&rev) {
            bail!("wrong rev returned by server");
        }
        Ok(RevInfo {
            version: tag,
            name: c.sha.clone(),
            short: shorten_sha1(&c.sha),
            time: parse_time(&c.commit.committer.date)?,
        })
    }

    fn resolve_ref(&self, tag: &str) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Ref {
            object: RefObject,
        }
        #[derive(Deserialize)]
        struct RefObject {
            #[serde(rename = "type")]
            kind: String,
            sha: String,
            url: String,
        }
        let mut first_err = None;
        for kind in ["tags", "heads"] {
            let r: Ref = match self.web.get_json(&self.api(&format!("git/refs/{kind}/{tag}"))) {
                Ok(r) => r,
                Err(e) => {
                    first_err.get_or_insert(e);
                    continue;
                }
            };
            match r.object.kind.as_str() {
                "commit" => return Ok(r.object.sha),
                "tag" => {
                    // Annotated tag: one more hop to the commit.
                    #[derive(Deserialize)]
                    struct TagObject {
                        object: Inner,
                    }
                    #[derive(Deserialize)]
                    struct Inner {
                        sha: String,
                        #[serde(rename = "type")]
                        kind: String,
                    }
                    let info: TagObject = self.web.get_json(&r.object.url)?;
                    if info.object.kind != "commit" {
                        bail!(
                            "invalid annotated tag {tag:?}: not a commit ({:?})",
                            info.object.kind
                        );
                    }
                    return Ok(info.object.sha);
                }
                other => bail!("invalid ref {tag:?}: not a commit or tag ({other:?})"),
            }
        }
        match first_err {
            Some(e) => bail!("unknown ref {tag:?} ({e:#})"),
            None => bail!("unknown ref {tag:?}"),
        }
    }

    /// Latest commit no later than `until` on the named branch; the
    /// default branch when branch is empty.
    pub fn latest_at(&self, until: Option<DateTime<Utc>>, branch: &str) -> anyhow::Result<RevInfo> {
        let mut url = self.api(&format!("commits?sha={branch}&per_page=2"));
        if let Some(t) = until {
            url.push_str(&format!("&until={}", t.format("%Y-%m-%dT%H:%M:%SZ")));
        }
        let commits: Vec<Commit> = self.web.get_json(&url)?;
        let Some(c) = commits.first() else {
            bail!("no commits");
        };
        Ok(RevInfo {
            version: String::new(),
            name: c.sha.clone(),
            short: shorten_sha1(&c.sha),
            time: parse_time(&c.commit.committer.date)?,
        })
    }

    pub fn latest(&self) -> anyhow::Result<RevInfo> {
        self.latest_at(None, "")
    }

    pub fn read_file(&self, rev: &str, file: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        #[derive(Deserialize)]
        struct Contents {
            #[serde(rename = "download_url")]
            download_url: Option<String>,
        }
        let meta: Contents = self
            .web
            .get_json(&self.api(&format!("contents/{file}?ref={rev}")))?;
        let url = meta.download_url.context("no download URL")?;
        self.web.get_body(&url, max_size)
    }

    /// Stream the zipball for rev into a temp file. The archive keeps
    /// the service's own top-level directory; the caller strips it.
    pub fn read_zip(
        &self,
        rev: &str,
        tmpdir: &Path,
        max_size: u64,
    ) -> anyhow::Result<(PathBuf, String)> {
        let mut tmp = tempfile::Builder::new()
            .prefix("vmod-github-")
            .suffix(".zip")
            .tempfile_in(tmpdir)?;
        self.web
            .download(&self.api(&format!("zipball/{rev}")), tmp.as_file_mut(), max_size)?;
        tmp.flush()?;
        let (_, path) = tmp.keep().context("keeping downloaded zip")?;
        Ok((path, String::new()))
    }
}

fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("parsing commit time {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_time_parses_as_utc() {
        let t = parse_time("2018-02-14T00:45:20Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2018-02-14T00:45:20+00:00");
    }

    #[test]
    fn commit_payload_decodes() {
        let data = r#"[{"sha":"f488df80bcdbd3e5f5c14b53c999d3d33ac6d1cc",
            "commit":{"committer":{"date":"2018-02-14T00:45:20Z"}}}]"#;
        let commits: Vec<Commit> = serde_json::from_str(data).unwrap();
        assert_eq!(commits[0].sha.len(), 40);
        assert_eq!(commits[0].commit.committer.date, "2018-02-14T00:45:20Z");
    }
}
