// Backend for the bitbucket.org 2.0 REST surface.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::codehost::{RevInfo, all_hex, shorten_sha1};
use crate::web::Client;

pub struct BitbucketRepo {
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
struct CommitPage {
    values: Vec<Commit>,
}

#[derive(Deserialize)]
struct Commit {
    hash: String,
    date: String,
}

#[derive(Deserialize)]
struct RefMeta {
    target: Commit,
}

pub fn lookup(web: &Arc<Client>, path: &str) -> anyhow::Result<BitbucketRepo> {
    let f: Vec<&str> = path.split('/').collect();
    if f.len() < 3 || f[0] != "bitbucket.org" {
        bail!("bitbucket repo must be bitbucket.org/org/project");
    }
    let meta: RepoMeta = web.get_json(&format!(
        "https://api.bitbucket.org/2.0/repositories/{}/{}",
        f[1], f[2]
    ))?;
    let my_full_name = format!("{}/{}", f[1], f[2]);
    if my_full_name != meta.full_name {
        let why = if my_full_name.eq_ignore_ascii_case(&meta.full_name) {
            "wrong case"
        } else {
            "moved"
        };
        bail!(
            "module path of repo is bitbucket.org/{}, not {path} ({why})",
            meta.full_name
        );
    }
    Ok(BitbucketRepo {
        web: Arc::clone(web),
        owner: f[1].to_string(),
        repo: f[2].to_string(),
        root: format!("bitbucket.org/{}/{}", f[1], f[2]),
    })
}

impl BitbucketRepo {
    pub fn root(&self) -> &str {
        &self.root
    }

    fn api(&self, rest: &str) -> String {
        format!(
            "https://api.bitbucket.org/2.0/repositories/{}/{}/{rest}",
            self.owner, self.repo
        )
    }

    pub fn tags(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagPage {
            values: Vec<Tag>,
            next: Option<String>,
        }
        #[derive(Deserialize)]
        struct Tag {
            name: String,
        }
        let mut tags = Vec::new();
        let mut url = self.api("refs/tags?pagelen=100");
        loop {
            let page: TagPage = self.web.get_json(&url)?;
            for t in page.values {
                if t.name.starts_with(prefix) {
                    tags.push(t.name);
                }
            }
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(tags)
    }

    pub fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        if all_hex(rev) {
            let c: Commit = self.web.get_json(&self.api(&format!("commit/{rev}")))?;
            return rev_info(&c, "");
        }
        let mut first_err = None;
        for kind in ["tags", "branches"] {
            match self
                .web
                .get_json::<RefMeta>(&self.api(&format!("refs/{kind}/{rev}")))
            {
                Ok(r) => {
                    let tag = if kind == "tags" { rev } else { "" };
                    return rev_info(&r.target, tag);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        bail!("unknown ref {rev:?} ({:#})", first_err.unwrap())
    }

    pub fn latest(&self) -> anyhow::Result<RevInfo> {
        let page: CommitPage = self.web.get_json(&self.api("commits?pagelen=2"))?;
        let Some(c) = page.values.first() else {
            bail!("no commits");
        };
        rev_info(c, "")
    }

    pub fn read_file(&self, rev: &str, file: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        self.web
            .get_body(&self.api(&format!("src/{rev}/{file}")), max_size)
    }

    pub fn read_zip(
        &self,
        rev: &str,
        tmpdir: &Path,
        max_size: u64,
    ) -> anyhow::Result<(PathBuf, String)> {
        let url = format!(
            "https://bitbucket.org/{}/{}/get/{rev}.zip",
            self.owner, self.repo
        );
        let mut tmp = tempfile::Builder::new()
            .prefix("vmod-bitbucket-")
            .suffix(".zip")
            .tempfile_in(tmpdir)?;
        self.web.download(&url, tmp.as_file_mut(), max_size)?;
        tmp.flush()?;
        let (_, path) = tmp.keep().context("keeping downloaded zip")?;
        Ok((path, String::new()))
    }
}

fn rev_info(c: &Commit, tag: &str) -> anyhow::Result<RevInfo> {
    let time = DateTime::parse_from_rfc3339(&c.date)
        .with_context(|| format!("parsing commit time {:?}", c.date))?
        .with_timezone(&Utc);
    Ok(RevInfo {
        version: tag.to_string(),
        name: c.hash.clone(),
        short: shorten_sha1(&c.hash),
        time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_payload_decodes_with_offset_time() {
        let data = r#"{"hash":"b4d366e9a5eaf7e1a3063fdae7642b7d3a7e2b5f",
            "date":"2018-02-14T00:45:20+00:00"}"#;
        let c: Commit = serde_json::from_str(data).unwrap();
        let info = rev_info(&c, "v1.0.0").unwrap();
        assert_eq!(info.short, "b4d366e9a5ea");
        assert_eq!(info.version, "v1.0.0");
        assert_eq!(info.time.to_rfc3339(), "2018-02-14T00:45:20+00:00");
    }
}
