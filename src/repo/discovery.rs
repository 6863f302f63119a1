// Custom-domain resolution: an HTTP probe with ?go-get=1 returns HTML
// whose <meta name="go-import"> tags name the module prefix, the vcs,
// and the backing repository URL. The backing URL is mapped onto one of
// the built-in hosts, keeping the custom prefix as the module root.

use std::sync::Arc;

use anyhow::{Context, bail};
use regex::Regex;

use super::codehost::{CodeHost, MAX_LICENSE};
use super::{github, gitiles};
use crate::web::Client;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaImport {
    pub prefix: String,
    pub vcs: String,
    pub repo_url: String,
}

pub fn lookup(web: &Arc<Client>, path: &str) -> anyhow::Result<CodeHost> {
    // Gitiles hosts answer directly; no discovery page needed.
    if path
        .split('/')
        .next()
        .is_some_and(|host| host.ends_with(".googlesource.com"))
    {
        return Ok(CodeHost::Gitiles(gitiles::lookup(web, path)?));
    }

    let url = format!("https://{path}?go-get=1");
    let body = web
        .get_text(&url, MAX_LICENSE)
        .with_context(|| format!("unrecognized import path {path:?}"))?;
    let imports = parse_meta_go_imports(&body);
    let found = imports
        .iter()
        .find(|m| path == m.prefix || path.starts_with(&format!("{}/", m.prefix)));
    let Some(meta) = found else {
        bail!("unrecognized import path {path:?} (no matching go-import meta tag)");
    };
    host_for_meta(web, meta)
}

fn host_for_meta(web: &Arc<Client>, meta: &MetaImport) -> anyhow::Result<CodeHost> {
    if meta.vcs != "git" && meta.vcs != "mod" {
        bail!(
            "unsupported version control system {:?} for {:?}",
            meta.vcs,
            meta.prefix
        );
    }
    let stripped = meta
        .repo_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches(".git");
    let f: Vec<&str> = stripped.split('/').collect();
    match f.first().copied() {
        Some("github.com") if f.len() >= 3 => Ok(CodeHost::Github(github::lookup_at(
            web,
            &meta.prefix,
            f[1],
            f[2],
        )?)),
        Some(host) if host.ends_with(".googlesource.com") => Ok(CodeHost::Gitiles(
            gitiles::lookup_at(web, &meta.prefix, &format!("https://{stripped}")),
        )),
        _ => bail!(
            "unsupported code host {:?} for {:?}",
            meta.repo_url,
            meta.prefix
        ),
    }
}

pub fn parse_meta_go_imports(html: &str) -> Vec<MetaImport> {
    let re = Regex::new(
        r#"(?is)<meta\s+name="go-import"\s+content="([^"]+)"\s*/?>"#,
    )
    .unwrap();
    let mut out = Vec::new();
    for cap in re.captures_iter(html) {
        let f: Vec<&str> = cap[1].split_whitespace().collect();
        if f.len() == 3 {
            out.push(MetaImport {
                prefix: f[0].to_string(),
                vcs: f[1].to_string(),
                repo_url: f[2].to_string(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_tags_parse() {
        let html = r#"<html><head>
            <meta name="go-import" content="rsc.io/quote git https://github.com/rsc/quote">
            <meta name="go-import" content="bad tag">
            <meta name="go-source" content="irrelevant">
            </head></html>"#;
        let got = parse_meta_go_imports(html);
        assert_eq!(
            got,
            vec![MetaImport {
                prefix: "rsc.io/quote".to_string(),
                vcs: "git".to_string(),
                repo_url: "https://github.com/rsc/quote".to_string(),
            }]
        );
    }

    #[test]
    fn self_closing_meta_parses() {
        let html = r#"<meta name="go-import" content="x.example/m git https://github.com/o/r" />"#;
        assert_eq!(parse_meta_go_imports(html).len(), 1);
    }
}
