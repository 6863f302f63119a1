// GOPROXY backend: a dumb file-server protocol under
// <proxy>/<module>/@v/ with list, <version>.info, <version>.mod, and
// <version>.zip. When a proxy is configured it replaces code-host
// dispatch entirely.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use super::codehost::{MAX_GO_MOD, MAX_ZIP_FILE, RevInfo};
use super::{Repo, sort_versions};
use crate::semver;
use crate::web::Client;

pub struct ProxyRepo {
    web: Arc<Client>,
    path: String,
    base: String,
}

pub fn lookup(web: &Arc<Client>, proxy_url: &str, path: &str) -> ProxyRepo {
    ProxyRepo {
        web: Arc::clone(web),
        path: path.to_string(),
        base: format!("{}/{}", proxy_url.trim_end_matches('/'), path),
    }
}

impl Repo for ProxyRepo {
    fn module_path(&self) -> &str {
        &self.path
    }

    fn versions(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let body = self
            .web
            .get_text(&format!("{}/@v/list", self.base), MAX_GO_MOD)?;
        let mut list: Vec<String> = body
            .lines()
            .map(str::trim)
            .filter(|v| v.starts_with(prefix) && semver::is_valid(v))
            .map(str::to_string)
            .collect();
        sort_versions(&mut list);
        Ok(list)
    }

    fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        self.web
            .get_json(&format!("{}/@v/{rev}.info", self.base))
            .with_context(|| format!("proxy stat {}@{rev}", self.path))
    }

    fn latest(&self) -> anyhow::Result<RevInfo> {
        self.web
            .get_json(&format!("{}/@v/latest", self.base))
            .with_context(|| format!("proxy latest {}", self.path))
    }

    fn manifest(&self, version: &str) -> anyhow::Result<Vec<u8>> {
        self.web
            .get_body(&format!("{}/@v/{version}.mod", self.base), MAX_GO_MOD)
    }

    fn archive(&self, version: &str, tmpdir: &Path) -> anyhow::Result<PathBuf> {
        let mut tmp = tempfile::Builder::new()
            .prefix("vmod-proxy-")
            .suffix(".zip")
            .tempfile_in(tmpdir)?;
        self.web.download(
            &format!("{}/@v/{version}.zip", self.base),
            tmp.as_file_mut(),
            MAX_ZIP_FILE,
        )?;
        tmp.flush()?;
        let (_, path) = tmp.keep().context("keeping downloaded zip")?;
        Ok(path)
    }
}
