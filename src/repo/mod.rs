// Purpose: Repository access layer: one Repo per module path, whatever the backend.
// Inputs/Outputs: Module paths in; version listings, revision metadata, manifests, archives out.
// Invariants: Lookups are memoized per path with single-flight; a failed lookup yields the
//   same error to every caller.
// Gotchas: -getmode and GOPROXY change dispatch globally; decorators wrap every returned repo.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::GetMode;
use crate::par::{Cache, SharedError};
use crate::semver;
use crate::web::Client;

pub mod bitbucket;
pub mod codehost;
pub mod coderepo;
pub mod discovery;
pub mod github;
pub mod gitiles;
pub mod gopkgin;
pub mod proxy;

pub use codehost::RevInfo;
use codehost::CodeHost;
use coderepo::CodeRepo;

/// All versions of one module from one backend.
pub trait Repo: Send + Sync {
    fn module_path(&self) -> &str;

    /// Canonical tagged versions with the given prefix, ascending in
    /// semver order. Pseudo-versions are never listed.
    fn versions(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Metadata for any identifier the backend understands. Non-tag
    /// revisions come back carrying a pseudo-version.
    fn stat(&self, rev: &str) -> anyhow::Result<RevInfo>;

    /// Latest default-branch revision; consulted only when versions()
    /// is empty.
    fn latest(&self) -> anyhow::Result<RevInfo>;

    /// The manifest file for the given version.
    fn manifest(&self, version: &str) -> anyhow::Result<Vec<u8>>;

    /// Download the archive for version into tmpdir, entries all nested
    /// under `<path>@<version>/`, and return the zip's path.
    fn archive(&self, version: &str, tmpdir: &Path) -> anyhow::Result<PathBuf>;
}

pub fn sort_versions(list: &mut Vec<String>) {
    semver::sort(list);
}

/// Repo lookup with per-path memoization. Caches are engine-scoped, not
/// global, so embeddings stay composable.
pub struct Repos {
    web: Arc<Client>,
    getmode: GetMode,
    goproxy: Option<String>,
    cache: Cache<String, Result<Arc<dyn Repo>, SharedError>>,
}

impl Repos {
    pub fn new(web: Arc<Client>, getmode: GetMode, goproxy: Option<String>) -> Self {
        Repos {
            web,
            getmode,
            goproxy,
            cache: Cache::new(),
        }
    }

    pub fn lookup(&self, path: &str) -> anyhow::Result<Arc<dyn Repo>> {
        self.cache
            .do_once(path.to_string(), || {
                lookup_uncached(&self.web, self.getmode, self.goproxy.as_deref(), path)
                    .map(|r| -> Arc<dyn Repo> { Arc::new(CachingRepo::new(LoggingRepo(r))) })
                    .map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }
}

fn lookup_uncached(
    web: &Arc<Client>,
    getmode: GetMode,
    goproxy: Option<&str>,
    path: &str,
) -> anyhow::Result<Box<dyn Repo>> {
    if getmode != GetMode::Normal {
        anyhow::bail!("module lookup disabled by -getmode={}", getmode.as_str());
    }
    if let Some(proxy_url) = goproxy {
        return Ok(Box::new(proxy::lookup(web, proxy_url, path)));
    }
    let host = if path.starts_with("github.com/") {
        CodeHost::Github(github::lookup(web, path)?)
    } else if path.starts_with("bitbucket.org/") {
        CodeHost::Bitbucket(bitbucket::lookup(web, path)?)
    } else if path.starts_with("gopkg.in/") {
        CodeHost::GopkgIn(gopkgin::lookup(web, path)?)
    } else {
        discovery::lookup(web, path)?
    };
    Ok(Box::new(CodeRepo::new(host, path)?))
}

// Debug tracer around a Repo; emits only when the subscriber enables
// debug level.
struct LoggingRepo(Box<dyn Repo>);

impl LoggingRepo {
    fn traced<T>(&self, call: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let start = Instant::now();
        tracing::debug!("+++ repo[{}]: {}", self.0.module_path(), call);
        let out = f();
        tracing::debug!(
            "{:.3}s repo[{}]: {}",
            start.elapsed().as_secs_f64(),
            self.0.module_path(),
            call
        );
        out
    }
}

impl Repo for LoggingRepo {
    fn module_path(&self) -> &str {
        self.0.module_path()
    }

    fn versions(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.traced(&format!("versions({prefix:?})"), || self.0.versions(prefix))
    }

    fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        self.traced(&format!("stat({rev:?})"), || self.0.stat(rev))
    }

    fn latest(&self) -> anyhow::Result<RevInfo> {
        self.traced("latest()", || self.0.latest())
    }

    fn manifest(&self, version: &str) -> anyhow::Result<Vec<u8>> {
        self.traced(&format!("manifest({version:?})"), || {
            self.0.manifest(version)
        })
    }

    fn archive(&self, version: &str, tmpdir: &Path) -> anyhow::Result<PathBuf> {
        self.traced(&format!("archive({version:?})"), || {
            self.0.archive(version, tmpdir)
        })
    }
}

// Memoizes versions, stat, latest, and manifest (not archive), with one
// in-flight call per key; underlying calls are serialized.
struct CachingRepo {
    inner: LoggingRepo,
    mu: Mutex<()>,
    versions: Cache<String, Result<Vec<String>, SharedError>>,
    stat: Cache<String, Result<RevInfo, SharedError>>,
    latest: Cache<u8, Result<RevInfo, SharedError>>,
    manifest: Cache<String, Result<Vec<u8>, SharedError>>,
}

impl CachingRepo {
    fn new(inner: LoggingRepo) -> Self {
        CachingRepo {
            inner,
            mu: Mutex::new(()),
            versions: Cache::new(),
            stat: Cache::new(),
            latest: Cache::new(),
            manifest: Cache::new(),
        }
    }
}

impl Repo for CachingRepo {
    fn module_path(&self) -> &str {
        self.inner.module_path()
    }

    fn versions(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.versions
            .do_once(prefix.to_string(), || {
                let _g = self.mu.lock().unwrap();
                self.inner.versions(prefix).map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        self.stat
            .do_once(rev.to_string(), || {
                let _g = self.mu.lock().unwrap();
                self.inner.stat(rev).map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    fn latest(&self) -> anyhow::Result<RevInfo> {
        self.latest
            .do_once(0, || {
                let _g = self.mu.lock().unwrap();
                self.inner.latest().map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    fn manifest(&self, version: &str) -> anyhow::Result<Vec<u8>> {
        self.manifest
            .do_once(version.to_string(), || {
                let _g = self.mu.lock().unwrap();
                self.inner.manifest(version).map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    fn archive(&self, version: &str, tmpdir: &Path) -> anyhow::Result<PathBuf> {
        let _g = self.mu.lock().unwrap();
        self.inner.archive(version, tmpdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_disabled_by_getmode() {
        let web = Arc::new(Client::new(false).unwrap());
        let repos = Repos::new(web, GetMode::Vendor, None);
        let err = repos.lookup("github.com/o/r").err().unwrap();
        assert!(err.to_string().contains("module lookup disabled by -getmode=vendor"));
    }

    #[test]
    fn failed_lookup_is_shared() {
        let web = Arc::new(Client::new(false).unwrap());
        let repos = Repos::new(web, GetMode::Local, None);
        let a = repos.lookup("github.com/o/r").err().unwrap().to_string();
        let b = repos.lookup("github.com/o/r").err().unwrap().to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn version_sort_is_semver_first() {
        let mut list = vec![
            "v1.10.0".to_string(),
            "v1.2.0".to_string(),
            "v1.2.0-pre".to_string(),
        ];
        sort_versions(&mut list);
        assert_eq!(list, vec!["v1.2.0-pre", "v1.2.0", "v1.10.0"]);
    }
}
