// Purpose: Answer "what does (path, version) require?" for the selection engine.
// Inputs/Outputs: Manifests from the fetch layer (or replacement directories) in;
//   requirement lists, upgrade targets, and version neighbors out.
// Invariants: Results are memoized per module version; concurrent callers share one
//   computation and, on failure, the same error. Exclusion substitution never downgrades.
// Gotchas: Callers must hand in canonical versions; anything else is an upstream bug
//   and panics by contract.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, bail};

use crate::config::UpgradeMode;
use crate::fetch::{Fetcher, query};
use crate::modfile::ModFile;
use crate::module::ModuleVersion;
use crate::mvs::{self, Reqs};
use crate::par::{Cache, SharedError};
use crate::semver;

/// Engine-scoped memo state for the oracle.
#[derive(Default)]
pub struct Oracle {
    required: Cache<ModuleVersion, Result<Vec<ModuleVersion>, SharedError>>,
    versions: Cache<String, Result<Vec<String>, SharedError>>,
}

impl Oracle {
    pub fn new() -> Self {
        Oracle::default()
    }
}

/// One selection run's view of the requirement graph. The target's own
/// requirements come from the current build list when one exists,
/// otherwise from the manifest; `extra` feeds upgrade additions in.
pub struct EngineReqs<'a> {
    pub fetcher: &'a Fetcher,
    pub oracle: &'a Oracle,
    pub modfile: &'a ModFile,
    pub mod_root: &'a Path,
    pub target: &'a ModuleVersion,
    pub excluded: &'a HashSet<ModuleVersion>,
    pub snapshot: Option<Vec<ModuleVersion>>,
    pub extra: Vec<ModuleVersion>,
    pub upgrade_mode: UpgradeMode,
}

impl EngineReqs<'_> {
    fn allowed(&self) -> impl Fn(&ModuleVersion) -> bool + '_ {
        |m| !self.excluded.contains(m)
    }

    fn versions_of(&self, path: &str) -> anyhow::Result<Vec<String>> {
        self.oracle
            .versions
            .do_once(path.to_string(), || {
                self.fetcher
                    .lookup(path)
                    .and_then(|r| r.versions(""))
                    .map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    /// Next version of m.path strictly after m.version, or "none"; the
    /// exclusion policy substitutes through this so it can never move
    /// backwards.
    fn next(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
        let list = self.versions_of(&m.path)?;
        for v in &list {
            if semver::compare(v, &m.version) == Ordering::Greater {
                return Ok(ModuleVersion::new(&m.path, v));
            }
        }
        Ok(ModuleVersion::new(&m.path, mvs::NONE))
    }

    // Replace excluded entries by the next greater available version.
    fn apply_exclusions(
        &self,
        of: &ModuleVersion,
        mut list: Vec<ModuleVersion>,
    ) -> anyhow::Result<Vec<ModuleVersion>> {
        for mv in &mut list {
            while self.excluded.contains(mv) {
                let next = self.next(mv)?;
                if next.version == mvs::NONE {
                    bail!(
                        "{}({}) depends on excluded {}({}) with no newer version available",
                        of.path,
                        of.version,
                        mv.path,
                        mv.version
                    );
                }
                *mv = next;
            }
        }
        Ok(list)
    }

    fn required_raw(&self, m: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>> {
        self.oracle
            .required
            .do_once(m.clone(), || {
                self.compute_required(m).map_err(SharedError::new)
            })
            .map_err(anyhow::Error::new)
    }

    fn compute_required(&self, m: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>> {
        let orig_path = &m.path;
        let mut m = m.clone();
        if let Some(repl) = self.modfile.replacement(&m) {
            if repl.new.version.is_empty() {
                // Filesystem replacement: its manifest is the truth.
                let dir = if Path::new(&repl.new.path).is_absolute() {
                    Path::new(&repl.new.path).to_path_buf()
                } else {
                    self.mod_root.join(&repl.new.path)
                };
                let f = ModFile::parse_file(&dir.join("go.mod"))?;
                return Ok(f.require.into_iter().map(|r| r.mv).collect());
            }
            m = repl.new.clone();
        }

        if m.version == mvs::NONE {
            return Ok(Vec::new());
        }
        if !semver::is_valid(&m.version) {
            // The query layer canonicalizes everything first; reaching
            // this point is a bug in the caller.
            panic!("invalid semantic version {:?} for {}", m.version, m.path);
        }

        let data = self.fetcher.manifest(&m.path, &m.version)?;
        let text = String::from_utf8(data)
            .with_context(|| format!("manifest for {} {} is not UTF-8", m.path, m.version))?;
        let f = ModFile::parse("go.mod", &text)
            .with_context(|| format!("parsing manifest for {} {}", m.path, m.version))?;
        if !f.module.is_empty() && f.module != *orig_path && f.module != m.path {
            bail!("downloaded {:?} and got module {:?}", m.path, f.module);
        }
        Ok(f.require.into_iter().map(|r| r.mv).collect())
    }
}

impl Reqs for EngineReqs<'_> {
    fn required(&self, m: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>> {
        let list = if m.path == self.target.path {
            let mut list = match &self.snapshot {
                Some(tail) => tail.clone(),
                None => self.modfile.require.iter().map(|r| r.mv.clone()).collect(),
            };
            list.extend(self.extra.iter().cloned());
            list
        } else {
            self.required_raw(m)?
        };
        self.apply_exclusions(m, list)
    }

    fn max(&self, v1: &str, v2: &str) -> String {
        // "none" and the target's empty version are invalid semver and
        // lose against any valid version.
        if semver::compare(v1, v2) == Ordering::Less {
            v2.to_string()
        } else {
            v1.to_string()
        }
    }

    fn upgrade(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
        // Replaced modules are pinned by the root manifest.
        if self.modfile.replacement(m).is_some() {
            return Ok(m.clone());
        }
        let allowed = self.allowed();
        let candidate = match self.upgrade_mode {
            UpgradeMode::Off => return Ok(m.clone()),
            UpgradeMode::Latest => {
                eprintln!("vmod: finding {} latest", m.path);
                query::query(self.fetcher, &m.path, "latest", &allowed)?.version
            }
            UpgradeMode::Patch => {
                let base = semver::canonical(&m.version);
                let prefix = match base.rfind('.') {
                    Some(i) => format!("{}.", &base[..i]),
                    None => return Ok(m.clone()),
                };
                let mut best = String::new();
                for v in self.versions_of(&m.path)? {
                    if v.starts_with(&prefix)
                        && semver::prerelease(&v).is_empty()
                        && allowed(&ModuleVersion::new(&m.path, &v))
                    {
                        best = v;
                    }
                }
                if best.is_empty() {
                    return Ok(m.clone());
                }
                best
            }
        };
        // Chronologically newer pseudo-versions beat the latest tag;
        // an upgrade must never move backwards.
        if semver::compare(&m.version, &candidate) == Ordering::Less {
            Ok(ModuleVersion::new(&m.path, candidate))
        } else {
            Ok(m.clone())
        }
    }

    fn previous(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
        let list = self.versions_of(&m.path)?;
        for v in list.iter().rev() {
            if semver::compare(v, &m.version) == Ordering::Less {
                return Ok(ModuleVersion::new(&m.path, v));
            }
        }
        Ok(ModuleVersion::new(&m.path, mvs::NONE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GetMode};
    use crate::fetch::checksum::Ledger;
    use crate::web::Client;
    use std::sync::Arc;

    struct Fixture {
        fetcher: Fetcher,
        oracle: Oracle,
        modfile: ModFile,
        mod_root: std::path::PathBuf,
        target: ModuleVersion,
        excluded: HashSet<ModuleVersion>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(published: &[&str]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            gopath: tmp.path().to_path_buf(),
            goroot: None,
            goproxy: None,
            getmode: GetMode::Normal,
            upgrade: UpgradeMode::Off,
            insecure: false,
            tags: Vec::new(),
            modules_only: false,
            workers: 2,
        };
        let web = Arc::new(Client::new(false).unwrap());
        let ledger = Ledger::load(&tmp.path().join("go.sum")).unwrap();
        let fetcher = Fetcher::new(cfg, web, ledger);

        let oracle = Oracle::new();
        let _ = oracle.versions.do_once("example.com/lib".to_string(), || {
            Ok(published.iter().map(|v| v.to_string()).collect())
        });

        let mut modfile = ModFile::new();
        modfile.add_module("example.com/root");
        modfile.add_require("example.com/lib", "v1.6.1");

        let mut excluded = HashSet::new();
        excluded.insert(ModuleVersion::new("example.com/lib", "v1.6.1"));

        Fixture {
            fetcher,
            oracle,
            modfile,
            mod_root: tmp.path().to_path_buf(),
            target: ModuleVersion::new("example.com/root", ""),
            excluded,
            _tmp: tmp,
        }
    }

    fn reqs(fx: &Fixture) -> EngineReqs<'_> {
        EngineReqs {
            fetcher: &fx.fetcher,
            oracle: &fx.oracle,
            modfile: &fx.modfile,
            mod_root: &fx.mod_root,
            target: &fx.target,
            excluded: &fx.excluded,
            snapshot: None,
            extra: Vec::new(),
            upgrade_mode: UpgradeMode::Off,
        }
    }

    // Excluding a required version substitutes the next greater
    // published version, never an older one.
    #[test]
    fn exclusion_forces_the_next_version_up() {
        let fx = fixture(&["v1.6.0", "v1.6.1", "v1.6.2"]);
        let r = reqs(&fx);
        let list = r.required(&fx.target).unwrap();
        assert_eq!(
            list,
            vec![ModuleVersion::new("example.com/lib", "v1.6.2")]
        );
    }

    #[test]
    fn exclusion_of_newest_version_fails() {
        let fx = fixture(&["v1.6.0", "v1.6.1"]);
        let r = reqs(&fx);
        let err = r.required(&fx.target).unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("depends on excluded example.com/lib(v1.6.1) with no newer version available"),
            "got: {text}"
        );
    }

    #[test]
    fn previous_and_next_walk_the_version_list() {
        let fx = fixture(&["v1.6.0", "v1.6.1", "v1.6.2"]);
        let r = reqs(&fx);
        let lib = |v: &str| ModuleVersion::new("example.com/lib", v);
        assert_eq!(r.previous(&lib("v1.6.1")).unwrap(), lib("v1.6.0"));
        assert_eq!(r.previous(&lib("v1.6.0")).unwrap(), lib(mvs::NONE));
        assert_eq!(r.next(&lib("v1.6.1")).unwrap(), lib("v1.6.2"));
        assert_eq!(r.next(&lib("v1.6.2")).unwrap(), lib(mvs::NONE));
    }

    // The manifest parse layer canonicalizes; a raw revision reaching
    // the oracle is a caller bug by contract.
    #[test]
    #[should_panic(expected = "invalid semantic version")]
    fn non_canonical_version_panics() {
        let fx = fixture(&[]);
        let r = reqs(&fx);
        let _ = r.required_raw(&ModuleVersion::new("example.com/lib", "master"));
    }
}
