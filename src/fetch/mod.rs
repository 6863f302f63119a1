// Purpose: Materialize module versions into the on-disk cache and verify every artifact.
// Inputs/Outputs: (path, version) pairs in; extracted read-only trees, zips, .info/.mod/.ziphash
//   files under <gopath>/src/mod out.
// Invariants: An extracted tree exists only alongside a matching ziphash; partial artifacts
//   are removed on failure; the ledger gates every install.
// Gotchas: Two workers may race on one module; the loser of the final rename must clean up
//   and accept the winner's tree.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, bail};
use fs2::FileExt;

use crate::config::Config;
use crate::dirhash;
use crate::modconv;
use crate::module::ModuleVersion;
use crate::repo::{Repo, Repos, RevInfo};
use crate::web::Client;

pub mod checksum;
pub mod query;

use checksum::Ledger;

pub struct Fetcher {
    cfg: Config,
    repos: Repos,
    ledger: Mutex<Ledger>,
}

impl Fetcher {
    pub fn new(cfg: Config, web: Arc<Client>, ledger: Ledger) -> Self {
        let repos = Repos::new(web, cfg.getmode, cfg.goproxy.clone());
        Fetcher {
            cfg,
            repos,
            ledger: Mutex::new(ledger),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn lookup(&self, path: &str) -> anyhow::Result<Arc<dyn Repo>> {
        self.repos.lookup(path)
    }

    pub fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }

    fn at_v(&self, path: &str) -> PathBuf {
        self.cfg.download_dir().join(path).join("@v")
    }

    pub fn info_file(&self, path: &str, version: &str) -> PathBuf {
        self.at_v(path).join(format!("{version}.info"))
    }

    fn mod_file(&self, path: &str, version: &str) -> PathBuf {
        self.at_v(path).join(format!("{version}.mod"))
    }

    fn zip_file(&self, path: &str, version: &str) -> PathBuf {
        self.at_v(path).join(format!("{version}.zip"))
    }

    /// Revision metadata, preferring the on-disk .info fast path over
    /// the network.
    pub fn stat(&self, path: &str, rev: &str) -> anyhow::Result<RevInfo> {
        if let Some(info) = self.stat_local(path, rev) {
            return Ok(info);
        }
        self.lookup(path)?.stat(rev)
    }

    pub fn stat_local(&self, path: &str, rev: &str) -> Option<RevInfo> {
        let data = fs::read(self.info_file(path, rev)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Download and extract one module version, returning the root of
    /// its source tree in the cache.
    pub fn download(&self, mv: &ModuleVersion) -> anyhow::Result<PathBuf> {
        let modpath = format!("{}@{}", mv.path, mv.version);
        let dir = self.cfg.src_mod().join(&modpath);
        let populated = fs::read_dir(&dir)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        if !populated {
            let zipfile = self.zip_file(&mv.path, &mv.version);
            if zipfile.exists() {
                // Preinitialized download cache, or the tree was pruned
                // without it.
                eprintln!("vmod: extracting {} {}", mv.path, mv.version);
            } else {
                fs::create_dir_all(self.at_v(&mv.path))?;
                eprintln!("vmod: downloading {} {}", mv.path, mv.version);
                self.download_zip(mv, &zipfile)?;
            }
            if let Err(e) = unzip(&dir, &zipfile, &modpath) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        self.check_zip_ledger(mv)?;
        Ok(dir)
    }

    fn download_zip(&self, mv: &ModuleVersion, target: &Path) -> anyhow::Result<()> {
        let repo = self.lookup(&mv.path)?;
        let tmpdir = target.parent().context("zip target has no parent")?;
        let tmpfile = repo.archive(&mv.version, tmpdir)?;
        let result = self.install_zip(mv, &tmpfile, target);
        let _ = fs::remove_file(&tmpfile);
        if result.is_err() {
            let _ = fs::remove_file(target);
        }
        result
    }

    fn install_zip(&self, mv: &ModuleVersion, tmpfile: &Path, target: &Path) -> anyhow::Result<()> {
        // Double-check the archive before it reaches the cache: every
        // entry must live under the canonical prefix.
        let prefix = format!("{}@{}", mv.path, mv.version);
        let f = File::open(tmpfile)?;
        let mut z = zip::ZipArchive::new(f).context("reading downloaded archive")?;
        for i in 0..z.len() {
            let name = z.by_index(i)?.name().to_string();
            if !name.starts_with(&prefix) {
                bail!("zip for {prefix} has unexpected file {name}");
            }
        }
        drop(z);

        let hash = dirhash::hash_zip(tmpfile)?;
        // Consult the ledger before installing anything.
        self.ledger().check(mv, &hash)?;

        if fs::rename(tmpfile, target).is_err() {
            fs::copy(tmpfile, target).with_context(|| format!("copying to {}", target.display()))?;
        }
        let mut hash_file = target.as_os_str().to_os_string();
        hash_file.push("hash");
        fs::write(PathBuf::from(hash_file), &hash)?;
        Ok(())
    }

    // The extracted tree is trusted only together with its ziphash.
    fn check_zip_ledger(&self, mv: &ModuleVersion) -> anyhow::Result<()> {
        let mut ledger = self.ledger();
        if !ledger.enabled() {
            return Ok(());
        }
        let mut hash_file = self.zip_file(&mv.path, &mv.version).into_os_string();
        hash_file.push("hash");
        let data = fs::read_to_string(PathBuf::from(hash_file))
            .with_context(|| format!("verifying {mv}"))?;
        let h = data.trim();
        if !h.starts_with("h1:") {
            bail!("verifying {mv}: unexpected ziphash: {h:?}");
        }
        ledger.check(mv, h)
    }

    /// Fetch a module manifest, independently of the archive: the
    /// selection traversal usually needs nothing else. Results are
    /// cached as `<version>.mod` plus a `<version>.info` metadata blob
    /// and are always checked against the ledger.
    pub fn manifest(&self, path: &str, version: &str) -> anyhow::Result<Vec<u8>> {
        if let Some(data) = self.cached_manifest(path, version) {
            self.ledger().check_manifest(path, version, &data)?;
            return Ok(data);
        }
        eprintln!("vmod: finding {path} {version}");
        let repo = self.lookup(path)?;
        let info = repo.stat(version)?;
        let data = repo.manifest(&info.version)?;
        self.ledger().check_manifest(path, version, &data)?;

        fs::create_dir_all(self.at_v(path))?;
        let js = serde_json::to_vec(&info).context("encoding revision info")?;
        fs::write(self.info_file(path, version), js).context("caching info")?;
        fs::write(self.mod_file(path, version), &data).context("caching go.mod")?;
        Ok(data)
    }

    fn cached_manifest(&self, path: &str, version: &str) -> Option<Vec<u8>> {
        let data = fs::read(self.mod_file(path, version)).ok()?;
        // A manifest translated from a legacy lock file by a different
        // converter version may embed fixed bugs; refetch it.
        if data.starts_with(b"//vmod") && !data.starts_with(modconv::PREFIX.as_bytes()) {
            return None;
        }
        Some(data)
    }

    /// Advisory lock over the whole cache, held across download phases.
    pub fn lock_cache(&self) -> anyhow::Result<CacheLock> {
        CacheLock::acquire(&self.cfg.src_mod())
    }
}

pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    /// Block until the advisory lock on `<root>/cache.lock` is held,
    /// creating the file if absent. Released on drop.
    pub fn acquire(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)?;
        let lock_path = root.join("cache.lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        f.lock_exclusive()?;
        Ok(Self { _file: f })
    }
}

/// Extract zipfile into dir, stripping the required `<prefix>/` from
/// every entry and installing files read-only. Extraction goes through
/// a sibling temp directory and an atomic rename so concurrent workers
/// cannot observe a partial tree; losing the rename race is not an
/// error.
pub fn unzip(dir: &Path, zipfile: &Path, prefix: &str) -> anyhow::Result<()> {
    let parent = dir.parent().context("cache dir has no parent")?;
    fs::create_dir_all(parent)?;
    let tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempdir_in(parent)?;

    let f = File::open(zipfile).with_context(|| format!("open {}", zipfile.display()))?;
    let mut z = zip::ZipArchive::new(f).with_context(|| format!("reading {}", zipfile.display()))?;
    for i in 0..z.len() {
        let mut entry = z.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some(rel) = name.strip_prefix(&format!("{prefix}/")) else {
            bail!("zip for {prefix} has unexpected file {name}");
        };
        if rel.is_empty() || rel.split('/').any(|c| c.is_empty() || c == "..") {
            bail!("zip for {prefix} has invalid file name {name}");
        }
        let dst = tmp.path().join(rel);
        if let Some(p) = dst.parent() {
            fs::create_dir_all(p)?;
        }
        let mut out = File::create(&dst).with_context(|| format!("create {}", dst.display()))?;
        std::io::copy(&mut entry, &mut out)?;
        drop(out);
        let mut perm = fs::metadata(&dst)?.permissions();
        perm.set_readonly(true);
        fs::set_permissions(&dst, perm)?;
    }

    let tmp = tmp.keep();
    match fs::rename(&tmp, dir) {
        Ok(()) => Ok(()),
        Err(_) if dir.exists() => {
            // Another worker won the race; its tree is equivalent.
            remove_tree(&tmp);
            Ok(())
        }
        Err(e) => {
            remove_tree(&tmp);
            Err(e).with_context(|| format!("installing {}", dir.display()))
        }
    }
}

// remove_dir_all refuses read-only entries on some platforms; restore
// write bits first.
fn remove_tree(dir: &Path) {
    fn make_writable(dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for ent in entries.flatten() {
            let p = ent.path();
            if p.is_dir() {
                make_writable(&p);
            } else if let Ok(meta) = fs::metadata(&p) {
                let mut perm = meta.permissions();
                #[allow(clippy::permissions_set_readonly_false)]
                perm.set_readonly(false);
                let _ = fs::set_permissions(&p, perm);
            }
        }
    }
    make_writable(dir);
    let _ = fs::remove_dir_all(dir);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_module_zip(dir: &Path, prefix: &str) -> PathBuf {
        let path = dir.join("m.zip");
        let mut zw = zip::ZipWriter::new(File::create(&path).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        zw.start_file(format!("{prefix}/go.mod"), opts).unwrap();
        zw.write_all(b"module example.com/m\n").unwrap();
        zw.start_file(format!("{prefix}/a/a.go"), opts).unwrap();
        zw.write_all(b"package a\n").unwrap();
        zw.finish().unwrap();
        path
    }

    #[test]
    fn unzip_strips_prefix_and_installs_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = "example.com/m@v1.0.0";
        let zipfile = make_module_zip(tmp.path(), prefix);
        let dir = tmp.path().join("out").join(prefix);
        unzip(&dir, &zipfile, prefix).unwrap();
        assert!(dir.join("go.mod").exists());
        assert!(dir.join("a/a.go").exists());
        assert!(
            fs::metadata(dir.join("go.mod"))
                .unwrap()
                .permissions()
                .readonly()
        );
    }

    #[test]
    fn unzip_rejects_foreign_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let zipfile = make_module_zip(tmp.path(), "example.com/other@v1.0.0");
        let dir = tmp.path().join("out").join("x");
        let err = unzip(&dir, &zipfile, "example.com/m@v1.0.0").unwrap_err();
        assert!(err.to_string().contains("unexpected file"));
        assert!(!dir.exists());
    }

    #[test]
    fn unzip_race_loser_accepts_existing_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = "example.com/m@v1.0.0";
        let zipfile = make_module_zip(tmp.path(), prefix);
        let dir = tmp.path().join("out").join(prefix);
        unzip(&dir, &zipfile, prefix).unwrap();
        // Second extraction into the same final directory.
        unzip(&dir, &zipfile, prefix).unwrap();
        assert!(dir.join("go.mod").exists());
        // No leftover temp directories.
        let leftovers: Vec<_> = fs::read_dir(dir.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cache_lock_is_reentrant_per_process_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = CacheLock::acquire(tmp.path()).unwrap();
        drop(lock);
        let _again = CacheLock::acquire(tmp.path()).unwrap();
    }
}
