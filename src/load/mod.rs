// Purpose: The engine: root-manifest state, fixed-point import loading, and the commands'
//   shared machinery (get, list, download, write-back).
// Inputs/Outputs: A module root directory in; a resolved build list, package->module maps,
//   and rewritten go.mod/go.sum out.
// Invariants: Every process-wide cache is a field here. A load ends with the manifest
//   reduced to its minimal requirement form.
// Gotchas: The loader tolerates missing imports (they drive the next iteration); every
//   other error in a phase is terminal.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};

use crate::config::{Config, GetMode, UpgradeMode};
use crate::fetch::checksum::Ledger;
use crate::fetch::{Fetcher, query};
use crate::modconv;
use crate::modfile::ModFile;
use crate::module::ModuleVersion;
use crate::mvs;
use crate::semver;
use crate::web::Client;

pub mod imports;
pub mod oracle;

use oracle::{EngineReqs, Oracle};

/// The package-level result of a completed load.
#[derive(Clone, Debug, Default)]
pub struct Loaded {
    /// Every package reached, in first-visit order.
    pub pkgs: Vec<String>,
    pub importmap: HashMap<String, String>,
    pub pkgdir: HashMap<String, PathBuf>,
    pub pkgmod: HashMap<String, ModuleVersion>,
}

pub struct Engine {
    cfg: Config,
    fetcher: Fetcher,
    mod_root: PathBuf,
    modfile: ModFile,
    target: ModuleVersion,
    excluded: HashSet<ModuleVersion>,
    oracle: Oracle,
    build_list: Vec<ModuleVersion>,
    found: HashSet<String>,
    loaded: Option<Loaded>,
}

impl Engine {
    pub fn new(cfg: Config) -> anyhow::Result<Engine> {
        let cwd = std::env::current_dir()?;
        Engine::at(cfg, &cwd)
    }

    pub fn at(cfg: Config, dir: &Path) -> anyhow::Result<Engine> {
        let Some((mod_root, _config_name)) = find_module_root(dir) else {
            bail!("cannot determine module root; please create a go.mod file there");
        };
        let web = Arc::new(Client::new(cfg.insecure)?);
        let ledger = Ledger::load(&mod_root.join("go.sum"))?;
        let fetcher = Fetcher::new(cfg.clone(), web, ledger);

        let gomod = mod_root.join("go.mod");
        let modfile = if gomod.exists() {
            let mut f = ModFile::parse_file(&gomod).context("errors parsing go.mod")?;
            if f.module.is_empty() {
                f.module = find_module_path(&mod_root)?;
            }
            f
        } else {
            legacy_mod_init(&mod_root, &fetcher, cfg.workers)?
        };

        let excluded: HashSet<ModuleVersion> =
            modfile.exclude.iter().map(|x| x.mv.clone()).collect();
        let target = ModuleVersion::new(modfile.module.clone(), "");

        let mut engine = Engine {
            cfg,
            fetcher,
            mod_root,
            modfile,
            target,
            excluded,
            oracle: Oracle::new(),
            build_list: Vec::new(),
            found: HashSet::new(),
            loaded: None,
        };
        engine.fix_versions()?;
        Ok(engine)
    }

    pub fn mod_root(&self) -> &Path {
        &self.mod_root
    }

    pub fn target(&self) -> &ModuleVersion {
        &self.target
    }

    pub fn modfile(&self) -> &ModFile {
        &self.modfile
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn build_list(&self) -> &[ModuleVersion] {
        &self.build_list
    }

    pub fn loaded(&self) -> Option<&Loaded> {
        self.loaded.as_ref()
    }

    fn allowed(&self) -> impl Fn(&ModuleVersion) -> bool + '_ {
        |m| !self.excluded.contains(m)
    }

    fn reqs(&self, extra: Vec<ModuleVersion>) -> EngineReqs<'_> {
        EngineReqs {
            fetcher: &self.fetcher,
            oracle: &self.oracle,
            modfile: &self.modfile,
            mod_root: &self.mod_root,
            target: &self.target,
            excluded: &self.excluded,
            snapshot: if self.build_list.is_empty() {
                None
            } else {
                Some(self.build_list[1..].to_vec())
            },
            extra,
            upgrade_mode: self.cfg.upgrade,
        }
    }

    // Requirement versions written by hand (or by older tools) may be
    // branches, short hashes, or abbreviated semver; pin them all to
    // canonical form before selection sees them.
    fn fix_versions(&mut self) -> anyhow::Result<()> {
        let mut fixed: Vec<(String, String)> = Vec::new();
        for r in &self.modfile.require {
            let vers = &r.mv.version;
            if semver::is_valid(vers) {
                let canon = semver::canonical(vers);
                if canon != *vers {
                    fixed.push((r.mv.path.clone(), canon));
                }
                continue;
            }
            let allowed = self.allowed();
            let info = query::query(&self.fetcher, &r.mv.path, vers, &allowed)
                .with_context(|| format!("resolving required version {}@{vers}", r.mv.path))?;
            fixed.push((r.mv.path.clone(), info.version));
        }
        for (path, version) in fixed {
            self.modfile.add_require(&path, &version);
        }
        Ok(())
    }

    fn run_mvs(&self) -> anyhow::Result<Vec<ModuleVersion>> {
        let reqs = self.reqs(Vec::new());
        match self.cfg.upgrade {
            UpgradeMode::Off => mvs::build_list(&self.target, &reqs),
            _ => mvs::upgrade_all(&self.target, &reqs),
        }
    }

    /// Compute the build list without walking any packages.
    pub fn load_build_list(&mut self) -> anyhow::Result<&[ModuleVersion]> {
        self.iterate(&[], false)?;
        Ok(&self.build_list)
    }

    /// Load the named packages and everything they import, expanding
    /// the build list until it covers every reachable import.
    pub fn import_paths(&mut self, pkgs: &[String], tests: bool) -> anyhow::Result<&Loaded> {
        let roots = self.resolve_patterns(pkgs)?;
        self.iterate(&roots, tests)?;
        Ok(self.loaded.as_ref().unwrap())
    }

    fn resolve_patterns(&self, pkgs: &[String]) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for pkg in pkgs {
            match pkg.as_str() {
                "all" | "ALL" => out.extend(self.module_packages()?),
                "." => out.push(self.target.path.clone()),
                p if p.starts_with("./") => {
                    out.push(format!("{}/{}", self.target.path, &p[2..]));
                }
                p => out.push(p.to_string()),
            }
        }
        Ok(out)
    }

    // Import paths of every package directory inside the module.
    fn module_packages(&self) -> anyhow::Result<Vec<String>> {
        fn walk(dir: &Path, import: &str, out: &mut Vec<String>) -> anyhow::Result<()> {
            let mut has_source = false;
            let mut entries: Vec<_> = fs::read_dir(dir)
                .with_context(|| format!("read_dir {}", dir.display()))?
                .collect::<Result<_, _>>()?;
            entries.sort_by_key(|e| e.file_name());
            for ent in entries {
                let p = ent.path();
                let Some(name) = p.file_name().and_then(|s| s.to_str()).map(String::from) else {
                    continue;
                };
                if p.is_dir() {
                    if name.starts_with('.')
                        || name.starts_with('_')
                        || name == "vendor"
                        || name == "testdata"
                    {
                        continue;
                    }
                    walk(&p, &format!("{import}/{name}"), out)?;
                } else if name.ends_with(".go") {
                    has_source = true;
                }
            }
            if has_source {
                out.push(import.to_string());
            }
            Ok(())
        }
        let mut out = Vec::new();
        walk(&self.mod_root, &self.target.path, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn iterate(&mut self, roots: &[String], tests: bool) -> anyhow::Result<()> {
        self.build_list = self.run_mvs()?;
        loop {
            let mut pass = Pass::new(self, tests);
            for root in roots {
                pass.import_pkg(root);
            }
            if !pass.errors.is_empty() {
                bail!("{}", pass.errors.join("\n"));
            }
            if pass.missing.is_empty() {
                let loaded = pass.into_loaded();
                self.loaded = Some(loaded);
                return Ok(());
            }
            let missing = std::mem::take(&mut pass.missing);
            drop(pass);
            for m in &missing {
                self.find_missing(m)?;
            }
            self.build_list = self.run_mvs()?;
        }
    }

    fn find_missing(&mut self, m: &Missing) -> anyhow::Result<()> {
        for mv in &self.build_list {
            if import_path_in_module(&m.path, &mv.path) {
                // Already served; leave the ordinary build to complain
                // about whatever is wrong inside.
                return Ok(());
            }
        }
        if m.path.starts_with("./") || m.path.starts_with("../") {
            bail!("relative import is not supported: {}", m.path);
        }
        eprintln!("vmod: resolving import {:?}", m.path);
        let (repo, info) = query::import_repo(&self.fetcher, &m.path, &self.allowed())
            .with_context(|| m.stack.clone())?;
        let root = repo.module_path().to_string();
        eprintln!("vmod: finding {root} (latest)");
        if !self.found.insert(root.clone()) {
            bail!("internal error: findmissing loop on {root}");
        }
        eprintln!("vmod: adding {root} {}", info.version);
        self.build_list
            .push(ModuleVersion::new(&root, &info.version));
        self.modfile.add_require(&root, &info.version);
        Ok(())
    }

    /// Directory holding the source of mv, honoring root-manifest
    /// replacements before touching the network cache.
    pub fn fetch_module(&self, mv: &ModuleVersion) -> anyhow::Result<PathBuf> {
        if let Some(repl) = self.modfile.replacement(mv) {
            if repl.new.version.is_empty() {
                let dir = if Path::new(&repl.new.path).is_absolute() {
                    PathBuf::from(&repl.new.path)
                } else {
                    self.mod_root.join(&repl.new.path)
                };
                return dir
                    .canonicalize()
                    .with_context(|| format!("replacement path {}", dir.display()));
            }
            return self.fetcher.download(&repl.new);
        }
        self.fetcher.download(mv)
    }

    /// Materialize every selected module into the cache.
    pub fn download_all(&mut self) -> anyhow::Result<()> {
        self.load_build_list()?;
        let _lock = self.fetcher.lock_cache()?;
        let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let work: crate::par::Work<ModuleVersion> = crate::par::Work::new();
        for mv in &self.build_list[1..] {
            work.add(mv.clone());
        }
        work.run(self.cfg.workers, |mv| {
            if let Err(e) = self.fetch_module(&mv) {
                errors.lock().unwrap().push(format!("{mv}: {e:#}"));
            }
        });
        let errors = errors.into_inner().unwrap();
        if !errors.is_empty() {
            bail!("{}", errors.join("\n"));
        }
        Ok(())
    }

    /// The `get` operation: raise the named modules, reload, then
    /// downgrade whatever overshot an explicit request. Under -u the
    /// whole graph is lifted through the upgrade hook first and the
    /// named requests join the requirement set; the overshoot pass
    /// below reduces only what an explicit request pins lower.
    pub fn get(&mut self, specs: &[(String, String)]) -> anyhow::Result<()> {
        let mut upgrades: Vec<ModuleVersion> = Vec::new();
        let mut downgrades: Vec<ModuleVersion> = Vec::new();
        for (path, vers) in specs {
            if vers == mvs::NONE {
                downgrades.push(ModuleVersion::new(path, mvs::NONE));
                continue;
            }
            let allowed = self.allowed();
            let info = query::query(&self.fetcher, path, vers, &allowed)
                .with_context(|| format!("get {path}@{vers}"))?;
            upgrades.push(ModuleVersion::new(path, &info.version));
        }

        let list = match self.cfg.upgrade {
            UpgradeMode::Off => {
                let reqs = self.reqs(Vec::new());
                mvs::upgrade(&self.target, &reqs, &upgrades)?
            }
            _ => {
                let reqs = self.reqs(upgrades.clone());
                mvs::upgrade_all(&self.target, &reqs)?
            }
        };
        self.build_list = list;
        self.import_paths(&[".".to_string()], false)?;

        // Downgrade anything that went past an explicit request.
        let mut selected: HashMap<&str, &str> = HashMap::new();
        for mv in &self.build_list {
            selected.insert(&mv.path, &mv.version);
        }
        for u in &upgrades {
            if let Some(v) = selected.get(u.path.as_str())
                && semver::compare(&u.version, v) == std::cmp::Ordering::Less
            {
                downgrades.push(u.clone());
            }
        }
        if !downgrades.is_empty() {
            let list = {
                let reqs = self.reqs(Vec::new());
                let down = mvs::downgrade(&self.target, &reqs, &downgrades)?;
                let over = mvs::Override {
                    target: self.target.clone(),
                    list: down[1..].to_vec(),
                    reqs: &reqs,
                };
                mvs::build_list(&self.target, &over)?
            };
            self.build_list = list;
        }
        Ok(())
    }

    /// Module listing lines: the target first, then every selected
    /// module, optionally annotated with its available upgrade.
    pub fn list_modules(&mut self, with_upgrades: bool) -> anyhow::Result<Vec<String>> {
        self.load_build_list()?;
        let mut latest: HashMap<String, String> = HashMap::new();
        if with_upgrades {
            let results: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
            let work: crate::par::Work<String> = crate::par::Work::new();
            for mv in &self.build_list[1..] {
                if self.modfile.replacement(mv).is_none() {
                    work.add(mv.path.clone());
                }
            }
            let allowed = self.allowed();
            work.run(self.cfg.workers, |path| {
                if let Ok(info) = query::query(&self.fetcher, &path, "latest", &allowed) {
                    results.lock().unwrap().insert(path, info.version);
                }
            });
            latest = results.into_inner().unwrap();
        }

        let mut out = vec![self.target.path.clone()];
        for mv in &self.build_list[1..] {
            let mut line = format!("{} {}", mv.path, mv.version);
            if let Some(l) = latest.get(&mv.path)
                && semver::compare(l, &mv.version) == std::cmp::Ordering::Greater
            {
                line.push_str(&format!(" [{l}]"));
            }
            if let Some(repl) = self.modfile.replacement(mv) {
                line.push_str(&format!(" => {}", repl.new.path));
                if !repl.new.version.is_empty() {
                    line.push_str(&format!(" {}", repl.new.version));
                }
            }
            out.push(line);
        }
        Ok(out)
    }

    /// Requirement summary: the target's direct requirements, then the
    /// transitively selected remainder.
    pub fn graph_lines(&mut self) -> anyhow::Result<Vec<String>> {
        self.load_build_list()?;
        let direct: HashSet<&str> = self
            .modfile
            .require
            .iter()
            .map(|r| r.mv.path.as_str())
            .collect();
        let mut out = vec![format!("main: {}", self.target.path), "direct:".to_string()];
        if self.modfile.require.is_empty() {
            out.push("  (none)".to_string());
        }
        for r in &self.modfile.require {
            out.push(format!("  {} @ {}", r.mv.path, r.mv.version));
        }
        out.push("transitive:".to_string());
        let trans: Vec<&ModuleVersion> = self.build_list[1..]
            .iter()
            .filter(|mv| !direct.contains(mv.path.as_str()))
            .collect();
        if trans.is_empty() {
            out.push("  (none)".to_string());
        }
        for mv in trans {
            out.push(format!("  {} @ {}", mv.path, mv.version));
        }
        Ok(out)
    }

    /// Reduce the manifest to the minimal requirements reproducing the
    /// current build list, then persist manifest and ledger. Files are
    /// rewritten only when their bytes change.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        if !self.build_list.is_empty() {
            let min = {
                let reqs = self.reqs(Vec::new());
                mvs::req(&self.target, &self.build_list, &reqs)?
            };
            self.modfile.set_require(&min);
        }
        let file = self.mod_root.join("go.mod");
        let old = fs::read(&file).unwrap_or_default();
        let new = self.modfile.format();
        if old != new.as_bytes() {
            fs::write(&file, new).with_context(|| format!("writing {}", file.display()))?;
        }
        self.fetcher.ledger().write()
    }
}

struct Missing {
    path: String,
    stack: String,
}

struct Pass<'e> {
    engine: &'e Engine,
    tests: bool,
    imported: HashSet<String>,
    importmap: HashMap<String, String>,
    pkgdir: HashMap<String, PathBuf>,
    pkgmod: HashMap<String, ModuleVersion>,
    pkgs: Vec<String>,
    stack: Vec<String>,
    missing: Vec<Missing>,
    errors: Vec<String>,
}

impl<'e> Pass<'e> {
    fn new(engine: &'e Engine, tests: bool) -> Pass<'e> {
        let mut imported = HashSet::new();
        // The cgo pseudo-import never resolves to a module.
        imported.insert("C".to_string());
        Pass {
            engine,
            tests,
            imported,
            importmap: HashMap::new(),
            pkgdir: HashMap::new(),
            pkgmod: HashMap::new(),
            pkgs: Vec::new(),
            stack: Vec::new(),
            missing: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn into_loaded(self) -> Loaded {
        Loaded {
            pkgs: self.pkgs,
            importmap: self.importmap,
            pkgdir: self.pkgdir,
            pkgmod: self.pkgmod,
        }
    }

    fn stack_text(&self) -> String {
        let mut out = String::new();
        for p in &self.stack[..self.stack.len() - 1] {
            out.push_str(&format!("import {p:?} ->\n\t"));
        }
        out.push_str(&format!("import {:?}", self.stack[self.stack.len() - 1]));
        out
    }

    fn import_pkg(&mut self, path: &str) {
        if self.imported.contains(path) {
            return;
        }
        self.stack.push(path.to_string());
        self.import_pkg_body(path);
        self.stack.pop();
    }

    fn import_pkg_body(&mut self, path: &str) {
        self.imported.insert(path.to_string());
        self.importmap.insert(path.to_string(), path.to_string());

        let Some(dir) = self.import_dir(path) else {
            return;
        };
        self.pkgdir.insert(path.to_string(), dir.clone());
        self.pkgs.push(path.to_string());

        let (imports, test_imports) = match imports::scan_dir(&dir) {
            Ok(found) => found,
            Err(e) => {
                self.errors
                    .push(format!("{} [{}]: {e:#}", self.stack_text(), dir.display()));
                return;
            }
        };
        for pkg in imports {
            if imports::is_magic_import(&pkg) {
                continue;
            }
            self.import_pkg(&pkg);
        }
        if self.tests && self.stack.len() == 1 {
            for pkg in test_imports {
                if imports::is_magic_import(&pkg) {
                    continue;
                }
                self.import_pkg(&pkg);
            }
        }
    }

    fn import_dir(&mut self, path: &str) -> Option<PathBuf> {
        let engine = self.engine;
        if import_path_in_module(path, &engine.target.path) {
            let mut dir = engine.mod_root.clone();
            if path.len() > engine.target.path.len() {
                dir = dir.join(&path[engine.target.path.len() + 1..]);
            }
            self.pkgmod.insert(path.to_string(), engine.target.clone());
            return Some(dir);
        }

        if imports::is_standard_import_path(path)
            && let Some(root) = &engine.cfg.goroot
        {
            // Served from the compiler's tree when present; otherwise
            // fall through to module search, which will complain.
            let dir = root.join("src").join(path);
            if dir.exists() {
                return Some(dir);
            }
        }

        if engine.cfg.getmode == GetMode::Vendor {
            return Some(engine.mod_root.join("vendor").join(path));
        }

        let mut found: Option<(ModuleVersion, PathBuf)> = None;
        for mv in &engine.build_list {
            if !import_path_in_module(path, &mv.path) {
                continue;
            }
            let dir = match engine.fetch_module(mv) {
                Ok(d) => d,
                Err(e) => {
                    self.errors.push(format!("{}: {e:#}", self.stack_text()));
                    return None;
                }
            };
            let dir = if path.len() > mv.path.len() {
                dir.join(&path[mv.path.len() + 1..])
            } else {
                dir
            };
            if let Some((m1, _)) = &found {
                self.errors.push(format!(
                    "{}: found in both {} {} and {} {}",
                    self.stack_text(),
                    m1.path,
                    m1.version,
                    mv.path,
                    mv.version
                ));
                return None;
            }
            found = Some((mv.clone(), dir));
        }
        if let Some((mv, dir)) = found {
            self.pkgmod.insert(path.to_string(), mv);
            return Some(dir);
        }
        self.missing.push(Missing {
            path: path.to_string(),
            stack: self.stack_text(),
        });
        None
    }
}

pub fn import_path_in_module(path: &str, mpath: &str) -> bool {
    path == mpath || (path.len() > mpath.len() && path.starts_with(mpath) && path.as_bytes()[mpath.len()] == b'/')
}

/// Walk up from dir looking for a go.mod; failing that, for a known
/// legacy configuration file.
pub fn find_module_root(dir: &Path) -> Option<(PathBuf, String)> {
    let mut d = dir.to_path_buf();
    loop {
        if d.join("go.mod").exists() {
            return Some((d, "go.mod".to_string()));
        }
        if !d.pop() {
            break;
        }
    }
    let mut d = dir.to_path_buf();
    loop {
        for name in modconv::ALT_CONFIGS {
            if d.join(name).exists() {
                return Some((d.clone(), name.to_string()));
            }
        }
        if !d.pop() {
            break;
        }
    }
    None
}

fn legacy_mod_init(mod_root: &Path, fetcher: &Fetcher, workers: usize) -> anyhow::Result<ModFile> {
    let path = find_module_path(mod_root)?;
    let mut f = ModFile::new();
    f.add_module(&path);
    for name in modconv::ALT_CONFIGS {
        let file = mod_root.join(name);
        let Ok(data) = fs::read_to_string(&file) else {
            continue;
        };
        if modconv::converter_for(name).is_none() {
            continue;
        }
        modconv::convert_legacy_config(&mut f, fetcher, name, &data, workers)?;
        return Ok(f);
    }
    Ok(f)
}

/// Best-effort guess of the module path for a legacy source directory:
/// declarations in legacy metadata first, then the git origin remote.
pub fn find_module_path(dir: &Path) -> anyhow::Result<String> {
    #[derive(serde::Deserialize)]
    struct Godeps {
        #[serde(rename = "ImportPath")]
        import_path: Option<String>,
    }
    if let Ok(data) = fs::read(dir.join("Godeps/Godeps.json"))
        && let Ok(cfg) = serde_json::from_slice::<Godeps>(&data)
        && let Some(p) = cfg.import_path
        && !p.is_empty()
    {
        return Ok(p);
    }

    #[derive(serde::Deserialize)]
    struct VendorJson {
        #[serde(rename = "rootPath")]
        root_path: Option<String>,
    }
    if let Ok(data) = fs::read(dir.join("vendor/vendor.json"))
        && let Ok(cfg) = serde_json::from_slice::<VendorJson>(&data)
        && let Some(p) = cfg.root_path
        && !p.is_empty()
    {
        return Ok(p);
    }

    if let Ok(data) = fs::read_to_string(dir.join(".git/config")) {
        let re = regex::Regex::new(
            r#"(?m)^\[remote "origin"\]\n\turl = (?:https://github\.com/|git@github\.com:|gh:)([^/\n]+/[^/\n]+?)(\.git)?\n"#,
        )
        .unwrap();
        if let Some(c) = re.captures(&data) {
            return Ok(format!("github.com/{}", &c[1]));
        }
    }

    bail!(
        "cannot determine module path for source directory {} (no import comments, no legacy config)",
        dir.display()
    )
}
