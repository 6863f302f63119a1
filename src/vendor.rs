// Purpose: Project the build list into a self-contained vendor directory.
// Inputs/Outputs: A completed load in; <modRoot>/vendor/<importPath> trees plus
//   vendor/modules.txt out.
// Invariants: Every vendored package's testdata chain up to its module root comes
//   along, as do the module's license-like files.
// Gotchas: The vendor tree is rebuilt from scratch on every run.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::load::{Engine, Loaded};
use crate::module::ModuleVersion;

/// Rebuild `<modRoot>/vendor` from the current build list and loaded
/// package set. Returns the number of vendored packages.
pub fn run(engine: &Engine, loaded: &Loaded) -> anyhow::Result<usize> {
    let vdir = engine.mod_root().join("vendor");
    if vdir.exists() {
        fs::remove_dir_all(&vdir).with_context(|| format!("removing {}", vdir.display()))?;
    }

    let mut modpkgs: HashMap<ModuleVersion, Vec<String>> = HashMap::new();
    for pkg in &loaded.pkgs {
        let Some(m) = loaded.pkgmod.get(pkg) else {
            continue;
        };
        if m == engine.target() {
            continue;
        }
        modpkgs.entry(m.clone()).or_default().push(pkg.clone());
    }

    let mut buf = String::new();
    let mut copied: HashSet<std::path::PathBuf> = HashSet::new();
    let mut count = 0;
    for m in &engine.build_list()[1..] {
        let Some(pkgs) = modpkgs.get(m) else {
            continue;
        };
        let mut repl = String::new();
        if let Some(r) = engine.modfile().replacement(m) {
            repl = format!(" => {}", r.new.path);
            if !r.new.version.is_empty() {
                repl.push_str(&format!(" {}", r.new.version));
            }
        }
        buf.push_str(&format!("# {} {}{repl}\n", m.path, m.version));
        for pkg in pkgs {
            buf.push_str(pkg);
            buf.push('\n');
            vendor_pkg(engine, loaded, &vdir, pkg, m, &mut copied)?;
            count += 1;
        }
        vendor_legal_files(engine, &vdir, m)?;
    }

    if buf.is_empty() {
        eprintln!("vmod: no dependencies to vendor");
        return Ok(0);
    }
    fs::create_dir_all(&vdir)?;
    fs::write(vdir.join("modules.txt"), buf).context("writing vendor/modules.txt")?;
    Ok(count)
}

fn vendor_pkg(
    engine: &Engine,
    loaded: &Loaded,
    vdir: &Path,
    pkg: &str,
    m: &ModuleVersion,
    copied: &mut HashSet<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let real_path = loaded.importmap.get(pkg).map(String::as_str).unwrap_or(pkg);
    let Some(src) = loaded.pkgdir.get(real_path) else {
        eprintln!("internal error: no pkg for {pkg} -> {real_path}");
        return Ok(());
    };
    let dst = vdir.join(pkg);
    copy_dir(&dst, src, false)?;

    // testdata directories on the chain from the package up to the
    // module root.
    let mut pkg = real_path.to_string();
    let mut dst = dst;
    let mut src = src.clone();
    loop {
        if !copied.insert(dst.clone()) {
            break;
        }
        let td = src.join("testdata");
        if td.is_dir() {
            copy_dir(&dst.join("testdata"), &td, true)?;
        }
        if pkg == m.path {
            break;
        }
        let (Some(i), Some(dp), Some(sp)) = (pkg.rfind('/'), dst.parent(), src.parent()) else {
            break;
        };
        pkg.truncate(i);
        dst = dp.to_path_buf();
        src = sp.to_path_buf();
    }
    Ok(())
}

// License-like files from the module root travel with the vendored
// code.
fn vendor_legal_files(engine: &Engine, vdir: &Path, m: &ModuleVersion) -> anyhow::Result<()> {
    let root = match engine.fetch_module(m) {
        Ok(dir) => dir,
        Err(_) => return Ok(()),
    };
    let dst = vdir.join(&m.path);
    for ent in fs::read_dir(&root).with_context(|| format!("read_dir {}", root.display()))? {
        let ent = ent?;
        let p = ent.path();
        if !p.is_file() {
            continue;
        }
        let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_legal_file(name) {
            continue;
        }
        fs::create_dir_all(&dst)?;
        copy_file(&dst.join(name), &p)?;
    }
    Ok(())
}

fn is_legal_file(name: &str) -> bool {
    let base = name.split('.').next().unwrap_or(name);
    matches!(base, "LICENSE" | "LICENCE" | "COPYING" | "COPYLEFT" | "PATENTS")
        || name.starts_with("AUTHORS")
        || name.starts_with("CONTRIBUTORS")
        || name.starts_with("NOTICE")
}

fn copy_dir(dst: &Path, src: &Path, recursive: bool) -> anyhow::Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("mkdir {}", dst.display()))?;
    for ent in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let ent = ent?;
        let p = ent.path();
        let name = ent.file_name();
        if p.is_dir() {
            if recursive || name == "testdata" {
                copy_dir(&dst.join(&name), &p, true)?;
            }
            continue;
        }
        if !p.is_file() {
            continue;
        }
        copy_file(&dst.join(&name), &p)?;
    }
    Ok(())
}

// Plain byte copy; cached sources are read-only and vendored copies
// must not be.
fn copy_file(dst: &Path, src: &Path) -> anyhow::Result<()> {
    let data = fs::read(src).with_context(|| format!("read {}", src.display()))?;
    fs::write(dst, data).with_context(|| format!("write {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GetMode, UpgradeMode};

    fn test_config(gopath: &Path) -> Config {
        Config {
            gopath: gopath.to_path_buf(),
            goroot: None,
            goproxy: None,
            getmode: GetMode::Normal,
            upgrade: UpgradeMode::Off,
            insecure: false,
            tags: Vec::new(),
            modules_only: false,
            workers: 2,
        }
    }

    #[test]
    fn legal_file_detection() {
        for name in [
            "LICENSE",
            "LICENSE.md",
            "LICENCE",
            "COPYING",
            "PATENTS",
            "AUTHORS",
            "AUTHORS.txt",
            "CONTRIBUTORS",
            "NOTICE",
            "NOTICE-2018",
        ] {
            assert!(is_legal_file(name), "{name}");
        }
        for name in ["README", "main.go", "license_test.go"] {
            assert!(!is_legal_file(name), "{name}");
        }
    }

    #[test]
    fn vendor_copies_packages_testdata_and_licenses() {
        let tmp = tempfile::tempdir().unwrap();
        let gopath = tmp.path().join("gopath");
        let work = tmp.path().join("work");

        let y = work.join("y");
        fs::create_dir_all(&y).unwrap();
        fs::write(
            y.join("go.mod"),
            "module x/y\n\nrequire zz v1.0.0\n\nreplace zz v1.0.0 => ../z\n",
        )
        .unwrap();
        fs::write(
            y.join("main.go"),
            "package main\n\nimport \"zz/util\"\n\nfunc main() { util.F() }\n",
        )
        .unwrap();

        let z = work.join("z");
        fs::create_dir_all(z.join("util/testdata")).unwrap();
        fs::create_dir_all(z.join("testdata")).unwrap();
        fs::write(z.join("go.mod"), "module zz\n").unwrap();
        fs::write(z.join("LICENSE"), "license text\n").unwrap();
        fs::write(z.join("NOTICE.txt"), "notice\n").unwrap();
        fs::write(z.join("util/util.go"), "package util\n\nfunc F() {}\n").unwrap();
        fs::write(z.join("util/testdata/fixture.txt"), "fixture\n").unwrap();
        fs::write(z.join("testdata/root.txt"), "root fixture\n").unwrap();

        let mut engine = crate::load::Engine::at(test_config(&gopath), &y).unwrap();
        let loaded = engine
            .import_paths(&["all".to_string()], false)
            .unwrap()
            .clone();
        let n = run(&engine, &loaded).unwrap();
        assert_eq!(n, 1);

        let vdir = y.join("vendor");
        assert!(vdir.join("zz/util/util.go").exists());
        assert!(vdir.join("zz/util/testdata/fixture.txt").exists());
        assert!(vdir.join("zz/testdata/root.txt").exists());
        assert!(vdir.join("zz/LICENSE").exists());
        assert!(vdir.join("zz/NOTICE.txt").exists());

        let txt = fs::read_to_string(vdir.join("modules.txt")).unwrap();
        assert_eq!(txt, "# zz v1.0.0 => ../z\nzz/util\n");
    }
}
