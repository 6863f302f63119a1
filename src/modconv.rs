// Purpose: Map foreign dependency lock files into the native manifest.
// Inputs/Outputs: A recognized legacy file's text in; require entries with resolved
//   canonical versions merged into the manifest, marked with a provenance comment.
// Invariants: One (path, rev) decoder per format; the maximum resolved version per
//   path is what survives the merge.
// Gotchas: Lock files routinely pin raw revisions; resolution fans out over the
//   worker set and tolerates individual failures.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::fetch::Fetcher;
use crate::modfile::ModFile;
use crate::par::Work;
use crate::semver;

/// Marker prepended to auto-converted manifests. A cached manifest
/// carrying a marker from a different tool version is refetched.
pub const PREFIX: &str = concat!("//vmod ", env!("CARGO_PKG_VERSION"));

/// Files that imply a module root when no manifest exists. Order is
/// the probe order; .git/config only anchors the root and converts to
/// nothing.
pub const ALT_CONFIGS: &[&str] = &[
    "Gopkg.lock",
    "GLOCKFILE",
    "Godeps/Godeps.json",
    "dependencies.tsv",
    "glide.lock",
    "vendor.conf",
    "vendor.yml",
    "vendor/manifest",
    "vendor/vendor.json",
    ".git/config",
];

type Decoder = fn(&str) -> anyhow::Result<Vec<(String, String)>>;

/// The decoder for a legacy file, keyed by its last one or two path
/// elements.
pub fn converter_for(file: &str) -> Option<Decoder> {
    let file = file.replace('\\', "/");
    let mut key = file.as_str();
    let parts: Vec<&str> = file.split('/').collect();
    if parts.len() >= 2 {
        key = &file[file.len() - parts[parts.len() - 2].len() - parts[parts.len() - 1].len() - 1..];
    }
    let last = parts[parts.len() - 1];
    match key {
        "Godeps/Godeps.json" => return Some(decode_godeps),
        "vendor/manifest" => return Some(decode_gb_manifest),
        "vendor/vendor.json" => return Some(decode_govendor),
        _ => {}
    }
    match last {
        "Gopkg.lock" => Some(decode_dep_lock),
        "GLOCKFILE" => Some(decode_glockfile),
        "dependencies.tsv" => Some(decode_dependencies_tsv),
        "glide.lock" => Some(decode_glide_lock),
        "vendor.conf" => Some(decode_vendor_conf),
        "vendor.yml" => Some(decode_vendor_yml),
        _ => None,
    }
}

/// Decode a legacy file and merge its pins into the manifest: every
/// raw revision is resolved to a canonical version and the maximum per
/// path is retained.
pub fn convert_legacy_config(
    f: &mut ModFile,
    fetcher: &Fetcher,
    file: &str,
    data: &str,
    workers: usize,
) -> anyhow::Result<()> {
    let Some(decode) = converter_for(file) else {
        bail!("unknown legacy config file {file}");
    };
    let pins = decode(data).with_context(|| format!("parsing {file}"))?;

    let work: Work<(String, String)> = Work::new();
    for (path, rev) in pins {
        if path.is_empty() {
            continue;
        }
        work.add((truncate_repo_path(&path), rev));
    }
    let need: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
    work.run(workers, |(path, rev)| {
        let info = match fetcher.stat(&path, &rev) {
            Ok(info) => info,
            Err(e) => {
                eprintln!("vmod: stat {path}@{rev}: {e:#}");
                return;
            }
        };
        let mut need = need.lock().unwrap();
        match need.get(&path) {
            Some(v) if semver::compare(v, &info.version) != std::cmp::Ordering::Less => {}
            _ => {
                need.insert(path, info.version);
            }
        }
    });

    let need = need.into_inner().unwrap();
    let mut paths: Vec<&String> = need.keys().collect();
    paths.sort();
    for path in paths {
        f.add_new_require(path, &need[path]);
    }
    f.cleanup();
    f.leading_comments = vec![format!("{} translated from {file}", &PREFIX[2..])];
    Ok(())
}

// Lock files pin whole repositories; module paths on the big hosts are
// three elements deep.
fn truncate_repo_path(path: &str) -> String {
    if path.starts_with("github.com/") || path.starts_with("golang.org/x/") {
        let f: Vec<&str> = path.split('/').collect();
        if f.len() > 3 {
            return f[..3].join("/");
        }
    }
    path.to_string()
}

fn decode_dep_lock(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    #[derive(Deserialize)]
    struct Lock {
        #[serde(default)]
        projects: Vec<Project>,
    }
    #[derive(Deserialize)]
    struct Project {
        name: String,
        revision: Option<String>,
        version: Option<String>,
    }
    let lock: Lock = toml::from_str(data).context("decoding Gopkg.lock")?;
    Ok(lock
        .projects
        .into_iter()
        .filter_map(|p| {
            let rev = p.revision.or(p.version)?;
            Some((p.name, rev))
        })
        .collect())
}

fn decode_godeps(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    #[derive(Deserialize)]
    struct Godeps {
        #[serde(rename = "Deps", default)]
        deps: Vec<Dep>,
    }
    #[derive(Deserialize)]
    struct Dep {
        #[serde(rename = "ImportPath")]
        import_path: String,
        #[serde(rename = "Rev")]
        rev: String,
    }
    let g: Godeps = serde_json::from_str(data).context("decoding Godeps.json")?;
    Ok(g.deps.into_iter().map(|d| (d.import_path, d.rev)).collect())
}

fn decode_govendor(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    #[derive(Deserialize)]
    struct VendorJson {
        #[serde(rename = "package", default)]
        packages: Vec<Package>,
    }
    #[derive(Deserialize)]
    struct Package {
        path: String,
        #[serde(rename = "revision")]
        revision: Option<String>,
    }
    let v: VendorJson = serde_json::from_str(data).context("decoding vendor.json")?;
    Ok(v.packages
        .into_iter()
        .filter_map(|p| Some((p.path, p.revision?)))
        .collect())
}

fn decode_gb_manifest(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    #[derive(Deserialize)]
    struct Manifest {
        #[serde(default)]
        dependencies: Vec<Dep>,
    }
    #[derive(Deserialize)]
    struct Dep {
        importpath: String,
        revision: String,
    }
    let m: Manifest = serde_json::from_str(data).context("decoding vendor/manifest")?;
    Ok(m.dependencies
        .into_iter()
        .map(|d| (d.importpath, d.revision))
        .collect())
}

fn decode_glockfile(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for line in data.lines() {
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() == 2 && f[0] != "cmd" {
            out.push((f[0].to_string(), f[1].to_string()));
        }
    }
    Ok(out)
}

fn decode_dependencies_tsv(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for line in data.lines() {
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() >= 3 {
            out.push((f[0].to_string(), f[2].to_string()));
        }
    }
    Ok(out)
}

// glide.lock and vendor.yml are flat enough that field scanning beats
// a YAML dependency.
fn decode_glide_lock(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut imports = false;
    let mut name: Option<String> = None;
    for line in data.lines() {
        if !line.starts_with(' ') && !line.starts_with('-') {
            imports = line.trim_end() == "imports:";
            name = None;
            continue;
        }
        if !imports {
            continue;
        }
        let t = line.trim();
        if let Some(n) = t.strip_prefix("- name: ") {
            name = Some(n.trim().to_string());
        } else if let Some(v) = t.strip_prefix("version: ")
            && let Some(n) = name.take()
        {
            out.push((n, v.trim().to_string()));
        }
    }
    Ok(out)
}

fn decode_vendor_yml(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut path: Option<String> = None;
    for line in data.lines() {
        let t = line.trim();
        if let Some(p) = t.strip_prefix("- path: ") {
            path = Some(p.trim().to_string());
        } else if let Some(r) = t.strip_prefix("rev: ")
            && let Some(p) = path.take()
        {
            out.push((p, r.trim().to_string()));
        }
    }
    Ok(out)
}

fn decode_vendor_conf(data: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for line in data.lines() {
        let line = line.split('#').next().unwrap_or("");
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() >= 2 {
            out.push((f[0].to_string(), f[1].to_string()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GetMode, UpgradeMode};
    use crate::fetch::checksum::Ledger;
    use crate::repo::RevInfo;
    use crate::web::Client;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn decoder_table_matches_known_names() {
        assert!(converter_for("Gopkg.lock").is_some());
        assert!(converter_for("/src/project/Gopkg.lock").is_some());
        assert!(converter_for("Godeps/Godeps.json").is_some());
        assert!(converter_for("a/b/vendor/manifest").is_some());
        assert!(converter_for("unknown.lock").is_none());
        assert!(converter_for(".git/config").is_none());
    }

    #[test]
    fn dep_lock_decodes_projects() {
        let data = r#"
[[projects]]
  name = "github.com/pkg/errors"
  revision = "645ef00459ed84a119197bfb8d8205042c6df63d"
  version = "v0.8.0"

[[projects]]
  name = "golang.org/x/net/context"
  revision = "66aacef3dd8a676686c7ae3716979581e8b03c47"
"#;
        let got = decode_dep_lock(data).unwrap();
        assert_eq!(
            got,
            vec![
                (
                    "github.com/pkg/errors".to_string(),
                    "645ef00459ed84a119197bfb8d8205042c6df63d".to_string()
                ),
                (
                    "golang.org/x/net/context".to_string(),
                    "66aacef3dd8a676686c7ae3716979581e8b03c47".to_string()
                ),
            ]
        );
    }

    #[test]
    fn godeps_and_govendor_decode() {
        let godeps = r#"{"ImportPath":"example.com/m","Deps":[
            {"ImportPath":"github.com/pkg/errors","Rev":"645ef00459ed"}]}"#;
        assert_eq!(
            decode_godeps(godeps).unwrap(),
            vec![("github.com/pkg/errors".to_string(), "645ef00459ed".to_string())]
        );
        let govendor = r#"{"rootPath":"example.com/m","package":[
            {"path":"github.com/pkg/errors","revision":"645ef00459ed"}]}"#;
        assert_eq!(
            decode_govendor(govendor).unwrap(),
            vec![("github.com/pkg/errors".to_string(), "645ef00459ed".to_string())]
        );
    }

    #[test]
    fn glide_lock_decodes_imports() {
        let data = "hash: abc\nimports:\n- name: github.com/pkg/errors\n  version: 645ef00459ed\n- name: gopkg.in/yaml.v2\n  version: deadbeef\ntestImports: []\n";
        assert_eq!(
            decode_glide_lock(data).unwrap(),
            vec![
                ("github.com/pkg/errors".to_string(), "645ef00459ed".to_string()),
                ("gopkg.in/yaml.v2".to_string(), "deadbeef".to_string()),
            ]
        );
    }

    #[test]
    fn plain_text_formats_decode() {
        assert_eq!(
            decode_glockfile("cmd github.com/x/tool\ngithub.com/pkg/errors 645ef0\n").unwrap(),
            vec![("github.com/pkg/errors".to_string(), "645ef0".to_string())]
        );
        assert_eq!(
            decode_vendor_conf("# comment\ngithub.com/pkg/errors 645ef0 # trailing\n").unwrap(),
            vec![("github.com/pkg/errors".to_string(), "645ef0".to_string())]
        );
        assert_eq!(
            decode_dependencies_tsv("github.com/pkg/errors\tgit\t645ef0\t2018-01-01\n").unwrap(),
            vec![("github.com/pkg/errors".to_string(), "645ef0".to_string())]
        );
    }

    #[test]
    fn repo_paths_are_truncated() {
        assert_eq!(
            truncate_repo_path("github.com/user/repo/sub/pkg"),
            "github.com/user/repo"
        );
        assert_eq!(truncate_repo_path("golang.org/x/net/context"), "golang.org/x/net");
        assert_eq!(truncate_repo_path("example.com/a/b/c/d"), "example.com/a/b/c/d");
    }

    // End to end against the on-disk stat fast path: no network, the
    // .info files stand in for resolved revisions.
    #[test]
    fn convert_merges_max_version_per_path() {
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
        let seed = |path: &str, rev: &str, version: &str| {
            let dir = cfg.download_dir().join(path).join("@v");
            std::fs::create_dir_all(&dir).unwrap();
            let info = RevInfo {
                version: version.to_string(),
                name: rev.to_string(),
                short: rev[..rev.len().min(12)].to_string(),
                time: Utc.with_ymd_and_hms(2018, 2, 14, 0, 45, 20).unwrap(),
            };
            std::fs::write(
                dir.join(format!("{rev}.info")),
                serde_json::to_vec(&info).unwrap(),
            )
            .unwrap();
        };
        seed("github.com/pkg/errors", "aaaa11", "v0.7.0");
        seed("github.com/pkg/errors", "bbbb22", "v0.8.0");

        let web = Arc::new(Client::new(false).unwrap());
        let ledger = Ledger::load(&tmp.path().join("go.sum")).unwrap();
        let fetcher = Fetcher::new(cfg, web, ledger);

        let mut f = ModFile::new();
        f.add_module("example.com/m");
        let data = "github.com/pkg/errors/sub aaaa11\ngithub.com/pkg/errors bbbb22\n";
        convert_legacy_config(&mut f, &fetcher, "GLOCKFILE", data, 2).unwrap();

        assert_eq!(f.require.len(), 1);
        assert_eq!(f.require[0].mv.path, "github.com/pkg/errors");
        assert_eq!(f.require[0].mv.version, "v0.8.0");
        assert_eq!(
            f.leading_comments,
            vec![format!(
                "vmod {} translated from GLOCKFILE",
                env!("CARGO_PKG_VERSION")
            )]
        );
    }
}
