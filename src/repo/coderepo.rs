// Purpose: Adapt a raw code host into the module Repo contract.
// Inputs/Outputs: Tags become canonical versions (or pseudo-versions); archives become
//   zips rooted at the single prefix <path>@<version>/.
// Invariants: versions() never yields pseudo-versions; every yielded version matches the
//   path's major line.
// Gotchas: Modules may live in a subdirectory of their repository; tags and manifest
//   paths then carry the directory prefix.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use super::codehost::{CodeHost, MAX_GO_MOD, MAX_ZIP_FILE, RevInfo};
use super::{Repo, sort_versions};
use crate::module::{is_pseudo_version, matches_major, path_major, pseudo_version};
use crate::semver;

pub struct CodeRepo {
    path: String,
    code_dir: String,
    path_major: String,
    code: CodeHost,
}

impl CodeRepo {
    pub fn new(code: CodeHost, path: &str) -> anyhow::Result<CodeRepo> {
        let root = code.root();
        if path != root && !path.starts_with(&format!("{root}/")) {
            bail!("mismatched repo: found {root} for {path}");
        }
        let path_major = path_major(path).unwrap_or("").to_string();
        let prefix = match path_major.as_str() {
            "" => path,
            maj => &path[..path.len() - maj.len() - 1],
        };
        let code_dir = prefix
            .strip_prefix(root)
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        Ok(CodeRepo {
            path: path.to_string(),
            code_dir,
            path_major,
            code,
        })
    }

    fn tag_prefix(&self, prefix: &str) -> String {
        if self.code_dir.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{prefix}", self.code_dir)
        }
    }

    // Map a canonical version back to the identifier the host knows.
    fn rev_for_version(&self, version: &str) -> String {
        if is_pseudo_version(version) {
            return version.rsplit('-').next().unwrap_or(version).to_string();
        }
        self.tag_prefix(version)
    }

    // Canonicalize host metadata: a matching semver tag becomes the
    // version; anything else becomes a pseudo-version on this path's
    // major line.
    fn convert(&self, mut info: RevInfo) -> RevInfo {
        let mut tag = info.version.clone();
        if !self.code_dir.is_empty() {
            tag = tag
                .strip_prefix(&format!("{}/", self.code_dir))
                .unwrap_or("")
                .to_string();
        }
        if semver::is_valid(&tag) && matches_major(&self.path, &semver::canonical(&tag)) {
            info.version = semver::canonical(&tag);
        } else {
            info.version = pseudo_version(&self.path_major, info.time, &info.short);
        }
        info
    }
}

impl Repo for CodeRepo {
    fn module_path(&self) -> &str {
        &self.path
    }

    fn versions(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let strip = self.tag_prefix("");
        let tags = self.code.tags(&self.tag_prefix(prefix))?;
        let mut list: Vec<String> = tags
            .iter()
            .filter_map(|t| t.strip_prefix(strip.as_str()))
            .filter(|t| semver::is_valid(t) && !is_pseudo_version(t))
            .map(semver::canonical)
            .filter(|v| matches_major(&self.path, v))
            .collect();
        sort_versions(&mut list);
        list.dedup();
        Ok(list)
    }

    fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        let info = self.code.stat(rev)?;
        Ok(self.convert(info))
    }

    fn latest(&self) -> anyhow::Result<RevInfo> {
        let info = self.code.latest()?;
        Ok(self.convert(info))
    }

    fn manifest(&self, version: &str) -> anyhow::Result<Vec<u8>> {
        let rev = self.rev_for_version(version);
        let file = if self.code_dir.is_empty() {
            "go.mod".to_string()
        } else {
            format!("{}/go.mod", self.code_dir)
        };
        match self.code.read_file(&rev, &file, MAX_GO_MOD) {
            Ok(data) => Ok(data),
            // Root repositories that predate manifests are still
            // usable: synthesize the one-line declaration. Subdirectory
            // modules must carry a real manifest, or import discovery
            // could never strip a bad path segment.
            Err(err) => {
                if self.code_dir.is_empty() {
                    Ok(format!("module {}\n", self.path).into_bytes())
                } else {
                    Err(err.context(format!("no go.mod for {} at {version}", self.path)))
                }
            }
        }
    }

    fn archive(&self, version: &str, tmpdir: &Path) -> anyhow::Result<PathBuf> {
        let rev = self.rev_for_version(version);
        let (raw, actual_subdir) = self
            .code
            .read_zip(&rev, &self.code_dir, tmpdir, MAX_ZIP_FILE)?;
        let strip = if actual_subdir.is_empty() {
            self.code_dir.as_str()
        } else {
            // The host already narrowed the archive to the subdir.
            ""
        };
        let out = rewrite_zip(&raw, strip, &format!("{}@{version}", self.path), tmpdir);
        let _ = std::fs::remove_file(&raw);
        out
    }
}

/// Re-root an archive: drop the host's single unknown top-level
/// directory, optionally keep only `strip_subdir`, and emit every file
/// under `prefix/`.
pub fn rewrite_zip(
    src: &Path,
    strip_subdir: &str,
    prefix: &str,
    tmpdir: &Path,
) -> anyhow::Result<PathBuf> {
    let f = std::fs::File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut z = zip::ZipArchive::new(f).context("reading downloaded archive")?;
    let names: Vec<String> = (0..z.len())
        .map(|i| Ok(z.by_index(i)?.name().to_string()))
        .collect::<anyhow::Result<_>>()?;

    let topdir = names
        .iter()
        .find_map(|n| n.split('/').next())
        .context("empty archive")?
        .to_string();

    let mut tmp = tempfile::Builder::new()
        .prefix("vmod-zip-")
        .suffix(".zip")
        .tempfile_in(tmpdir)?;
    let mut zw = zip::ZipWriter::new(tmp.as_file_mut());
    let opts = zip::write::SimpleFileOptions::default();

    for name in &names {
        if name.ends_with('/') {
            continue;
        }
        let Some(rel) = name.strip_prefix(&format!("{topdir}/")) else {
            bail!("archive for {prefix} has unexpected file {name}");
        };
        let rel = if strip_subdir.is_empty() {
            rel
        } else {
            match rel.strip_prefix(&format!("{strip_subdir}/")) {
                Some(r) => r,
                None => continue,
            }
        };
        if rel.is_empty() {
            continue;
        }
        let mut entry = z.by_name(name)?;
        zw.start_file(format!("{prefix}/{rel}"), opts)?;
        std::io::copy(&mut entry, &mut zw)?;
    }
    zw.finish()?;
    tmp.flush()?;
    let (_, path) = tmp.keep().context("keeping rewritten zip")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_zip(entries: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.zip");
        let mut zw = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zw.start_file(*name, opts).unwrap();
            zw.write_all(data.as_bytes()).unwrap();
        }
        zw.finish().unwrap();
        (dir, path)
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let mut z = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..z.len())
            .map(|i| z.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rewrite_drops_host_topdir() {
        let (dir, src) = make_zip(&[
            ("owner-repo-abc123/go.mod", "module example.com/m\n"),
            ("owner-repo-abc123/pkg/a.go", "package a\n"),
        ]);
        let out = rewrite_zip(&src, "", "example.com/m@v1.0.0", dir.path()).unwrap();
        assert_eq!(
            zip_names(&out),
            vec![
                "example.com/m@v1.0.0/go.mod".to_string(),
                "example.com/m@v1.0.0/pkg/a.go".to_string(),
            ]
        );
    }

    #[test]
    fn rewrite_keeps_only_subdir() {
        let (dir, src) = make_zip(&[
            ("top/README", "x"),
            ("top/sub/go.mod", "module example.com/r/sub\n"),
            ("top/sub/a.go", "package sub\n"),
        ]);
        let out = rewrite_zip(&src, "sub", "example.com/r/sub@v1.0.0", dir.path()).unwrap();
        assert_eq!(
            zip_names(&out),
            vec![
                "example.com/r/sub@v1.0.0/a.go".to_string(),
                "example.com/r/sub@v1.0.0/go.mod".to_string(),
            ]
        );
    }

    #[test]
    fn rewrite_rejects_stray_entries() {
        let (dir, src) = make_zip(&[("top/a.go", "x"), ("other/b.go", "y")]);
        let err = rewrite_zip(&src, "", "m@v1.0.0", dir.path()).unwrap_err();
        assert!(err.to_string().contains("unexpected file"));
    }
}
