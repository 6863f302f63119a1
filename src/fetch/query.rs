// Purpose: Resolve version expressions (exact, range, latest, raw revision) against a Repo.
// Inputs/Outputs: (path, expression, allowed predicate) in; concrete revision metadata out.
// Invariants: With a fixed repository snapshot the result is a pure function of the inputs.
// Gotchas: "latest" prefers releases over prereleases; ranges consider prereleases too.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::bail;
use strsim::jaro_winkler;

use super::Fetcher;
use crate::module::ModuleVersion;
use crate::repo::{Repo, RevInfo};
use crate::semver;

pub type Allowed<'a> = &'a dyn Fn(&ModuleVersion) -> bool;

/// Resolve a version expression for path:
///   - vX.Y.Z        exact (short forms padded with zeros)
///   - >vX.Y.Z       smallest tagged version strictly greater
///   - <vX.Y.Z       largest tagged version strictly less
///   - latest        largest non-prerelease, falling back to prereleases,
///                   falling back to the repository head
///   - anything else an opaque revision for the backend to stat
pub fn query(
    fetcher: &Fetcher,
    path: &str,
    vers: &str,
    allowed: Allowed<'_>,
) -> anyhow::Result<RevInfo> {
    if semver::is_valid(vers) {
        let vers = semver::canonical(vers);
        if !allowed(&ModuleVersion::new(path, &vers)) {
            bail!("{path}@{vers} excluded");
        }
        // Cached metadata avoids resolving the path to a host at all.
        if let Some(info) = fetcher.stat_local(path, &vers) {
            return Ok(info);
        }
    }
    let repo = fetcher.lookup(path)?;
    query_repo(repo.as_ref(), vers, allowed)
}

/// The expression logic against one repository; query() adds the
/// on-disk fast path on top.
pub fn query_repo(repo: &dyn Repo, vers: &str, allowed: Allowed<'_>) -> anyhow::Result<RevInfo> {
    let path = repo.module_path();
    if semver::is_valid(vers) {
        let vers = semver::canonical(vers);
        if !allowed(&ModuleVersion::new(path, &vers)) {
            bail!("{path}@{vers} excluded");
        }
        return repo.stat(&vers);
    }

    if vers == "latest" || vers.starts_with('>') || vers.starts_with('<') {
        let (op, want) = if vers == "latest" {
            ("", "")
        } else {
            let (op, rest) = vers.split_at(1);
            if !semver::is_valid(rest) {
                bail!("invalid semantic version in range {vers}");
            }
            (op, rest)
        };
        let versions = repo.versions("")?;
        if versions.is_empty() && op.is_empty() {
            return repo.latest();
        }
        let ok = |v: &str| allowed(&ModuleVersion::new(path, v));
        match op {
            "" => {
                // Prefer a proper release.
                for v in versions.iter().rev() {
                    if semver::prerelease(v).is_empty() && ok(v) {
                        return repo.stat(v);
                    }
                }
                for v in versions.iter().rev() {
                    if !semver::prerelease(v).is_empty() && ok(v) {
                        return repo.stat(v);
                    }
                }
            }
            "<" => {
                for v in versions.iter().rev() {
                    if semver::compare(v, want) == Ordering::Less && ok(v) {
                        return repo.stat(v);
                    }
                }
            }
            _ => {
                for v in versions.iter() {
                    if semver::compare(v, want) == Ordering::Greater && ok(v) {
                        return repo.stat(v);
                    }
                }
            }
        }
        bail!("no matching versions for {op}{want}");
    }

    match repo.stat(vers) {
        Ok(info) => Ok(info),
        Err(err) => {
            if let Some(tip) = did_you_mean(repo, vers) {
                bail!("{err:#}\nhelp: did you mean {tip:?}?");
            }
            Err(err)
        }
    }
}

fn did_you_mean(repo: &dyn Repo, rev: &str) -> Option<String> {
    let versions = repo.versions("").ok()?;
    let mut best: Option<(&String, f64)> = None;
    for v in &versions {
        let score = jaro_winkler(rev, v);
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((v, score));
        }
    }
    match best {
        Some((v, score)) if score >= 0.84 => Some(v.clone()),
        _ => None,
    }
}

/// Resolve an import path to the module that provides it: starting
/// from the full path, strip trailing segments until some prefix hosts
/// a module whose latest version has a manifest.
pub fn import_repo(
    fetcher: &Fetcher,
    path: &str,
    allowed: Allowed<'_>,
) -> anyhow::Result<(Arc<dyn Repo>, RevInfo)> {
    let mut first_err = None;
    let mut p = path;
    loop {
        match try_import(fetcher, p, allowed) {
            Ok(found) => return Ok(found),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
        match p.rfind('/') {
            Some(i) => p = &p[..i],
            None => break,
        }
    }
    Err(first_err.unwrap())
}

fn try_import(
    fetcher: &Fetcher,
    path: &str,
    allowed: Allowed<'_>,
) -> anyhow::Result<(Arc<dyn Repo>, RevInfo)> {
    let repo = fetcher.lookup(path)?;
    let info = query(fetcher, path, "latest", allowed)?;
    repo.manifest(&info.version)?;
    Ok((repo, info))
}
