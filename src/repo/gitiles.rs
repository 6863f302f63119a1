// Backend for gitiles-style source viewers (*.googlesource.com).
// Listings are plain text, blobs are base64, logs are JSON behind a
// magic prefix line, and archives only come as tar.gz, which this
// backend rewrites into the canonical zip form.

use std::io::{BufRead, BufReader, Read, Seek as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::codehost::{MAX_LICENSE, RevInfo, all_hex, shorten_sha1};
use crate::web::Client;

pub struct GitilesRepo {
    web: Arc<Client>,
    base: String,
    root: String,
}

pub fn lookup(web: &Arc<Client>, path: &str) -> anyhow::Result<GitilesRepo> {
    let Some(i) = path.find('/') else {
        bail!("not *.googlesource.com/*");
    };
    if i + 1 == path.len() || !path[..i + 1].ends_with(".googlesource.com/") {
        bail!("not *.googlesource.com/*");
    }
    // The repository is the first element after the host.
    let root = match path[i + 1..].find('/') {
        Some(j) => &path[..i + 1 + j],
        None => path,
    };
    Ok(lookup_at(web, root, &format!("https://{root}")))
}

pub fn lookup_at(web: &Arc<Client>, root: &str, base: &str) -> GitilesRepo {
    GitilesRepo {
        web: Arc::clone(web),
        base: base.to_string(),
        root: root.to_string(),
    }
}

#[derive(Deserialize)]
struct Log {
    log: Vec<LogEntry>,
}

#[derive(Deserialize)]
struct LogEntry {
    commit: String,
    committer: Signature,
}

#[derive(Deserialize)]
struct Signature {
    time: String,
}

impl GitilesRepo {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tags(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let body = self
            .web
            .get_text(&format!("{}/+refs/tags/?format=TEXT", self.base), MAX_LICENSE)?;
        let want = format!("refs/tags/{prefix}");
        let mut tags = Vec::new();
        for line in body.lines() {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() == 2 && f[0].len() == 40 && f[1].starts_with(&want) {
                tags.push(f[1].trim_start_matches("refs/tags/").to_string());
            }
        }
        Ok(tags)
    }

    pub fn stat(&self, rev: &str) -> anyhow::Result<RevInfo> {
        if !all_hex(rev) || rev.len() != 40 {
            // Branch or tag name: take the tip of its log.
            return self.log_head(rev).map(|mut info| {
                // Record which tag matched, so the module layer can
                // canonicalize it.
                if !all_hex(rev) {
                    info.version = rev.to_string();
                }
                info
            });
        }
        let raw = self
            .web
            .get_body(&format!("{}/+show/{rev}?format=TEXT", self.base), MAX_LICENSE)?;
        let commit = decode_base64(&raw)?;
        for line in commit.lines() {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix("committer ") {
                let f: Vec<&str> = rest.split_whitespace().collect();
                if f.len() >= 2
                    && let Ok(secs) = f[f.len() - 2].parse::<i64>()
                {
                    let time = DateTime::from_timestamp(secs, 0)
                        .context("commit time out of range")?;
                    return Ok(RevInfo {
                        version: String::new(),
                        name: rev.to_string(),
                        short: shorten_sha1(rev),
                        time,
                    });
                }
            }
        }
        bail!("malformed commit: no committer")
    }

    pub fn latest(&self) -> anyhow::Result<RevInfo> {
        self.log_head("HEAD")
    }

    fn log_head(&self, rev: &str) -> anyhow::Result<RevInfo> {
        let url = format!("{}/+log/{rev}?format=JSON&n=2", self.base);
        let raw = self.web.get_body(&url, MAX_LICENSE)?;
        let log: Log = decode_prefixed_json(&raw)?;
        let Some(e) = log.log.first() else {
            bail!("no commits");
        };
        Ok(RevInfo {
            version: String::new(),
            name: e.commit.clone(),
            short: shorten_sha1(&e.commit),
            time: parse_time(&e.committer.time)?,
        })
    }

    pub fn read_file(&self, rev: &str, file: &str, max_size: u64) -> anyhow::Result<Vec<u8>> {
        let raw = self.web.get_body(
            &format!("{}/+show/{rev}/{file}?format=TEXT", self.base),
            max_size * 2,
        )?;
        let data = decode_base64(&raw)?;
        if data.len() as u64 > max_size {
            bail!("{file}: too long");
        }
        Ok(data.into_bytes())
    }

    /// Download `+archive/<rev>[/<subdir>].tar.gz` and repack it as a
    /// zip whose entries live under a single synthetic top directory.
    /// A LICENSE at the repository root is pulled into subdir archives
    /// that lack one.
    pub fn read_zip(
        &self,
        rev: &str,
        subdir: &str,
        tmpdir: &Path,
        max_size: u64,
    ) -> anyhow::Result<(PathBuf, String)> {
        let subdir = subdir.trim_end_matches('/');
        let mut url = format!("{}/+archive/{rev}", self.base);
        if !subdir.is_empty() {
            url.push('/');
            url.push_str(subdir);
        }
        url.push_str(".tar.gz");

        let mut tgz = tempfile::tempfile_in(tmpdir)?;
        self.web.download(&url, &mut tgz, max_size)?;
        tgz.seek(std::io::SeekFrom::Start(0))?;

        let mut tmp = tempfile::Builder::new()
            .prefix("vmod-gitiles-")
            .suffix(".zip")
            .tempfile_in(tmpdir)?;
        let mut zw = zip::ZipWriter::new(tmp.as_file_mut());
        let opts = zip::write::SimpleFileOptions::default();

        let mut remaining = max_size as i64;
        let mut have_license = false;
        let prefix = "gitiles/";
        let mut ar = tar::Archive::new(flate2::read::GzDecoder::new(tgz));
        for entry in ar.entries().context("reading tar.gz archive")? {
            let mut entry = entry?;
            remaining -= 512;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let size = entry.header().size()? as i64;
            remaining -= size;
            if remaining < 0 {
                bail!("module source tree too big");
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            if name == "LICENSE" {
                have_license = true;
            }
            zw.start_file(format!("{prefix}{name}"), opts)?;
            std::io::copy(&mut entry, &mut zw)?;
        }

        if !have_license && !subdir.is_empty() {
            if let Ok(data) = self.read_file(rev, "LICENSE", MAX_LICENSE) {
                zw.start_file(format!("{prefix}LICENSE"), opts)?;
                zw.write_all(&data)?;
            }
        }
        zw.finish()?;
        tmp.flush()?;
        let (_, path) = tmp.keep().context("keeping rewritten zip")?;
        Ok((path, subdir.to_string()))
    }
}

fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    // Gitiles format: "Wed Feb 14 00:45:20 2018 -0800".
    DateTime::parse_from_str(s, "%a %b %d %H:%M:%S %Y %z")
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("parsing commit time {s:?}"))
}

fn decode_base64(raw: &[u8]) -> anyhow::Result<String> {
    use base64::Engine as _;
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let data = base64::engine::general_purpose::STANDARD
        .decode(&compact)
        .context("decoding base64 response")?;
    String::from_utf8(data).context("decoding base64 response")
}

// JSON responses open with a )]}' guard line that must be skipped.
fn decode_prefixed_json<T: serde::de::DeserializeOwned>(raw: &[u8]) -> anyhow::Result<T> {
    let mut r = BufReader::new(raw);
    let mut first = String::new();
    r.read_line(&mut first)?;
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    serde_json::from_slice(&rest).context("decoding log response")
}
