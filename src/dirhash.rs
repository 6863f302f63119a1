// The h1 content hash: a SHA-256 over a sorted per-file digest listing,
// applicable to loose file sets, extracted module trees, and archives.
// The same listing always produces the same hash regardless of platform
// or working directory.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

/// Hash a named file set. Names are sorted in lexical byte order and
/// each contributes the line `<hex(sha256(contents))>  <name>\n`; the
/// result is `h1:` + standard base64 of the SHA-256 of those lines.
pub fn hash1<F, R>(files: &[String], mut open: F) -> anyhow::Result<String>
where
    F: FnMut(&str) -> anyhow::Result<R>,
    R: Read,
{
    let mut names: Vec<&str> = files.iter().map(|s| s.as_str()).collect();
    names.sort_unstable();
    let mut outer = Sha256::new();
    for name in names {
        let mut r = open(name)?;
        let sum = digest_reader(&mut r).with_context(|| format!("hashing {name}"))?;
        outer.update(format!("{}  {}\n", hex::encode(sum), name).as_bytes());
    }
    Ok(format!("h1:{}", BASE64.encode(outer.finalize())))
}

/// Hash the file tree rooted at dir, displaying each file as
/// `<prefix>/<slash-separated relative path>`.
pub fn hash_dir(dir: &Path, prefix: &str) -> anyhow::Result<String> {
    let mut rel = Vec::new();
    walk(dir, "", &mut rel)?;
    let files: Vec<String> = rel.iter().map(|p| format!("{prefix}/{p}")).collect();
    let strip = format!("{prefix}/");
    hash1(&files, |name| {
        let rel = name.strip_prefix(&strip).unwrap_or(name);
        let path = dir.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR));
        fs::File::open(&path).with_context(|| format!("open {}", path.display()))
    })
}

fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> anyhow::Result<()> {
    for ent in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let ent = ent?;
        let name = ent.file_name();
        let name = name.to_string_lossy();
        let child = if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        };
        let p = ent.path();
        if p.is_dir() {
            walk(&p, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

/// Hash a zip archive using the in-archive entry names as display names.
pub fn hash_zip(zipfile: &Path) -> anyhow::Result<String> {
    let f = fs::File::open(zipfile).with_context(|| format!("open {}", zipfile.display()))?;
    let mut z = zip::ZipArchive::new(f).with_context(|| format!("reading {}", zipfile.display()))?;
    let mut names: Vec<String> = (0..z.len())
        .map(|i| Ok(z.by_index(i)?.name().to_string()))
        .collect::<anyhow::Result<_>>()?;
    names.sort_unstable();
    let mut outer = Sha256::new();
    for name in &names {
        let mut entry = z.by_name(name)?;
        let sum = digest_reader(&mut entry).with_context(|| format!("hashing {name}"))?;
        outer.update(format!("{}  {}\n", hex::encode(sum), name).as_bytes());
    }
    Ok(format!("h1:{}", BASE64.encode(outer.finalize())))
}

fn digest_reader(r: &mut impl Read) -> anyhow::Result<[u8; 32]> {
    let mut h = Sha256::new();
    io::copy(r, &mut h)?;
    Ok(h.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn h(s: &str) -> String {
        hex::encode(Sha256::digest(s.as_bytes()))
    }

    fn htop(listing: &str) -> String {
        format!("h1:{}", BASE64.encode(Sha256::digest(listing.as_bytes())))
    }

    #[test]
    fn hash1_sorts_and_matches_reference_listing() {
        let files = vec!["xyz".to_string(), "abc".to_string()];
        let got = hash1(&files, |name| {
            Ok(io::Cursor::new(format!("data for {name}").into_bytes()))
        })
        .unwrap();
        let want = htop(&format!(
            "{}  abc\n{}  xyz\n",
            h("data for abc"),
            h("data for xyz")
        ));
        assert_eq!(got, want);
    }

    #[test]
    fn hash_dir_uses_display_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("xyz"), "data for xyz").unwrap();
        fs::write(dir.path().join("abc"), "data for abc").unwrap();
        let got = hash_dir(dir.path(), "prefix").unwrap();
        let want = htop(&format!(
            "{}  prefix/abc\n{}  prefix/xyz\n",
            h("data for abc"),
            h("data for xyz")
        ));
        assert_eq!(got, want);
    }

    #[test]
    fn hash_zip_matches_hash_dir_listing() {
        let dir = tempfile::tempdir().unwrap();
        let zippath = dir.path().join("m.zip");
        let f = fs::File::create(&zippath).unwrap();
        let mut zw = zip::ZipWriter::new(f);
        let opts = zip::write::SimpleFileOptions::default();
        zw.start_file("prefix/xyz", opts).unwrap();
        zw.write_all(b"data for xyz").unwrap();
        zw.start_file("prefix/abc", opts).unwrap();
        zw.write_all(b"data for abc").unwrap();
        zw.finish().unwrap();

        let got = hash_zip(&zippath).unwrap();
        let want = htop(&format!(
            "{}  prefix/abc\n{}  prefix/xyz\n",
            h("data for abc"),
            h("data for xyz")
        ));
        assert_eq!(got, want);
    }

    #[test]
    fn hash_is_independent_of_insertion_order() {
        let a = hash1(&["b".into(), "a".into()], |n| {
            Ok(io::Cursor::new(n.as_bytes().to_vec()))
        })
        .unwrap();
        let b = hash1(&["a".into(), "b".into()], |n| {
            Ok(io::Cursor::new(n.as_bytes().to_vec()))
        })
        .unwrap();
        assert_eq!(a, b);
    }
}
