// Purpose: The go.sum ledger: record and enforce h1 hashes for every fetched artifact.
// Inputs/Outputs: Loads go.sum (+ transitional go.modverify), checks artifacts, flushes sorted.
// Invariants: Entries are only ever added; a mismatch against a stored h1 line is fatal.
// Gotchas: When no go.sum exists the ledger still collects hashes but verifies nothing.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::dirhash;
use crate::module::{self, ModuleVersion};

pub struct Ledger {
    file: PathBuf,
    modverify: Option<PathBuf>,
    enabled: bool,
    entries: HashMap<ModuleVersion, Vec<String>>,
}

impl Ledger {
    /// Load the ledger next to the root manifest. A sibling
    /// go.modverify left by older tooling is merged and deleted on the
    /// next successful write.
    pub fn load(file: &Path) -> anyhow::Result<Ledger> {
        let mut ledger = Ledger {
            file: file.to_path_buf(),
            modverify: None,
            enabled: false,
            entries: HashMap::new(),
        };
        match std::fs::read_to_string(file) {
            Ok(data) => {
                ledger.enabled = true;
                ledger.merge(&file.display().to_string(), &data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("read {}", file.display())),
        }
        if ledger.enabled {
            let alt = file.with_extension("modverify");
            if let Ok(data) = std::fs::read_to_string(&alt) {
                ledger.merge(&alt.display().to_string(), &data)?;
                ledger.modverify = Some(alt);
            }
        }
        Ok(ledger)
    }

    fn merge(&mut self, name: &str, data: &str) -> anyhow::Result<()> {
        for (lineno, line) in data.lines().enumerate() {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.is_empty() {
                continue;
            }
            if f.len() != 3 {
                bail!(
                    "malformed go.sum:\n{name}:{}: wrong number of fields {}",
                    lineno + 1,
                    f.len()
                );
            }
            let key = ModuleVersion::new(f[0], f[1]);
            let hashes = self.entries.entry(key).or_default();
            if !hashes.iter().any(|h| h == f[2]) {
                hashes.push(f[2].to_string());
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Turn verification on even without a pre-existing go.sum, so the
    /// collected hashes are flushed as a seed file.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Check one artifact hash against the ledger. Unknown keys are
    /// recorded; a conflicting h1 line is a fatal mismatch and is never
    /// auto-corrected.
    pub fn check(&mut self, mv: &ModuleVersion, h: &str) -> anyhow::Result<()> {
        let stored = self.entries.entry(mv.clone()).or_default();
        for vh in stored.iter() {
            if vh == h {
                return Ok(());
            }
            if vh.starts_with("h1:") && self.enabled {
                bail!(
                    "verifying {mv}: checksum mismatch\n\tdownloaded: {h}\n\tgo.sum:     {vh}"
                );
            }
        }
        if !stored.is_empty() && self.enabled {
            eprintln!(
                "warning: verifying {mv}: unknown hashes in go.sum: {}; adding {h}",
                stored.join(", ")
            );
        }
        stored.push(h.to_string());
        Ok(())
    }

    /// Check a manifest blob under the `<version>/go.mod` key.
    pub fn check_manifest(
        &mut self,
        path: &str,
        version: &str,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let h = dirhash::hash1(&["go.mod".to_string()], |_| Ok(Cursor::new(data.to_vec())))?;
        self.check(&ModuleVersion::new(path, format!("{version}/go.mod")), &h)
    }

    /// The stored hash set for a key, if any.
    pub fn sums(&self, mv: &ModuleVersion) -> Option<&[String]> {
        self.entries.get(mv).map(|v| v.as_slice())
    }

    /// Flush the ledger sorted by path, version, hash. The file is only
    /// rewritten when its content would change; a migrated go.modverify
    /// is deleted afterwards.
    pub fn write(&mut self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut keys: Vec<ModuleVersion> = self
            .entries
            .iter()
            .filter(|(_, hs)| !hs.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        module::sort(&mut keys);
        let mut buf = String::new();
        for k in &keys {
            let mut hashes = self.entries[k].clone();
            hashes.sort();
            for h in hashes {
                buf.push_str(&format!("{} {} {h}\n", k.path, k.version));
            }
        }
        let old = std::fs::read_to_string(&self.file).unwrap_or_default();
        if old != buf {
            std::fs::write(&self.file, &buf)
                .with_context(|| format!("writing {}", self.file.display()))?;
        }
        if let Some(alt) = self.modverify.take() {
            let _ = std::fs::remove_file(alt);
        }
        Ok(())
    }
}
