// Import extraction from source files. A regex scan stands in for the
// full build-constraint-aware scanner: single import lines, factored
// import blocks, aliased and blank imports. Files named *_test.go feed
// the test import set.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::Regex;

/// Scan the .go files directly inside dir. Returns (imports,
/// test imports), each sorted and deduplicated.
pub fn scan_dir(dir: &Path) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let mut imports = BTreeSet::new();
    let mut test_imports = BTreeSet::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read_dir {}", dir.display()))?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for ent in entries {
        let p = ent.path();
        let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.ends_with(".go") || name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        let src = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
        let found = scan_source(&src);
        if name.ends_with("_test.go") {
            test_imports.extend(found);
        } else {
            imports.extend(found);
        }
    }
    Ok((
        imports.into_iter().collect(),
        test_imports.into_iter().collect(),
    ))
}

/// Imports of one source text.
pub fn scan_source(src: &str) -> Vec<String> {
    let single = Regex::new(r#"(?m)^\s*import\s+(?:[\w.]+\s+|_\s+)?"([^"]+)""#).unwrap();
    let block_open = Regex::new(r"(?m)^\s*import\s*\(").unwrap();
    let quoted = Regex::new(r#"(?m)^\s*(?:[\w.]+\s+|_\s+)?"([^"]+)"\s*(?://.*)?$"#).unwrap();

    let mut out = BTreeSet::new();
    for c in single.captures_iter(src) {
        out.insert(c[1].to_string());
    }
    for m in block_open.find_iter(src) {
        let rest = &src[m.end()..];
        let Some(close) = rest.find(')') else {
            continue;
        };
        for c in quoted.captures_iter(&rest[..close]) {
            out.insert(c[1].to_string());
        }
    }
    out.into_iter().collect()
}

/// Whether the first path element names a standard-library package
/// (no dot means no hosting domain).
pub fn is_standard_import_path(path: &str) -> bool {
    let first = path.split('/').next().unwrap_or(path);
    !first.contains('.')
}

/// Imports that predate URL-like paths and must never reach module
/// resolution.
pub fn is_magic_import(path: &str) -> bool {
    for magic in ["appengine", "appengine_internal"] {
        if path == magic || path.starts_with(&format!("{magic}/")) {
            return true;
        }
    }
    false
}
