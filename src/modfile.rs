// Purpose: Parse and re-emit the module manifest and apply structured edits to it.
// Inputs/Outputs: go.mod text in, typed require/exclude/replace sections out, and back.
// Invariants: Require entries unique by path; excludes by (path, version); replaces by old pair.
// Gotchas: Formatting is deterministic; comments survive re-serialization, so edits must keep them.

use std::path::Path;

use anyhow::bail;

use crate::module::ModuleVersion;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Require {
    pub mv: ModuleVersion,
    pub indirect: bool,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exclude {
    pub mv: ModuleVersion,
    pub comment: Option<String>,
}

/// A replacement directive. `old.version` empty matches every version
/// of the path; `new.version` empty means `new.path` is a filesystem
/// directory relative to the module root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Replace {
    pub old: ModuleVersion,
    pub new: ModuleVersion,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ModFile {
    /// Full-line comments before the module statement. The legacy
    /// converter stores its provenance marker here.
    pub leading_comments: Vec<String>,
    pub module: String,
    pub require: Vec<Require>,
    pub exclude: Vec<Exclude>,
    pub replace: Vec<Replace>,
}

impl ModFile {
    pub fn new() -> Self {
        ModFile::default()
    }

    /// Parse manifest text. `name` is used in error positions
    /// (`name:line:col: message`).
    pub fn parse(name: &str, text: &str) -> anyhow::Result<Self> {
        let mut f = ModFile::new();
        let mut block: Option<&'static str> = None;
        let mut before_module = true;
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let (code, comment) = split_comment(raw);
            let code = code.trim();
            if code.is_empty() {
                if before_module
                    && let Some(c) = comment
                {
                    f.leading_comments.push(c.to_string());
                }
                continue;
            }
            let toks = tokenize(name, lineno, code)?;
            if let Some(kind) = block {
                if toks.len() == 1 && toks[0] == ")" {
                    block = None;
                    continue;
                }
                f.add_entry(name, lineno, kind, &toks, comment)?;
                continue;
            }
            match toks[0].as_str() {
                "module" => {
                    if toks.len() != 2 {
                        bail!("{name}:{lineno}:1: usage: module path");
                    }
                    f.module = toks[1].clone();
                    before_module = false;
                }
                kw @ ("require" | "exclude" | "replace") => {
                    before_module = false;
                    let kw: &'static str = match kw {
                        "require" => "require",
                        "exclude" => "exclude",
                        _ => "replace",
                    };
                    if toks.len() == 2 && toks[1] == "(" {
                        block = Some(kw);
                        continue;
                    }
                    f.add_entry(name, lineno, kw, &toks[1..], comment)?;
                }
                other => {
                    bail!("{name}:{lineno}:1: unknown directive: {other}");
                }
            }
        }
        if let Some(kind) = block {
            bail!("{name}: unclosed {kind} block");
        }
        Ok(f)
    }

    pub fn parse_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        ModFile::parse(&path.display().to_string(), &text)
    }

    fn add_entry(
        &mut self,
        name: &str,
        lineno: usize,
        kind: &str,
        toks: &[String],
        comment: Option<&str>,
    ) -> anyhow::Result<()> {
        match kind {
            "require" | "exclude" => {
                if toks.len() != 2 {
                    bail!("{name}:{lineno}:1: usage: {kind} module/path v1.2.3");
                }
                let mv = ModuleVersion::new(&toks[0], &toks[1]);
                if kind == "require" {
                    let indirect = comment.is_some_and(|c| c.trim() == "indirect");
                    let comment = comment
                        .filter(|c| c.trim() != "indirect")
                        .map(|c| c.to_string());
                    self.require.push(Require {
                        mv,
                        indirect,
                        comment,
                    });
                } else {
                    self.exclude.push(Exclude {
                        mv,
                        comment: comment.map(|c| c.to_string()),
                    });
                }
            }
            "replace" => {
                let arrow = toks.iter().position(|t| t == "=>");
                let Some(arrow) = arrow else {
                    bail!("{name}:{lineno}:1: replace is missing =>");
                };
                let (old, new) = (&toks[..arrow], &toks[arrow + 1..]);
                let parse_side = |side: &[String]| -> anyhow::Result<ModuleVersion> {
                    match side {
                        [p] => Ok(ModuleVersion::new(p, "")),
                        [p, v] => Ok(ModuleVersion::new(p, v)),
                        _ => bail!(
                            "{name}:{lineno}:1: usage: replace module/path [v1.2.3] => other/path [v1.4.5]"
                        ),
                    }
                };
                let old = parse_side(old)?;
                let new = parse_side(new)?;
                if new.version.is_empty() && !is_directory_path(&new.path) {
                    bail!(
                        "{name}:{lineno}:1: replacement module without version must be directory path (rooted or starting with ./ or ../)"
                    );
                }
                if !new.version.is_empty() && is_directory_path(&new.path) {
                    bail!("{name}:{lineno}:1: replacement directory must not have version");
                }
                self.replace.push(Replace {
                    old,
                    new,
                    comment: comment.map(|c| c.to_string()),
                });
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    pub fn add_module(&mut self, path: &str) {
        self.module = path.to_string();
    }

    /// Replace the require section wholesale, preserving indirect marks
    /// and comments of entries that survive.
    pub fn set_require(&mut self, list: &[ModuleVersion]) {
        let old = std::mem::take(&mut self.require);
        self.require = list
            .iter()
            .map(|mv| {
                let prev = old.iter().find(|r| r.mv.path == mv.path);
                Require {
                    mv: mv.clone(),
                    indirect: prev.map(|r| r.indirect).unwrap_or(false),
                    comment: prev.and_then(|r| r.comment.clone()),
                }
            })
            .collect();
    }

    /// Update the version of an existing requirement, or append one.
    pub fn add_require(&mut self, path: &str, version: &str) {
        for r in &mut self.require {
            if r.mv.path == path {
                r.mv.version = version.to_string();
                return;
            }
        }
        self.add_new_require(path, version);
    }

    pub fn add_new_require(&mut self, path: &str, version: &str) {
        self.require.push(Require {
            mv: ModuleVersion::new(path, version),
            indirect: false,
            comment: None,
        });
    }

    pub fn drop_require(&mut self, path: &str) {
        self.require.retain(|r| r.mv.path != path);
    }

    pub fn add_exclude(&mut self, path: &str, version: &str) {
        let mv = ModuleVersion::new(path, version);
        if self.exclude.iter().any(|x| x.mv == mv) {
            return;
        }
        self.exclude.push(Exclude { mv, comment: None });
    }

    pub fn drop_exclude(&mut self, path: &str, version: &str) {
        self.exclude
            .retain(|x| !(x.mv.path == path && x.mv.version == version));
    }

    pub fn add_replace(
        &mut self,
        old_path: &str,
        old_version: &str,
        new_path: &str,
        new_version: &str,
    ) -> anyhow::Result<()> {
        if new_version.is_empty() && !is_directory_path(new_path) {
            bail!("replacement module without version must be directory path");
        }
        if !new_version.is_empty() && is_directory_path(new_path) {
            bail!("replacement directory must not have version");
        }
        let rep = Replace {
            old: ModuleVersion::new(old_path, old_version),
            new: ModuleVersion::new(new_path, new_version),
            comment: None,
        };
        for r in &mut self.replace {
            if r.old == rep.old {
                *r = rep;
                return Ok(());
            }
        }
        self.replace.push(rep);
        Ok(())
    }

    pub fn drop_replace(&mut self, old_path: &str, old_version: &str) {
        self.replace
            .retain(|r| !(r.old.path == old_path && r.old.version == old_version));
    }

    /// The replacement for mod from this manifest, if any. A later
    /// matching directive wins; an old version of "" matches any
    /// version of the path.
    pub fn replacement(&self, mv: &ModuleVersion) -> Option<&Replace> {
        let mut found = None;
        for r in &self.replace {
            if r.old.path == mv.path && (r.old.version.is_empty() || r.old.version == mv.version) {
                found = Some(r);
            }
        }
        found
    }

    /// Drop duplicate entries: requires unique by path, excludes by
    /// (path, version), replaces by (old path, old version); the last
    /// occurrence wins.
    pub fn cleanup(&mut self) {
        dedup_by_key(&mut self.require, |r| r.mv.path.clone());
        dedup_by_key(&mut self.exclude, |x| x.mv.clone());
        dedup_by_key(&mut self.replace, |r| r.old.clone());
    }

    /// Canonical text form: module line first, then require, exclude,
    /// replace sections, each a single line or a block as count demands.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for c in &self.leading_comments {
            out.push_str("//");
            out.push_str(c);
            out.push('\n');
        }
        out.push_str(&format!("module {}\n", quote_if_needed(&self.module)));

        let reqs: Vec<String> = self
            .require
            .iter()
            .map(|r| {
                let mut line = format!(
                    "{} {}",
                    quote_if_needed(&r.mv.path),
                    quote_if_needed(&r.mv.version)
                );
                if r.indirect {
                    line.push_str(" // indirect");
                } else if let Some(c) = &r.comment {
                    line.push_str(" //");
                    line.push_str(c);
                }
                line
            })
            .collect();
        emit_section(&mut out, "require", &reqs);

        let excludes: Vec<String> = self
            .exclude
            .iter()
            .map(|x| {
                let mut line = format!(
                    "{} {}",
                    quote_if_needed(&x.mv.path),
                    quote_if_needed(&x.mv.version)
                );
                if let Some(c) = &x.comment {
                    line.push_str(" //");
                    line.push_str(c);
                }
                line
            })
            .collect();
        emit_section(&mut out, "exclude", &excludes);

        let replaces: Vec<String> = self
            .replace
            .iter()
            .map(|r| {
                let mut line = quote_if_needed(&r.old.path);
                if !r.old.version.is_empty() {
                    line.push(' ');
                    line.push_str(&quote_if_needed(&r.old.version));
                }
                line.push_str(" => ");
                line.push_str(&quote_if_needed(&r.new.path));
                if !r.new.version.is_empty() {
                    line.push(' ');
                    line.push_str(&quote_if_needed(&r.new.version));
                }
                if let Some(c) = &r.comment {
                    line.push_str(" //");
                    line.push_str(c);
                }
                line
            })
            .collect();
        emit_section(&mut out, "replace", &replaces);

        out
    }
}

fn dedup_by_key<T, K: Eq + std::hash::Hash>(list: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut last: std::collections::HashMap<K, usize> = std::collections::HashMap::new();
    for (i, item) in list.iter().enumerate() {
        last.insert(key(item), i);
    }
    let mut i = 0;
    list.retain(|item| {
        let keep = last[&key(item)] == i;
        i += 1;
        keep
    });
}

fn emit_section(out: &mut String, kw: &str, lines: &[String]) {
    match lines {
        [] => {}
        [one] => {
            out.push('\n');
            out.push_str(&format!("{kw} {one}\n"));
        }
        many => {
            out.push('\n');
            out.push_str(&format!("{kw} (\n"));
            for line in many {
                out.push_str(&format!("\t{line}\n"));
            }
            out.push_str(")\n");
        }
    }
}

fn is_directory_path(p: &str) -> bool {
    p.starts_with("./") || p.starts_with("../") || p.starts_with('/') || p.starts_with("..")
}

/// Whether a token must be double-quoted when emitted.
pub fn must_quote(t: &str) -> bool {
    if t.is_empty() || t.contains("//") || t.contains("/*") || t.contains("*/") {
        return true;
    }
    t.chars().any(|c| {
        c.is_control()
            || c.is_whitespace()
            || matches!(
                c,
                '"' | '\'' | '`' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | ','
            )
    })
}

fn quote_if_needed(t: &str) -> String {
    if must_quote(t) {
        format!("{t:?}")
    } else {
        t.to_string()
    }
}

// Split a raw line into its code part and the text after "//" (quotes
// respected).
fn split_comment(line: &str) -> (&str, Option<&str>) {
    let bytes = line.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quote = !in_quote,
            b'/' if !in_quote && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                return (&line[..i], Some(&line[i + 2..]));
            }
            _ => {}
        }
        i += 1;
    }
    (line, None)
}

fn tokenize(name: &str, lineno: usize, code: &str) -> anyhow::Result<Vec<String>> {
    let mut toks = Vec::new();
    let mut chars = code.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            for (_, c) in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                s.push(c);
            }
            if !closed {
                bail!("{name}:{lineno}:{}: unterminated quoted string", i + 1);
            }
            toks.push(s);
            continue;
        }
        let mut s = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            s.push(c);
            chars.next();
        }
        toks.push(s);
    }
    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"module example.com/hello

require (
	example.com/a v1.0.0
	example.com/b v1.2.3 // indirect
	"example.com/odd,path" v0.1.0
)

exclude example.com/a v0.9.0

replace (
	example.com/a v1.0.0 => example.com/a-fork v1.0.1
	example.com/local => ./vendor-local
)
"#;

    #[test]
    fn parse_blocks_and_lines() {
        let f = ModFile::parse("go.mod", SAMPLE).unwrap();
        assert_eq!(f.module, "example.com/hello");
        assert_eq!(f.require.len(), 3);
        assert!(f.require[1].indirect);
        assert_eq!(f.require[2].mv.path, "example.com/odd,path");
        assert_eq!(f.exclude.len(), 1);
        assert_eq!(f.replace.len(), 2);
        assert_eq!(f.replace[1].new.path, "./vendor-local");
        assert_eq!(f.replace[1].new.version, "");
    }

    #[test]
    fn single_line_and_block_forms_are_equivalent() {
        let a = ModFile::parse(
            "go.mod",
            "module m\nrequire example.com/a v1.0.0\n",
        )
        .unwrap();
        let b = ModFile::parse(
            "go.mod",
            "module m\nrequire (\n\texample.com/a v1.0.0\n)\n",
        )
        .unwrap();
        assert_eq!(a.require, b.require);
    }

    #[test]
    fn format_round_trip_is_stable() {
        let f = ModFile::parse("go.mod", SAMPLE).unwrap();
        let text = f.format();
        let g = ModFile::parse("go.mod", &text).unwrap();
        assert_eq!(f.module, g.module);
        assert_eq!(f.require, g.require);
        assert_eq!(f.exclude, g.exclude);
        assert_eq!(f.replace, g.replace);
        assert_eq!(text, g.format());
    }

    #[test]
    fn indirect_marker_survives_set_require() {
        let mut f = ModFile::parse("go.mod", SAMPLE).unwrap();
        f.set_require(&[
            ModuleVersion::new("example.com/b", "v1.3.0"),
            ModuleVersion::new("example.com/c", "v0.1.0"),
        ]);
        assert_eq!(f.require.len(), 2);
        assert!(f.require[0].indirect);
        assert_eq!(f.require[0].mv.version, "v1.3.0");
        assert!(!f.require[1].indirect);
    }

    #[test]
    fn structured_edits() {
        let mut f = ModFile::new();
        f.add_module("example.com/m");
        f.add_require("example.com/a", "v1.0.0");
        f.add_require("example.com/a", "v1.1.0");
        assert_eq!(f.require.len(), 1);
        assert_eq!(f.require[0].mv.version, "v1.1.0");
        f.add_new_require("example.com/a", "v1.2.0");
        f.cleanup();
        assert_eq!(f.require.len(), 1);
        assert_eq!(f.require[0].mv.version, "v1.2.0");
        f.drop_require("example.com/a");
        assert!(f.require.is_empty());

        f.add_exclude("example.com/x", "v0.2.0");
        f.add_exclude("example.com/x", "v0.2.0");
        assert_eq!(f.exclude.len(), 1);
        f.drop_exclude("example.com/x", "v0.2.0");
        assert!(f.exclude.is_empty());

        f.add_replace("example.com/x", "", "./x", "").unwrap();
        assert!(f.add_replace("example.com/x", "", "example.com/y", "").is_err());
        f.add_replace("example.com/x", "", "example.com/y", "v1.0.0")
            .unwrap();
        assert_eq!(f.replace.len(), 1);
        assert_eq!(f.replace[0].new.path, "example.com/y");
        f.drop_replace("example.com/x", "");
        assert!(f.replace.is_empty());
    }

    #[test]
    fn replacement_lookup_prefers_specific_and_last() {
        let mut f = ModFile::new();
        f.add_replace("example.com/a", "", "./a", "").unwrap();
        f.add_replace("example.com/a", "v1.0.0", "example.com/b", "v1.0.1")
            .unwrap();
        let r = f
            .replacement(&ModuleVersion::new("example.com/a", "v1.0.0"))
            .unwrap();
        assert_eq!(r.new.path, "example.com/b");
        let r = f
            .replacement(&ModuleVersion::new("example.com/a", "v2.0.0"))
            .unwrap();
        assert_eq!(r.new.path, "./a");
    }

    #[test]
    fn quoting_rules() {
        assert!(must_quote(""));
        assert!(must_quote("has space"));
        assert!(must_quote("a,b"));
        assert!(must_quote("x//y"));
        assert!(!must_quote("example.com/ok-path_v2"));
        let mut f = ModFile::new();
        f.add_module("example.com/odd,path");
        assert!(f.format().starts_with("module \"example.com/odd,path\"\n"));
    }

    #[test]
    fn leading_comment_is_preserved(){
        let text = "// converted by vmod from Gopkg.lock\nmodule m\n";
        let f = ModFile::parse("go.mod", text).unwrap();
        assert_eq!(f.leading_comments.len(), 1);
        assert!(f.format().starts_with("// converted by vmod from Gopkg.lock\nmodule m\n"));
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = ModFile::parse("go.mod", "module m\nfrobnicate x\n").unwrap_err();
        assert!(err.to_string().contains("go.mod:2:1"));
        let err = ModFile::parse("go.mod", "module m\nrequire (\n\ta v1.0.0\n").unwrap_err();
        assert!(err.to_string().contains("unclosed require block"));
    }
}
