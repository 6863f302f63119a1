// Purpose: Semantic-version predicates used by selection, queries, and tag filtering.
// Inputs/Outputs: Operates on `v`-prefixed semver strings; returns canonical forms and orderings.
// Invariants: Invalid versions order before all valid versions; build metadata never affects order.
// Gotchas: Pseudo-versions are plain prereleases here; the encoded timestamp drives their order.

use std::cmp::Ordering;

#[derive(Debug, Default)]
struct Parsed {
    major: String,
    minor: String,
    patch: String,
    prerelease: String,
    #[allow(dead_code)]
    build: String,
}

pub fn is_valid(v: &str) -> bool {
    parse(v).is_some()
}

/// Canonical form of v: vMAJOR.MINOR.PATCH with missing parts padded
/// with zeros and build metadata dropped. Empty string if v is invalid.
pub fn canonical(v: &str) -> String {
    let Some(p) = parse(v) else {
        return String::new();
    };
    let mut out = format!("v{}.{}.{}", p.major, p.minor, p.patch);
    out.push_str(&p.prerelease);
    out
}

pub fn major(v: &str) -> String {
    match parse(v) {
        Some(p) => format!("v{}", p.major),
        None => String::new(),
    }
}

/// Prerelease part of v including the leading dash, or "" if none.
pub fn prerelease(v: &str) -> String {
    match parse(v) {
        Some(p) => p.prerelease,
        None => String::new(),
    }
}

/// Three-way comparison following Semantic Versioning 2.0.0.
/// An invalid version compares less than every valid version;
/// two invalid versions compare equal.
pub fn compare(v: &str, w: &str) -> Ordering {
    let pv = parse(v);
    let pw = parse(w);
    match (pv, pw) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(pv), Some(pw)) => {
            let c = compare_int(&pv.major, &pw.major);
            if c != Ordering::Equal {
                return c;
            }
            let c = compare_int(&pv.minor, &pw.minor);
            if c != Ordering::Equal {
                return c;
            }
            let c = compare_int(&pv.patch, &pw.patch);
            if c != Ordering::Equal {
                return c;
            }
            compare_prerelease(&pv.prerelease, &pw.prerelease)
        }
    }
}

pub fn max<'a>(v: &'a str, w: &'a str) -> &'a str {
    if compare(v, w) == Ordering::Less { w } else { v }
}

fn parse(v: &str) -> Option<Parsed> {
    let rest = v.strip_prefix('v')?;
    let (major, rest) = parse_int(rest)?;
    let mut p = Parsed {
        major: major.to_string(),
        minor: "0".to_string(),
        patch: "0".to_string(),
        ..Parsed::default()
    };
    // Short forms vN and vN.M are padded with zeros; prerelease and
    // build sections are only legal after a full vN.M.P.
    let rest = match rest.strip_prefix('.') {
        None => return if rest.is_empty() { Some(p) } else { None },
        Some(rest) => rest,
    };
    let (minor, rest) = parse_int(rest)?;
    p.minor = minor.to_string();
    let rest = match rest.strip_prefix('.') {
        None => return if rest.is_empty() { Some(p) } else { None },
        Some(rest) => rest,
    };
    let (patch, rest) = parse_int(rest)?;
    p.patch = patch.to_string();
    let rest = parse_tail(rest, &mut p)?;
    if rest.is_empty() { Some(p) } else { None }
}

fn parse_tail<'a>(rest: &'a str, p: &mut Parsed) -> Option<&'a str> {
    let rest = if rest.starts_with('-') {
        let (pre, rest) = parse_prerelease(rest)?;
        p.prerelease = pre.to_string();
        rest
    } else {
        rest
    };
    if rest.starts_with('+') {
        let (build, rest) = parse_build(rest)?;
        p.build = build.to_string();
        return Some(rest);
    }
    Some(rest)
}

fn parse_int(s: &str) -> Option<(&str, &str)> {
    let n = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if n == 0 {
        return None;
    }
    // No leading zeros on numeric identifiers.
    if s.as_bytes()[0] == b'0' && n != 1 {
        return None;
    }
    Some((&s[..n], &s[n..]))
}

fn parse_prerelease(s: &str) -> Option<(&str, &str)> {
    // s starts with '-'; identifiers are dot-separated, non-empty,
    // alphanumeric-or-hyphen, and numeric identifiers carry no leading zeros.
    let body = &s[1..];
    let mut end = 0;
    for (i, ident) in split_until_plus(body) {
        if ident.is_empty() || !ident.bytes().all(is_ident_byte) {
            return None;
        }
        if ident.bytes().all(|b| b.is_ascii_digit()) && ident.len() > 1 && ident.starts_with('0') {
            return None;
        }
        end = i + ident.len();
    }
    if end == 0 {
        return None;
    }
    Some((&s[..end + 1], &s[end + 1..]))
}

fn parse_build(s: &str) -> Option<(&str, &str)> {
    let body = &s[1..];
    let mut end = 0;
    for (i, ident) in split_until_plus(body) {
        if ident.is_empty() || !ident.bytes().all(is_ident_byte) {
            return None;
        }
        end = i + ident.len();
    }
    if end == 0 {
        return None;
    }
    Some((&s[..end + 1], &s[end + 1..]))
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

// Yields (offset, identifier) for dot-separated identifiers until the
// string ends or a '+' begins the build section.
fn split_until_plus(body: &str) -> Vec<(usize, &str)> {
    let stop = body.find('+').unwrap_or(body.len());
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in body[..stop].bytes().enumerate() {
        if b == b'.' {
            out.push((start, &body[start..i]));
            start = i + 1;
        }
    }
    out.push((start, &body[start..stop]));
    out
}

fn compare_int(a: &str, b: &str) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    a.cmp(b)
}

fn compare_prerelease(a: &str, b: &str) -> Ordering {
    // A version without prerelease orders after the same base with one.
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    let mut xs = a[1..].split('.');
    let mut ys = b[1..].split('.');
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let xnum = x.bytes().all(|b| b.is_ascii_digit());
                let ynum = y.bytes().all(|b| b.is_ascii_digit());
                let c = match (xnum, ynum) {
                    (true, true) => compare_int(x, y),
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.cmp(y),
                };
                if c != Ordering::Equal {
                    return c;
                }
            }
        }
    }
}

/// Sort a version list ascending in semver order, ties broken by the
/// raw string so the order is total.
pub fn sort(list: &mut [String]) {
    list.sort_by(|a, b| compare(a, b).then_with(|| a.cmp(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_and_canonical_forms() {
        let cases = [
            ("bad", ""),
            ("v1-alpha.beta.gamma", ""),
            ("v1-pre", ""),
            ("v1+meta", ""),
            ("v1-pre+meta", ""),
            ("v1.2-pre", ""),
            ("v1.2+meta", ""),
            ("v1.2-pre+meta", ""),
            ("v1.0.0-alpha", "v1.0.0-alpha"),
            ("v1.0.0-alpha.1", "v1.0.0-alpha.1"),
            ("v1.0.0-alpha.beta", "v1.0.0-alpha.beta"),
            ("v1.0.0-beta", "v1.0.0-beta"),
            ("v1.0.0-beta.2", "v1.0.0-beta.2"),
            ("v1.0.0-beta.11", "v1.0.0-beta.11"),
            ("v1.0.0-rc.1", "v1.0.0-rc.1"),
            ("v1", "v1.0.0"),
            ("v1.0", "v1.0.0"),
            ("v1.0.0", "v1.0.0"),
            ("v1.2", "v1.2.0"),
            ("v1.2.0", "v1.2.0"),
            ("v1.2.3-456", "v1.2.3-456"),
            ("v1.2.3-456.789", "v1.2.3-456.789"),
            ("v1.2.3-456-789", "v1.2.3-456-789"),
            ("v1.2.3-456a", "v1.2.3-456a"),
            ("v1.2.3-pre", "v1.2.3-pre"),
            ("v1.2.3-pre+meta", "v1.2.3-pre"),
            ("v1.2.3-pre.1", "v1.2.3-pre.1"),
            ("v1.2.3-zzz", "v1.2.3-zzz"),
            ("v1.2.3", "v1.2.3"),
            ("v1.2.3+meta", "v1.2.3"),
            ("v1.2.3+meta-pre", "v1.2.3"),
        ];
        for (input, want) in cases {
            assert_eq!(is_valid(input), !want.is_empty(), "is_valid({input})");
            assert_eq!(canonical(input), want, "canonical({input})");
        }
    }

    #[test]
    fn ordering_matches_published_rules() {
        // Listed in ascending order; every adjacent pair must compare Less.
        let ordered = [
            "bad",
            "v0.0.0",
            "v0.0.1",
            "v0.1.0",
            "v1.0.0-alpha",
            "v1.0.0-alpha.1",
            "v1.0.0-alpha.beta",
            "v1.0.0-beta",
            "v1.0.0-beta.2",
            "v1.0.0-beta.11",
            "v1.0.0-rc.1",
            "v1.0.0",
            "v1.2.3-456",
            "v1.2.3-456.789",
            "v1.2.3-456-789",
            "v1.2.3-456a",
            "v1.2.3-pre",
            "v1.2.3-pre.1",
            "v1.2.3-zzz",
            "v1.2.3",
            "v1.2.30",
        ];
        for i in 0..ordered.len() {
            for j in 0..ordered.len() {
                let want = i.cmp(&j);
                assert_eq!(
                    compare(ordered[i], ordered[j]),
                    want,
                    "compare({}, {})",
                    ordered[i],
                    ordered[j]
                );
            }
        }
    }

    #[test]
    fn build_metadata_is_ignored() {
        assert_eq!(compare("v1.2.3+alpha", "v1.2.3+beta"), Ordering::Equal);
        assert_eq!(compare("v1.2.3-pre+zzz", "v1.2.3-pre"), Ordering::Equal);
    }

    #[test]
    fn pseudo_versions_sort_chronologically() {
        let mut list = vec![
            "v1.0.0-20180302235959-ffffffffffff".to_string(),
            "v1.0.0-20170101000000-abcdefabcdef".to_string(),
            "v1.0.0-20180214004520-f488df80bcdb".to_string(),
        ];
        sort(&mut list);
        assert_eq!(
            list,
            vec![
                "v1.0.0-20170101000000-abcdefabcdef",
                "v1.0.0-20180214004520-f488df80bcdb",
                "v1.0.0-20180302235959-ffffffffffff",
            ]
        );
    }

    #[test]
    fn prerelease_and_major_extractors() {
        assert_eq!(prerelease("v1.2.3-pre.1+meta"), "-pre.1");
        assert_eq!(prerelease("v1.2.3"), "");
        assert_eq!(major("v2.1.0"), "v2");
        assert_eq!(major("junk"), "");
    }
}
