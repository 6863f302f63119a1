// Purpose: Minimal version selection over an abstract requirement graph.
// Inputs/Outputs: A target module plus a Reqs oracle; produces path-unique build lists.
// Invariants: Pure and deterministic; maxima are commutative so traversal order never matters.
// Gotchas: The oracle injects all I/O. The sentinel version "none" means "not required".

use std::collections::{HashMap, HashSet};

use anyhow::bail;

use crate::module::ModuleVersion;

/// Version sentinel marking a module as not required.
pub const NONE: &str = "none";

/// The requirement oracle injected into the selection algorithms.
/// Implementations perform whatever I/O is needed; the algorithms here
/// stay pure.
pub trait Reqs {
    /// Direct requirements of m. For the target this is the manifest's
    /// require list; for all other modules the list must be complete
    /// and stable for the duration of one operation.
    fn required(&self, m: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>>;

    /// The larger of two versions of the same path. "none" orders below
    /// every version.
    fn max(&self, v1: &str, v2: &str) -> String;

    /// The preferred upgrade target for m (its latest allowed version,
    /// never older than m itself).
    fn upgrade(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion>;

    /// The next version of m.path strictly before m.version, or "none".
    fn previous(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion>;
}

/// The build list for target: target first, then for every other path
/// reached through the requirement graph the maximum demanded version,
/// sorted by path.
pub fn build_list<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    reqs: &R,
) -> anyhow::Result<Vec<ModuleVersion>> {
    build_list_with(target, reqs, None)
}

fn build_list_with<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    reqs: &R,
    upgrade: Option<&dyn Fn(&ModuleVersion) -> anyhow::Result<ModuleVersion>>,
) -> anyhow::Result<Vec<ModuleVersion>> {
    let mut min: HashMap<String, String> = HashMap::new();
    min.insert(target.path.clone(), target.version.clone());
    let mut seen: HashSet<ModuleVersion> = HashSet::new();
    seen.insert(target.clone());
    let mut todo = vec![target.clone()];

    while let Some(m) = todo.pop() {
        for r in reqs.required(&m)? {
            let r = match upgrade {
                Some(up) if r.path != target.path => up(&r)?,
                _ => r,
            };
            if r.version == NONE {
                continue;
            }
            if r.path == target.path {
                if reqs.max(&r.version, &target.version) != target.version {
                    bail!(
                        "{} requires {}@{}, but the target is {}@{}",
                        m,
                        r.path,
                        r.version,
                        target.path,
                        target.version
                    );
                }
                continue;
            }
            let cur = min.get(&r.path);
            if cur.is_none_or(|v| reqs.max(v, &r.version) != *v) {
                min.insert(r.path.clone(), r.version.clone());
            }
            if seen.insert(r.clone()) {
                todo.push(r);
            }
        }
    }

    let mut rest: Vec<ModuleVersion> = min
        .into_iter()
        .filter(|(p, _)| *p != target.path)
        .map(|(p, v)| ModuleVersion::new(p, v))
        .collect();
    rest.sort_by(|a, b| a.path.cmp(&b.path));
    let mut list = Vec::with_capacity(rest.len() + 1);
    list.push(target.clone());
    list.extend(rest);
    Ok(list)
}

/// Build list after raising specific modules: each addition competes
/// with the target's existing requirements under max.
pub fn upgrade<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    reqs: &R,
    additions: &[ModuleVersion],
) -> anyhow::Result<Vec<ModuleVersion>> {
    let mut list = reqs.required(target)?;
    list.extend(additions.iter().cloned());
    let over = Override {
        target: target.clone(),
        list,
        reqs,
    };
    build_list(target, &over)
}

/// Build list with every module in the graph lifted to its upgrade
/// target (the oracle guarantees an upgrade is never a downgrade, so
/// chronologically newer pseudo-versions survive).
pub fn upgrade_all<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    reqs: &R,
) -> anyhow::Result<Vec<ModuleVersion>> {
    build_list_with(target, reqs, Some(&|m: &ModuleVersion| reqs.upgrade(m)))
}

/// The minimal requirement list for target that reproduces `list`
/// exactly under build_list: transitively implied entries are dropped,
/// entries pinning indirect dependencies are kept.
pub fn req<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    list: &[ModuleVersion],
    reqs: &R,
) -> anyhow::Result<Vec<ModuleVersion>> {
    let mut cache: HashMap<ModuleVersion, Vec<ModuleVersion>> = HashMap::new();
    cache.insert(target.clone(), Vec::new());
    let mut postorder: Vec<ModuleVersion> = Vec::new();
    for m in list {
        walk_postorder(m, reqs, &mut cache, &mut postorder)?;
    }

    let mut max: HashMap<&str, &str> = HashMap::new();
    for m in list {
        max.insert(&m.path, &m.version);
    }

    let mut have: HashSet<ModuleVersion> = HashSet::new();
    let mut min: Vec<ModuleVersion> = Vec::new();
    for m in postorder.iter().rev() {
        if max.get(m.path.as_str()) != Some(&m.version.as_str()) {
            // A superseded version; the selected one carries the path.
            continue;
        }
        if !have.contains(m) {
            min.push(m.clone());
            mark_implied(m, &cache, &mut have);
        }
    }
    min.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(min)
}

fn walk_postorder<R: Reqs + ?Sized>(
    m: &ModuleVersion,
    reqs: &R,
    cache: &mut HashMap<ModuleVersion, Vec<ModuleVersion>>,
    postorder: &mut Vec<ModuleVersion>,
) -> anyhow::Result<()> {
    if cache.contains_key(m) {
        return Ok(());
    }
    let required = reqs.required(m)?;
    cache.insert(m.clone(), required.clone());
    for r in &required {
        if r.version == NONE {
            continue;
        }
        walk_postorder(r, reqs, cache, postorder)?;
    }
    postorder.push(m.clone());
    Ok(())
}

fn mark_implied(
    m: &ModuleVersion,
    cache: &HashMap<ModuleVersion, Vec<ModuleVersion>>,
    have: &mut HashSet<ModuleVersion>,
) {
    if !have.insert(m.clone()) {
        return;
    }
    if let Some(required) = cache.get(m) {
        for r in required {
            mark_implied(r, cache, have);
        }
    }
}

/// Reduce the target's requirements so no forbidden version survives:
/// each removal (path, cap) caps that path at cap ("none" removes it),
/// and any requirement whose closure would violate a cap is replaced by
/// its previous version until the closure is consistent.
pub fn downgrade<R: Reqs + ?Sized>(
    target: &ModuleVersion,
    reqs: &R,
    removals: &[ModuleVersion],
) -> anyhow::Result<Vec<ModuleVersion>> {
    let list = reqs.required(target)?;
    let mut max: HashMap<String, String> = HashMap::new();
    for r in &list {
        max.insert(r.path.clone(), r.version.clone());
    }
    for d in removals {
        let cur = max.get(&d.path);
        if cur.is_none_or(|v| reqs.max(v, &d.version) != d.version) {
            max.insert(d.path.clone(), d.version.clone());
        }
    }

    let mut st = DowngradeState {
        reqs,
        max,
        added: HashSet::new(),
        rdeps: HashMap::new(),
        excluded: HashSet::new(),
    };

    let mut out = vec![target.clone()];
    'list: for r in list {
        st.add(&r)?;
        let mut r = r;
        while st.excluded.contains(&r) {
            let p = st.reqs.previous(&r)?;
            if p.version == NONE {
                continue 'list;
            }
            st.add(&p)?;
            r = p;
        }
        out.push(r);
    }
    Ok(out)
}

struct DowngradeState<'a, R: Reqs + ?Sized> {
    reqs: &'a R,
    max: HashMap<String, String>,
    added: HashSet<ModuleVersion>,
    rdeps: HashMap<ModuleVersion, Vec<ModuleVersion>>,
    excluded: HashSet<ModuleVersion>,
}

impl<R: Reqs + ?Sized> DowngradeState<'_, R> {
    fn add(&mut self, m: &ModuleVersion) -> anyhow::Result<()> {
        if !self.added.insert(m.clone()) {
            return Ok(());
        }
        let over_cap = match self.max.get(&m.path) {
            Some(cap) => self.reqs.max(&m.version, cap) != *cap,
            None => false,
        };
        if over_cap {
            self.exclude(m);
            return Ok(());
        }
        for r in self.reqs.required(m)? {
            if r.version == NONE {
                continue;
            }
            self.add(&r)?;
            if self.excluded.contains(&r) {
                self.exclude(m);
                return Ok(());
            }
            self.rdeps.entry(r).or_default().push(m.clone());
        }
        Ok(())
    }

    fn exclude(&mut self, m: &ModuleVersion) {
        if !self.excluded.insert(m.clone()) {
            return;
        }
        if let Some(parents) = self.rdeps.get(m).cloned() {
            for p in parents {
                self.exclude(&p);
            }
        }
    }
}

/// A Reqs view whose target requirement list is replaced, delegating
/// everything else. Used by upgrade and by callers that re-run
/// selection against a previously computed list.
pub struct Override<'a, R: Reqs + ?Sized> {
    pub target: ModuleVersion,
    pub list: Vec<ModuleVersion>,
    pub reqs: &'a R,
}

impl<R: Reqs + ?Sized> Reqs for Override<'_, R> {
    fn required(&self, m: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>> {
        if m.path == self.target.path {
            return Ok(self.list.clone());
        }
        self.reqs.required(m)
    }

    fn max(&self, v1: &str, v2: &str) -> String {
        self.reqs.max(v1, v2)
    }

    fn upgrade(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
        self.reqs.upgrade(m)
    }

    fn previous(&self, m: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
        self.reqs.previous(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semver;
    use std::cmp::Ordering;

    fn m(path: &str, version: &str) -> ModuleVersion {
        ModuleVersion::new(path, version)
    }

    struct TestReqs {
        graph: HashMap<ModuleVersion, Vec<ModuleVersion>>,
        versions: HashMap<String, Vec<String>>,
        latest: HashMap<String, String>,
    }

    impl TestReqs {
        fn new(edges: &[(&str, &str, &[(&str, &str)])]) -> Self {
            let mut graph = HashMap::new();
            let mut versions: HashMap<String, Vec<String>> = HashMap::new();
            for (path, version, deps) in edges {
                let deps = deps
                    .iter()
                    .map(|(p, v)| m(p, v))
                    .collect::<Vec<ModuleVersion>>();
                graph.insert(m(path, version), deps);
                versions
                    .entry(path.to_string())
                    .or_default()
                    .push(version.to_string());
            }
            for list in versions.values_mut() {
                semver::sort(list);
                list.dedup();
            }
            TestReqs {
                graph,
                versions,
                latest: HashMap::new(),
            }
        }
    }

    impl Reqs for TestReqs {
        fn required(&self, mv: &ModuleVersion) -> anyhow::Result<Vec<ModuleVersion>> {
            Ok(self.graph.get(mv).cloned().unwrap_or_default())
        }

        fn max(&self, v1: &str, v2: &str) -> String {
            if v1 == NONE {
                return v2.to_string();
            }
            if v2 == NONE {
                return v1.to_string();
            }
            semver::max(v1, v2).to_string()
        }

        fn upgrade(&self, mv: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
            match self.latest.get(&mv.path) {
                Some(v) if semver::compare(v, &mv.version) == Ordering::Greater => {
                    Ok(m(&mv.path, v))
                }
                _ => Ok(mv.clone()),
            }
        }

        fn previous(&self, mv: &ModuleVersion) -> anyhow::Result<ModuleVersion> {
            if let Some(list) = self.versions.get(&mv.path) {
                for v in list.iter().rev() {
                    if semver::compare(v, &mv.version) == Ordering::Less {
                        return Ok(m(&mv.path, v));
                    }
                }
            }
            Ok(m(&mv.path, NONE))
        }
    }

    fn blog_graph() -> TestReqs {
        TestReqs::new(&[
            ("a", "v1.0.0", &[("b", "v1.2.0"), ("c", "v1.2.0")]),
            ("b", "v1.1.0", &[("d", "v1.1.0")]),
            ("b", "v1.2.0", &[("d", "v1.3.0")]),
            ("c", "v1.1.0", &[]),
            ("c", "v1.2.0", &[("d", "v1.4.0")]),
            ("c", "v1.3.0", &[("f", "v1.1.0")]),
            ("d", "v1.1.0", &[("e", "v1.1.0")]),
            ("d", "v1.2.0", &[("e", "v1.1.0")]),
            ("d", "v1.3.0", &[("e", "v1.2.0")]),
            ("d", "v1.4.0", &[("e", "v1.2.0")]),
            ("e", "v1.1.0", &[]),
            ("e", "v1.2.0", &[]),
            ("e", "v1.3.0", &[]),
            ("f", "v1.1.0", &[("g", "v1.1.0")]),
            ("g", "v1.1.0", &[]),
        ])
    }

    #[test]
    fn build_list_selects_maxima() {
        let reqs = blog_graph();
        let list = build_list(&m("a", "v1.0.0"), &reqs).unwrap();
        assert_eq!(
            list,
            vec![
                m("a", "v1.0.0"),
                m("b", "v1.2.0"),
                m("c", "v1.2.0"),
                m("d", "v1.4.0"),
                m("e", "v1.2.0"),
            ]
        );
    }

    #[test]
    fn build_list_is_idempotent() {
        let reqs = blog_graph();
        let target = m("a", "v1.0.0");
        let list = build_list(&target, &reqs).unwrap();
        let over = Override {
            target: target.clone(),
            list: list[1..].to_vec(),
            reqs: &reqs,
        };
        assert_eq!(build_list(&target, &over).unwrap(), list);
    }

    #[test]
    fn upgrade_is_monotonic() {
        let reqs = blog_graph();
        let target = m("a", "v1.0.0");
        let before = build_list(&target, &reqs).unwrap();
        let after = upgrade(&target, &reqs, &[m("c", "v1.3.0")]).unwrap();
        for mv in &before[1..] {
            let new = after.iter().find(|n| n.path == mv.path).unwrap();
            assert_ne!(
                semver::compare(&new.version, &mv.version),
                Ordering::Less,
                "{} downgraded by upgrade",
                mv.path
            );
        }
        // The raised module pulls in its own new requirements.
        assert!(after.contains(&m("c", "v1.3.0")));
        assert!(after.contains(&m("f", "v1.1.0")));
        assert!(after.contains(&m("g", "v1.1.0")));
    }

    #[test]
    fn upgrade_all_lifts_to_latest() {
        let mut reqs = blog_graph();
        reqs.latest.insert("e".to_string(), "v1.3.0".to_string());
        reqs.latest.insert("c".to_string(), "v1.3.0".to_string());
        let list = upgrade_all(&m("a", "v1.0.0"), &reqs).unwrap();
        assert!(list.contains(&m("e", "v1.3.0")));
        assert!(list.contains(&m("c", "v1.3.0")));
        assert!(list.contains(&m("f", "v1.1.0")));
    }

    #[test]
    fn req_round_trips_through_build_list() {
        let reqs = blog_graph();
        let target = m("a", "v1.0.0");
        let list = upgrade(&target, &reqs, &[m("e", "v1.3.0")]).unwrap();
        let min = req(&target, &list, &reqs).unwrap();
        // e v1.3.0 is not implied by b or c, so it must be pinned.
        assert!(min.contains(&m("e", "v1.3.0")));
        let over = Override {
            target: target.clone(),
            list: min,
            reqs: &reqs,
        };
        assert_eq!(build_list(&target, &over).unwrap(), list);
    }

    #[test]
    fn req_drops_implied_requirements() {
        let reqs = blog_graph();
        let target = m("a", "v1.0.0");
        let list = build_list(&target, &reqs).unwrap();
        let min = req(&target, &list, &reqs).unwrap();
        assert_eq!(min, vec![m("b", "v1.2.0"), m("c", "v1.2.0")]);
    }

    #[test]
    fn downgrade_propagates_through_dependents() {
        // root -> a v1.5.0 -> b v1.5.2 -> c v1.3.0
        // a v1.2.0 -> b v1.0.0 -> c v1.0.0
        let reqs = TestReqs::new(&[
            ("root", "v1.0.0", &[("a", "v1.5.0")]),
            ("a", "v1.5.0", &[("b", "v1.5.2")]),
            ("a", "v1.2.0", &[("b", "v1.0.0")]),
            ("b", "v1.5.2", &[("c", "v1.3.0")]),
            ("b", "v1.0.0", &[("c", "v1.0.0")]),
            ("c", "v1.3.0", &[]),
            ("c", "v1.0.0", &[]),
        ]);
        let target = m("root", "v1.0.0");
        let down = downgrade(&target, &reqs, &[m("a", "v1.2.0")]).unwrap();
        let over = Override {
            target: target.clone(),
            list: down[1..].to_vec(),
            reqs: &reqs,
        };
        let list = build_list(&target, &over).unwrap();
        assert_eq!(
            list,
            vec![
                m("root", "v1.0.0"),
                m("a", "v1.2.0"),
                m("b", "v1.0.0"),
                m("c", "v1.0.0"),
            ]
        );
    }

    #[test]
    fn downgrade_to_none_removes_module() {
        let reqs = TestReqs::new(&[
            ("root", "v1.0.0", &[("a", "v1.0.0"), ("b", "v1.0.0")]),
            ("a", "v1.0.0", &[]),
            ("b", "v1.0.0", &[]),
        ]);
        let target = m("root", "v1.0.0");
        let down = downgrade(&target, &reqs, &[m("a", NONE)]).unwrap();
        assert_eq!(down, vec![m("root", "v1.0.0"), m("b", "v1.0.0")]);
    }

    #[test]
    fn build_list_rejects_newer_target_requirement() {
        let reqs = TestReqs::new(&[
            ("root", "v1.0.0", &[("a", "v1.0.0")]),
            ("a", "v1.0.0", &[("root", "v1.1.0")]),
        ]);
        let err = build_list(&m("root", "v1.0.0"), &reqs).unwrap_err();
        assert!(err.to_string().contains("requires root@v1.1.0"));
    }

    #[test]
    fn build_list_is_order_independent() {
        let forward = blog_graph();
        let reversed = TestReqs::new(&[
            ("a", "v1.0.0", &[("c", "v1.2.0"), ("b", "v1.2.0")]),
            ("b", "v1.2.0", &[("d", "v1.3.0")]),
            ("c", "v1.2.0", &[("d", "v1.4.0")]),
            ("d", "v1.3.0", &[("e", "v1.2.0")]),
            ("d", "v1.4.0", &[("e", "v1.2.0")]),
            ("e", "v1.2.0", &[]),
        ]);
        assert_eq!(
            build_list(&m("a", "v1.0.0"), &forward).unwrap(),
            build_list(&m("a", "v1.0.0"), &reversed).unwrap()
        );
    }
}
