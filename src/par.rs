// Purpose: Concurrency primitives for fetch-heavy phases: single-flight memo and worker set.
// Inputs/Outputs: Keyed closures run at most once; work items fan out over bounded workers.
// Invariants: Concurrent callers of the same key observe the one result, failures included.
// Gotchas: Results must be Clone; fallible work stores SharedError so the error object is stable.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

/// A cloneable error that every blocked caller of a failed single-flight
/// computation receives, wrapping the one underlying failure.
#[derive(Clone, Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        SharedError(Arc::new(err))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {}

/// Keyed single-flight cache: the first caller for a key runs the
/// closure, concurrent callers block on the same cell, and every later
/// caller gets a clone of the stored result.
pub struct Cache<K, V> {
    map: Mutex<HashMap<K, Arc<OnceLock<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new() -> Self {
        Cache {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn do_once(&self, key: K, f: impl FnOnce() -> V) -> V {
        let cell = self
            .map
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();
        cell.get_or_init(f).clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let cell = self.map.lock().unwrap().get(key).cloned()?;
        cell.get().cloned()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Cache::new()
    }
}

/// A deduplicating work queue processed by a bounded worker set.
/// Items may be added while the run is in progress; each distinct item
/// is handed to exactly one worker.
pub struct Work<T> {
    state: Mutex<WorkState<T>>,
    cond: Condvar,
}

struct WorkState<T> {
    added: HashSet<T>,
    todo: Vec<T>,
    running: usize,
}

impl<T: Eq + Hash + Clone + Send> Work<T> {
    pub fn new() -> Self {
        Work {
            state: Mutex::new(WorkState {
                added: HashSet::new(),
                todo: Vec::new(),
                running: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn add(&self, item: T) {
        let mut st = self.state.lock().unwrap();
        if st.added.insert(item.clone()) {
            st.todo.push(item);
            self.cond.notify_one();
        }
    }

    /// Process every queued item with up to `workers` threads, blocking
    /// until the queue drains and no worker can add more.
    pub fn run<F>(&self, workers: usize, f: F)
    where
        F: Fn(T) + Sync,
    {
        let workers = workers.max(1);
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        let item = {
                            let mut st = self.state.lock().unwrap();
                            loop {
                                if let Some(it) = st.todo.pop() {
                                    st.running += 1;
                                    break Some(it);
                                }
                                if st.running == 0 {
                                    break None;
                                }
                                st = self.cond.wait(st).unwrap();
                            }
                        };
                        let Some(item) = item else {
                            // Queue drained with no producer left; wake
                            // the other sleepers so they exit too.
                            self.cond.notify_all();
                            break;
                        };
                        f(item);
                        let mut st = self.state.lock().unwrap();
                        st.running -= 1;
                        if st.running == 0 && st.todo.is_empty() {
                            self.cond.notify_all();
                        }
                    }
                });
            }
        });
    }
}

impl<T: Eq + Hash + Clone + Send> Default for Work<T> {
    fn default() -> Self {
        Work::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cache_runs_closure_once() {
        let cache: Cache<String, usize> = Cache::new();
        let calls = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let got = cache.do_once("k".to_string(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        7usize
                    });
                    assert_eq!(got, 7);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(7));
    }

    #[test]
    fn cache_shares_the_same_failure() {
        let cache: Cache<&'static str, Result<u32, SharedError>> = Cache::new();
        let mk = || Err(SharedError::new(anyhow::anyhow!("lookup failed: boom")));
        let a = cache.do_once("k", mk);
        let b = cache.do_once("k", || panic!("second computation must not run"));
        let ae = a.unwrap_err().to_string();
        let be = b.unwrap_err().to_string();
        assert_eq!(ae, be);
        assert!(ae.contains("lookup failed: boom"));
    }

    #[test]
    fn work_processes_items_added_mid_run() {
        let work: Work<u32> = Work::new();
        for i in 0..5 {
            work.add(i);
        }
        let seen = Mutex::new(Vec::new());
        work.run(4, |item| {
            if item < 5 {
                work.add(item + 100);
            }
            seen.lock().unwrap().push(item);
        });
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4, 100, 101, 102, 103, 104]);
    }

    #[test]
    fn work_deduplicates() {
        let work: Work<&'static str> = Work::new();
        work.add("a");
        work.add("a");
        work.add("b");
        let n = AtomicUsize::new(0);
        work.run(2, |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(n.load(Ordering::SeqCst), 2);
    }
}
