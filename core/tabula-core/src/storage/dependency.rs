//! Cache dependency graph
//!
//! Directed edges `dependent -> source`: when `source` is invalidated every
//! dependent is invalidated too, transitively. Both directions are indexed.
//! Cycles are tolerated; the traversal tracks visited keys and is bounded
//! by a maximum depth.

use crate::storage::cache::CacheKey;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

/// Outcome of a cascade walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cascade {
    /// Dependents reached, in breadth-first order; the start key is excluded
    pub keys: Vec<CacheKey>,
    /// True when the depth bound stopped the walk before it was exhausted
    pub truncated: bool,
}

#[derive(Default)]
struct Indexes {
    /// dependent -> sources
    forward: HashMap<CacheKey, HashSet<CacheKey>>,
    /// source -> dependents
    reverse: HashMap<CacheKey, HashSet<CacheKey>>,
}

#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<Indexes>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` must be invalidated whenever `source` is.
    ///
    /// Returns `true` if the new edge closes a cycle. The edge is kept either way.
    pub fn add_dependency(&self, dependent: CacheKey, source: CacheKey) -> bool {
        let mut inner = self.inner.write();
        let closes_cycle = source == dependent || reaches(&inner.reverse, &dependent, &source);
        if closes_cycle {
            tracing::warn!(source = %source, dependent = %dependent, "cache dependency closes a cycle");
        }
        inner
            .forward
            .entry(dependent.clone())
            .or_default()
            .insert(source.clone());
        inner.reverse.entry(source).or_default().insert(dependent);
        closes_cycle
    }

    /// Direct dependents of `source`, sorted.
    pub fn dependents(&self, source: &CacheKey) -> Vec<CacheKey> {
        sorted(self.inner.read().reverse.get(source))
    }

    /// Direct sources of `dependent`, sorted.
    pub fn sources(&self, dependent: &CacheKey) -> Vec<CacheKey> {
        sorted(self.inner.read().forward.get(dependent))
    }

    /// Walk dependents of `start` breadth-first, at most `max_depth` edges away.
    pub fn cascade(&self, start: &CacheKey, max_depth: usize) -> Cascade {
        let inner = self.inner.read();
        let edges = &inner.reverse;
        let mut visited: HashSet<&CacheKey> = HashSet::new();
        visited.insert(start);
        let mut queue: VecDeque<(&CacheKey, usize)> = VecDeque::new();
        queue.push_back((start, 0));
        let mut result = Cascade::default();

        while let Some((key, depth)) = queue.pop_front() {
            let Some(next) = edges.get(key) else {
                continue;
            };
            let mut next: Vec<&CacheKey> = next.iter().filter(|k| !visited.contains(k)).collect();
            if next.is_empty() {
                continue;
            }
            if depth >= max_depth {
                result.truncated = true;
                continue;
            }
            next.sort();
            for dependent in next {
                if visited.insert(dependent) {
                    result.keys.push(dependent.clone());
                    queue.push_back((dependent, depth + 1));
                }
            }
        }
        result
    }

    /// Drop every edge touching `key`.
    pub fn remove_key(&self, key: &CacheKey) {
        let mut inner = self.inner.write();
        let Indexes { forward, reverse } = &mut *inner;
        for source in forward.remove(key).unwrap_or_default() {
            detach(reverse, &source, key);
        }
        for dependent in reverse.remove(key).unwrap_or_default() {
            detach(forward, &dependent, key);
        }
    }

    /// Drop every edge with an endpoint belonging to `tenant`.
    pub fn remove_tenant(&self, tenant: &str) {
        let mut inner = self.inner.write();
        let Indexes { forward, reverse } = &mut *inner;
        for index in [forward, reverse] {
            index.retain(|key, others| {
                others.retain(|other| other.tenant != tenant);
                key.tenant != tenant && !others.is_empty()
            });
        }
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.inner.read().reverse.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted(set: Option<&HashSet<CacheKey>>) -> Vec<CacheKey> {
    let mut out: Vec<CacheKey> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    out.sort();
    out
}

fn detach(index: &mut HashMap<CacheKey, HashSet<CacheKey>>, key: &CacheKey, other: &CacheKey) {
    if let Some(set) = index.get_mut(key) {
        set.remove(other);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

// Iterative DFS over the reverse index.
fn reaches(edges: &HashMap<CacheKey, HashSet<CacheKey>>, from: &CacheKey, to: &CacheKey) -> bool {
    let mut stack = vec![from];
    let mut seen: HashSet<&CacheKey> = HashSet::new();
    while let Some(key) = stack.pop() {
        if key == to {
            return true;
        }
        if !seen.insert(key) {
            continue;
        }
        if let Some(next) = edges.get(key) {
            stack.extend(next.iter());
        }
    }
    false
}
