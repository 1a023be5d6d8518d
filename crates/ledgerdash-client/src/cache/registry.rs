//! Cross-domain invalidation.
//!
//! Caches register a handle under their domain; dependency edges say which
//! domains go stale when another domain is written (`deals → dashboard`).
//! Handles are held weakly: dropping a cache unregisters it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{lock, Domain};

/// Invalidation surface shared by every cache kind.
pub trait Invalidate: Send + Sync {
    fn domain(&self) -> Domain;

    /// Clear `last_fetch`; data stays readable until the next fetch.
    fn invalidate(&self);

    /// Drop all cached data.
    fn reset(&self);
}

#[derive(Default)]
struct RegistryInner {
    handles: BTreeMap<Domain, Weak<dyn Invalidate>>,
    edges: BTreeMap<Domain, BTreeSet<Domain>>,
}

/// Domain → cache handle map plus dependency edges.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("CacheRegistry")
            .field("domains", &inner.handles.keys().collect::<Vec<_>>())
            .field("edges", &inner.edges)
            .finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under its domain, replacing any previous handle.
    pub fn register(&self, handle: &Arc<dyn Invalidate>) {
        let domain = handle.domain();
        lock(&self.inner).handles.insert(domain, Arc::downgrade(handle));
        debug!(domain = %domain, "cache registered");
    }

    /// Writes to `source` invalidate `dependent`.
    pub fn link(&self, source: Domain, dependent: Domain) {
        lock(&self.inner)
            .edges
            .entry(source)
            .or_default()
            .insert(dependent);
    }

    /// Registered domains with a live cache.
    pub fn domains(&self) -> Vec<Domain> {
        lock(&self.inner)
            .handles
            .iter()
            .filter(|(_, handle)| handle.strong_count() > 0)
            .map(|(domain, _)| *domain)
            .collect()
    }

    /// Every domain reachable from `source` through dependency edges.
    pub fn dependents_of(&self, source: Domain) -> Vec<Domain> {
        let inner = lock(&self.inner);
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([source]);

        while let Some(domain) = queue.pop_front() {
            for next in inner.edges.get(&domain).into_iter().flatten() {
                if *next != source && seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Invalidate the named domains, or every registered domain when
    /// `domains` is empty.
    pub fn invalidate(&self, domains: &[Domain]) {
        let targets = self.resolve(domains);
        debug!(count = targets.len(), "invalidating caches");
        for handle in targets {
            handle.invalidate();
        }
    }

    pub fn invalidate_all(&self) {
        self.invalidate(&[]);
    }

    /// Reset every registered cache (logout).
    pub fn reset_all(&self) {
        for handle in self.resolve(&[]) {
            handle.reset();
        }
    }

    pub(crate) fn invalidate_dependents(&self, source: Domain) {
        let dependents = self.dependents_of(source);
        if !dependents.is_empty() {
            debug!(domain = %source, ?dependents, "write invalidates dependents");
            self.invalidate(&dependents);
        }
    }

    fn resolve(&self, domains: &[Domain]) -> Vec<Arc<dyn Invalidate>> {
        let mut inner = lock(&self.inner);
        inner.handles.retain(|_, handle| handle.strong_count() > 0);
        inner
            .handles
            .iter()
            .filter(|(domain, _)| domains.is_empty() || domains.contains(domain))
            .filter_map(|(_, handle)| handle.upgrade())
            .collect()
    }
}
