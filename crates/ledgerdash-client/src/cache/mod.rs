//! Per-domain entity caches with TTL freshness and optimistic writes.
//!
//! One generic [`EntityCache`] is instantiated per domain (deals, invoices,
//! briefs, ...). Reads are served from memory while the entry is fresh under
//! its [`TtlClass`]; writes are applied optimistically and rolled back if the
//! server rejects them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RequestOptions;
use crate::clock::{Clock, SystemClock};
use crate::error::{ApiError, ApiResult};

mod entry;
mod mutation;
mod registry;
mod source;
mod ttl;
mod value;

pub use entry::CacheEntry;
pub use mutation::{MutationKind, MutationRecord};
pub use registry::{CacheRegistry, Invalidate};
pub use source::{Entity, EntitySource, Filters, ListQuery, Page, Pagination, RestSource};
pub use ttl::TtlClass;
pub use value::{RestValue, ValueCache, ValueSource};

use mutation::{CacheState, FetchMode, RollbackGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Name of a cached domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(&'static str);

impl Domain {
    pub const DEALS: Domain = Domain("deals");
    pub const INVOICES: Domain = Domain("invoices");
    pub const BRIEFS: Domain = Domain("briefs");
    pub const CLIENTS: Domain = Domain("clients");
    pub const DASHBOARD: Domain = Domain("dashboard");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Options for one fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Bypass the TTL check.
    pub force: bool,
    /// A cancelled fetch leaves the cache untouched.
    pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct Inner<E: Entity, S> {
    domain: Domain,
    ttl: TtlClass,
    source: S,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState<E>>,
    registry: Mutex<Option<CacheRegistry>>,
}

impl<E: Entity, S: Send + Sync> Invalidate for Inner<E, S> {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn invalidate(&self) {
        lock(&self.state).entry.last_fetch = None;
        debug!(domain = %self.domain, "cache invalidated");
    }

    fn reset(&self) {
        lock(&self.state).reset();
        debug!(domain = %self.domain, "cache reset");
    }
}

/// Clears `is_loading` for a fetch that never reached the apply step
/// (error, cancellation, or the future being dropped).
struct LoadingGuard<'a, E: Entity> {
    state: &'a Mutex<CacheState<E>>,
    armed: bool,
}

impl<'a, E: Entity> LoadingGuard<'a, E> {
    fn new(state: &'a Mutex<CacheState<E>>) -> Self {
        Self { state, armed: true }
    }

    fn finish(mut self, state: &mut CacheState<E>) {
        self.armed = false;
        state.end_fetch();
    }
}

impl<E: Entity> Drop for LoadingGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.state).end_fetch();
        }
    }
}

/// Cache for one entity domain.
///
/// Cheap to clone; clones share state.
pub struct EntityCache<E: Entity, S> {
    inner: Arc<Inner<E, S>>,
}

impl<E: Entity, S> Clone for EntityCache<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity, S> fmt::Debug for EntityCache<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("EntityCache")
            .field("domain", &self.inner.domain)
            .field("ttl", &self.inner.ttl)
            .field("len", &state.entry.len())
            .field("last_fetch", &state.entry.last_fetch)
            .field("is_loading", &state.entry.is_loading)
            .finish()
    }
}

impl<E: Entity, S: EntitySource<E> + 'static> EntityCache<E, S> {
    pub fn new(domain: Domain, ttl: TtlClass, source: S) -> Self {
        Self::with_clock(domain, ttl, source, Arc::new(SystemClock))
    }

    pub fn with_clock(domain: Domain, ttl: TtlClass, source: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                domain,
                ttl,
                source,
                clock,
                state: Mutex::new(CacheState::default()),
                registry: Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    pub fn ttl(&self) -> TtlClass {
        self.inner.ttl
    }

    /// Invalidation handle for a [`CacheRegistry`].
    pub fn handle(&self) -> Arc<dyn Invalidate> {
        self.inner.clone()
    }

    /// Register with `registry`; successful writes then invalidate the
    /// domains linked as dependents of this one.
    pub fn register(&self, registry: &CacheRegistry) {
        registry.register(&self.handle());
        *lock(&self.inner.registry) = Some(registry.clone());
    }

    /// Cached list while fresh, otherwise fetched.
    pub async fn fetch(&self, force: bool) -> ApiResult<Vec<E>> {
        self.fetch_with(FetchOptions {
            force,
            cancel: None,
        })
        .await
    }

    pub async fn fetch_with(&self, options: FetchOptions) -> ApiResult<Vec<E>> {
        let domain = self.inner.domain;
        let (ticket, query) = {
            let mut state = lock(&self.inner.state);
            let now = self.inner.clock.now();
            if !options.force && self.inner.ttl.is_fresh(state.entry.last_fetch, now) {
                debug!(domain = %domain, "cache hit");
                return Ok(state.entry.list.clone());
            }
            (state.begin_fetch(), state.entry.query())
        };

        debug!(domain = %domain, page = query.page, force = options.force, "fetching");
        let loading = LoadingGuard::new(&self.inner.state);
        let request = RequestOptions {
            retry_safe: true,
            cancel: options.cancel,
        };
        let result = self.inner.source.list(&query, &request).await;

        let mut state = lock(&self.inner.state);
        loading.finish(&mut state);
        match result {
            Ok(page) => {
                let count = page.items.len();
                if state.apply_fetch(ticket, page, self.inner.clock.now(), FetchMode::Replace) {
                    debug!(domain = %domain, count, "fetch applied");
                }
                Ok(state.entry.list.clone())
            }
            Err(ApiError::Cancelled) => {
                debug!(domain = %domain, "fetch cancelled");
                Err(ApiError::Cancelled)
            }
            Err(err) => {
                warn!(domain = %domain, error = %err, "fetch failed, keeping cached data");
                state.entry.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Append the next page when the server reported more. Returns the
    /// whole cached list.
    pub async fn fetch_next_page(&self) -> ApiResult<Vec<E>> {
        self.fetch_next_page_with(None).await
    }

    pub async fn fetch_next_page_with(
        &self,
        cancel: Option<CancellationToken>,
    ) -> ApiResult<Vec<E>> {
        let domain = self.inner.domain;
        let (ticket, query) = {
            let mut state = lock(&self.inner.state);
            if !state.entry.pagination.has_more {
                return Ok(state.entry.list.clone());
            }
            let mut query = state.entry.query();
            query.page += 1;
            (state.begin_fetch(), query)
        };

        debug!(domain = %domain, page = query.page, "fetching next page");
        let loading = LoadingGuard::new(&self.inner.state);
        let request = RequestOptions {
            retry_safe: true,
            cancel,
        };
        let result = self.inner.source.list(&query, &request).await;

        let mut state = lock(&self.inner.state);
        loading.finish(&mut state);
        match result {
            Ok(page) => {
                let reported = page.pagination.is_some();
                let now = self.inner.clock.now();
                if state.apply_fetch(ticket, page, now, FetchMode::Append) && !reported {
                    state.entry.pagination.page = query.page;
                }
                Ok(state.entry.list.clone())
            }
            Err(ApiError::Cancelled) => Err(ApiError::Cancelled),
            Err(err) => {
                warn!(domain = %domain, error = %err, "next page failed");
                state.entry.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Replace the filters and go back to the first page. The next fetch
    /// goes to the network.
    pub fn set_filters(&self, filters: Filters) {
        let mut state = lock(&self.inner.state);
        state.entry.filters = filters;
        state.entry.pagination.page = 1;
        state.entry.last_fetch = None;
    }

    pub fn set_page(&self, page: u32) {
        let mut state = lock(&self.inner.state);
        state.entry.pagination.page = page.max(1);
        state.entry.last_fetch = None;
    }

    /// Optimistically prepend `provisional` and persist it. On success the
    /// provisional entity is replaced in place by the server's. Fails with
    /// [`ApiError::InvalidRequest`] when the provisional id is already cached.
    pub async fn create(&self, provisional: E) -> ApiResult<E> {
        let domain = self.inner.domain;
        let record = lock(&self.inner.state).begin_create(provisional.clone())?;
        let guard = RollbackGuard::new(&self.inner.state, record);

        let result = self.inner.source.create(&provisional).await;
        let record = guard.disarm();

        match result {
            Ok(entity) => {
                if let Some(record) = &record {
                    lock(&self.inner.state).commit(record, entity.clone());
                }
                info!(domain = %domain, id = %entity.id(), "created");
                self.written();
                Ok(entity)
            }
            Err(err) => {
                if let Some(record) = &record {
                    lock(&self.inner.state).rollback(record);
                }
                warn!(domain = %domain, error = %err, "create rejected, rolled back");
                Err(err)
            }
        }
    }

    /// Apply `patch` (JSON merge patch) optimistically and persist it. The
    /// local update only happens when `id` is cached.
    pub async fn update(&self, id: &E::Id, patch: Map<String, Value>) -> ApiResult<E> {
        let domain = self.inner.domain;
        let record = lock(&self.inner.state).begin_update(id, &patch)?;
        let guard = record.map(|record| RollbackGuard::new(&self.inner.state, record));

        let result = self.inner.source.update(id, &patch).await;
        let record = guard.and_then(RollbackGuard::disarm);

        match result {
            Ok(entity) => {
                if let Some(record) = &record {
                    lock(&self.inner.state).commit(record, entity.clone());
                }
                debug!(domain = %domain, id = %id, "updated");
                self.written();
                Ok(entity)
            }
            Err(err) => {
                if let Some(record) = &record {
                    lock(&self.inner.state).rollback(record);
                }
                warn!(domain = %domain, id = %id, error = %err, "update rejected, rolled back");
                Err(err)
            }
        }
    }

    /// Delete on the server, then drop the entity locally.
    pub async fn delete(&self, id: &E::Id) -> ApiResult<()> {
        let domain = self.inner.domain;
        if let Err(err) = self.inner.source.delete(id).await {
            warn!(domain = %domain, id = %id, error = %err, "delete rejected");
            return Err(err);
        }

        lock(&self.inner.state).confirm_delete(id);
        info!(domain = %domain, id = %id, "deleted");
        self.written();
        Ok(())
    }

    fn written(&self) {
        let registry = lock(&self.inner.registry).clone();
        if let Some(registry) = registry {
            registry.invalidate_dependents(self.inner.domain);
        }
    }

    /// Mark stale; the next fetch goes to the network.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    /// Drop all cached data.
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn list(&self) -> Vec<E> {
        lock(&self.inner.state).entry.list.clone()
    }

    pub fn get(&self, id: &E::Id) -> Option<E> {
        lock(&self.inner.state).entry.get(id).cloned()
    }

    /// Copy of the whole entry.
    pub fn snapshot(&self) -> CacheEntry<E> {
        lock(&self.inner.state).entry.clone()
    }

    pub fn is_valid(&self) -> bool {
        let last_fetch = lock(&self.inner.state).entry.last_fetch;
        self.inner.ttl.is_fresh(last_fetch, self.inner.clock.now())
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.inner.state).entry.is_loading
    }

    /// Error from the last failed fetch, cleared by the next successful one.
    pub fn error(&self) -> Option<ApiError> {
        lock(&self.inner.state).entry.error.clone()
    }

    pub fn pagination(&self) -> Pagination {
        lock(&self.inner.state).entry.pagination.clone()
    }
}
