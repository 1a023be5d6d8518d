//! Single-value TTL cache for derived aggregates (dashboard totals).
//!
//! Aggregates are never recomputed locally: writes to the domains they
//! depend on invalidate them and the next read refetches.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::client::{ApiClient, ApiRequest, RequestOptions};
use crate::clock::{Clock, SystemClock};
use crate::error::{ApiError, ApiResult};

use super::{lock, CacheRegistry, Domain, FetchOptions, Invalidate, TtlClass};

/// Loads one aggregate value.
#[async_trait]
pub trait ValueSource<T>: Send + Sync {
    async fn load(&self, options: &RequestOptions) -> ApiResult<T>;
}

/// `GET <path>` through the pipeline.
pub struct RestValue<T> {
    client: ApiClient,
    path: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> RestValue<T> {
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RestValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestValue").field("path", &self.path).finish()
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> ValueSource<T> for RestValue<T> {
    async fn load(&self, options: &RequestOptions) -> ApiResult<T> {
        self.client
            .send(ApiRequest::get(&self.path), options.clone())
            .await
    }
}

struct ValueState<T> {
    value: Option<T>,
    last_fetch: Option<DateTime<Utc>>,
    error: Option<ApiError>,
    fetch_seq: u64,
    applied_fetch: u64,
    in_flight: usize,
}

impl<T> Default for ValueState<T> {
    fn default() -> Self {
        Self {
            value: None,
            last_fetch: None,
            error: None,
            fetch_seq: 0,
            applied_fetch: 0,
            in_flight: 0,
        }
    }
}

struct ValueInner<T, S> {
    domain: Domain,
    ttl: TtlClass,
    source: S,
    clock: Arc<dyn Clock>,
    state: Mutex<ValueState<T>>,
}

impl<T: Send, S: Send + Sync> Invalidate for ValueInner<T, S> {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn invalidate(&self) {
        lock(&self.state).last_fetch = None;
        debug!(domain = %self.domain, "value invalidated");
    }

    fn reset(&self) {
        let mut state = lock(&self.state);
        state.value = None;
        state.last_fetch = None;
        state.error = None;
        // Fetches started before the reset are discarded when they land.
        state.applied_fetch = state.fetch_seq + 1;
        debug!(domain = %self.domain, "value reset");
    }
}

struct InFlight<'a, T> {
    state: &'a Mutex<ValueState<T>>,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// TTL cache for a single value.
pub struct ValueCache<T, S> {
    inner: Arc<ValueInner<T, S>>,
}

impl<T, S> Clone for ValueCache<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> fmt::Debug for ValueCache<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ValueCache")
            .field("domain", &self.inner.domain)
            .field("ttl", &self.inner.ttl)
            .field("cached", &state.value.is_some())
            .field("last_fetch", &state.last_fetch)
            .finish()
    }
}

impl<T, S> ValueCache<T, S>
where
    T: Clone + Send + 'static,
    S: ValueSource<T> + 'static,
{
    pub fn new(domain: Domain, ttl: TtlClass, source: S) -> Self {
        Self::with_clock(domain, ttl, source, Arc::new(SystemClock))
    }

    pub fn with_clock(domain: Domain, ttl: TtlClass, source: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                domain,
                ttl,
                source,
                clock,
                state: Mutex::new(ValueState::default()),
            }),
        }
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    pub fn handle(&self) -> Arc<dyn Invalidate> {
        self.inner.clone()
    }

    pub fn register(&self, registry: &CacheRegistry) {
        registry.register(&self.handle());
    }

    pub async fn fetch(&self, force: bool) -> ApiResult<T> {
        self.fetch_with(FetchOptions {
            force,
            cancel: None,
        })
        .await
    }

    pub async fn fetch_with(&self, options: FetchOptions) -> ApiResult<T> {
        let domain = self.inner.domain;
        let seq = {
            let mut state = lock(&self.inner.state);
            let now = self.inner.clock.now();
            if !options.force && self.inner.ttl.is_fresh(state.last_fetch, now) {
                if let Some(value) = &state.value {
                    debug!(domain = %domain, "value cache hit");
                    return Ok(value.clone());
                }
            }
            state.fetch_seq += 1;
            state.in_flight += 1;
            state.fetch_seq
        };

        let in_flight = InFlight {
            state: &self.inner.state,
        };
        let request = RequestOptions {
            retry_safe: true,
            cancel: options.cancel,
        };
        let result = self.inner.source.load(&request).await;
        drop(in_flight);

        let mut state = lock(&self.inner.state);
        match result {
            Ok(value) => {
                if seq >= state.applied_fetch {
                    state.applied_fetch = seq;
                    state.value = Some(value.clone());
                    state.last_fetch = Some(self.inner.clock.now());
                    state.error = None;
                } else {
                    debug!(domain = %domain, seq, "discarding stale value");
                }
                Ok(value)
            }
            Err(ApiError::Cancelled) => Err(ApiError::Cancelled),
            Err(err) => {
                warn!(domain = %domain, error = %err, "value fetch failed");
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.inner.state).value.clone()
    }

    pub fn is_valid(&self) -> bool {
        let last_fetch = lock(&self.inner.state).last_fetch;
        self.inner.ttl.is_fresh(last_fetch, self.inner.clock.now())
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.inner.state).in_flight > 0
    }

    pub fn error(&self) -> Option<ApiError> {
        lock(&self.inner.state).error.clone()
    }

    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub fn reset(&self) {
        self.inner.reset();
    }
}
