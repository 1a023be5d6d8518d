//! Single-flight access token renewal.
//!
//! When many requests fail with 401 at once, exactly one renewal call is
//! made. The first caller moves the coordinator from `Idle` to `Refreshing`
//! and starts the renewal; every later caller is queued as a waiter and
//! receives the outcome of that same call.
//!
//! ```text
//! Idle ──401──▶ Refreshing ──ok──▶ Idle (new pair stored, waiters resolved)
//!                    │
//!                    └────err──▶ Idle (credentials cleared, waiters rejected)
//! ```
//!
//! The renewal itself runs on a spawned task. Callers only hold the
//! receiving half of a oneshot channel, so a caller that is cancelled or
//! dropped never leaves the coordinator stuck in `Refreshing`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::helpers::{classify_failure, decode_payload};
use crate::credentials::CredentialStore;
use crate::envelope::{RenewalRequest, TokenPair};
use crate::error::{ApiError, ApiResult};

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait TokenRenewer: Send + Sync + std::fmt::Debug {
    async fn renew(&self, refresh_token: &str) -> ApiResult<TokenPair>;
}

/// Renewal over HTTP: `POST <base><refresh_path>` with `{refreshToken}`.
///
/// Uses the bare reqwest client, never the request pipeline, so a 401 from
/// the renewal endpoint cannot trigger another renewal.
#[derive(Debug, Clone)]
pub struct HttpRenewer {
    client: reqwest::Client,
    url: String,
}

impl HttpRenewer {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenRenewer for HttpRenewer {
    async fn renew(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        debug!(url = %self.url, "requesting token renewal");

        let response = self
            .client
            .post(&self.url)
            .json(&RenewalRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| ApiError::Network {
            message: format!("failed to read renewal response: {}", e),
        })?;

        if !status.is_success() {
            return Err(classify_failure(status, &headers, &body));
        }

        decode_payload(&body)
    }
}

/// Observable coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Idle,
    Refreshing,
}

type Waiter = oneshot::Sender<ApiResult<String>>;

enum RenewalState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

struct Inner {
    state: Mutex<RenewalState>,
    renewer: Arc<dyn TokenRenewer>,
    credentials: CredentialStore,
    renewals: AtomicUsize,
}

/// Owns the renewal state and the waiter queue.
///
/// Clones share state; inject one instance per session.
#[derive(Clone)]
pub struct RenewalCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RenewalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalCoordinator")
            .field("phase", &self.phase())
            .field("pending_waiters", &self.pending_waiters())
            .field("renewals", &self.renewals_started())
            .finish()
    }
}

impl RenewalCoordinator {
    pub fn new(renewer: Arc<dyn TokenRenewer>, credentials: CredentialStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RenewalState::Idle),
                renewer,
                credentials,
                renewals: AtomicUsize::new(0),
            }),
        }
    }

    /// Obtain a usable access token after a request was rejected with 401.
    ///
    /// `rejected_token` is the token the failed request carried. If the store
    /// already holds a different one (a renewal completed meanwhile), it is
    /// returned without another renewal.
    pub async fn acquire(&self, rejected_token: Option<&str>) -> ApiResult<String> {
        let rx = {
            let mut state = self.inner.lock_state();
            match &mut *state {
                RenewalState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(waiters = waiters.len(), "queued behind in-flight renewal");
                    rx
                }
                RenewalState::Idle => {
                    if let Some(current) = self.inner.credentials.access_token() {
                        if rejected_token != Some(current.as_str()) {
                            debug!("token already renewed, replaying with stored token");
                            return Ok(current);
                        }
                    }

                    let Some(refresh_token) = self.inner.credentials.refresh_token() else {
                        drop(state);
                        self.inner.clear_credentials();
                        return Err(ApiError::unauthenticated("no refresh token available"));
                    };

                    let (tx, rx) = oneshot::channel();
                    *state = RenewalState::Refreshing { waiters: vec![tx] };
                    drop(state);

                    self.spawn_renewal(refresh_token);
                    rx
                }
            }
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::unauthenticated("token renewal was abandoned")),
        }
    }

    fn spawn_renewal(&self, refresh_token: String) {
        let renewal = self.inner.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(renewal, "starting token renewal");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.renewer.renew(&refresh_token).await;
            inner.settle(result);
        });
    }

    /// Current phase.
    pub fn phase(&self) -> RenewalPhase {
        match &*self.inner.lock_state() {
            RenewalState::Idle => RenewalPhase::Idle,
            RenewalState::Refreshing { .. } => RenewalPhase::Refreshing,
        }
    }

    /// Number of callers waiting on the in-flight renewal.
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.lock_state() {
            RenewalState::Idle => 0,
            RenewalState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Total renewal calls started by this coordinator.
    pub fn renewals_started(&self) -> usize {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    /// Return to `Idle`, rejecting anyone still queued.
    pub fn reset(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), RenewalState::Idle);
        if let RenewalState::Refreshing { waiters } = previous {
            for waiter in waiters {
                let _ = waiter.send(Err(ApiError::unauthenticated("token renewal was reset")));
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RenewalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_credentials(&self) {
        if let Err(e) = self.credentials.clear() {
            warn!(error = %e, "failed to clear credentials");
        }
    }

    fn settle(&self, result: ApiResult<TokenPair>) {
        let outcome = result.and_then(|pair| {
            self.credentials
                .set_tokens(Some(&pair.access_token), pair.refresh_token.as_deref())?;
            Ok(pair.access_token)
        });

        let outcome = match outcome {
            Ok(token) => {
                info!("access token renewed");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "token renewal failed, clearing credentials");
                self.clear_credentials();
                Err(ApiError::unauthenticated(format!("token renewal failed: {}", e)))
            }
        };

        let waiters = match std::mem::replace(&mut *self.lock_state(), RenewalState::Idle) {
            RenewalState::Refreshing { waiters } => waiters,
            RenewalState::Idle => Vec::new(),
        };

        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "renewal settled");
        for waiter in waiters {
            // A dropped receiver means that caller was cancelled.
            let _ = waiter.send(outcome.clone());
        }
    }
}
