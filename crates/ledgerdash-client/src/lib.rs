//! Data-access core for the ledgerdash business dashboard.
//!
//! This crate provides:
//!
//! - An authenticated request pipeline (bearer tokens, envelope unwrapping,
//!   status classification, retry for idempotent calls, cancellation)
//! - Transparent access-token renewal with a single in-flight refresh no
//!   matter how many requests fail at once
//! - Durable credential storage (file or in-memory)
//! - Per-domain entity caches with TTL freshness, optimistic writes and
//!   rollback, plus cross-domain invalidation
//! - Multipart upload with progress and file download
//!
//! # Quick Start
//!
//! ```no_run
//! use ledgerdash_client::{ApiClient, Domain, EntityCache, LoginRequest, RestSource, TtlClass};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Deal {
//!     id: String,
//!     amount: i64,
//! }
//!
//! impl ledgerdash_client::Entity for Deal {
//!     type Id = String;
//!
//!     fn id(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Create client from environment
//! let client = ApiClient::from_env()?;
//! client.login(&LoginRequest::new("ana@example.com", "secret")).await?;
//!
//! // Deals are cached for 5 minutes
//! let deals = EntityCache::new(
//!     Domain::DEALS,
//!     TtlClass::Medium,
//!     RestSource::<Deal>::new(client.clone(), "/deals"),
//! );
//! for deal in deals.fetch(false).await? {
//!     println!("{}: {}", deal.id, deal.amount);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `LEDGERDASH_API_URL` | API base URL (default: `http://localhost:3000/api`) |
//! | `LEDGERDASH_TIMEOUT_MS` | Request timeout in milliseconds (default: 30000) |
//! | `LEDGERDASH_STORAGE_PREFIX` | Prefix for persisted credential keys (default: `ledgerdash_`) |
//! | `LEDGERDASH_MAX_RETRIES` | Max retries for retry-safe calls (default: 3) |
//! | `LEDGERDASH_REFRESH_PATH` | Token renewal endpoint (default: `/auth/refresh`) |
//! | `LEDGERDASH_CREDENTIALS_FILE` | Credential file (default: platform data dir) |
//!
//! # Logging
//!
//! The crate emits `tracing` events and installs no subscriber.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod renewal;

// Re-export main types
pub use cache::{
    CacheEntry, CacheRegistry, Domain, Entity, EntityCache, EntitySource, FetchOptions, Filters,
    Invalidate, ListQuery, MutationKind, MutationRecord, Page, Pagination, RestSource, RestValue,
    TtlClass, ValueCache, ValueSource,
};
pub use client::{ApiClient, ApiRequest, Download, RequestBody, RequestOptions, UploadBody};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use credentials::{CredentialStore, FileStorage, MemoryStorage, TokenStorage};
pub use envelope::{Envelope, LoginRequest, LoginResponse, TokenPair};
pub use error::{ApiError, ApiResult, FieldErrors};
pub use renewal::{HttpRenewer, RenewalCoordinator, RenewalPhase, TokenRenewer};

/// Re-exported so callers can build cancellation handles without a direct
/// `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
