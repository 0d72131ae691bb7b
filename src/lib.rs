//! # ESI Integration Library
//!
//! A resilient client for EVE Online's ESI API with:
//! - Access credentials exchanged from stored refresh tokens and cached until expiry
//! - Classification of ESI's in-body error reporting into a closed error taxonomy
//! - A shared error-budget throttle that pauses every client sharing a cache store
//! - Response caching keyed by endpoint, body and acting identity
//! - Bounded retries of transient failures
//! - Concurrent bulk and paginated fetching with a page generation check
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_esi::{EsiClient, EsiConfig, RequestResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EsiConfig::builder()
//!         .user_agent("my-app/1.0 (admin@example.com)")
//!         .build()?;
//!
//!     let client = EsiClient::new(config)?;
//!
//!     if let RequestResult::Success { payload, .. } = client.get("/v1/status/").await? {
//!         println!("{} players online", payload["players"]);
//!     }
//!
//!     let orders = client
//!         .get_multiple_paginated("/v1/markets/10000002/orders/")
//!         .await?;
//!     println!("{} orders", orders.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Shared state
pub mod store;

// Authentication
pub mod auth;

// Response handling
pub mod classify;
pub mod cache;

// HTTP client
pub mod client;

// Bulk and paginated fetching
pub mod pagination;

// Resilience patterns
pub mod resilience;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AccessCredential, AuthService, Identity, RefreshTokenSource, SsoAuthService};
pub use client::{EsiClient, EsiClientBuilder};
pub use config::{ClientPolicy, ClientPolicyBuilder, EsiConfig, EsiConfigBuilder};
pub use errors::{Attempt, EsiError, EsiErrorKind, EsiResult, Failure, RequestResult};
pub use observability::{LogFormat, LogLevel, LoggingConfig, MetricsSnapshot};
pub use pagination::{BulkFetcher, PageSetOutcome};
pub use store::{CacheStore, InMemoryCacheStore};
