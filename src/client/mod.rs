//! ESI client implementation.

use crate::auth::{AccessCredential, AuthService, CredentialCache, RefreshTokenSource, SsoAuthService};
use crate::cache::ResponseCache;
use crate::classify::{classify_body, ResponseSignals};
use crate::config::{ClientPolicy, EsiConfig};
use crate::errors::{Attempt, EsiError, EsiErrorKind, EsiResult, Failure, RequestResult};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::pagination::BulkFetcher;
use crate::resilience::{apply_terminal_policy, run_cancellable, RetryController, ThrottleGuard};
use crate::store::{CacheStore, InMemoryCacheStore};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

/// Endpoint probed by [`EsiClient::is_downtime`].
pub const STATUS_ENDPOINT: &str = "/v1/status/";

/// Player count at or below which the server is considered down.
pub const DOWNTIME_PLAYER_THRESHOLD: u64 = 100;

/// An error-free response with the header signals it carried.
#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub(crate) payload: Value,
    pub(crate) signals: ResponseSignals,
}

/// ESI API client.
///
/// A client carries one [`ClientPolicy`]; use [`EsiClient::with_policy`] to
/// derive a client for a different identity or error policy. Derived clients
/// share the HTTP pool, the cache store and the metrics.
#[derive(Clone)]
pub struct EsiClient {
    /// HTTP client.
    http: Client,
    /// Process-level configuration.
    config: Arc<EsiConfig>,
    /// Per-operation policy.
    policy: ClientPolicy,
    /// Shared store backing the throttle flag and both caches.
    store: Arc<dyn CacheStore>,
    /// Credential cache, present when a refresh token source is configured.
    credentials: Option<Arc<CredentialCache>>,
    /// Response cache.
    responses: Arc<ResponseCache>,
    /// Error budget guard.
    throttle: Arc<ThrottleGuard>,
    /// Retry controller.
    retry: Arc<RetryController>,
    /// Request metrics.
    metrics: Arc<Metrics>,
}

impl EsiClient {
    /// Creates a client without authenticated access and with an in-memory store.
    pub fn new(config: EsiConfig) -> EsiResult<Self> {
        EsiClientBuilder::new().config(config).build()
    }

    /// Creates a new client builder.
    pub fn builder() -> EsiClientBuilder {
        EsiClientBuilder::new()
    }

    /// Derives a client that runs under `policy`.
    pub fn with_policy(&self, policy: ClientPolicy) -> Self {
        Self {
            throttle: Arc::new(ThrottleGuard::new(
                self.store.clone(),
                policy.error_throttle_threshold,
                self.metrics.clone(),
            )),
            retry: Arc::new(RetryController::new(
                policy.max_retries,
                policy.retry_delay,
                self.metrics.clone(),
            )),
            policy,
            ..self.clone()
        }
    }

    /// Gets the configuration.
    pub fn config(&self) -> &EsiConfig {
        &self.config
    }

    /// Gets the active policy.
    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    /// Gets a snapshot of the request metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Gets the bulk fetch engine.
    pub fn bulk(&self) -> BulkFetcher<'_> {
        BulkFetcher::new(self)
    }

    // Single requests

    /// Makes a GET request.
    pub async fn get(&self, endpoint: &str) -> EsiResult<RequestResult> {
        self.request(endpoint, None).await
    }

    /// Makes a POST request with a JSON body.
    pub async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> EsiResult<RequestResult> {
        let body = serde_json::to_value(body)?;
        self.request(endpoint, Some(&body)).await
    }

    /// Makes a GET request and deserializes the payload.
    ///
    /// A failure the policy would return is raised instead, since there is
    /// no payload of type `T` to hand back.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> EsiResult<T> {
        match self.get(endpoint).await? {
            RequestResult::Success { payload, .. } => Ok(serde_json::from_value(payload)?),
            RequestResult::Failure { kind, payload } => Err(EsiError::upstream(kind, endpoint, payload)),
        }
    }

    /// Gets an access credential for the policy's identity.
    ///
    /// Returns `Ok(Ok(None))` when the policy has no identity.
    pub async fn get_access_token(&self) -> EsiResult<Attempt<Option<AccessCredential>>> {
        let Some(identity) = &self.policy.identity else {
            return Ok(Ok(None));
        };
        let exchange = self.credentials()?.get_access_credential(identity);
        Ok(run_cancellable(self.policy.cancellation.as_ref(), exchange)
            .await??
            .map(Some))
    }

    /// Reads the page count of a paginated endpoint.
    ///
    /// Probes the endpoint without the response cache. Returns `None` when
    /// the response carries no `X-Pages` header, or when the probe failed
    /// and the policy returns failures instead of raising them.
    pub async fn get_page_count(&self, endpoint: &str) -> EsiResult<Option<u32>> {
        match self.probe(endpoint).await? {
            Ok(signals) => Ok(signals.pages),
            Err(failure) => {
                let result = RequestResult::Failure {
                    kind: failure.kind,
                    payload: failure.payload,
                };
                apply_terminal_policy(&self.policy, endpoint, result)?;
                Ok(None)
            }
        }
    }

    /// Returns true while the game server is in downtime.
    ///
    /// A failed or undecodable status probe counts as downtime.
    pub async fn is_downtime(&self) -> EsiResult<bool> {
        let probe = self.with_policy(ClientPolicy {
            identity: None,
            bypass_cache: true,
            raise_application_errors: false,
            raise_other_errors: false,
            ..self.policy.clone()
        });

        match probe.get(STATUS_ENDPOINT).await {
            Ok(RequestResult::Success { payload, .. }) => {
                let players = payload.get("players").and_then(Value::as_u64).unwrap_or(0);
                Ok(players <= DOWNTIME_PLAYER_THRESHOLD)
            }
            Ok(RequestResult::Failure { kind, .. }) => {
                tracing::info!(kind = %kind, "Status probe failed, assuming downtime");
                Ok(true)
            }
            Err(EsiError::Decode { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    // Bulk requests

    /// Fetches `template` once per parameter. See [`BulkFetcher::get_multiple`].
    pub async fn get_multiple<P>(&self, template: &str, params: &[P]) -> EsiResult<HashMap<P, RequestResult>>
    where
        P: Display + Eq + Hash + Clone,
    {
        self.bulk().get_multiple(template, params).await
    }

    /// Fetches every page of `endpoint`. See [`BulkFetcher::get_multiple_paginated`].
    pub async fn get_multiple_paginated(&self, endpoint: &str) -> EsiResult<Vec<Value>> {
        self.bulk().get_multiple_paginated(endpoint).await
    }

    // Internal methods

    async fn request(&self, endpoint: &str, body: Option<&Value>) -> EsiResult<RequestResult> {
        if self.policy.is_cancelled() {
            return Err(EsiError::Cancelled);
        }

        let identity = self.policy.identity.as_ref();
        let cacheable = !self.policy.bypass_cache && !self.responses.is_disabled();

        if cacheable {
            if let Some(payload) = self.responses.try_read(endpoint, body, identity).await? {
                tracing::info!(endpoint = endpoint, "ESI cache HIT");
                self.metrics.record_cache_hit();
                return Ok(RequestResult::Success {
                    payload,
                    expires_at: None,
                });
            }
            tracing::info!(endpoint = endpoint, "ESI cache MISS");
            self.metrics.record_cache_miss();
        }

        let result = match self.fetch_uncached(endpoint, body).await? {
            Ok(fetched) => {
                if cacheable {
                    self.responses
                        .write(endpoint, body, identity, &fetched.payload, fetched.signals.expires_at)
                        .await?;
                }
                RequestResult::Success {
                    payload: fetched.payload,
                    expires_at: fetched.signals.expires_at,
                }
            }
            Err(failure) => RequestResult::Failure {
                kind: failure.kind,
                payload: failure.payload,
            },
        };

        apply_terminal_policy(&self.policy, endpoint, result)
    }

    /// Runs a request under the retry controller without touching the response cache.
    pub(crate) async fn fetch_uncached(&self, endpoint: &str, body: Option<&Value>) -> EsiResult<Attempt<Fetched>> {
        let cancellation = self.policy.cancellation.as_ref();
        self.retry
            .execute_with_retry(endpoint, cancellation, || self.attempt(endpoint, body))
            .await
    }

    /// Fetches `endpoint` once for its headers.
    pub(crate) async fn probe(&self, endpoint: &str) -> EsiResult<Attempt<ResponseSignals>> {
        Ok(self
            .fetch_uncached(endpoint, None)
            .await?
            .map(|fetched| fetched.signals))
    }

    pub(crate) fn record_pagination_restart(&self) {
        self.metrics.record_pagination_restart();
    }

    fn credentials(&self) -> EsiResult<&CredentialCache> {
        self.credentials
            .as_deref()
            .ok_or_else(|| EsiError::configuration("an acting identity requires a refresh token source"))
    }

    /// One attempt: throttle, credential, HTTP call, budget accounting, classification.
    async fn attempt(&self, endpoint: &str, body: Option<&Value>) -> EsiResult<Attempt<Fetched>> {
        let cancellation = self.policy.cancellation.as_ref();
        self.throttle.block_if_active(cancellation).await?;

        let authorization = match &self.policy.identity {
            Some(identity) => {
                let exchange = self.credentials()?.get_access_credential(identity);
                match run_cancellable(cancellation, exchange).await?? {
                    Ok(credential) => Some(credential.authorization_header()),
                    Err(failure) => return Ok(Err(failure)),
                }
            }
            None => None,
        };

        let method = if body.is_some() { Method::POST } else { Method::GET };
        let mut request = self
            .http
            .request(method, self.config.endpoint_url(endpoint))
            .header(ACCEPT, "application/json");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        self.metrics.record_request();
        let started = Instant::now();
        let response = match run_cancellable(cancellation, request.send()).await? {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(EsiError::configuration(format!(
                    "invalid request for {}: {}",
                    endpoint, e
                )))
            }
            Err(e) => {
                tracing::warn!(endpoint = endpoint, error = %e, "Connection error when querying ESI");
                self.metrics.record_failure();
                return Ok(Err(Failure::new(EsiErrorKind::ConnectionError)));
            }
        };

        let status = response.status();
        let signals = ResponseSignals::from_headers(response.headers());
        if signals.deprecated {
            tracing::error!(endpoint = endpoint, "Route depreciating soon");
            self.metrics.record_deprecation_warning();
        }
        self.throttle.record(&signals, endpoint).await?;

        let bytes = match run_cancellable(cancellation, response.bytes()).await? {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(endpoint = endpoint, error = %e, "Connection dropped while reading ESI response");
                self.metrics.record_failure();
                return Ok(Err(Failure::new(EsiErrorKind::ConnectionError)));
            }
        };
        self.metrics.record_latency(started.elapsed());

        let classification = classify_body(endpoint, status, &bytes)?;
        match classification.kind {
            None => {
                self.metrics.record_success();
                Ok(Ok(Fetched {
                    payload: classification.payload,
                    signals,
                }))
            }
            Some(kind) => {
                self.metrics.record_failure();
                self.log_failure(endpoint, kind, &classification.payload);
                Ok(Err(Failure::new(kind).with_payload(classification.payload)))
            }
        }
    }

    fn log_failure(&self, endpoint: &str, kind: EsiErrorKind, payload: &Value) {
        match kind {
            EsiErrorKind::UpstreamApplicationError => {
                if self.policy.log_application_errors {
                    tracing::warn!(endpoint = endpoint, error = %payload, "ESI application error");
                }
            }
            EsiErrorKind::InvalidCredential | EsiErrorKind::AuthServiceError => {
                tracing::warn!(endpoint = endpoint, kind = %kind, error = %payload, "SSO error reported by ESI");
            }
            EsiErrorKind::UpstreamUnresponsive | EsiErrorKind::ConnectionError => {
                tracing::warn!(endpoint = endpoint, error = %payload, "ESI is not responding");
            }
        }
    }
}

/// Builder for EsiClient.
#[derive(Default)]
pub struct EsiClientBuilder {
    config: Option<EsiConfig>,
    policy: Option<ClientPolicy>,
    store: Option<Arc<dyn CacheStore>>,
    refresh_tokens: Option<Arc<dyn RefreshTokenSource>>,
    auth_service: Option<Arc<dyn AuthService>>,
}

impl EsiClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn config(mut self, config: EsiConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the policy. Defaults to [`ClientPolicy::from_config`].
    pub fn policy(mut self, policy: ClientPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the shared cache store. Defaults to a private [`InMemoryCacheStore`].
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the source of refresh tokens, enabling authenticated requests.
    pub fn refresh_tokens(mut self, tokens: Arc<dyn RefreshTokenSource>) -> Self {
        self.refresh_tokens = Some(tokens);
        self
    }

    /// Replaces the SSO token exchange. Defaults to [`SsoAuthService`].
    pub fn auth_service(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth_service = Some(auth);
        self
    }

    /// Builds the client.
    pub fn build(self) -> EsiResult<EsiClient> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EsiError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let metrics = Arc::new(Metrics::new());
        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryCacheStore::new()),
        };

        let credentials = match self.refresh_tokens {
            Some(tokens) => {
                let auth: Arc<dyn AuthService> = match self.auth_service {
                    Some(auth) => auth,
                    None => Arc::new(SsoAuthService::new(
                        http.clone(),
                        config.sso_token_url.clone(),
                        config.client_id.clone(),
                        config.client_secret.clone(),
                    )),
                };
                Some(Arc::new(CredentialCache::new(
                    store.clone(),
                    auth,
                    tokens,
                    metrics.clone(),
                    config.token_expiry_margin,
                    config.deactivate_revoked_credentials,
                )))
            }
            None => None,
        };

        let policy = match self.policy {
            Some(policy) => policy,
            None => ClientPolicy::from_config(&config).build(),
        };

        Ok(EsiClient {
            throttle: Arc::new(ThrottleGuard::new(
                store.clone(),
                policy.error_throttle_threshold,
                metrics.clone(),
            )),
            retry: Arc::new(RetryController::new(
                policy.max_retries,
                policy.retry_delay,
                metrics.clone(),
            )),
            responses: Arc::new(ResponseCache::new(
                store.clone(),
                config.cache_ttl,
                config.cache_disabled,
            )),
            http,
            config: Arc::new(config),
            policy,
            store,
            credentials,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let client = EsiClient::builder().build().unwrap();

        assert_eq!(client.config().base_url, "https://esi.evetech.net");
        assert!(client.policy().identity.is_none());
        assert!(client.policy().raise_application_errors);
        assert_eq!(client.metrics(), MetricsSnapshot::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EsiConfig {
            base_url: "not a url".to_string(),
            ..EsiConfig::default()
        };
        assert!(matches!(EsiClient::new(config), Err(EsiError::Configuration(_))));
    }

    #[test]
    fn test_with_policy_shares_metrics() {
        let client = EsiClient::builder().build().unwrap();
        let derived = client.with_policy(ClientPolicy::builder().bypass_cache(true).build());

        assert!(derived.policy().bypass_cache);
        assert!(!client.policy().bypass_cache);
        derived.record_pagination_restart();
        assert_eq!(client.metrics().pagination_restarts, 1);
    }

    #[tokio::test]
    async fn test_access_token_without_identity() {
        let client = EsiClient::builder().build().unwrap();
        assert!(matches!(client.get_access_token().await, Ok(Ok(None))));
    }

    #[tokio::test]
    async fn test_identity_without_token_source_is_configuration_error() {
        let client = EsiClient::builder()
            .policy(ClientPolicy::builder().identity(1u64).build())
            .build()
            .unwrap();

        assert!(matches!(
            client.get_access_token().await,
            Err(EsiError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_policy_short_circuits() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let client = EsiClient::builder()
            .policy(ClientPolicy::builder().cancellation(token).build())
            .build()
            .unwrap();

        assert!(matches!(client.get("/v1/status/").await, Err(EsiError::Cancelled)));
        assert_eq!(client.metrics().requests_total, 0);
    }
}
