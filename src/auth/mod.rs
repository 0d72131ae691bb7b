//! Access credential management for authenticated ESI calls.
//!
//! Access tokens are derived from a long-lived refresh token through EVE SSO and
//! memoized in the shared [`CacheStore`] under a SHA-224 hash of the refresh
//! token, so every process sharing the store reuses the same exchange.

use crate::classify::CREDENTIAL_REJECTION_ERRORS;
use crate::errors::{Attempt, EsiError, EsiErrorKind, EsiResult, Failure};
use crate::observability::Metrics;
use crate::store::CacheStore;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Principal on whose behalf an authenticated request is made.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Creates an identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gets the identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for Identity {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Identity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Short-lived bearer credential returned by SSO.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    /// Access token.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds declared by SSO.
    pub expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AccessCredential {
    /// Generates the Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Failure of a refresh token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// SSO answered with an OAuth error.
    Protocol {
        /// OAuth error code.
        error: String,
    },
    /// SSO could not be reached.
    Connection(String),
    /// SSO answered with something that is not an OAuth response.
    Service(String),
}

/// Source of stored refresh tokens, owned by the persistence layer.
#[async_trait]
pub trait RefreshTokenSource: Send + Sync {
    /// Gets the active refresh token for an identity.
    async fn refresh_token(&self, identity: &Identity) -> EsiResult<Option<SecretString>>;

    /// Permanently deactivates the identity's refresh token after revocation.
    async fn deactivate(&self, identity: &Identity) -> EsiResult<()>;
}

/// SSO token service.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Exchanges a refresh token for an access credential.
    async fn exchange(&self, refresh_token: &SecretString) -> Result<AccessCredential, ExchangeError>;

    /// Checks whether SSO still accepts a refresh token.
    ///
    /// Returns false only when SSO explicitly rejects the token; anything
    /// inconclusive counts as valid.
    async fn is_refresh_token_valid(&self, refresh_token: &SecretString) -> bool;
}

/// EVE SSO token endpoint client.
pub struct SsoAuthService {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl SsoAuthService {
    /// Creates a new SSO client.
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    fn refresh_form(&self, refresh_token: &SecretString) -> Result<String, serde_urlencoded::ser::Error> {
        serde_urlencoded::to_string([
            ("grant_type", "refresh_token"),
            ("client_secret", self.client_secret.expose_secret().as_str()),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token.expose_secret().as_str()),
        ])
    }

    async fn post_refresh(&self, refresh_token: &SecretString) -> Result<reqwest::Response, ExchangeError> {
        let form = self
            .refresh_form(refresh_token)
            .map_err(|e| ExchangeError::Service(format!("Failed to encode token request: {}", e)))?;

        self.http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded;charset=UTF-8",
            )
            .body(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ExchangeError::Connection(e.to_string())
                } else {
                    ExchangeError::Service(e.to_string())
                }
            })
    }
}

#[async_trait]
impl AuthService for SsoAuthService {
    async fn exchange(&self, refresh_token: &SecretString) -> Result<AccessCredential, ExchangeError> {
        tracing::debug!("Querying EVE SSO for an access token");
        let response = self.post_refresh(refresh_token).await?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let value: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) if status.is_success() => {
                return Err(ExchangeError::Service(format!(
                    "SSO returned a non-JSON body with status {}",
                    status
                )))
            }
            Err(_) => {
                return Err(ExchangeError::Protocol {
                    error: format!("http_{}", status.as_u16()),
                })
            }
        };

        if let Some(error) = value.get("error") {
            return Err(ExchangeError::Protocol {
                error: error.as_str().unwrap_or("unknown_error").to_string(),
            });
        }
        if !status.is_success() {
            return Err(ExchangeError::Protocol {
                error: format!("http_{}", status.as_u16()),
            });
        }

        serde_json::from_value(value).map_err(|_| ExchangeError::Protocol {
            error: "missing_token".to_string(),
        })
    }

    async fn is_refresh_token_valid(&self, refresh_token: &SecretString) -> bool {
        let response = match self.post_refresh(refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = ?e, "Refresh token validation probe failed");
                return true;
            }
        };

        tracing::debug!(status = response.status().as_u16(), "Refresh token validation probe completed");
        let text = response.text().await.unwrap_or_default();
        if text.is_empty() {
            return true;
        }

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(content) => !content
                .get("error")
                .and_then(|e| e.as_str())
                .map_or(false, |e| CREDENTIAL_REJECTION_ERRORS.contains(&e)),
            Err(_) => true,
        }
    }
}

/// Memoizes access credentials in the shared store.
pub struct CredentialCache {
    store: Arc<dyn CacheStore>,
    auth: Arc<dyn AuthService>,
    tokens: Arc<dyn RefreshTokenSource>,
    metrics: Arc<Metrics>,
    expiry_margin: Duration,
    deactivate_revoked: bool,
}

impl CredentialCache {
    /// Creates a new credential cache.
    pub fn new(
        store: Arc<dyn CacheStore>,
        auth: Arc<dyn AuthService>,
        tokens: Arc<dyn RefreshTokenSource>,
        metrics: Arc<Metrics>,
        expiry_margin: Duration,
        deactivate_revoked: bool,
    ) -> Self {
        Self {
            store,
            auth,
            tokens,
            metrics,
            expiry_margin,
            deactivate_revoked,
        }
    }

    /// Cache key for a refresh token.
    pub fn cache_key(refresh_token: &SecretString) -> String {
        hex::encode(Sha224::digest(refresh_token.expose_secret().as_bytes()))
    }

    /// Gets an access credential for an identity.
    ///
    /// A live cache entry is returned without any network call. A failed
    /// exchange that SSO confirms as revocation yields `InvalidCredential`
    /// and deactivates the stored token; other exchange failures are returned
    /// as retryable kinds.
    pub async fn get_access_credential(&self, identity: &Identity) -> EsiResult<Attempt<AccessCredential>> {
        let refresh_token = self
            .tokens
            .refresh_token(identity)
            .await?
            .ok_or_else(|| EsiError::MissingCredential {
                identity: identity.to_string(),
            })?;

        let key = Self::cache_key(&refresh_token);
        if let Some(cached) = self.store.get(&key).await? {
            match serde_json::from_value::<AccessCredential>(cached) {
                Ok(credential) => {
                    tracing::info!(identity = %identity, "Access token request hit cache");
                    return Ok(Ok(credential));
                }
                Err(e) => tracing::warn!(identity = %identity, error = %e, "Discarding unreadable cached access token"),
            }
        }
        tracing::info!(identity = %identity, "Access token request MISS cache");

        self.metrics.record_credential_exchange();
        match self.auth.exchange(&refresh_token).await {
            Ok(credential) => {
                let ttl = Duration::from_secs(credential.expires_in).saturating_sub(self.expiry_margin);
                if !ttl.is_zero() {
                    self.store.set(&key, serde_json::to_value(&credential)?, ttl).await?;
                    tracing::debug!(identity = %identity, ttl_secs = ttl.as_secs(), "Access token cached");
                }
                Ok(Ok(credential))
            }
            Err(ExchangeError::Protocol { error }) => {
                if self.auth.is_refresh_token_valid(&refresh_token).await {
                    tracing::warn!(identity = %identity, error = %error, "Received oauth error from SSO");
                    Ok(Err(Failure::new(EsiErrorKind::AuthServiceError)))
                } else {
                    tracing::warn!(
                        identity = %identity,
                        "Refresh token was rejected, the application was probably revoked"
                    );
                    if self.deactivate_revoked {
                        self.tokens.deactivate(identity).await?;
                    }
                    Ok(Err(Failure::new(EsiErrorKind::InvalidCredential)))
                }
            }
            Err(ExchangeError::Connection(message)) => {
                tracing::warn!(identity = %identity, error = %message, "Connection error when querying SSO");
                Ok(Err(Failure::new(EsiErrorKind::ConnectionError)))
            }
            Err(ExchangeError::Service(message)) => {
                tracing::warn!(identity = %identity, error = %message, "Miscellaneous SSO error");
                Ok(Err(Failure::new(EsiErrorKind::AuthServiceError)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockAuthService, MockRefreshTokenSource};
    use crate::store::InMemoryCacheStore;

    fn cache_with(
        auth: Arc<MockAuthService>,
        tokens: Arc<MockRefreshTokenSource>,
        store: Arc<InMemoryCacheStore>,
    ) -> CredentialCache {
        CredentialCache::new(
            store,
            auth,
            tokens,
            Arc::new(Metrics::new()),
            Duration::from_secs(30),
            true,
        )
    }

    fn credential(token: &str, expires_in: u64) -> AccessCredential {
        AccessCredential {
            access_token: token.to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
        }
    }

    #[test]
    fn test_identity_conversions() {
        assert_eq!(Identity::from(42u64).as_str(), "42");
        assert_eq!(Identity::from("pilot").to_string(), "pilot");
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let debug = format!("{:?}", credential("secret-token", 1200));
        assert!(!debug.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_cached_credential_skips_exchange() {
        let auth = Arc::new(MockAuthService::new());
        auth.push_exchange(Ok(credential("first", 1200)));
        let tokens = Arc::new(MockRefreshTokenSource::new().with_token("1", "refresh-1"));
        let cache = cache_with(auth.clone(), tokens, Arc::new(InMemoryCacheStore::new()));

        let first = cache.get_access_credential(&Identity::from(1u64)).await.unwrap();
        let second = cache.get_access_credential(&Identity::from(1u64)).await.unwrap();

        assert_eq!(first.unwrap().access_token, "first");
        assert_eq!(second.unwrap().access_token, "first");
        assert_eq!(auth.exchange_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_expires_before_declared_lifetime() {
        let auth = Arc::new(MockAuthService::new());
        auth.push_exchange(Ok(credential("first", 60)));
        auth.push_exchange(Ok(credential("second", 60)));
        let tokens = Arc::new(MockRefreshTokenSource::new().with_token("1", "refresh-1"));
        let cache = cache_with(auth.clone(), tokens, Arc::new(InMemoryCacheStore::new()));
        let identity = Identity::from(1u64);

        cache.get_access_credential(&identity).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let refreshed = cache.get_access_credential(&identity).await.unwrap().unwrap();

        assert_eq!(refreshed.access_token, "second");
        assert_eq!(auth.exchange_calls(), 2);
    }

    #[tokio::test]
    async fn test_revoked_token_is_deactivated() {
        let auth = Arc::new(MockAuthService::new().with_token_valid(false));
        auth.push_exchange(Err(ExchangeError::Protocol {
            error: "invalid_grant".to_string(),
        }));
        let tokens = Arc::new(MockRefreshTokenSource::new().with_token("7", "revoked"));
        let cache = cache_with(auth, tokens.clone(), Arc::new(InMemoryCacheStore::new()));

        let result = cache.get_access_credential(&Identity::from(7u64)).await.unwrap();

        assert_eq!(result.unwrap_err().kind, EsiErrorKind::InvalidCredential);
        assert_eq!(tokens.deactivated(), vec![Identity::from(7u64)]);
    }

    #[tokio::test]
    async fn test_inconclusive_protocol_error_is_retryable() {
        let auth = Arc::new(MockAuthService::new().with_token_valid(true));
        auth.push_exchange(Err(ExchangeError::Protocol {
            error: "server_error".to_string(),
        }));
        let tokens = Arc::new(MockRefreshTokenSource::new().with_token("7", "refresh"));
        let cache = cache_with(auth, tokens.clone(), Arc::new(InMemoryCacheStore::new()));

        let result = cache.get_access_credential(&Identity::from(7u64)).await.unwrap();

        assert_eq!(result.unwrap_err().kind, EsiErrorKind::AuthServiceError);
        assert!(tokens.deactivated().is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_maps_to_connection_error() {
        let auth = Arc::new(MockAuthService::new());
        auth.push_exchange(Err(ExchangeError::Connection("refused".to_string())));
        let tokens = Arc::new(MockRefreshTokenSource::new().with_token("7", "refresh"));
        let cache = cache_with(auth, tokens, Arc::new(InMemoryCacheStore::new()));

        let result = cache.get_access_credential(&Identity::from(7u64)).await.unwrap();
        assert_eq!(result.unwrap_err().kind, EsiErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_fault() {
        let cache = cache_with(
            Arc::new(MockAuthService::new()),
            Arc::new(MockRefreshTokenSource::new()),
            Arc::new(InMemoryCacheStore::new()),
        );

        let result = cache.get_access_credential(&Identity::from(3u64)).await;
        assert!(matches!(result, Err(EsiError::MissingCredential { .. })));
    }
}
