//! Configuration types for the ESI client.

use crate::auth::Identity;
use crate::errors::{EsiError, EsiResult};
use secrecy::SecretString;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default ESI base URL.
pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net";

/// Default EVE SSO token endpoint.
pub const DEFAULT_SSO_TOKEN_URL: &str = "https://login.eveonline.com/oauth/token";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "integrations-esi/0.1.0";

/// Default number of attempts per logical request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Remaining error budget below which all callers are blocked.
pub const DEFAULT_ERROR_THROTTLE_THRESHOLD: u32 = 20;

/// Default lifetime of cached responses.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Default maximum in-flight requests per bulk operation.
pub const DEFAULT_MAX_CONCURRENCY: usize = 128;

/// Access tokens are cached for their declared lifetime minus this margin.
pub const DEFAULT_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Default number of full restarts after a pagination generation mismatch.
pub const DEFAULT_MAX_PAGINATION_RESTARTS: u32 = 3;

/// Process-level ESI client configuration.
#[derive(Clone)]
pub struct EsiConfig {
    /// ESI base URL.
    pub base_url: String,
    /// SSO token endpoint.
    pub sso_token_url: String,
    /// SSO application client ID.
    pub client_id: String,
    /// SSO application secret.
    pub client_secret: SecretString,
    /// User-Agent header.
    pub user_agent: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Attempts per logical request.
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Error budget threshold for the throttle guard.
    pub error_throttle_threshold: u32,
    /// Lifetime of cached responses.
    pub cache_ttl: Duration,
    /// Disables response caching for every client.
    pub cache_disabled: bool,
    /// Maximum in-flight requests per bulk operation.
    pub max_concurrency: usize,
    /// Safety margin subtracted from access token lifetimes.
    pub token_expiry_margin: Duration,
    /// Full restarts allowed after a pagination generation mismatch.
    pub max_pagination_restarts: u32,
    /// Deactivate stored refresh credentials once revocation is proven.
    pub deactivate_revoked_credentials: bool,
}

impl Default for EsiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            sso_token_url: DEFAULT_SSO_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: SecretString::new(String::new()),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            error_throttle_threshold: DEFAULT_ERROR_THROTTLE_THRESHOLD,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_disabled: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            token_expiry_margin: DEFAULT_TOKEN_EXPIRY_MARGIN,
            max_pagination_restarts: DEFAULT_MAX_PAGINATION_RESTARTS,
            deactivate_revoked_credentials: true,
        }
    }
}

impl std::fmt::Debug for EsiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsiConfig")
            .field("base_url", &self.base_url)
            .field("sso_token_url", &self.sso_token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("error_throttle_threshold", &self.error_throttle_threshold)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_disabled", &self.cache_disabled)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl EsiConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> EsiConfigBuilder {
        EsiConfigBuilder::new()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ESI_CLIENT_ID` / `ESI_CLIENT_SECRET`: SSO application credentials
    /// - `ESI_BASE_URL`, `ESI_SSO_TOKEN_URL`: endpoint overrides
    /// - `ESI_MAX_RETRIES`, `ESI_RETRY_DELAY_SECS`: retry policy
    /// - `ESI_CACHE_TTL_SECS`, `ESI_DISABLE_CACHE`: response cache policy
    pub fn from_env() -> EsiResult<Self> {
        let mut builder = EsiConfigBuilder::new();

        if let Ok(id) = std::env::var("ESI_CLIENT_ID") {
            builder = builder.client_id(id);
        }
        if let Ok(secret) = std::env::var("ESI_CLIENT_SECRET") {
            builder = builder.client_secret(secret);
        }
        if let Ok(url) = std::env::var("ESI_BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Ok(url) = std::env::var("ESI_SSO_TOKEN_URL") {
            builder = builder.sso_token_url(url);
        }
        if let Some(retries) = env_parse::<u32>("ESI_MAX_RETRIES") {
            builder = builder.max_retries(retries);
        }
        if let Some(secs) = env_parse::<u64>("ESI_RETRY_DELAY_SECS") {
            builder = builder.retry_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("ESI_CACHE_TTL_SECS") {
            builder = builder.cache_ttl(Duration::from_secs(secs));
        }
        if let Some(disabled) = env_parse::<bool>("ESI_DISABLE_CACHE") {
            builder = builder.cache_disabled(disabled);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EsiResult<()> {
        for (name, value) in [("base URL", &self.base_url), ("SSO token URL", &self.sso_token_url)] {
            let parsed = url::Url::parse(value)
                .map_err(|e| EsiError::configuration(format!("invalid {}: {}", name, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(EsiError::configuration(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        if self.max_retries == 0 {
            return Err(EsiError::configuration("max_retries must be at least 1"));
        }

        if self.max_concurrency == 0 {
            return Err(EsiError::configuration("max_concurrency must be at least 1"));
        }

        if self.user_agent.is_empty() {
            return Err(EsiError::configuration("User-Agent is required by ESI"));
        }

        Ok(())
    }

    /// Builds the full URL for an endpoint path.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Builder for `EsiConfig`.
#[derive(Default)]
pub struct EsiConfigBuilder {
    config: EsiConfig,
}

impl EsiConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ESI base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Sets the SSO token endpoint.
    pub fn sso_token_url(mut self, url: impl Into<String>) -> Self {
        self.config.sso_token_url = url.into();
        self
    }

    /// Sets the SSO client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    /// Sets the SSO client secret.
    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.client_secret = SecretString::new(secret.into());
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the attempts per logical request.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Sets the delay between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Sets the error budget threshold.
    pub fn error_throttle_threshold(mut self, threshold: u32) -> Self {
        self.config.error_throttle_threshold = threshold;
        self
    }

    /// Sets the response cache lifetime.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Globally disables response caching.
    pub fn cache_disabled(mut self, disabled: bool) -> Self {
        self.config.cache_disabled = disabled;
        self
    }

    /// Sets the maximum in-flight requests per bulk operation.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    /// Sets the access token expiry margin.
    pub fn token_expiry_margin(mut self, margin: Duration) -> Self {
        self.config.token_expiry_margin = margin;
        self
    }

    /// Sets the pagination restart budget.
    pub fn max_pagination_restarts(mut self, restarts: u32) -> Self {
        self.config.max_pagination_restarts = restarts;
        self
    }

    /// Enables or disables deactivation of revoked refresh credentials.
    pub fn deactivate_revoked_credentials(mut self, enabled: bool) -> Self {
        self.config.deactivate_revoked_credentials = enabled;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> EsiResult<EsiConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-operation client policy.
///
/// Owned by the caller for one logical operation and never mutated once built.
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    /// Identity on whose behalf authenticated requests are made.
    pub identity: Option<Identity>,
    /// Attempts per logical request.
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Error budget threshold.
    pub error_throttle_threshold: u32,
    /// Skip the response cache on read.
    pub bypass_cache: bool,
    /// Raise `UpstreamApplicationError` instead of returning it.
    pub raise_application_errors: bool,
    /// Raise every other failure kind instead of returning it.
    pub raise_other_errors: bool,
    /// Log application errors at warn level.
    pub log_application_errors: bool,
    /// Full restarts allowed after a pagination generation mismatch.
    pub max_pagination_restarts: u32,
    /// Aborts in-flight requests and pending retries when cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            identity: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            error_throttle_threshold: DEFAULT_ERROR_THROTTLE_THRESHOLD,
            bypass_cache: false,
            raise_application_errors: true,
            raise_other_errors: true,
            log_application_errors: true,
            max_pagination_restarts: DEFAULT_MAX_PAGINATION_RESTARTS,
            cancellation: None,
        }
    }
}

impl ClientPolicy {
    /// Creates a policy builder seeded with crate defaults.
    pub fn builder() -> ClientPolicyBuilder {
        ClientPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Creates a policy builder seeded from a client configuration.
    pub fn from_config(config: &EsiConfig) -> ClientPolicyBuilder {
        ClientPolicyBuilder {
            policy: Self {
                max_retries: config.max_retries,
                retry_delay: config.retry_delay,
                error_throttle_threshold: config.error_throttle_threshold,
                max_pagination_restarts: config.max_pagination_restarts,
                ..Self::default()
            },
        }
    }

    /// Returns true if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }
}

/// Builder for `ClientPolicy`.
#[derive(Debug, Clone)]
pub struct ClientPolicyBuilder {
    policy: ClientPolicy,
}

impl ClientPolicyBuilder {
    /// Sets the acting identity.
    pub fn identity(mut self, identity: impl Into<Identity>) -> Self {
        self.policy.identity = Some(identity.into());
        self
    }

    /// Sets the attempts per logical request.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    /// Sets the delay between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    /// Sets the error budget threshold.
    pub fn error_throttle_threshold(mut self, threshold: u32) -> Self {
        self.policy.error_throttle_threshold = threshold;
        self
    }

    /// Skips the response cache on read.
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.policy.bypass_cache = bypass;
        self
    }

    /// Raise application errors instead of returning them.
    pub fn raise_application_errors(mut self, raise: bool) -> Self {
        self.policy.raise_application_errors = raise;
        self
    }

    /// Raise every other failure instead of returning it.
    pub fn raise_other_errors(mut self, raise: bool) -> Self {
        self.policy.raise_other_errors = raise;
        self
    }

    /// Log application errors.
    pub fn log_application_errors(mut self, log: bool) -> Self {
        self.policy.log_application_errors = log;
        self
    }

    /// Sets the pagination restart budget.
    pub fn max_pagination_restarts(mut self, restarts: u32) -> Self {
        self.policy.max_pagination_restarts = restarts;
        self
    }

    /// Attaches a cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.policy.cancellation = Some(token);
        self
    }

    /// Builds the policy.
    pub fn build(self) -> ClientPolicy {
        self.policy
    }
}
