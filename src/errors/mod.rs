//! Error types for the ESI client.
//!
//! Two layers live here. [`EsiErrorKind`] is the closed taxonomy assigned to a
//! failed attempt; it decides retry eligibility and travels inside
//! [`RequestResult::Failure`]. [`EsiError`] is the fault path: it is returned
//! when the caller's policy asks for failures to be raised, and for conditions
//! that are not part of the taxonomy at all (decode failures, inconsistent
//! pagination, missing credentials, misconfiguration).

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Result type alias for ESI operations.
pub type EsiResult<T> = Result<T, EsiError>;

/// Classification of a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EsiErrorKind {
    /// The HTTP connection could not be established or was dropped.
    ConnectionError,
    /// The refresh credential was revoked upstream.
    InvalidCredential,
    /// ESI answered but reported itself down, overloaded or timing out.
    UpstreamUnresponsive,
    /// The SSO service misbehaved in a way that does not prove revocation.
    AuthServiceError,
    /// ESI rejected the request itself.
    UpstreamApplicationError,
}

impl EsiErrorKind {
    /// Returns true if a failed attempt of this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError | Self::UpstreamUnresponsive | Self::AuthServiceError
        )
    }
}

impl fmt::Display for EsiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionError => write!(f, "connection_error"),
            Self::InvalidCredential => write!(f, "invalid_credential"),
            Self::UpstreamUnresponsive => write!(f, "upstream_unresponsive"),
            Self::AuthServiceError => write!(f, "auth_service_error"),
            Self::UpstreamApplicationError => write!(f, "upstream_application_error"),
        }
    }
}

/// A classified failure of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Error classification.
    pub kind: EsiErrorKind,
    /// Error body returned by the upstream, if any.
    pub payload: Option<Value>,
}

impl Failure {
    /// Creates a failure without a payload.
    pub fn new(kind: EsiErrorKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    /// Attaches the upstream error body.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Result of one attempt: a value or a classified failure.
///
/// Faults outside the taxonomy travel in the surrounding [`EsiResult`].
pub type Attempt<T> = Result<T, Failure>;

/// Outcome of one logical request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    /// The upstream returned a payload without an error marker.
    Success {
        /// Decoded payload.
        payload: Value,
        /// Parsed `expires` header, if the upstream sent one.
        expires_at: Option<DateTime<Utc>>,
    },
    /// The request failed with a classified error.
    Failure {
        /// Error classification.
        kind: EsiErrorKind,
        /// Error body returned by the upstream, if any.
        payload: Option<Value>,
    },
}

impl RequestResult {
    /// Creates a failure without a payload.
    pub fn failure(kind: EsiErrorKind) -> Self {
        Self::Failure {
            kind,
            payload: None,
        }
    }

    /// Builds a result from the final attempt of a request.
    pub fn from_attempt(attempt: Attempt<(Value, Option<DateTime<Utc>>)>) -> Self {
        match attempt {
            Ok((payload, expires_at)) => Self::Success {
                payload,
                expires_at,
            },
            Err(failure) => Self::Failure {
                kind: failure.kind,
                payload: failure.payload,
            },
        }
    }

    /// Returns true for a successful result.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Gets the error kind of a failed result.
    pub fn error_kind(&self) -> Option<EsiErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Gets the payload, whether success body or error body.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { payload, .. } => payload.as_ref(),
        }
    }

    /// Consumes the result and returns the payload.
    pub fn into_payload(self) -> Option<Value> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { payload, .. } => payload,
        }
    }
}

/// Faults raised by the client.
#[derive(Error, Debug)]
pub enum EsiError {
    /// A classified failure the caller's policy asked to raise.
    #[error("[{kind}] ESI request to {endpoint} failed")]
    Upstream {
        /// Error classification.
        kind: EsiErrorKind,
        /// Endpoint that was queried.
        endpoint: String,
        /// Error body returned by the upstream, if any.
        payload: Option<Value>,
    },

    /// The response body was not JSON and not a known gateway failure.
    #[error("undecodable response from {endpoint}: {body}")]
    Decode {
        /// Endpoint that was queried.
        endpoint: String,
        /// Raw body, lossily decoded.
        body: String,
    },

    /// Pages of a paginated fetch came from different upstream generations.
    #[error("inconsistent pages for {endpoint} after {restarts} restarts")]
    InconsistentPages {
        /// Endpoint that was queried.
        endpoint: String,
        /// Number of full restarts attempted.
        restarts: u32,
    },

    /// No usable refresh credential is stored for the acting identity.
    #[error("no refresh credential stored for identity {identity}")]
    MissingCredential {
        /// The acting identity.
        identity: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A request body or cached value could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The shared cache store failed.
    #[error("cache store failure: {0}")]
    Store(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl EsiError {
    /// Creates an upstream fault from a classified failure.
    pub fn upstream(kind: EsiErrorKind, endpoint: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Upstream {
            kind,
            endpoint: endpoint.into(),
            payload,
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Gets the taxonomy kind, if this fault carries one.
    pub fn kind(&self) -> Option<EsiErrorKind> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EsiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
