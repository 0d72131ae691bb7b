//! Response classification.
//!
//! ESI reports most failures with HTTP 200 and an `error` field in the body, so
//! classification is driven by the decoded payload and never by status alone.
//! The known transient messages are kept as table data in
//! [`TRANSIENT_ERROR_PHRASES`].

use crate::errors::{EsiError, EsiErrorKind, EsiResult};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Error messages that mean ESI itself is struggling and the request may succeed later.
pub const TRANSIENT_ERROR_PHRASES: &[&str] = &[
    "The datasource tranquility is temporarily unavailable",
    "No reply within 10 seconds",
    "timeout contacting endpoint",
    "Unhandled internal error encountered!",
    "Internal error",
    "failed to proxy request",
    "Timeout contacting tranquility",
];

/// SSO error codes that explicitly reject the credential.
pub const CREDENTIAL_REJECTION_ERRORS: &[&str] = &["invalid_token", "invalid_grant"];

/// Substring identifying a gateway failure page in place of JSON.
pub const GATEWAY_FAILURE_SIGNATURE: &str = "502 Bad Gateway";

/// Value of the `Warning` header on deprecated routes.
pub const DEPRECATION_WARNING: &str = "299 - This route is deprecated.";

/// Header carrying the remaining error budget.
pub const ERROR_LIMIT_REMAIN_HEADER: &str = "x-esi-error-limit-remain";

/// Header carrying the seconds until the error budget resets.
pub const ERROR_LIMIT_RESET_HEADER: &str = "x-esi-error-limit-reset";

/// Header carrying the page count of a paginated resource.
pub const PAGES_HEADER: &str = "x-pages";

/// Header fields the client acts on, pulled from every response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSignals {
    /// Errors remaining in the current budget window.
    pub error_limit_remain: Option<u32>,
    /// Seconds until the budget window resets.
    pub error_limit_reset: Option<u64>,
    /// Raw `expires` header, used verbatim as the generation marker.
    pub expires: Option<String>,
    /// Parsed `expires` header.
    pub expires_at: Option<DateTime<Utc>>,
    /// Page count of a paginated resource.
    pub pages: Option<u32>,
    /// The route carries the deprecation warning.
    pub deprecated: bool,
}

impl ResponseSignals {
    /// Extracts signals from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        let expires = text("expires");
        let expires_at = expires.as_deref().and_then(parse_http_date);

        Self {
            error_limit_remain: text(ERROR_LIMIT_REMAIN_HEADER).and_then(|v| v.parse().ok()),
            error_limit_reset: text(ERROR_LIMIT_RESET_HEADER).and_then(|v| v.parse().ok()),
            expires,
            expires_at,
            pages: text(PAGES_HEADER).and_then(|v| v.parse().ok()),
            deprecated: text("warning").map_or(false, |w| w == DEPRECATION_WARNING),
        }
    }
}

/// Parses an HTTP date such as `Thu, 16 Oct 2026 12:00:00 GMT`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Result of classifying a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Error kind, `None` when the payload carries no error marker.
    pub kind: Option<EsiErrorKind>,
    /// The payload, unchanged.
    pub payload: Value,
}

/// Classifies a decoded payload.
pub fn classify(payload: Value) -> Classification {
    let kind = payload
        .as_object()
        .and_then(|body| body.get("error").map(|error| (body, error)))
        .map(|(body, error)| {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());

            if body.contains_key("sso_status") {
                if CREDENTIAL_REJECTION_ERRORS.contains(&message.as_str()) {
                    EsiErrorKind::InvalidCredential
                } else {
                    EsiErrorKind::AuthServiceError
                }
            } else if TRANSIENT_ERROR_PHRASES.contains(&message.as_str()) {
                EsiErrorKind::UpstreamUnresponsive
            } else {
                EsiErrorKind::UpstreamApplicationError
            }
        });

    Classification { kind, payload }
}

/// Decodes a raw body into JSON.
///
/// A non-JSON gateway failure page becomes a synthetic transient error
/// payload. Any other non-JSON body is a [`EsiError::Decode`] fault.
pub fn decode_body(endpoint: &str, status: StatusCode, body: &[u8]) -> EsiResult<Value> {
    if body.is_empty() && status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    match serde_json::from_slice(body) {
        Ok(value) => Ok(value),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            if text.contains(GATEWAY_FAILURE_SIGNATURE) {
                Ok(json!({
                    "error": "failed to proxy request",
                    "actual_error": "502 bad gateway",
                }))
            } else {
                tracing::error!(
                    endpoint = endpoint,
                    status = status.as_u16(),
                    body = %text,
                    "Undecodable ESI response"
                );
                Err(EsiError::Decode {
                    endpoint: endpoint.to_string(),
                    body: text.into_owned(),
                })
            }
        }
    }
}

/// Decodes and classifies a response body.
pub fn classify_body(endpoint: &str, status: StatusCode, body: &[u8]) -> EsiResult<Classification> {
    decode_body(endpoint, status, body).map(classify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use test_case::test_case;

    #[test]
    fn test_payload_without_error_passes_through() {
        let payload = json!([{"type_id": 34, "price": 5.1}]);
        let result = classify(payload.clone());

        assert_eq!(result.kind, None);
        assert_eq!(result.payload, payload);

        let object = json!({"players": 23000, "server_version": "1"});
        assert_eq!(classify(object.clone()).payload, object);
    }

    #[test_case("The datasource tranquility is temporarily unavailable")]
    #[test_case("No reply within 10 seconds")]
    #[test_case("timeout contacting endpoint")]
    #[test_case("Unhandled internal error encountered!")]
    #[test_case("Internal error")]
    #[test_case("failed to proxy request")]
    #[test_case("Timeout contacting tranquility")]
    fn test_transient_phrases(message: &str) {
        let result = classify(json!({ "error": message }));
        assert_eq!(result.kind, Some(EsiErrorKind::UpstreamUnresponsive));
    }

    #[test]
    fn test_unknown_error_is_application_error() {
        let result = classify(json!({"error": "Character not found"}));
        assert_eq!(result.kind, Some(EsiErrorKind::UpstreamApplicationError));
    }

    #[test]
    fn test_sso_error_classification() {
        let rejected = classify(json!({"error": "invalid_token", "sso_status": 401}));
        assert_eq!(rejected.kind, Some(EsiErrorKind::InvalidCredential));

        let flaky = classify(json!({"error": "sso unreachable", "sso_status": 502}));
        assert_eq!(flaky.kind, Some(EsiErrorKind::AuthServiceError));
    }

    #[test]
    fn test_gateway_failure_body() {
        let body = b"<html><body><h1>502 Bad Gateway</h1></body></html>";
        let payload = decode_body("/v1/status/", StatusCode::BAD_GATEWAY, body).unwrap();

        assert_eq!(payload["actual_error"], "502 bad gateway");
        assert_eq!(classify(payload).kind, Some(EsiErrorKind::UpstreamUnresponsive));
    }

    #[test]
    fn test_undecodable_body_is_fatal() {
        let result = decode_body("/v1/status/", StatusCode::OK, b"<html>maintenance</html>");
        assert!(matches!(result, Err(EsiError::Decode { .. })));
    }

    #[test]
    fn test_signals_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Esi-Error-Limit-Remain", HeaderValue::from_static("12"));
        headers.insert("X-Esi-Error-Limit-Reset", HeaderValue::from_static("37"));
        headers.insert("Expires", HeaderValue::from_static("Thu, 16 Oct 2026 12:05:00 GMT"));
        headers.insert("X-Pages", HeaderValue::from_static("4"));
        headers.insert("Warning", HeaderValue::from_static(DEPRECATION_WARNING));

        let signals = ResponseSignals::from_headers(&headers);
        assert_eq!(signals.error_limit_remain, Some(12));
        assert_eq!(signals.error_limit_reset, Some(37));
        assert_eq!(signals.pages, Some(4));
        assert!(signals.deprecated);
        assert_eq!(signals.expires.as_deref(), Some("Thu, 16 Oct 2026 12:05:00 GMT"));
        assert_eq!(
            signals.expires_at.map(|t| t.to_rfc3339()),
            Some("2026-10-16T12:05:00+00:00".to_string())
        );
    }

    #[test]
    fn test_classify_body() {
        let body = br#"{"error": "Internal error"}"#;
        let result = classify_body("/v1/markets/", StatusCode::OK, body).unwrap();
        assert_eq!(result.kind, Some(EsiErrorKind::UpstreamUnresponsive));

        let empty = classify_body("/v1/fleets/1/", StatusCode::NO_CONTENT, b"").unwrap();
        assert_eq!(empty.kind, None);
        assert_eq!(empty.payload, Value::Null);
    }
}
