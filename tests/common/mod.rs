//! Shared helpers for integration tests.

#![allow(dead_code)]

use integrations_esi::{EsiClient, EsiConfig};
use std::time::Duration;
use wiremock::MockServer;

/// Starts a mock server standing in for both ESI and SSO.
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Configuration pointing every endpoint at the mock server.
pub fn test_config(server: &MockServer) -> EsiConfig {
    EsiConfig::builder()
        .base_url(server.uri())
        .sso_token_url(format!("{}/oauth/token", server.uri()))
        .client_id("test-client")
        .client_secret("test-secret")
        .retry_delay(Duration::from_millis(10))
        .build()
        .expect("valid test config")
}

/// Anonymous client against the mock server.
pub fn test_client(server: &MockServer) -> EsiClient {
    EsiClient::new(test_config(server)).expect("Failed to build client")
}
