//! Mock collaborators for testing ESI clients.

use crate::auth::{AccessCredential, AuthService, ExchangeError, Identity, RefreshTokenSource};
use crate::errors::EsiResult;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory refresh token store.
#[derive(Debug, Default)]
pub struct MockRefreshTokenSource {
    tokens: Mutex<HashMap<Identity, String>>,
    deactivated: Mutex<Vec<Identity>>,
}

impl MockRefreshTokenSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a refresh token for an identity.
    pub fn with_token(self, identity: impl Into<Identity>, token: &str) -> Self {
        self.tokens
            .lock()
            .unwrap()
            .insert(identity.into(), token.to_string());
        self
    }

    /// Identities deactivated so far, in call order.
    pub fn deactivated(&self) -> Vec<Identity> {
        self.deactivated.lock().unwrap().clone()
    }
}

#[async_trait]
impl RefreshTokenSource for MockRefreshTokenSource {
    async fn refresh_token(&self, identity: &Identity) -> EsiResult<Option<SecretString>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(identity)
            .map(|token| SecretString::new(token.clone())))
    }

    async fn deactivate(&self, identity: &Identity) -> EsiResult<()> {
        self.tokens.lock().unwrap().remove(identity);
        self.deactivated.lock().unwrap().push(identity.clone());
        Ok(())
    }
}

/// Scripted SSO service.
#[derive(Debug)]
pub struct MockAuthService {
    exchanges: Mutex<VecDeque<Result<AccessCredential, ExchangeError>>>,
    exchanged_tokens: Mutex<Vec<String>>,
    exchange_calls: AtomicU32,
    probe_calls: AtomicU32,
    token_valid: AtomicBool,
}

impl Default for MockAuthService {
    fn default() -> Self {
        Self {
            exchanges: Mutex::new(VecDeque::new()),
            exchanged_tokens: Mutex::new(Vec::new()),
            exchange_calls: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
            token_valid: AtomicBool::new(true),
        }
    }
}

impl MockAuthService {
    /// Creates a service with no scripted exchanges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the validation probe answer.
    pub fn with_token_valid(self, valid: bool) -> Self {
        self.token_valid.store(valid, Ordering::SeqCst);
        self
    }

    /// Queues the result of the next exchange.
    pub fn push_exchange(&self, result: Result<AccessCredential, ExchangeError>) {
        self.exchanges.lock().unwrap().push_back(result);
    }

    /// Number of exchanges performed.
    pub fn exchange_calls(&self) -> u32 {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    /// Number of validation probes performed.
    pub fn probe_calls(&self) -> u32 {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented to `exchange`, in call order.
    pub fn exchanged_tokens(&self) -> Vec<String> {
        self.exchanged_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthService for MockAuthService {
    async fn exchange(&self, refresh_token: &SecretString) -> Result<AccessCredential, ExchangeError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.exchanged_tokens
            .lock()
            .unwrap()
            .push(refresh_token.expose_secret().clone());
        self.exchanges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ExchangeError::Service("no scripted exchange".to_string())))
    }

    async fn is_refresh_token_valid(&self, _refresh_token: &SecretString) -> bool {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.token_valid.load(Ordering::SeqCst)
    }
}
