//! Bulk fetching for ESI.
//!
//! Two protocols share one bounded pool of in-flight requests:
//!
//! - an independent map, issuing one request per parameter and collecting
//!   every result keyed by its parameter;
//! - a paginated accumulate, fetching pages concurrently and checking that
//!   every page carries the same generation marker (the raw `expires`
//!   header). A page set assembled from two generations is never returned.

use crate::client::EsiClient;
use crate::errors::{EsiError, EsiResult, RequestResult};
use crate::resilience::apply_terminal_policy;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

/// Substitutes `param` for the first `{}` placeholder in `template`.
pub fn fill_template(template: &str, param: &impl Display) -> String {
    template.replacen("{}", &param.to_string(), 1)
}

/// Builds the template addressing individual pages of `endpoint`.
pub fn page_template(endpoint: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}page={{}}", endpoint, separator)
}

/// Tracks the generation marker of a page set.
///
/// The first observed marker becomes the reference unless the tracker was
/// seeded from a probe response.
#[derive(Debug, Clone, Default)]
pub struct GenerationTracker {
    expected: Option<Option<String>>,
}

impl GenerationTracker {
    /// Creates a tracker that adopts the first marker it observes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker seeded with a known marker.
    ///
    /// `None` behaves like [`GenerationTracker::new`].
    pub fn seeded(marker: Option<String>) -> Self {
        Self {
            expected: marker.map(Some),
        }
    }

    /// Records the marker of one page. Returns false on a generation mismatch.
    pub fn observe(&mut self, marker: Option<&str>) -> bool {
        match &self.expected {
            Some(expected) => expected.as_deref() == marker,
            None => {
                self.expected = Some(marker.map(str::to_string));
                true
            }
        }
    }

    /// The reference marker, once known.
    pub fn marker(&self) -> Option<&str> {
        self.expected.as_ref().and_then(|m| m.as_deref())
    }
}

/// Outcome of a paginated accumulate.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSetOutcome {
    /// Every page came from one generation. Items are in page order.
    Complete(Vec<Value>),
    /// Pages came from different generations and were discarded.
    Inconsistent,
}

impl PageSetOutcome {
    /// Returns the items of a complete page set.
    pub fn into_items(self) -> Option<Vec<Value>> {
        match self {
            Self::Complete(items) => Some(items),
            Self::Inconsistent => None,
        }
    }
}

/// Bulk fetch engine bound to a client and its policy.
pub struct BulkFetcher<'a> {
    client: &'a EsiClient,
}

impl<'a> BulkFetcher<'a> {
    pub(crate) fn new(client: &'a EsiClient) -> Self {
        Self { client }
    }

    fn concurrency(&self) -> usize {
        self.client.config().max_concurrency.max(1)
    }

    /// Fetches `template` once per parameter, at most `max_concurrency` at a time.
    ///
    /// Bulk requests skip the response cache. Each result goes through the
    /// client's terminal policy, so a raised failure aborts the whole batch,
    /// as does an undecodable response.
    pub async fn get_multiple<P>(
        &self,
        template: &str,
        params: &[P],
    ) -> EsiResult<HashMap<P, RequestResult>>
    where
        P: Display + Eq + Hash + Clone,
    {
        let policy = self.client.policy();
        tracing::debug!(
            template = template,
            count = params.len(),
            concurrency = self.concurrency(),
            "Starting bulk fetch"
        );

        let mut responses = stream::iter(params.iter().cloned())
            .map(|param| async move {
                let endpoint = fill_template(template, &param);
                let attempt = self.client.fetch_uncached(&endpoint, None).await;
                (param, endpoint, attempt)
            })
            .buffer_unordered(self.concurrency());

        let mut results = HashMap::with_capacity(params.len());
        while let Some((param, endpoint, attempt)) = responses.next().await {
            let result = RequestResult::from_attempt(
                attempt?.map(|fetched| (fetched.payload, fetched.signals.expires_at)),
            );
            results.insert(param, apply_terminal_policy(policy, &endpoint, result)?);
        }

        Ok(results)
    }

    /// Fetches every parameter of `template` and flattens the payloads.
    ///
    /// Array payloads are concatenated and other payloads appended as one
    /// item. Returns [`PageSetOutcome::Inconsistent`] as soon as a page
    /// disagrees with the generation marker; in-flight requests are dropped.
    /// A page that still fails after retries is raised regardless of policy,
    /// since the set would otherwise be incomplete.
    pub async fn get_multiple_flat<P>(
        &self,
        template: &str,
        params: &[P],
        marker: Option<String>,
    ) -> EsiResult<PageSetOutcome>
    where
        P: Display + Clone,
    {
        let mut tracker = GenerationTracker::seeded(marker);

        let mut responses = stream::iter(params.iter().cloned().enumerate())
            .map(|(index, param)| async move {
                let endpoint = fill_template(template, &param);
                let attempt = self.client.fetch_uncached(&endpoint, None).await;
                (index, endpoint, attempt)
            })
            .buffer_unordered(self.concurrency());

        let mut pages = Vec::with_capacity(params.len());
        while let Some((index, endpoint, attempt)) = responses.next().await {
            let fetched = match attempt? {
                Ok(fetched) => fetched,
                Err(failure) => {
                    return Err(EsiError::upstream(failure.kind, endpoint, failure.payload))
                }
            };

            let marker = fetched.signals.expires.as_deref();
            if !tracker.observe(marker) {
                tracing::warn!(
                    endpoint = %endpoint,
                    expected = ?tracker.marker(),
                    received = ?marker,
                    "Cache switchover detected, discarding page set"
                );
                return Ok(PageSetOutcome::Inconsistent);
            }
            pages.push((index, fetched.payload));
        }

        pages.sort_by_key(|(index, _)| *index);
        let mut items = Vec::new();
        for (_, payload) in pages {
            match payload {
                Value::Array(values) => items.extend(values),
                other => items.push(other),
            }
        }

        Ok(PageSetOutcome::Complete(items))
    }

    /// Like [`BulkFetcher::get_multiple_flat`], restarting on a generation mismatch.
    ///
    /// Gives up with [`EsiError::InconsistentPages`] once the policy's
    /// restart budget is spent.
    pub async fn get_multiple_flat_consistent<P>(
        &self,
        template: &str,
        params: &[P],
    ) -> EsiResult<Vec<Value>>
    where
        P: Display + Clone,
    {
        let mut restarts = 0;
        loop {
            match self.get_multiple_flat(template, params, None).await? {
                PageSetOutcome::Complete(items) => return Ok(items),
                PageSetOutcome::Inconsistent => self.restart_or_give_up(template, &mut restarts)?,
            }
        }
    }

    /// Fetches every page of `endpoint`.
    ///
    /// The page count and the reference marker come from a cache-bypassing
    /// probe. A missing `X-Pages` header means a single page. On a
    /// generation mismatch the whole operation, probe included, restarts.
    pub async fn get_multiple_paginated(&self, endpoint: &str) -> EsiResult<Vec<Value>> {
        let template = page_template(endpoint);
        let mut restarts = 0;

        loop {
            let signals = match self.client.probe(endpoint).await? {
                Ok(signals) => signals,
                Err(failure) => {
                    return Err(EsiError::upstream(failure.kind, endpoint, failure.payload))
                }
            };

            let pages: Vec<u32> = (1..=signals.pages.unwrap_or(1)).collect();
            match self.get_multiple_flat(&template, &pages, signals.expires).await? {
                PageSetOutcome::Complete(items) => return Ok(items),
                PageSetOutcome::Inconsistent => self.restart_or_give_up(endpoint, &mut restarts)?,
            }
        }
    }

    fn restart_or_give_up(&self, endpoint: &str, restarts: &mut u32) -> EsiResult<()> {
        let budget = self.client.policy().max_pagination_restarts;
        if *restarts >= budget {
            tracing::error!(
                endpoint = endpoint,
                restarts = *restarts,
                "Giving up on paginated fetch"
            );
            return Err(EsiError::InconsistentPages {
                endpoint: endpoint.to_string(),
                restarts: *restarts,
            });
        }

        *restarts += 1;
        self.client.record_pagination_restart();
        tracing::info!(endpoint = endpoint, restart = *restarts, "Restarting paginated fetch");
        Ok(())
    }
}
