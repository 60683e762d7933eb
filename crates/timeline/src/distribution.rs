use std::sync::Arc;

use hashbrown::HashMap;
use relaypool::{Filter, HealthMonitor, HealthStatus, Pubkey, RelayUrl};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collab::PopularityRanker;

/// Horizontal and vertical video kinds, plus their addressable variants.
pub const VIDEO_KINDS: [u32; 4] = [21, 22, 34235, 34236];

/// One logical query: the same filter sent to every listed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub endpoints: Vec<RelayUrl>,
    pub filter: Filter,
}

impl SubscriptionRequest {
    pub fn new(endpoints: Vec<RelayUrl>, filter: Filter) -> Self {
        Self { endpoints, filter }
    }
}

fn default_relays(urls: &[&str]) -> Vec<RelayUrl> {
    urls.iter().filter_map(|u| RelayUrl::new(u).ok()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Used when the ranking knows nothing about the requested authors.
    pub fallback_relays: Vec<RelayUrl>,
    /// Queried directly, without an author filter, for the global feed.
    pub global_relays: Vec<RelayUrl>,
    /// Upper bound on relays per plan.
    pub relay_budget: usize,
    pub authors_per_request: usize,
    /// How many relays each author chunk is sent to.
    pub redundancy: usize,
    pub kinds: Vec<u32>,
    pub limit: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            fallback_relays: default_relays(&[
                "wss://relay.damus.io",
                "wss://nos.lol",
                "wss://relay.primal.net",
            ]),
            global_relays: default_relays(&[
                "wss://relay.damus.io",
                "wss://nos.lol",
                "wss://relay.nostr.band",
            ]),
            relay_budget: 5,
            authors_per_request: 150,
            redundancy: 2,
            kinds: VIDEO_KINDS.to_vec(),
            limit: 50,
        }
    }
}

/// Decides which relays get asked about which authors.
pub struct DistributionStrategy {
    config: DistributionConfig,
    ranker: Arc<dyn PopularityRanker>,
    health: Arc<HealthMonitor>,
}

impl DistributionStrategy {
    pub fn new(
        config: DistributionConfig,
        ranker: Arc<dyn PopularityRanker>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            config,
            ranker,
            health,
        }
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    fn base_filter(&self) -> Filter {
        Filter::new()
            .kinds(self.config.kinds.iter().copied())
            .limit(self.config.limit)
    }

    /// Relays for `authors`, best first: popularity weighted by health,
    /// relays known to be unhealthy dropped, capped at `relay_budget`.
    pub fn select_relays(&self, authors: &[Pubkey]) -> Vec<RelayUrl> {
        let mut popularity: HashMap<RelayUrl, f64> = HashMap::new();
        for (url, score) in self.ranker.rank(authors) {
            let entry = popularity.entry(url).or_insert(0.0);
            *entry = entry.max(score);
        }

        if popularity.is_empty() {
            debug!("no relay ranking for {} authors, using fallback", authors.len());
            popularity = self
                .config
                .fallback_relays
                .iter()
                .map(|url| (url.clone(), 1.0))
                .collect();
        }

        let known_bad = |url: &RelayUrl| {
            self.health.metrics(url).is_some()
                && self.health.health_status(url) == HealthStatus::Unhealthy
        };

        let mut scored: Vec<(RelayUrl, f64)> = popularity
            .iter()
            .filter(|(url, _)| !known_bad(url))
            .map(|(url, pop)| (url.clone(), pop * self.health.score(url)))
            .collect();

        // everything is unhealthy: still better to ask than to show nothing
        if scored.is_empty() {
            scored = popularity
                .into_iter()
                .map(|(url, pop)| {
                    let score = pop * self.health.score(&url);
                    (url, score)
                })
                .collect();
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(self.config.relay_budget.max(1));
        scored.into_iter().map(|(url, _)| url).collect()
    }

    /// Plan a following-style feed. An empty target set plans nothing; it
    /// never turns into a global query.
    #[profiling::function]
    pub fn plan_queries(&self, targets: &[Pubkey], self_author: &Pubkey) -> Vec<SubscriptionRequest> {
        if targets.is_empty() {
            return Vec::new();
        }

        let mut authors: Vec<Pubkey> = targets.to_vec();
        authors.push(*self_author);
        authors.sort();
        authors.dedup();

        let relays = self.select_relays(&authors);
        if relays.is_empty() {
            return Vec::new();
        }

        let chunks: Vec<&[Pubkey]> = authors
            .chunks(self.config.authors_per_request.max(1))
            .collect();

        if chunks.len() == 1 {
            return vec![SubscriptionRequest::new(
                relays,
                self.base_filter().authors(authors.iter().copied()),
            )];
        }

        let redundancy = self.config.redundancy.clamp(1, relays.len());
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let endpoints = (0..redundancy)
                    .map(|k| relays[(i * redundancy + k) % relays.len()].clone())
                    .collect();
                SubscriptionRequest::new(
                    endpoints,
                    self.base_filter().authors(chunk.iter().copied()),
                )
            })
            .collect()
    }

    /// The non-personalized feed: a fixed relay set, no author filter.
    pub fn plan_global(&self) -> Vec<SubscriptionRequest> {
        if self.config.global_relays.is_empty() {
            return Vec::new();
        }
        vec![SubscriptionRequest::new(
            self.config.global_relays.clone(),
            self.base_filter(),
        )]
    }
}
