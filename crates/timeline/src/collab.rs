//! Seams to the rest of the application. The engine only ever talks to
//! these traits, never to a concrete filter, ranking or store.

use std::sync::RwLock;

use hashbrown::HashMap;
use relaypool::{Event, Pubkey, RelayUrl};

use crate::Result;

/// Decides whether an event belongs in the feed at all.
pub trait ContentFilter: Send + Sync {
    fn is_relevant(&self, event: &Event) -> bool;
}

pub struct AcceptAll;

impl ContentFilter for AcceptAll {
    fn is_relevant(&self, _event: &Event) -> bool {
        true
    }
}

impl<F> ContentFilter for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn is_relevant(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Knows which relays the given authors favor, and how strongly.
pub trait PopularityRanker: Send + Sync {
    fn rank(&self, authors: &[Pubkey]) -> Vec<(RelayUrl, f64)>;
}

/// No ranking available; the distribution strategy falls back to its
/// default relays.
pub struct NoRanking;

impl PopularityRanker for NoRanking {
    fn rank(&self, _authors: &[Pubkey]) -> Vec<(RelayUrl, f64)> {
        Vec::new()
    }
}

/// Ranks relays by how many of the requested authors list them. Feed it
/// from relay lists or from where we have seen an author's events.
#[derive(Default)]
pub struct AuthorRelayHints {
    hints: RwLock<HashMap<Pubkey, Vec<RelayUrl>>>,
}

impl AuthorRelayHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, author: Pubkey, relays: Vec<RelayUrl>) {
        let mut hints = self
            .hints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hints.insert(author, relays);
    }

    /// Remember that `author` was seen on `relay`.
    pub fn observed(&self, author: Pubkey, relay: RelayUrl) {
        let mut hints = self
            .hints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let relays = hints.entry(author).or_default();
        if !relays.contains(&relay) {
            relays.push(relay);
        }
    }
}

impl PopularityRanker for AuthorRelayHints {
    fn rank(&self, authors: &[Pubkey]) -> Vec<(RelayUrl, f64)> {
        let hints = self
            .hints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut counts: HashMap<RelayUrl, usize> = HashMap::new();
        for author in authors {
            for relay in hints.get(author).into_iter().flatten() {
                *counts.entry(relay.clone()).or_default() += 1;
            }
        }

        let total = authors.len().max(1) as f64;
        let mut ranked: Vec<(RelayUrl, f64)> = counts
            .into_iter()
            .map(|(url, n)| (url, n as f64 / total))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

/// Local read-through store. Misses and errors never block the network path;
/// the manager logs and moves on.
pub trait EventCache: Send + Sync {
    fn put(&self, event: &Event) -> Result<()>;

    /// Newest `n` events, newest first.
    fn recent(&self, n: usize) -> Result<Vec<Event>>;

    /// Newest `n` events by `author`, newest first.
    fn by_author(&self, author: &Pubkey, n: usize) -> Result<Vec<Event>>;
}

pub struct NoCache;

impl EventCache for NoCache {
    fn put(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    fn recent(&self, _n: usize) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    fn by_author(&self, _author: &Pubkey, _n: usize) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}
