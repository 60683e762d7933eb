use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;
use relaypool::{Event, EventId, Pubkey};

use crate::collab::EventCache;
use crate::Result;

/// Sort key that iterates newest first.
type Recency = (std::cmp::Reverse<u64>, EventId);

fn recency(ev: &Event) -> Recency {
    (std::cmp::Reverse(ev.created_at), ev.id)
}

#[derive(Default)]
struct Inner {
    events: HashMap<EventId, Event>,
    order: BTreeSet<Recency>,
    by_author: HashMap<Pubkey, BTreeSet<Recency>>,
}

impl Inner {
    fn remove(&mut self, key: &Recency) {
        self.order.remove(key);
        let Some(ev) = self.events.remove(&key.1) else {
            return;
        };
        if let Some(keys) = self.by_author.get_mut(&ev.pubkey) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_author.remove(&ev.pubkey);
            }
        }
    }
}

/// Bounded in-memory [`EventCache`]. When full, the oldest event by
/// `created_at` is evicted.
pub struct MemoryCache {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        MemoryCache::new(10_000)
    }
}

impl EventCache for MemoryCache {
    fn put(&self, event: &Event) -> Result<()> {
        let mut inner = self.write();
        if inner.events.contains_key(&event.id) {
            return Ok(());
        }

        let key = recency(event);
        inner.order.insert(key);
        inner
            .by_author
            .entry(event.pubkey)
            .or_default()
            .insert(key);
        inner.events.insert(event.id, event.clone());

        while inner.events.len() > self.capacity {
            let Some(oldest) = inner.order.last().copied() else {
                break;
            };
            inner.remove(&oldest);
        }

        Ok(())
    }

    fn recent(&self, n: usize) -> Result<Vec<Event>> {
        let inner = self.read();
        Ok(inner
            .order
            .iter()
            .take(n)
            .filter_map(|(_, id)| inner.events.get(id).cloned())
            .collect())
    }

    fn by_author(&self, author: &Pubkey, n: usize) -> Result<Vec<Event>> {
        let inner = self.read();
        let Some(keys) = inner.by_author.get(author) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .take(n)
            .filter_map(|(_, id)| inner.events.get(id).cloned())
            .collect())
    }
}
