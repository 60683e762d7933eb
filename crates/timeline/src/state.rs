use std::cmp::Ordering;
use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use relaypool::{Event, EventId};
use serde::Serialize;
use tracing::debug;

use crate::collab::ContentFilter;
use crate::fingerprint::Fingerprinter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    FrontInsert,
    Spliced,
}

/// Merge two slices that are each sorted by `cmp`. Also reports whether the
/// new items all landed in front of the old ones, or got spliced in between.
pub fn merge_sorted_vecs<T: Clone>(
    vec1: &[T],
    vec2: &[T],
    cmp: impl Fn(&T, &T) -> Ordering,
) -> (Vec<T>, MergeKind) {
    let mut merged = Vec::with_capacity(vec1.len() + vec2.len());
    let mut i = 0;
    let mut j = 0;
    let mut result: Option<MergeKind> = None;

    while i < vec1.len() && j < vec2.len() {
        if cmp(&vec1[i], &vec2[j]) != Ordering::Greater {
            if result.is_none() {
                // pushing from the old list while new items remain
                result = Some(MergeKind::Spliced);
            }
            merged.push(vec1[i].clone());
            i += 1;
        } else {
            merged.push(vec2[j].clone());
            j += 1;
        }
    }

    merged.extend_from_slice(&vec1[i..]);
    merged.extend_from_slice(&vec2[j..]);

    (merged, result.unwrap_or(MergeKind::FrontInsert))
}

/// Where a batch of stored events came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    Relay,
    Cache,
}

/// Why an event did not make it into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Irrelevant,
    DuplicateId,
    DuplicateContent,
}

/// Where a live event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveOutcome {
    /// In `new_events`, waiting for `merge_new`.
    Buffered(Event),
    /// Arrived before the backlog settled; released when it does.
    Held,
    Rejected(Rejection),
}

/// Produced once, when the last endpoint of a subscription reaches EOSE or
/// fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    /// Live events held back during the backlog, now in `new_events`.
    pub released: Vec<Event>,
    pub error: Option<String>,
}

/// One page of older events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub events: Vec<Event>,
    pub until: Option<u64>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineSnapshot {
    pub key: String,
    pub events: Vec<Event>,
    pub new_events: Vec<Event>,
    pub until: Option<u64>,
    pub loading: bool,
    pub error: Option<String>,
    pub has_more: bool,
    pub closed: bool,
    pub filtered: usize,
    pub duplicates: usize,
}

/// The merged, deduplicated view of one subscription.
#[derive(Debug)]
pub struct TimelineState {
    key: String,
    /// newest first
    events: Vec<Event>,
    /// oldest at the front
    new_events: VecDeque<Event>,
    held_live: Vec<Event>,
    live_cap: usize,

    seen_ids: HashSet<EventId>,
    seen_content: HashSet<String>,
    fingerprints: HashMap<EventId, String>,

    until: Option<u64>,
    loading: bool,
    error: Option<String>,
    has_more: bool,
    closed: bool,
    backlog_done: bool,

    streams: usize,
    outstanding: usize,
    failed: usize,
    last_error: Option<String>,

    filtered: usize,
    duplicates: usize,
}

impl TimelineState {
    pub fn new(key: impl Into<String>, live_cap: usize) -> Self {
        Self {
            key: key.into(),
            events: Vec::new(),
            new_events: VecDeque::new(),
            held_live: Vec::new(),
            live_cap: live_cap.max(1),
            seen_ids: HashSet::new(),
            seen_content: HashSet::new(),
            fingerprints: HashMap::new(),
            until: None,
            loading: true,
            error: None,
            has_more: true,
            closed: false,
            backlog_done: false,
            streams: 0,
            outstanding: 0,
            failed: 0,
            last_error: None,
            filtered: 0,
            duplicates: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn new_events(&self) -> impl Iterator<Item = &Event> {
        self.new_events.iter()
    }

    pub fn until(&self) -> Option<u64> {
        self.until
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.loading = false;
    }

    /// Check relevance and both identity keys, and remember the event if it
    /// passes.
    fn admit(
        &mut self,
        ev: &Event,
        filter: &dyn ContentFilter,
        fingerprinter: &dyn Fingerprinter,
    ) -> Result<(), Rejection> {
        if !filter.is_relevant(ev) {
            self.filtered += 1;
            return Err(Rejection::Irrelevant);
        }

        if self.seen_ids.contains(&ev.id) {
            self.duplicates += 1;
            return Err(Rejection::DuplicateId);
        }

        let fingerprint = fingerprinter.fingerprint(ev);
        if let Some(fp) = &fingerprint {
            if self.seen_content.contains(fp) {
                self.duplicates += 1;
                return Err(Rejection::DuplicateContent);
            }
        }

        self.seen_ids.insert(ev.id);
        if let Some(fp) = fingerprint {
            self.seen_content.insert(fp.clone());
            self.fingerprints.insert(ev.id, fp);
        }
        Ok(())
    }

    fn forget(&mut self, ev: &Event) {
        self.seen_ids.remove(&ev.id);
        if let Some(fp) = self.fingerprints.remove(&ev.id) {
            self.seen_content.remove(&fp);
        }
    }

    fn lower_until(&mut self, oldest: u64) {
        let candidate = oldest.saturating_sub(1);
        self.until = Some(match self.until {
            Some(until) => until.min(candidate),
            None => candidate,
        });
    }

    /// Admit a batch of stored events and merge the survivors into the
    /// timeline. Returns what was accepted, newest first.
    ///
    /// Only relay batches move the `until` cursor, and they move it past the
    /// oldest event the relay sent whether or not it was accepted. Cached
    /// events can be older than anything the relays have returned yet, so
    /// letting them move the cursor would skip history on the next page.
    #[profiling::function]
    pub fn apply_batch(
        &mut self,
        batch: Vec<Event>,
        source: BatchSource,
        filter: &dyn ContentFilter,
        fingerprinter: &dyn Fingerprinter,
    ) -> Vec<Event> {
        if source == BatchSource::Relay {
            if let Some(oldest) = batch.iter().map(|ev| ev.created_at).min() {
                self.lower_until(oldest);
            }
        }

        let mut accepted: Vec<Event> = Vec::with_capacity(batch.len());
        for ev in batch {
            if self.admit(&ev, filter, fingerprinter).is_ok() {
                accepted.push(ev);
            }
        }

        if accepted.is_empty() {
            return accepted;
        }

        accepted.sort_by(Event::timeline_cmp);
        let (events, merge_kind) =
            merge_sorted_vecs(&self.events, &accepted, Event::timeline_cmp);
        if merge_kind == MergeKind::Spliced {
            debug!(
                "{}: spliced {} events into the timeline",
                self.key,
                accepted.len()
            );
        }
        self.events = events;

        accepted
    }

    /// Admit a page fetched by `load_more`. The cursor always moves past the
    /// oldest event the relays returned, even when all of them turned out
    /// to be duplicates, so paging cannot get stuck.
    pub fn apply_page(
        &mut self,
        raw: Vec<Event>,
        filter: &dyn ContentFilter,
        fingerprinter: &dyn Fingerprinter,
    ) -> Page {
        if raw.is_empty() {
            self.has_more = false;
        }
        let accepted = self.apply_batch(raw, BatchSource::Relay, filter, fingerprinter);

        Page {
            events: accepted,
            until: self.until,
            has_more: self.has_more,
        }
    }

    fn buffer_live(&mut self, ev: Event) {
        self.new_events.push_back(ev);
        while self.new_events.len() > self.live_cap {
            if let Some(evicted) = self.new_events.pop_front() {
                self.forget(&evicted);
            }
        }
    }

    pub fn push_live(
        &mut self,
        ev: Event,
        filter: &dyn ContentFilter,
        fingerprinter: &dyn Fingerprinter,
    ) -> LiveOutcome {
        if let Err(rejection) = self.admit(&ev, filter, fingerprinter) {
            return LiveOutcome::Rejected(rejection);
        }

        if !self.backlog_done {
            self.held_live.push(ev);
            return LiveOutcome::Held;
        }

        self.buffer_live(ev.clone());
        LiveOutcome::Buffered(ev)
    }

    /// Promote buffered live events into the main timeline.
    pub fn merge_new(&mut self) -> usize {
        if self.new_events.is_empty() {
            return 0;
        }

        let mut fresh: Vec<Event> = self.new_events.drain(..).collect();
        fresh.sort_by(Event::timeline_cmp);
        let n = fresh.len();
        let (events, _) = merge_sorted_vecs(&self.events, &fresh, Event::timeline_cmp);
        self.events = events;
        n
    }

    /// How many endpoint streams have to report before the backlog settles.
    pub fn expect_streams(&mut self, n: usize) {
        self.streams = n;
        self.outstanding = n;
        self.failed = 0;
        self.last_error = None;
        if n == 0 {
            self.settle();
        }
    }

    /// Nothing to fetch. Not an error.
    pub fn settle_empty(&mut self) -> Settled {
        self.streams = 0;
        self.outstanding = 0;
        self.has_more = false;
        self.settle()
    }

    /// There was nothing to even try.
    pub fn settle_failed(&mut self, reason: impl Into<String>) -> Settled {
        self.last_error = Some(reason.into());
        self.streams = 0;
        self.outstanding = 0;
        self.failed = 0;
        let mut settled = self.settle();
        let error = self.last_error.clone();
        self.error = error.clone();
        self.has_more = false;
        settled.error = error;
        settled
    }

    /// One endpoint stream reached EOSE (`Ok`) or failed (`Err`). Returns
    /// `Some` exactly once, when the last stream reports.
    pub fn stream_done(&mut self, outcome: Result<(), String>) -> Option<Settled> {
        if self.outstanding == 0 {
            return None;
        }

        self.outstanding -= 1;
        if let Err(reason) = outcome {
            self.failed += 1;
            self.last_error = Some(reason);
        }

        if self.outstanding > 0 {
            return None;
        }

        let mut settled = self.settle();
        if self.failed == self.streams {
            let reason = self
                .last_error
                .clone()
                .unwrap_or_else(|| "every endpoint failed".to_owned());
            self.error = Some(reason.clone());
            self.has_more = false;
            settled.error = Some(reason);
        }
        Some(settled)
    }

    fn settle(&mut self) -> Settled {
        self.loading = false;
        self.backlog_done = true;
        if self.events.is_empty() {
            self.has_more = false;
        }

        let mut held = std::mem::take(&mut self.held_live);
        // oldest first so the newest end up at the back of the buffer
        held.sort_by(|a, b| b.timeline_cmp(a));
        for ev in &held {
            self.buffer_live(ev.clone());
        }

        Settled {
            released: held,
            error: None,
        }
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            key: self.key.clone(),
            events: self.events.clone(),
            new_events: self.new_events.iter().cloned().collect(),
            until: self.until,
            loading: self.loading,
            error: self.error.clone(),
            has_more: self.has_more,
            closed: self.closed,
            filtered: self.filtered,
            duplicates: self.duplicates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::AcceptAll;
    use crate::fingerprint::MediaUrlFingerprint;
    use relaypool::Pubkey;

    fn ev(n: u8, created_at: u64, media: &str) -> Event {
        Event {
            id: EventId::new([n; 32]),
            pubkey: Pubkey::new([1; 32]),
            created_at,
            kind: 34235,
            tags: vec![vec!["url".to_owned(), media.to_owned()]],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn media(n: u8) -> String {
        format!("https://cdn.example.com/{n}.mp4")
    }

    fn times(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.created_at).collect()
    }

    #[test]
    fn test_merge_sorted_vecs() {
        let a = [9, 7, 5];
        let b = [8, 6];
        let desc = |x: &i32, y: &i32| y.cmp(x);

        let (merged, kind) = merge_sorted_vecs(&a, &b, desc);
        assert_eq!(merged, vec![9, 8, 7, 6, 5]);
        assert_eq!(kind, MergeKind::Spliced);

        let (merged, kind) = merge_sorted_vecs(&a, &[12, 10], desc);
        assert_eq!(merged, vec![12, 10, 9, 7, 5]);
        assert_eq!(kind, MergeKind::FrontInsert);
    }

    #[test]
    fn batches_merge_sorted_and_dedupe_both_ways() {
        let mut st = TimelineState::new("k", 50);
        let fp = MediaUrlFingerprint;

        let first = st.apply_batch(
            vec![ev(1, 100, &media(1)), ev(2, 300, &media(2))],
            BatchSource::Relay,
            &AcceptAll,
            &fp,
        );
        assert_eq!(times(&first), vec![300, 100]);

        // same id again, and same media under a new id
        let second = st.apply_batch(
            vec![ev(1, 100, &media(1)), ev(3, 200, &media(2)), ev(4, 200, &media(4))],
            BatchSource::Relay,
            &AcceptAll,
            &fp,
        );
        assert_eq!(times(&second), vec![200]);
        assert_eq!(times(st.events()), vec![300, 200, 100]);
        assert_eq!(st.snapshot().duplicates, 2);
        assert_eq!(st.until(), Some(99));
    }

    #[test]
    fn irrelevant_events_are_counted_not_kept() {
        let mut st = TimelineState::new("k", 50);
        let only_new = |e: &Event| e.created_at > 150;
        let kept = st.apply_batch(
            vec![ev(1, 100, &media(1)), ev(2, 200, &media(2))],
            BatchSource::Relay,
            &only_new,
            &MediaUrlFingerprint,
        );
        assert_eq!(times(&kept), vec![200]);
        assert_eq!(st.snapshot().filtered, 1);
    }

    #[test]
    fn until_only_moves_backwards() {
        let mut st = TimelineState::new("k", 50);
        let fp = MediaUrlFingerprint;
        st.apply_batch(vec![ev(1, 100, &media(1))], BatchSource::Relay, &AcceptAll, &fp);
        assert_eq!(st.until(), Some(99));
        st.apply_batch(vec![ev(2, 500, &media(2))], BatchSource::Relay, &AcceptAll, &fp);
        assert_eq!(st.until(), Some(99));

        let page = st.apply_page(vec![ev(3, 90, &media(3)), ev(1, 100, &media(1))], &AcceptAll, &fp);
        assert_eq!(page.until, Some(89));
        assert!(page.has_more);

        // nothing new, but the relays did return something
        let page = st.apply_page(vec![ev(3, 90, &media(3))], &AcceptAll, &fp);
        assert!(page.events.is_empty());
        assert_eq!(page.until, Some(89));

        let page = st.apply_page(vec![], &AcceptAll, &fp);
        assert!(!page.has_more);
    }

    #[test]
    fn cached_events_leave_the_cursor_alone() {
        let mut st = TimelineState::new("k", 50);
        let fp = MediaUrlFingerprint;

        let cached = st.apply_batch(vec![ev(1, 100, &media(1))], BatchSource::Cache, &AcceptAll, &fp);
        assert_eq!(times(&cached), vec![100]);
        assert_eq!(st.until(), None);

        st.apply_batch(
            vec![ev(10, 1000, &media(10)), ev(9, 900, &media(9))],
            BatchSource::Relay,
            &AcceptAll,
            &fp,
        );
        assert_eq!(times(st.events()), vec![1000, 900, 100]);
        assert_eq!(st.until(), Some(899));

        // the relay later returns the cached event; it is a duplicate but
        // still moves the cursor
        let page = st.apply_page(vec![ev(2, 200, &media(2)), ev(1, 100, &media(1))], &AcceptAll, &fp);
        assert_eq!(times(&page.events), vec![200]);
        assert_eq!(page.until, Some(99));
    }

    #[test]
    fn live_events_wait_for_backlog_then_buffer() {
        let mut st = TimelineState::new("k", 50);
        let fp = MediaUrlFingerprint;
        st.expect_streams(2);

        assert_eq!(st.push_live(ev(9, 900, &media(9)), &AcceptAll, &fp), LiveOutcome::Held);
        assert!(st.stream_done(Ok(())).is_none());
        st.apply_batch(vec![ev(1, 100, &media(1))], BatchSource::Relay, &AcceptAll, &fp);

        let settled = st.stream_done(Err("timed out".into())).unwrap();
        assert_eq!(times(&settled.released), vec![900]);
        assert_eq!(settled.error, None);
        assert!(!st.is_loading());
        assert_eq!(times(st.events()), vec![100]);
        assert_eq!(st.new_events().count(), 1);

        // a second settle never happens
        assert!(st.stream_done(Ok(())).is_none());

        assert!(matches!(
            st.push_live(ev(10, 1000, &media(10)), &AcceptAll, &fp),
            LiveOutcome::Buffered(_)
        ));
        assert_eq!(st.merge_new(), 2);
        assert_eq!(times(st.events()), vec![1000, 900, 100]);
    }

    #[test]
    fn live_buffer_is_capped_oldest_first() {
        let mut st = TimelineState::new("k", 3);
        let fp = MediaUrlFingerprint;
        st.expect_streams(0);

        for n in 1..=5u8 {
            st.push_live(ev(n, n as u64 * 10, &media(n)), &AcceptAll, &fp);
        }
        let buffered: Vec<u64> = st.new_events().map(|e| e.created_at).collect();
        assert_eq!(buffered, vec![30, 40, 50]);

        // evicted events are forgotten and may come back later
        assert!(matches!(
            st.push_live(ev(1, 10, &media(1)), &AcceptAll, &fp),
            LiveOutcome::Buffered(_)
        ));
    }

    #[test]
    fn total_failure_is_terminal() {
        let mut st = TimelineState::new("k", 50);
        st.expect_streams(2);
        assert!(st.stream_done(Err("refused".into())).is_none());
        let settled = st.stream_done(Err("no response after 5s".into())).unwrap();
        assert_eq!(settled.error.as_deref(), Some("no response after 5s"));
        assert!(!st.is_loading());
        assert!(!st.has_more());
        assert_eq!(st.error(), Some("no response after 5s"));
    }
}
