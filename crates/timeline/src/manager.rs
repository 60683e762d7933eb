use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::{HashMap, HashSet};
use relaypool::{
    Event, Filter, HealthStatus, Metrics, PoolStats, Priority, Pubkey, QueryDeduplicator,
    QueryQueue, QueueStats, RelayLease, RelayPool, RelaySubscription, RelayUrl, ReqEvent,
};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::cache::MemoryCache;
use crate::collab::{AcceptAll, ContentFilter, EventCache, NoRanking, PopularityRanker};
use crate::config::EngineConfig;
use crate::distribution::{DistributionStrategy, SubscriptionRequest};
use crate::fingerprint::{Fingerprinter, MediaUrlFingerprint};
use crate::handler::TimelineHandler;
use crate::state::{BatchSource, LiveOutcome, Page, Settled, TimelineSnapshot, TimelineState};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The relay's own words when it has some, otherwise the error itself.
fn close_reason(err: &relaypool::Error) -> String {
    match err {
        relaypool::Error::Closed { reason, .. } => reason.clone(),
        relaypool::Error::Connection { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// Rough health of a whole feed, derived from its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedHealth {
    Healthy,
    Degraded,
    Poor,
}

/// Shared by the manager and every task it spawns.
struct Engine {
    pool: Arc<RelayPool>,
    queue: QueryQueue,
    pages: QueryDeduplicator<Vec<Event>>,
    filter: Arc<dyn ContentFilter>,
    fingerprinter: Arc<dyn Fingerprinter>,
    cache: Arc<dyn EventCache>,
    config: EngineConfig,
}

impl Engine {
    fn remember(&self, events: &[Event]) {
        for ev in events {
            if let Err(err) = self.cache.put(ev) {
                warn!("could not cache {}: {err}", ev.id);
            }
        }
    }
}

struct Session {
    key: String,
    requests: Vec<SubscriptionRequest>,
    handler: Arc<dyn TimelineHandler>,
    state: Mutex<TimelineState>,
    /// Bumped by refresh so that tasks of the previous run go quiet.
    generation: AtomicU64,
    cancelled: AtomicBool,
    /// Held while a callback runs, so cancel and refresh can wait out a
    /// callback that already passed the generation check.
    forwarding: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn state(&self) -> MutexGuard<'_, TimelineState> {
        lock(&self.state)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && self.generation() == generation
    }

    /// Run `f` against the handler unless the session was cancelled or
    /// refreshed past `generation`.
    fn forward(&self, generation: u64, f: impl FnOnce(&dyn TimelineHandler)) {
        let _forwarding = lock(&self.forwarding);
        if self.is_current(generation) {
            f(self.handler.as_ref());
        }
    }

    /// Wait for any callback that is already running to return.
    fn quiesce(&self) {
        drop(lock(&self.forwarding));
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.quiesce();
        self.abort_tasks();
        self.state().close();
    }

    fn deliver_batch(
        &self,
        engine: &Engine,
        generation: u64,
        batch: Vec<Event>,
        source: BatchSource,
    ) {
        if batch.is_empty() || !self.is_current(generation) {
            return;
        }

        let accepted = self.state().apply_batch(
            batch,
            source,
            engine.filter.as_ref(),
            engine.fingerprinter.as_ref(),
        );
        if accepted.is_empty() {
            return;
        }

        if source == BatchSource::Relay {
            engine.remember(&accepted);
        }
        self.forward(generation, |handler| handler.on_batch(accepted, false));
    }

    fn deliver_live(&self, engine: &Engine, generation: u64, ev: Event) {
        if !self.is_current(generation) {
            return;
        }

        let outcome =
            self.state()
                .push_live(ev, engine.filter.as_ref(), engine.fingerprinter.as_ref());
        match outcome {
            LiveOutcome::Buffered(ev) => {
                engine.remember(std::slice::from_ref(&ev));
                self.forward(generation, |handler| handler.on_live(ev));
            }
            LiveOutcome::Held => {}
            LiveOutcome::Rejected(why) => trace!("{}: live event rejected: {why:?}", self.key),
        }
    }

    /// One endpoint stream finished its backlog, or never got there.
    fn stream_done(
        &self,
        engine: &Engine,
        generation: u64,
        endpoint: &RelayUrl,
        outcome: std::result::Result<(), String>,
    ) {
        if !self.is_current(generation) {
            return;
        }

        if let Err(reason) = &outcome {
            warn!("{}: {endpoint} failed: {reason}", self.key);
            self.forward(generation, |handler| handler.on_close(endpoint, reason));
        }

        let settled = self.state().stream_done(outcome);
        if let Some(settled) = settled {
            self.settled(engine, generation, settled);
        }
    }

    /// The failure, if any, goes out before the end-of-stored-events batch,
    /// so a consumer that stops reading at EOSE still sees it.
    fn settled(&self, engine: &Engine, generation: u64, settled: Settled) {
        info!("{}: backlog settled", self.key);
        engine.remember(&settled.released);
        self.forward(generation, |handler| {
            if let Some(reason) = &settled.error {
                warn!("{}: subscription failed: {reason}", self.key);
                handler.on_error(reason);
            }
            handler.on_batch(Vec::new(), true);
            for ev in settled.released {
                handler.on_live(ev);
            }
        });
    }
}

type Sessions = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Returned by [`TimelineManager::subscribe`].
pub struct SubscriptionHandle {
    key: String,
    session: Weak<Session>,
    sessions: Weak<Mutex<HashMap<String, Arc<Session>>>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop forwarding right away and release anything still queued.
    /// Queries already on the wire finish and their results are dropped.
    pub fn cancel(&self) {
        if let Some(sessions) = self.sessions.upgrade() {
            lock(&sessions).remove(&self.key);
        }
        if let Some(session) = self.session.upgrade() {
            session.stop();
        }
    }
}

/// Stream what's queued, collecting stored events into batches, until EOSE.
async fn stream_backlog(
    lease: RelayLease,
    filter: Filter,
    mut deliver: impl FnMut(Vec<Event>) + Send,
) -> relaypool::Result<RelaySubscription> {
    let mut sub = lease.subscribe(vec![filter])?;
    let mut batch = Vec::new();

    loop {
        let next = match sub.try_next() {
            Some(ev) => Some(ev),
            None => {
                if !batch.is_empty() {
                    deliver(std::mem::take(&mut batch));
                }
                sub.next().await
            }
        };

        match next {
            Some(ReqEvent::Event(ev)) => batch.push(*ev),
            Some(ReqEvent::Eose) => {
                deliver(batch);
                return Ok(sub);
            }
            Some(ReqEvent::Closed(reason)) => {
                deliver(batch);
                return Err(relaypool::Error::Closed {
                    url: lease.url().to_string(),
                    reason,
                });
            }
            None => {
                deliver(batch);
                return Err(relaypool::Error::connection(lease.url(), "connection closed"));
            }
        }
    }
}

async fn fetch_page(lease: RelayLease, filter: Filter) -> relaypool::Result<Vec<Event>> {
    let mut events = Vec::new();
    // dropping the subscription sends CLOSE
    let _sub = stream_backlog(lease, filter, |batch| events.extend(batch)).await?;
    Ok(events)
}

async fn run_stream(
    engine: Arc<Engine>,
    session: Arc<Session>,
    generation: u64,
    url: RelayUrl,
    filter: Filter,
) {
    let lease = match engine.pool.lease(&url) {
        Ok(lease) => lease,
        Err(err) => {
            session.stream_done(&engine, generation, &url, Err(close_reason(&err)));
            return;
        }
    };

    let backlog = {
        let lease = lease.clone();
        let job_engine = engine.clone();
        let job_session = session.clone();
        engine.queue.enqueue(&url, Priority::High, move || async move {
            stream_backlog(lease, filter, |batch| {
                job_session.deliver_batch(&job_engine, generation, batch, BatchSource::Relay)
            })
            .await
        })
    };

    let mut sub = match backlog.await {
        Ok(sub) => sub,
        Err(err) => {
            session.stream_done(&engine, generation, &url, Err(close_reason(&err)));
            return;
        }
    };
    session.stream_done(&engine, generation, &url, Ok(()));

    let reason = loop {
        match sub.next().await {
            Some(ReqEvent::Event(ev)) => session.deliver_live(&engine, generation, *ev),
            Some(ReqEvent::Eose) => {}
            Some(ReqEvent::Closed(reason)) => break reason,
            None => break "connection closed".to_owned(),
        }
    };

    session.forward(generation, |handler| {
        debug!("{}: live stream from {url} ended: {reason}", session.key);
        handler.on_close(&url, &reason);
    });
}

async fn read_cache(engine: Arc<Engine>, session: Arc<Session>, generation: u64) {
    let mut found = Vec::new();
    for req in &session.requests {
        let limit = req
            .filter
            .limit
            .unwrap_or(engine.config.distribution.limit) as usize;

        let cached: Result<Vec<Event>> = match &req.filter.authors {
            Some(authors) => authors
                .iter()
                .map(|author| engine.cache.by_author(author, limit))
                .collect::<Result<Vec<_>>>()
                .map(|per_author| per_author.into_iter().flatten().collect()),
            None => engine.cache.recent(limit),
        };

        match cached {
            Ok(events) => found.extend(events.into_iter().filter(|ev| req.filter.matches(ev))),
            Err(err) => warn!("{}: cache read failed: {err}", session.key),
        }
    }

    if !found.is_empty() {
        debug!("{}: {} events from cache", session.key, found.len());
        session.deliver_batch(&engine, generation, found, BatchSource::Cache);
    }
}

pub struct TimelineManagerBuilder {
    pool: Arc<RelayPool>,
    config: EngineConfig,
    filter: Arc<dyn ContentFilter>,
    fingerprinter: Arc<dyn Fingerprinter>,
    cache: Arc<dyn EventCache>,
    ranker: Arc<dyn PopularityRanker>,
}

impl TimelineManagerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn content_filter(mut self, filter: Arc<dyn ContentFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn EventCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn ranker(mut self, ranker: Arc<dyn PopularityRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn build(self) -> TimelineManager {
        let health = self.pool.health().clone();
        let strategy =
            DistributionStrategy::new(self.config.distribution.clone(), self.ranker, health.clone());
        let queue = QueryQueue::new(self.config.queue_config(), health);

        TimelineManager {
            engine: Arc::new(Engine {
                pool: self.pool,
                queue,
                pages: QueryDeduplicator::new(),
                filter: self.filter,
                fingerprinter: self.fingerprinter,
                cache: self.cache,
                config: self.config,
            }),
            strategy,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_key: AtomicU64::new(0),
        }
    }
}

/// Owns every timeline subscription and the query queue they share.
pub struct TimelineManager {
    engine: Arc<Engine>,
    strategy: DistributionStrategy,
    sessions: Sessions,
    next_key: AtomicU64,
}

impl TimelineManager {
    pub fn new(pool: Arc<RelayPool>, config: EngineConfig) -> Self {
        Self::builder(pool).config(config).build()
    }

    pub fn builder(pool: Arc<RelayPool>) -> TimelineManagerBuilder {
        TimelineManagerBuilder {
            pool,
            config: EngineConfig::default(),
            filter: Arc::new(AcceptAll),
            fingerprinter: Arc::new(MediaUrlFingerprint),
            cache: Arc::new(MemoryCache::default()),
            ranker: Arc::new(NoRanking),
        }
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.engine.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    pub fn strategy(&self) -> &DistributionStrategy {
        &self.strategy
    }

    fn session(&self, key: &str) -> Result<Arc<Session>> {
        lock(&self.sessions)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownSubscription(key.to_owned()))
    }

    /// Start a timeline over `requests`. Stored events arrive through
    /// `handler` as they are merged; live events follow once every endpoint
    /// has reached EOSE or failed.
    #[profiling::function]
    pub fn subscribe(
        &self,
        requests: Vec<SubscriptionRequest>,
        handler: Arc<dyn TimelineHandler>,
    ) -> SubscriptionHandle {
        let n = self.next_key.fetch_add(1, Ordering::SeqCst);
        let key = format!("timeline-{n}");
        let session = Arc::new(Session {
            key: key.clone(),
            requests,
            handler,
            state: Mutex::new(TimelineState::new(&key, self.engine.config.live_buffer_cap)),
            generation: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            forwarding: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });

        lock(&self.sessions).insert(key.clone(), session.clone());
        self.start(&session);

        SubscriptionHandle {
            key,
            session: Arc::downgrade(&session),
            sessions: Arc::downgrade(&self.sessions),
        }
    }

    fn start(&self, session: &Arc<Session>) {
        let generation = session.generation();

        if session.requests.is_empty() {
            debug!("{}: nothing to fetch", session.key);
            let settled = session.state().settle_empty();
            session.settled(&self.engine, generation, settled);
            return;
        }

        let mut streams: Vec<(RelayUrl, Filter)> = Vec::new();
        for req in &session.requests {
            let mut seen = HashSet::new();
            for url in &req.endpoints {
                if seen.insert(url) {
                    streams.push((url.clone(), req.filter.clone()));
                }
            }
        }

        if streams.is_empty() {
            let settled = session.state().settle_failed(Error::NoEndpoints.to_string());
            session.settled(&self.engine, generation, settled);
            return;
        }

        info!(
            "{}: {} requests over {} endpoint streams",
            session.key,
            session.requests.len(),
            streams.len()
        );
        session.state().expect_streams(streams.len());

        let mut tasks = Vec::with_capacity(streams.len() + 1);
        tasks.push(tokio::spawn(read_cache(
            self.engine.clone(),
            session.clone(),
            generation,
        )));
        for (url, filter) in streams {
            tasks.push(tokio::spawn(run_stream(
                self.engine.clone(),
                session.clone(),
                generation,
                url,
                filter,
            )));
        }
        lock(&session.tasks).extend(tasks);
    }

    /// Fetch events older than `until` (or the timeline's own cursor) from
    /// every endpoint of the subscription. Identical page queries from
    /// different timelines share one round trip.
    #[profiling::function]
    pub async fn load_more(&self, key: &str, until: Option<u64>, limit: u64) -> Result<Page> {
        let session = self.session(key)?;
        let generation = session.generation();
        let until = match until {
            Some(until) => Some(until),
            None => session.state().until(),
        };

        let mut queries = JoinSet::new();
        for req in &session.requests {
            let mut filter = req.filter.clone().limit(limit);
            if let Some(until) = until {
                filter = filter.until(until);
            }
            let filter_json = filter.json()?;

            let mut seen = HashSet::new();
            for url in req.endpoints.iter().filter(|url| seen.insert(*url)) {
                let engine = self.engine.clone();
                let url = url.clone();
                let filter = filter.clone();
                queries.spawn(self.engine.pages.dedupe(
                    format!("{url}|{filter_json}"),
                    move || async move {
                        let lease = engine.pool.lease(&url)?;
                        engine
                            .queue
                            .enqueue(&url, Priority::Medium, move || fetch_page(lease, filter))
                            .await
                    },
                ));
            }
        }

        if queries.is_empty() {
            return Ok(Page {
                events: Vec::new(),
                until,
                has_more: false,
            });
        }

        let total = queries.len();
        let mut raw = Vec::new();
        let mut last_error = None;
        let mut failures = 0;
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(Ok(events)) => raw.extend(events),
                Ok(Err(err)) => {
                    warn!("{key}: page query failed: {err}");
                    failures += 1;
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!("{key}: page query task failed: {err}");
                    failures += 1;
                }
            }
        }

        if failures == total {
            return Err(last_error.unwrap_or(relaypool::Error::Abandoned).into());
        }

        if !session.is_current(generation) {
            return Err(Error::Cancelled(key.to_owned()));
        }

        let page = session.state().apply_page(
            raw,
            self.engine.filter.as_ref(),
            self.engine.fingerprinter.as_ref(),
        );
        self.engine.remember(&page.events);
        debug!(
            "{key}: page of {} events, until {:?}",
            page.events.len(),
            page.until
        );
        Ok(page)
    }

    /// Throw away the timeline and query again under the same key.
    pub fn refresh(&self, key: &str) -> Result<()> {
        let session = self.session(key)?;
        session.abort_tasks();
        session.generation.fetch_add(1, Ordering::SeqCst);
        session.quiesce();
        *session.state() = TimelineState::new(key, self.engine.config.live_buffer_cap);
        info!("{key}: refreshing");
        self.start(&session);
        Ok(())
    }

    /// Move buffered live events into the timeline. Returns how many moved.
    pub fn merge_new(&self, key: &str) -> Result<usize> {
        let session = self.session(key)?;
        let merged = session.state().merge_new();
        Ok(merged)
    }

    pub fn cancel(&self, key: &str) -> bool {
        let removed = lock(&self.sessions).remove(key);
        match removed {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<TimelineSnapshot> {
        let session = self.session(key).ok()?;
        let snapshot = session.state().snapshot();
        Some(snapshot)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn connection_stats(&self) -> PoolStats {
        self.engine.pool.stats()
    }

    pub fn endpoint_health(&self, url: &RelayUrl) -> Option<Metrics> {
        self.engine.pool.health().metrics(url)
    }

    pub fn queue_stats(&self, url: &RelayUrl) -> QueueStats {
        self.engine.queue.stats(url)
    }

    /// Healthy endpoints count fully, degraded ones half. A subscription
    /// that failed outright is always poor.
    pub fn feed_health(&self, key: &str) -> Result<FeedHealth> {
        let session = self.session(key)?;
        let failed = session.state().error().is_some();
        if failed {
            return Ok(FeedHealth::Poor);
        }

        let endpoints: HashSet<&RelayUrl> = session
            .requests
            .iter()
            .flat_map(|req| req.endpoints.iter())
            .collect();
        if endpoints.is_empty() {
            return Ok(FeedHealth::Poor);
        }

        let health = self.engine.pool.health();
        let score: f64 = endpoints
            .iter()
            .map(|url| match health.health_status(url) {
                HealthStatus::Healthy => 1.0,
                HealthStatus::Degraded => 0.5,
                HealthStatus::Unhealthy => 0.0,
            })
            .sum();
        let ratio = score / endpoints.len() as f64;

        Ok(if ratio >= 0.7 {
            FeedHealth::Healthy
        } else if ratio >= 0.4 {
            FeedHealth::Degraded
        } else {
            FeedHealth::Poor
        })
    }

    /// Video feed from the people `self_author` follows. `None` when there
    /// is no one to ask about.
    pub fn subscribe_following(
        &self,
        authors: &[Pubkey],
        self_author: &Pubkey,
        handler: Arc<dyn TimelineHandler>,
    ) -> Option<SubscriptionHandle> {
        let plan = self.strategy.plan_queries(authors, self_author);
        if plan.is_empty() {
            return None;
        }
        Some(self.subscribe(plan, handler))
    }

    pub fn subscribe_global(&self, handler: Arc<dyn TimelineHandler>) -> Option<SubscriptionHandle> {
        let plan = self.strategy.plan_global();
        if plan.is_empty() {
            return None;
        }
        Some(self.subscribe(plan, handler))
    }
}

impl Drop for TimelineManager {
    fn drop(&mut self) {
        for (_, session) in lock(&self.sessions).drain() {
            session.stop();
        }
    }
}
