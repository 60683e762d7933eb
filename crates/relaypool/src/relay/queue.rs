use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, trace};

use crate::relay::health::{HealthMonitor, HealthSample};
use crate::{Error, RelayUrl, Result};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_concurrent_queries: usize,
    pub min_query_interval: Duration,
    pub query_timeout: Duration,
    pub batch_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 3,
            min_query_interval: Duration::from_millis(100),
            query_timeout: Duration::from_secs(8),
            batch_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
}

/// A query waiting for its turn. `execute` is type-erased so one heap can
/// hold queries with different result types.
pub struct QueuedQuery {
    pub id: u64,
    pub endpoint: RelayUrl,
    pub priority: Priority,
    pub enqueued_at: Instant,
    job: Box<dyn QueryJob>,
}

impl QueuedQuery {
    fn is_abandoned(&self) -> bool {
        self.job.is_abandoned()
    }
}

impl PartialEq for QueuedQuery {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedQuery {}

impl PartialOrd for QueuedQuery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher priority first, then the earlier enqueue.
impl Ord for QueuedQuery {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

trait QueryJob: Send {
    /// Nobody is waiting for the result anymore.
    fn is_abandoned(&self) -> bool;

    fn start(self: Box<Self>, ctx: RunContext) -> BoxFuture;
}

struct RunContext {
    endpoint: RelayUrl,
    query_timeout: Duration,
    health: Arc<HealthMonitor>,
}

struct Job<T, F> {
    execute: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<T, F, Fut> QueryJob for Job<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn start(self: Box<Self>, ctx: RunContext) -> BoxFuture {
        let Job { execute, reply } = *self;
        Box::pin(async move {
            let started = Instant::now();
            let result = match timeout(ctx.query_timeout, execute()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    url: ctx.endpoint.to_string(),
                    after: ctx.query_timeout,
                }),
            };

            let elapsed = started.elapsed();
            let sample = if result.is_ok() {
                HealthSample::success(ctx.endpoint, elapsed)
            } else {
                HealthSample::failure(ctx.endpoint, elapsed)
            };
            ctx.health.record_outcome(sample);

            // the caller may have given up; the result is simply discarded
            let _ = reply.send(result);
        })
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedQuery>,
    in_flight: usize,
    last_start: Option<Instant>,
}

struct EndpointQueue {
    url: RelayUrl,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Next {
    Idle,
    WaitUntil(Instant),
    Run(QueuedQuery),
}

impl EndpointQueue {
    fn next(&self, config: &QueueConfig) -> Next {
        let mut state = lock(&self.state);

        // cancelled callers release their slot in the queue here
        while state.heap.peek().is_some_and(QueuedQuery::is_abandoned) {
            if let Some(dropped) = state.heap.pop() {
                trace!("skipping abandoned query {} for {}", dropped.id, self.url);
            }
        }

        if state.heap.is_empty() || state.in_flight >= config.max_concurrent_queries {
            return Next::Idle;
        }

        if let Some(last) = state.last_start {
            let earliest = last + config.min_query_interval;
            if Instant::now() < earliest {
                return Next::WaitUntil(earliest);
            }
        }

        match state.heap.pop() {
            Some(query) => {
                state.in_flight += 1;
                state.last_start = Some(Instant::now());
                Next::Run(query)
            }
            None => Next::Idle,
        }
    }

    fn finished(&self) {
        let mut state = lock(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.wakeup.notify_one();
    }

    fn stats(&self) -> QueueStats {
        let state = lock(&self.state);
        QueueStats {
            pending: state.heap.iter().filter(|q| !q.is_abandoned()).count(),
            in_flight: state.in_flight,
        }
    }
}

async fn dispatch(
    queue: Arc<EndpointQueue>,
    config: QueueConfig,
    health: Arc<HealthMonitor>,
) {
    loop {
        match queue.next(&config) {
            Next::Idle => queue.wakeup.notified().await,
            Next::WaitUntil(at) => sleep_until(at).await,
            Next::Run(query) => {
                trace!(
                    "starting query {} ({:?}) on {}, queued for {:?}",
                    query.id,
                    query.priority,
                    query.endpoint,
                    query.enqueued_at.elapsed()
                );
                let fut = query.job.start(RunContext {
                    endpoint: query.endpoint,
                    query_timeout: config.query_timeout,
                    health: health.clone(),
                });

                let queue = queue.clone();
                let batch_delay = config.batch_delay;
                tokio::spawn(async move {
                    fut.await;
                    sleep(batch_delay).await;
                    queue.finished();
                });
            }
        }
    }
}

struct EndpointEntry {
    queue: Arc<EndpointQueue>,
    dispatcher: JoinHandle<()>,
}

/// Per-endpoint rate limiting. Each endpoint gets its own priority queue and
/// dispatcher task, so a congested relay only slows down queries to itself.
pub struct QueryQueue {
    config: QueueConfig,
    health: Arc<HealthMonitor>,
    endpoints: Mutex<HashMap<RelayUrl, EndpointEntry>>,
    next_id: AtomicU64,
}

impl QueryQueue {
    pub fn new(config: QueueConfig, health: Arc<HealthMonitor>) -> Self {
        Self {
            config,
            health,
            endpoints: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn endpoint(&self, url: &RelayUrl) -> Arc<EndpointQueue> {
        let mut endpoints = lock(&self.endpoints);
        let entry = endpoints.entry(url.clone()).or_insert_with(|| {
            debug!("creating query queue for {url}");
            let queue = Arc::new(EndpointQueue {
                url: url.clone(),
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
            });
            let dispatcher = tokio::spawn(dispatch(
                queue.clone(),
                self.config.clone(),
                self.health.clone(),
            ));
            EndpointEntry { queue, dispatcher }
        });
        entry.queue.clone()
    }

    /// Schedule `execute` against `url`. The query is placed in the queue
    /// immediately; the returned future resolves with its result, or with
    /// [`Error::Timeout`] once `query_timeout` elapses. Dropping the future
    /// before the query starts removes it from the queue.
    pub fn enqueue<T, F, Fut>(
        &self,
        url: &RelayUrl,
        priority: Priority,
        execute: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let query = QueuedQuery {
            id: self.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            endpoint: url.clone(),
            priority,
            enqueued_at: Instant::now(),
            job: Box::new(Job { execute, reply }),
        };

        let queue = self.endpoint(url);
        lock(&queue.state).heap.push(query);
        queue.wakeup.notify_one();

        async move { rx.await.map_err(|_| Error::Abandoned)? }
    }

    pub fn stats(&self, url: &RelayUrl) -> QueueStats {
        let queue = lock(&self.endpoints).get(url).map(|e| e.queue.clone());
        queue.map(|q| q.stats()).unwrap_or_default()
    }
}

impl Drop for QueryQueue {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.endpoints).drain() {
            entry.dispatcher.abort();
        }
    }
}
