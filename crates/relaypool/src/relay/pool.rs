use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::relay::connection::{ConnectionContext, RelayConnection, RelaySubscription};
use crate::relay::health::{HealthConfig, HealthMonitor, HealthStatus};
use crate::relay::transport::Transport;
use crate::relay::websocket::WebsocketTransport;
use crate::relay::{Endpoint, LivenessSchedule, PoolEvent, RelayStatus};
use crate::{Error, Filter, RelayUrl, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub liveness: LivenessSchedule,
    /// Unleased endpoints idle for longer than this are retired by
    /// [`RelayPool::prune_idle`].
    pub idle_timeout: Duration,
    pub ping_rate: Duration,
    pub maintenance_interval: Duration,
    pub health: HealthConfig,
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessSchedule::default(),
            idle_timeout: Duration::from_secs(5 * 60),
            ping_rate: Duration::from_secs(25),
            maintenance_interval: Duration::from_secs(10),
            health: HealthConfig::default(),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
}

struct Usage {
    leases: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Usage {
    fn touch(&self) {
        let mut last_used = self
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_used = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

pub struct PoolRelay {
    conn: RelayConnection,
    usage: Arc<Usage>,
    last_ping: Instant,
}

impl PoolRelay {
    pub fn status(&self) -> RelayStatus {
        self.conn.status()
    }

    pub fn leases(&self) -> usize {
        self.usage.leases.load(Ordering::SeqCst)
    }

    fn needs_new_attempt(&self) -> bool {
        self.conn.status() == RelayStatus::Failed || self.conn.is_finished()
    }
}

/// Shared use of one endpoint. The physical connection belongs to the pool;
/// leases only keep it from being pruned.
pub struct RelayLease {
    url: RelayUrl,
    conn: RelayConnection,
    usage: Arc<Usage>,
}

impl RelayLease {
    fn new(url: RelayUrl, conn: RelayConnection, usage: Arc<Usage>) -> Self {
        usage.leases.fetch_add(1, Ordering::SeqCst);
        usage.touch();
        Self { url, conn, usage }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        self.conn.status()
    }

    /// Resolves once the current attempt is connected or failed.
    pub async fn settled(&self) -> RelayStatus {
        self.conn.settled().await
    }

    /// Open a REQ. If the relay is still connecting the REQ is sent as soon
    /// as it connects.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<RelaySubscription> {
        self.usage.touch();
        self.conn.subscribe(filters)
    }
}

impl Clone for RelayLease {
    fn clone(&self) -> Self {
        RelayLease::new(self.url.clone(), self.conn.clone(), self.usage.clone())
    }
}

impl Drop for RelayLease {
    fn drop(&mut self) {
        self.usage.leases.fetch_sub(1, Ordering::SeqCst);
        self.usage.touch();
    }
}

/// Owns one connection per relay url and is the only thing that opens or
/// retires them.
pub struct RelayPool {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    health: Arc<HealthMonitor>,
    relays: RwLock<HashMap<RelayUrl, PoolRelay>>,
    events: broadcast::Sender<PoolEvent>,
    shut_down: AtomicBool,
}

impl RelayPool {
    pub fn new(transport: Arc<dyn Transport>, health: Arc<HealthMonitor>, config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            health,
            relays: RwLock::new(HashMap::new()),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    /// A pool talking to real relays over websockets.
    pub fn websocket(config: PoolConfig) -> Self {
        let health = Arc::new(HealthMonitor::new(config.health));
        Self::new(Arc::new(WebsocketTransport::new()), health, config)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RelayUrl, PoolRelay>> {
        self.relays
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RelayUrl, PoolRelay>> {
        self.relays
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, url: &RelayUrl, relay: &PoolRelay) -> Endpoint {
        Endpoint {
            url: url.clone(),
            state: relay.status(),
            metrics: self.health.metrics(url),
        }
    }

    fn connect(&self, url: &RelayUrl) -> RelayConnection {
        RelayConnection::spawn(ConnectionContext {
            url: url.clone(),
            transport: self.transport.clone(),
            health: self.health.clone(),
            events: self.events.clone(),
            schedule: self.config.liveness.clone(),
        })
    }

    fn ensure_open(&self, url: &RelayUrl) -> Result<(RelayConnection, Arc<Usage>)> {
        if self.is_shut_down() {
            return Err(Error::PoolShutdown);
        }

        if let Some(relay) = self.read().get(url) {
            if !relay.needs_new_attempt() {
                return Ok((relay.conn.clone(), relay.usage.clone()));
            }
        }

        let mut relays = self.write();
        match relays.get_mut(url) {
            Some(relay) if !relay.needs_new_attempt() => {
                Ok((relay.conn.clone(), relay.usage.clone()))
            }
            Some(relay) => {
                debug!("{url} failed earlier, starting a new attempt");
                relay.conn = self.connect(url);
                relay.usage.touch();
                Ok((relay.conn.clone(), relay.usage.clone()))
            }
            None => {
                info!("adding {url} to the pool");
                let conn = self.connect(url);
                let usage = Arc::new(Usage {
                    leases: AtomicUsize::new(0),
                    last_used: Mutex::new(Instant::now()),
                });
                relays.insert(
                    url.clone(),
                    PoolRelay {
                        conn: conn.clone(),
                        usage: usage.clone(),
                        last_ping: Instant::now(),
                    },
                );
                Ok((conn, usage))
            }
        }
    }

    /// Returns the endpoint for `url`, opening it if needed. Opening never
    /// waits for the handshake; a fresh endpoint starts out `Connecting`. An
    /// endpoint whose last attempt failed gets a new attempt.
    #[profiling::function]
    pub fn open(&self, url: &RelayUrl) -> Result<Endpoint> {
        let (conn, _) = self.ensure_open(url)?;
        Ok(Endpoint {
            url: url.clone(),
            state: conn.status(),
            metrics: self.health.metrics(url),
        })
    }

    pub fn lease(&self, url: &RelayUrl) -> Result<RelayLease> {
        let (conn, usage) = self.ensure_open(url)?;
        Ok(RelayLease::new(url.clone(), conn, usage))
    }

    pub fn has(&self, url: &RelayUrl) -> bool {
        self.read().contains_key(url)
    }

    pub fn urls(&self) -> BTreeSet<RelayUrl> {
        self.read().keys().cloned().collect()
    }

    pub fn status(&self, url: &RelayUrl) -> Option<RelayStatus> {
        self.read().get(url).map(PoolRelay::status)
    }

    pub fn endpoint(&self, url: &RelayUrl) -> Option<Endpoint> {
        self.read()
            .get(url)
            .map(|relay| self.snapshot(url, relay))
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .read()
            .iter()
            .map(|(url, relay)| self.snapshot(url, relay))
            .collect();
        endpoints.sort_by(|a, b| a.url.cmp(&b.url));
        endpoints
    }

    /// Waits for the current attempt on `url` to connect or fail.
    pub async fn settled(&self, url: &RelayUrl) -> Option<RelayStatus> {
        let conn = self.read().get(url).map(|relay| relay.conn.clone())?;
        Some(conn.settled().await)
    }

    pub fn stats(&self) -> PoolStats {
        let relays = self.read();
        let mut stats = PoolStats {
            total_connections: relays.len(),
            ..Default::default()
        };

        for (url, relay) in relays.iter() {
            if relay.status() == RelayStatus::Connected {
                stats.active_connections += 1;
            }

            if self.health.metrics(url).is_none() {
                continue;
            }
            match self.health.health_status(url) {
                HealthStatus::Healthy => stats.healthy_count += 1,
                HealthStatus::Unhealthy => stats.unhealthy_count += 1,
                HealthStatus::Degraded => {}
            }
        }

        stats
    }

    /// Keep relay connections alive by pinging relays that haven't been
    /// pinged in a while. Every ping window also counts towards uptime.
    pub fn keepalive_ping(&self) {
        let now = Instant::now();
        let mut relays = self.write();
        for (url, relay) in relays.iter_mut() {
            if now - relay.last_ping < self.config.ping_rate {
                continue;
            }
            relay.last_ping = now;

            match relay.status() {
                RelayStatus::Connected => {
                    debug!("pinging {url}");
                    relay.conn.ping();
                    self.health.record_liveness(url, true);
                }
                RelayStatus::Failed => self.health.record_liveness(url, false),
                RelayStatus::Connecting => {}
            }
        }
    }

    /// Retire endpoints nobody has leased for `idle_timeout`. Their health
    /// history is kept.
    pub fn prune_idle(&self) -> Vec<RelayUrl> {
        let idle_timeout = self.config.idle_timeout;
        let mut pruned = Vec::new();

        self.write().retain(|url, relay| {
            let idle = relay.leases() == 0 && relay.usage.idle_for() >= idle_timeout;
            if idle {
                info!("retiring idle relay {url}");
                relay.conn.shutdown();
                pruned.push(url.clone());
            }
            !idle
        });

        pruned
    }

    /// Periodic keepalive and idle pruning. Stops once the pool is dropped
    /// or shut down.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let every = self.config.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_shut_down() {
                    break;
                }
                pool.keepalive_ping();
                pool.prune_idle();
            }
        })
    }

    pub fn close_all(&self) {
        for (url, relay) in self.write().drain() {
            debug!("closing {url}");
            relay.conn.shutdown();
        }
    }

    /// Drops every endpoint and all health history, eg. after the relay
    /// configuration changed.
    pub fn reset(&self) {
        info!("resetting relay pool");
        self.close_all();
        self.health.reset();
    }

    pub fn shutdown(&self) {
        info!("shutting down relay pool");
        self.shut_down.store(true, Ordering::SeqCst);
        self.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::{MockRelay, MockTransport};
    use crate::relay::ReqEvent;
    use crate::{Event, EventId, Pubkey};

    fn url(s: &str) -> RelayUrl {
        RelayUrl::new(s).unwrap()
    }

    fn pool_with(relays: &[MockRelay]) -> (Arc<MockTransport>, RelayPool) {
        let transport = Arc::new(MockTransport::new());
        for relay in relays {
            transport.add(relay.clone());
        }
        let pool = RelayPool::new(
            transport.clone(),
            Arc::new(HealthMonitor::default()),
            PoolConfig::default(),
        );
        (transport, pool)
    }

    fn video(n: u8, created_at: u64) -> Event {
        Event {
            id: EventId::new([n; 32]),
            pubkey: Pubkey::new([1; 32]),
            created_at,
            kind: 34235,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_idempotent() {
        let a = url("wss://a.example.com");
        let (transport, pool) = pool_with(&[MockRelay::new(a.clone())]);

        let first = pool.open(&a).unwrap();
        let second = pool.open(&url("wss://A.example.com/")).unwrap();
        assert_eq!(first.state, RelayStatus::Connecting);
        assert_eq!(first.url, second.url);

        assert_eq!(pool.settled(&a).await, Some(RelayStatus::Connected));
        pool.open(&a).unwrap();
        assert_eq!(transport.opens(&a), 1);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relay_fails_once_after_last_check() {
        let dead = url("wss://dead.example.com");
        let live = url("wss://live.example.com");
        let (_transport, pool) =
            pool_with(&[MockRelay::new(dead.clone()).silent(), MockRelay::new(live.clone())]);
        let mut events = pool.events();

        let started = Instant::now();
        pool.open(&dead).unwrap();
        pool.open(&live).unwrap();

        assert_eq!(pool.settled(&live).await, Some(RelayStatus::Connected));
        assert_eq!(pool.settled(&dead).await, Some(RelayStatus::Failed));
        assert!(started.elapsed() >= Duration::from_secs(5));

        let mut failed = 0;
        let mut connected = 0;
        while let Ok(ev) = events.try_recv() {
            match ev {
                PoolEvent::Failed { url, .. } => {
                    assert_eq!(url, dead);
                    failed += 1;
                }
                PoolEvent::Connected { url, .. } => {
                    assert_eq!(url, live);
                    connected += 1;
                }
                _ => {}
            }
        }
        assert_eq!((failed, connected), (1, 1));

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.healthy_count, 1);
        assert_eq!(stats.unhealthy_count, 1);
        assert_eq!(pool.health().metrics(&dead).unwrap().success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_a_failed_endpoint_starts_a_new_attempt() {
        let flaky = url("wss://flaky.example.com");
        let relay = MockRelay::new(flaky.clone()).refusing("connection refused");
        let (transport, pool) = pool_with(&[relay.clone()]);

        pool.open(&flaky).unwrap();
        assert_eq!(pool.settled(&flaky).await, Some(RelayStatus::Failed));
        // the pool itself never retries
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(&flaky), 1);

        relay.accept();
        let endpoint = pool.open(&flaky).unwrap();
        assert_eq!(endpoint.state, RelayStatus::Connecting);
        assert_eq!(pool.settled(&flaky).await, Some(RelayStatus::Connected));
        assert_eq!(transport.opens(&flaky), 2);
        assert_eq!(pool.endpoint(&flaky).unwrap().metrics.unwrap().total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_gets_stored_events_then_eose() {
        let a = url("wss://a.example.com");
        let relay = MockRelay::new(a.clone()).with_events([video(1, 100), video(2, 200)]);
        let (_transport, pool) = pool_with(&[relay.clone()]);

        let lease = pool.lease(&a).unwrap();
        let mut sub = lease
            .subscribe(vec![Filter::new().kinds([34235]).limit(10)])
            .unwrap();

        let mut got = Vec::new();
        loop {
            match sub.next().await {
                Some(ReqEvent::Event(ev)) => got.push(ev.created_at),
                Some(ReqEvent::Eose) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, vec![200, 100]);

        relay.publish(video(3, 300));
        match sub.next().await {
            Some(ReqEvent::Event(ev)) => assert_eq!(ev.created_at, 300),
            other => panic!("unexpected {other:?}"),
        }

        drop(sub);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(relay.open_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_gets_one_new_attempt() {
        let a = url("wss://a.example.com");
        let relay = MockRelay::new(a.clone());
        let (transport, pool) = pool_with(&[relay.clone()]);

        let lease = pool.lease(&a).unwrap();
        assert_eq!(lease.settled().await, RelayStatus::Connected);
        let mut sub = lease.subscribe(vec![Filter::new().kinds([1])]).unwrap();
        assert_eq!(sub.next().await, Some(ReqEvent::Eose));

        relay.drop_connections();
        assert_eq!(
            sub.next().await,
            Some(ReqEvent::Closed("connection dropped".to_owned()))
        );
        assert_eq!(lease.settled().await, RelayStatus::Connected);
        assert_eq!(transport.opens(&a), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_endpoints_are_pruned_only_without_leases() {
        let a = url("wss://a.example.com");
        let b = url("wss://b.example.com");
        let (_transport, pool) = pool_with(&[MockRelay::new(a.clone()), MockRelay::new(b.clone())]);

        let lease = pool.lease(&a).unwrap();
        pool.open(&b).unwrap();

        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert_eq!(pool.prune_idle(), vec![b.clone()]);
        assert!(pool.has(&a));
        assert!(!pool.has(&b));

        drop(lease);
        assert!(pool.prune_idle().is_empty());
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert_eq!(pool.prune_idle(), vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_endpoints() {
        let a = url("wss://a.example.com");
        let (_transport, pool) = pool_with(&[MockRelay::new(a.clone())]);
        pool.open(&a).unwrap();
        pool.shutdown();
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(pool.open(&a), Err(Error::PoolShutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_health() {
        let a = url("wss://a.example.com");
        let (_transport, pool) = pool_with(&[MockRelay::new(a.clone())]);
        pool.open(&a).unwrap();
        pool.settled(&a).await;
        assert!(pool.health().metrics(&a).is_some());

        pool.reset();
        assert!(pool.health().metrics(&a).is_none());
        assert!(!pool.has(&a));
        // a reset pool is still usable
        pool.open(&a).unwrap();
    }
}
