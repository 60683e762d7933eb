use std::sync::{Arc, Once};
use std::time::Duration;

use relaypool::mock::{MockRelay, MockTransport};
use relaypool::{
    Event, EventId, Filter, HealthMonitor, PoolConfig, Pubkey, RelayPool, RelayStatus, RelayUrl,
};
use timeline::{
    ChannelHandler, EngineConfig, EventCache, MemoryCache, SubscriptionRequest, TimelineManager,
    TimelineUpdate, VIDEO_KINDS,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn url(s: &str) -> RelayUrl {
    RelayUrl::new(s).unwrap()
}

fn video(n: u8, created_at: u64, media: &str) -> Event {
    Event {
        id: EventId::new([n; 32]),
        pubkey: Pubkey::new([7; 32]),
        created_at,
        kind: 34235,
        tags: vec![
            vec!["d".to_owned(), format!("clip-{n}")],
            vec!["imeta".to_owned(), format!("url {media}"), "m video/mp4".to_owned()],
        ],
        content: String::new(),
        sig: String::new(),
    }
}

fn clip(n: u8, created_at: u64) -> Event {
    video(n, created_at, &format!("https://cdn.example.com/clips/{n}.mp4"))
}

struct Harness {
    transport: Arc<MockTransport>,
    pool: Arc<RelayPool>,
    manager: TimelineManager,
}

fn harness(relays: &[MockRelay]) -> Harness {
    init_logging();
    let transport = Arc::new(MockTransport::new());
    for relay in relays {
        transport.add(relay.clone());
    }
    let pool = Arc::new(RelayPool::new(
        transport.clone(),
        Arc::new(HealthMonitor::default()),
        PoolConfig::default(),
    ));
    let manager = TimelineManager::new(pool.clone(), EngineConfig::default());
    Harness {
        transport,
        pool,
        manager,
    }
}

fn videos_from(relays: &[&MockRelay]) -> SubscriptionRequest {
    SubscriptionRequest::new(
        relays.iter().map(|r| r.url().clone()).collect(),
        Filter::new().kinds(VIDEO_KINDS).limit(50),
    )
}

/// Collect stored batches up to the aggregate EOSE, and the endpoints that
/// closed on the way.
async fn backlog(rx: &mut UnboundedReceiver<TimelineUpdate>) -> (Vec<Event>, Vec<RelayUrl>) {
    let mut events = Vec::new();
    let mut closed = Vec::new();
    while let Some(update) = rx.recv().await {
        match update {
            TimelineUpdate::Batch {
                events: batch,
                end_of_stored_events,
            } => {
                events.extend(batch);
                if end_of_stored_events {
                    break;
                }
            }
            TimelineUpdate::Closed { endpoint, .. } => closed.push(endpoint),
            TimelineUpdate::Live(_) | TimelineUpdate::Failed(_) => {}
        }
    }
    (events, closed)
}

#[tokio::test(start_paused = true)]
async fn silent_endpoint_does_not_hold_up_the_feed() {
    let a = MockRelay::new(url("wss://a.example.com")).with_events([clip(1, 100), clip(2, 300)]);
    let b = MockRelay::new(url("wss://b.example.com")).with_events([clip(3, 200)]);
    let silent = MockRelay::new(url("wss://silent.example.com")).silent();
    let h = harness(&[a.clone(), b.clone(), silent.clone()]);

    let (handler, mut rx) = ChannelHandler::new();
    let handle = h
        .manager
        .subscribe(vec![videos_from(&[&a, &b, &silent])], Arc::new(handler));

    let started = tokio::time::Instant::now();
    let (events, closed) = backlog(&mut rx).await;
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(events.len(), 3);
    assert_eq!(closed, vec![silent.url().clone()]);

    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert!(!snap.loading);
    assert_eq!(snap.error, None);
    let times: Vec<u64> = snap.events.iter().map(|e| e.created_at).collect();
    assert_eq!(times, vec![300, 200, 100]);

    assert_eq!(h.pool.status(a.url()), Some(RelayStatus::Connected));
    assert_eq!(h.pool.status(b.url()), Some(RelayStatus::Connected));
    assert_eq!(h.pool.status(silent.url()), Some(RelayStatus::Failed));
    assert_eq!(h.transport.opens(silent.url()), 1);

    let stats = h.manager.connection_stats();
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.active_connections, 2);
    assert!(h.manager.endpoint_health(silent.url()).is_some());
}

#[tokio::test(start_paused = true)]
async fn same_media_under_different_ids_is_one_entry() {
    let media = "https://cdn.example.com/shared/cat.mp4";
    let a = MockRelay::new(url("wss://a.example.com")).with_events([video(1, 100, media)]);
    // same file, reposted with a cache-busting query
    let b = MockRelay::new(url("wss://b.example.com"))
        .with_events([video(2, 110, &format!("{media}?v=2")), clip(3, 50)]);
    let h = harness(&[a.clone(), b.clone()]);

    let (handler, mut rx) = ChannelHandler::new();
    let handle = h
        .manager
        .subscribe(vec![videos_from(&[&a, &b])], Arc::new(handler));
    let (events, _) = backlog(&mut rx).await;
    assert_eq!(events.len(), 2);

    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert_eq!(snap.events.len(), 2);
    assert_eq!(snap.duplicates, 1);

    let mut ids: Vec<EventId> = snap.events.iter().map(|e| e.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn nobody_to_follow_means_no_requests() {
    let h = harness(&[]);
    let me = Pubkey::new([1; 32]);

    assert!(h.manager.strategy().plan_queries(&[], &me).is_empty());

    let (handler, _rx) = ChannelHandler::new();
    assert!(h
        .manager
        .subscribe_following(&[], &me, Arc::new(handler))
        .is_none());
    assert!(h.manager.keys().is_empty());
    assert_eq!(h.manager.connection_stats().total_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn live_events_wait_for_merge() {
    let relay = MockRelay::new(url("wss://a.example.com"))
        .with_events([clip(1, 100), clip(2, 200), clip(3, 300)]);
    let h = harness(&[relay.clone()]);

    let (handler, mut rx) = ChannelHandler::new();
    let handle = h
        .manager
        .subscribe(vec![videos_from(&[&relay])], Arc::new(handler));
    let (events, _) = backlog(&mut rx).await;
    assert_eq!(events.len(), 3);

    for n in 0..25u8 {
        relay.publish(clip(100 + n, 1_000 + n as u64));
    }

    let mut live = 0;
    while live < 25 {
        match rx.recv().await {
            Some(TimelineUpdate::Live(_)) => live += 1,
            Some(_) => {}
            None => panic!("handler channel closed"),
        }
    }

    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert_eq!(snap.new_events.len(), 25);
    assert_eq!(snap.events.len(), 3);

    assert_eq!(h.manager.merge_new(handle.key()).unwrap(), 25);
    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert!(snap.new_events.is_empty());
    assert_eq!(snap.events.len(), 28);
    assert_eq!(snap.events[0].created_at, 1_024);
}

#[tokio::test(start_paused = true)]
async fn live_buffer_keeps_the_newest() {
    let relay = MockRelay::new(url("wss://a.example.com")).with_events([clip(1, 100)]);
    let h = harness(&[relay.clone()]);

    let (handler, mut rx) = ChannelHandler::new();
    let handle = h
        .manager
        .subscribe(vec![videos_from(&[&relay])], Arc::new(handler));
    backlog(&mut rx).await;

    for n in 0..60u8 {
        relay.publish(clip(100 + n, 1_000 + n as u64));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert_eq!(snap.new_events.len(), 50);
    assert_eq!(snap.new_events[0].created_at, 1_010);
    assert_eq!(snap.new_events[49].created_at, 1_059);
}

#[tokio::test(start_paused = true)]
async fn paging_walks_back_across_endpoints() {
    let a = MockRelay::new(url("wss://a.example.com"))
        .with_events((1..=10u8).map(|n| clip(n, n as u64 * 10)));
    // b overlaps a on ids 5..=10
    let b = MockRelay::new(url("wss://b.example.com"))
        .with_events((5..=12u8).map(|n| clip(n, n as u64 * 10)));
    let h = harness(&[a.clone(), b.clone()]);

    let req = SubscriptionRequest::new(
        vec![a.url().clone(), b.url().clone()],
        Filter::new().kinds(VIDEO_KINDS).limit(3),
    );
    let (handler, mut rx) = ChannelHandler::new();
    let handle = h.manager.subscribe(vec![req], Arc::new(handler));
    backlog(&mut rx).await;

    let mut until = h.manager.snapshot(handle.key()).unwrap().until.unwrap();
    assert_eq!(until, 79);
    for _ in 0..20 {
        let page = h.manager.load_more(handle.key(), None, 3).await.unwrap();
        if !page.has_more {
            break;
        }
        let next = page.until.unwrap();
        if !page.events.is_empty() {
            assert!(next < until);
        }
        until = next;
    }

    let snap = h.manager.snapshot(handle.key()).unwrap();
    assert!(!snap.has_more);
    assert_eq!(snap.until, Some(9));
    assert_eq!(snap.events.len(), 12);
    let mut ids: Vec<EventId> = snap.events.iter().map(|e| e.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 12);
}

#[tokio::test(start_paused = true)]
async fn identical_page_queries_share_one_request() {
    let relay = MockRelay::new(url("wss://a.example.com"))
        .with_events((1..=6u8).map(|n| clip(n, n as u64 * 100)));
    let h = harness(&[relay.clone()]);

    let (first, mut first_rx) = ChannelHandler::new();
    let (second, mut second_rx) = ChannelHandler::new();
    let one = h
        .manager
        .subscribe(vec![videos_from(&[&relay])], Arc::new(first));
    let two = h
        .manager
        .subscribe(vec![videos_from(&[&relay])], Arc::new(second));
    backlog(&mut first_rx).await;
    backlog(&mut second_rx).await;
    assert_eq!(relay.requests().len(), 2);

    let (p1, p2) = tokio::join!(
        h.manager.load_more(one.key(), Some(350), 2),
        h.manager.load_more(two.key(), Some(350), 2),
    );
    assert_eq!(relay.requests().len(), 3);

    // both timelines already hold these, so nothing is new for either
    let p1 = p1.unwrap();
    let p2 = p2.unwrap();
    assert!(p1.events.is_empty());
    assert_eq!(p1, p2);
    assert_eq!(p1.until, Some(99));
}

#[tokio::test(start_paused = true)]
async fn cached_history_does_not_skip_relay_pages() {
    let relay = MockRelay::new(url("wss://a.example.com"))
        .with_events((1..=10u8).map(|n| clip(n, n as u64 * 100)));
    init_logging();
    let transport = Arc::new(MockTransport::new());
    transport.add(relay.clone());
    let pool = Arc::new(RelayPool::new(
        transport.clone(),
        Arc::new(HealthMonitor::default()),
        PoolConfig::default(),
    ));

    // an earlier feed left the oldest clip behind in the cache
    let cache = Arc::new(MemoryCache::default());
    cache.put(&clip(1, 100)).unwrap();
    let manager = TimelineManager::builder(pool).cache(cache).build();

    let req = SubscriptionRequest::new(
        vec![relay.url().clone()],
        Filter::new().kinds(VIDEO_KINDS).limit(2),
    );
    let (handler, mut rx) = ChannelHandler::new();
    let handle = manager.subscribe(vec![req], Arc::new(handler));
    backlog(&mut rx).await;

    let snap = manager.snapshot(handle.key()).unwrap();
    let times: Vec<u64> = snap.events.iter().map(|e| e.created_at).collect();
    assert_eq!(times, vec![1000, 900, 100]);
    assert_eq!(snap.until, Some(899));

    for _ in 0..20 {
        let page = manager.load_more(handle.key(), None, 2).await.unwrap();
        if !page.has_more {
            break;
        }
    }

    let snap = manager.snapshot(handle.key()).unwrap();
    let times: Vec<u64> = snap.events.iter().map(|e| e.created_at).collect();
    assert_eq!(times, (1..=10u64).rev().map(|n| n * 100).collect::<Vec<_>>());
    assert!(!snap.has_more);
}
