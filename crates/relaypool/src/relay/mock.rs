//! Scripted in-process relays. They speak the same channel protocol as the
//! websocket transport, so everything above [`Transport`] runs unchanged.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use crate::relay::transport::{Channel, ChannelPeer, Transport, WireCommand, WireEvent};
use crate::{ClientMessage, Error, Event, Filter, RelayMessage, RelayReqId, RelayUrl, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Completes the handshake after the delay and serves REQs.
    Accept { open_after: Duration },
    /// Never answers.
    Silent,
    /// Fails the handshake right away.
    Refuse(String),
}

struct LiveSub {
    sub_id: RelayReqId,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<WireEvent>,
}

struct MockRelayInner {
    url: RelayUrl,
    behavior: Mutex<Behavior>,
    reply_delay: Mutex<Duration>,
    stored: Mutex<Vec<Event>>,
    subs: Mutex<Vec<LiveSub>>,
    links: Mutex<Vec<mpsc::UnboundedSender<WireEvent>>>,
    requests: Mutex<Vec<Vec<Filter>>>,
}

#[derive(Clone)]
pub struct MockRelay {
    inner: Arc<MockRelayInner>,
}

impl MockRelay {
    pub fn new(url: RelayUrl) -> Self {
        Self {
            inner: Arc::new(MockRelayInner {
                url,
                behavior: Mutex::new(Behavior::Accept {
                    open_after: Duration::ZERO,
                }),
                reply_delay: Mutex::new(Duration::ZERO),
                stored: Mutex::new(Vec::new()),
                subs: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    pub fn silent(self) -> Self {
        *lock(&self.inner.behavior) = Behavior::Silent;
        self
    }

    pub fn refusing(self, reason: impl Into<String>) -> Self {
        *lock(&self.inner.behavior) = Behavior::Refuse(reason.into());
        self
    }

    pub fn open_after(self, delay: Duration) -> Self {
        *lock(&self.inner.behavior) = Behavior::Accept { open_after: delay };
        self
    }

    /// Delay between receiving a REQ and answering it.
    pub fn reply_after(self, delay: Duration) -> Self {
        *lock(&self.inner.reply_delay) = delay;
        self
    }

    pub fn with_events(self, events: impl IntoIterator<Item = Event>) -> Self {
        lock(&self.inner.stored).extend(events);
        self
    }

    /// Future connections complete the handshake immediately.
    pub fn accept(&self) {
        *lock(&self.inner.behavior) = Behavior::Accept {
            open_after: Duration::ZERO,
        };
    }

    pub fn behavior(&self) -> Behavior {
        lock(&self.inner.behavior).clone()
    }

    pub fn store(&self, event: Event) {
        lock(&self.inner.stored).push(event);
    }

    /// Store `event` and stream it to every open REQ it matches.
    pub fn publish(&self, event: Event) {
        self.store(event.clone());
        let mut subs = lock(&self.inner.subs);
        subs.retain(|sub| {
            if !sub.filters.iter().any(|f| f.matches(&event)) {
                return true;
            }
            let msg = RelayMessage::event(sub.sub_id.0.clone(), event.clone());
            sub.tx.send(WireEvent::Message(msg)).is_ok()
        });
    }

    /// Answer every open REQ with CLOSED.
    pub fn close_subscriptions(&self, reason: &str) {
        for sub in lock(&self.inner.subs).drain(..) {
            let msg = RelayMessage::closed(sub.sub_id.0.clone(), reason);
            let _ = sub.tx.send(WireEvent::Message(msg));
        }
    }

    pub fn notice(&self, message: &str) {
        for link in lock(&self.inner.links).iter() {
            let _ = link.send(WireEvent::Message(RelayMessage::notice(message)));
        }
    }

    /// Hang up on every connected client.
    pub fn drop_connections(&self) {
        lock(&self.inner.subs).clear();
        for link in lock(&self.inner.links).drain(..) {
            let _ = link.send(WireEvent::Closed);
        }
    }

    /// Every REQ received so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<Filter>> {
        lock(&self.inner.requests).clone()
    }

    pub fn open_subscriptions(&self) -> usize {
        lock(&self.inner.subs).len()
    }

    /// Stored events answering `filters`: each filter contributes its newest
    /// `limit` matches.
    fn stored_matching(&self, filters: &[Filter]) -> Vec<Event> {
        let mut stored = lock(&self.inner.stored).clone();
        stored.sort_by(Event::timeline_cmp);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
            for ev in stored.iter().filter(|ev| filter.matches(ev)).take(limit) {
                if seen.insert(ev.id) {
                    out.push(ev.clone());
                }
            }
        }
        out.sort_by(Event::timeline_cmp);
        out
    }
}

async fn serve(relay: MockRelay, mut peer: ChannelPeer) {
    match relay.behavior() {
        Behavior::Silent => {
            while peer.commands.recv().await.is_some() {}
            return;
        }
        Behavior::Refuse(reason) => {
            let _ = peer.events.send(WireEvent::Error(reason));
            return;
        }
        Behavior::Accept { open_after } => {
            sleep(open_after).await;
            if peer.events.send(WireEvent::Opened).is_err() {
                return;
            }
        }
    }

    lock(&relay.inner.links).push(peer.events.clone());

    while let Some(cmd) = peer.commands.recv().await {
        match cmd {
            WireCommand::Send(ClientMessage::Req { sub_id, filters }) => {
                lock(&relay.inner.requests).push(filters.clone());

                let delay = *lock(&relay.inner.reply_delay);
                if !delay.is_zero() {
                    sleep(delay).await;
                }

                for ev in relay.stored_matching(&filters) {
                    let msg = RelayMessage::event(sub_id.0.clone(), ev);
                    let _ = peer.events.send(WireEvent::Message(msg));
                }
                let _ = peer
                    .events
                    .send(WireEvent::Message(RelayMessage::eose(sub_id.0.clone())));

                lock(&relay.inner.subs).push(LiveSub {
                    sub_id,
                    filters,
                    tx: peer.events.clone(),
                });
            }
            WireCommand::Send(ClientMessage::Close { sub_id }) => {
                lock(&relay.inner.subs).retain(|sub| sub.sub_id != sub_id);
            }
            WireCommand::Send(ClientMessage::Raw(raw)) => {
                debug!("mock relay {} ignoring raw message {raw}", relay.url());
            }
            WireCommand::Ping => {}
        }
    }

    // the client hung up
    lock(&relay.inner.subs).retain(|sub| !sub.tx.same_channel(&peer.events));
    lock(&relay.inner.links).retain(|link| !link.same_channel(&peer.events));
}

/// A [`Transport`] whose relays are [`MockRelay`]s registered up front.
#[derive(Default)]
pub struct MockTransport {
    relays: Mutex<HashMap<RelayUrl, MockRelay>>,
    opens: Mutex<HashMap<RelayUrl, usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, relay: MockRelay) -> MockRelay {
        lock(&self.relays).insert(relay.url().clone(), relay.clone());
        relay
    }

    pub fn relay(&self, url: &RelayUrl) -> Option<MockRelay> {
        lock(&self.relays).get(url).cloned()
    }

    /// Connection attempts made to `url`.
    pub fn opens(&self, url: &RelayUrl) -> usize {
        lock(&self.opens).get(url).copied().unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &RelayUrl) -> Result<Channel> {
        *lock(&self.opens).entry(url.clone()).or_insert(0) += 1;

        let relay = self
            .relay(url)
            .ok_or_else(|| Error::connection(url, "no such relay"))?;

        let (channel, peer) = Channel::pair();
        tokio::spawn(serve(relay, peer));
        Ok(channel)
    }
}
