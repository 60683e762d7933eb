use relaypool::{Event, RelayUrl};
use tokio::sync::mpsc;

/// Receives what a subscription produces. Calls come from the engine's
/// tasks, so implementations must not block. Cancelling or refreshing a
/// subscription waits for its running callback, so a callback must not
/// cancel or refresh its own subscription.
pub trait TimelineHandler: Send + Sync {
    /// Newly accepted stored events, newest first. Called once more with an
    /// empty batch and `end_of_stored_events` set when every endpoint has
    /// reached EOSE or failed.
    fn on_batch(&self, events: Vec<Event>, end_of_stored_events: bool);

    /// A live event, now waiting in `new_events`.
    fn on_live(&self, event: Event);

    /// One endpoint stopped serving this subscription.
    fn on_close(&self, endpoint: &RelayUrl, reason: &str);

    /// The subscription failed as a whole. It stays failed until refreshed.
    /// Arrives before the final `end_of_stored_events` batch.
    fn on_error(&self, _reason: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineUpdate {
    Batch {
        events: Vec<Event>,
        end_of_stored_events: bool,
    },
    Live(Event),
    Closed {
        endpoint: RelayUrl,
        reason: String,
    },
    Failed(String),
}

/// Turns handler callbacks into a stream of [`TimelineUpdate`]s.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<TimelineUpdate>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimelineUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, update: TimelineUpdate) {
        // the receiver going away just means nobody is watching anymore
        let _ = self.tx.send(update);
    }
}

impl TimelineHandler for ChannelHandler {
    fn on_batch(&self, events: Vec<Event>, end_of_stored_events: bool) {
        self.send(TimelineUpdate::Batch {
            events,
            end_of_stored_events,
        });
    }

    fn on_live(&self, event: Event) {
        self.send(TimelineUpdate::Live(event));
    }

    fn on_close(&self, endpoint: &RelayUrl, reason: &str) {
        self.send(TimelineUpdate::Closed {
            endpoint: endpoint.clone(),
            reason: reason.to_owned(),
        });
    }

    fn on_error(&self, reason: &str) {
        self.send(TimelineUpdate::Failed(reason.to_owned()));
    }
}
