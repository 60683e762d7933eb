use crate::{ClientMessage, RelayMessage, RelayUrl, Result};

use tokio::sync::mpsc;

/// What the pool asks a live channel to do.
#[derive(Debug, Clone)]
pub enum WireCommand {
    Send(ClientMessage),
    Ping,
}

/// What a live channel reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Opened,
    Message(RelayMessage),
    Error(String),
    Closed,
}

/// One physical connection attempt. Dropping `commands` closes it; the
/// transport drops its end of `events` once the socket is gone.
pub struct Channel {
    pub commands: mpsc::UnboundedSender<WireCommand>,
    pub events: mpsc::UnboundedReceiver<WireEvent>,
}

impl Channel {
    pub fn pair() -> (Channel, ChannelPeer) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            Channel {
                commands: cmd_tx,
                events: ev_rx,
            },
            ChannelPeer {
                commands: cmd_rx,
                events: ev_tx,
            },
        )
    }
}

/// The transport side of a [`Channel`].
pub struct ChannelPeer {
    pub commands: mpsc::UnboundedReceiver<WireCommand>,
    pub events: mpsc::UnboundedSender<WireEvent>,
}

/// Opens channels to relays. Must be called from inside a tokio runtime,
/// implementations are free to spawn.
pub trait Transport: Send + Sync {
    fn open(&self, url: &RelayUrl) -> Result<Channel>;
}
