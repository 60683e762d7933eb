use crate::relay::transport::{Channel, ChannelPeer, Transport, WireCommand, WireEvent};
use crate::{RelayMessage, RelayUrl, Result};

use std::sync::Arc;

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use tokio::sync::Notify;
use tracing::{debug, error, trace};

/// [`Transport`] backed by ewebsock. ewebsock runs its own socket thread and
/// calls our wakeup whenever something arrives; the wakeup pokes a tokio task
/// that drains the receiver and forwards parsed relay messages.
#[derive(Default, Clone)]
pub struct WebsocketTransport {
    options: Options,
}

impl WebsocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self { options }
    }
}

impl Transport for WebsocketTransport {
    fn open(&self, url: &RelayUrl) -> Result<Channel> {
        let wakeup = Arc::new(Notify::new());
        let notifier = wakeup.clone();
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), self.options.clone(), move || {
                notifier.notify_one()
            })?;

        let (channel, peer) = Channel::pair();
        tokio::spawn(pump(url.clone(), sender, receiver, wakeup, peer));
        Ok(channel)
    }
}

fn send(url: &RelayUrl, sender: &mut WsSender, cmd: WireCommand) {
    match cmd {
        WireCommand::Send(msg) => {
            let json = match msg.to_json() {
                Ok(json) => {
                    debug!("sending {} to {}", json, url);
                    json
                }
                Err(e) => {
                    error!("error serializing json for filter: {e}");
                    return;
                }
            };
            sender.send(WsMessage::Text(json));
        }
        WireCommand::Ping => {
            trace!("pinging {}", url);
            sender.send(WsMessage::Ping(vec![]));
        }
    }
}

/// Returns false once the socket is finished.
fn handle_ws_event(url: &RelayUrl, sender: &mut WsSender, peer: &ChannelPeer, ev: WsEvent) -> bool {
    let wire = match ev {
        WsEvent::Opened => WireEvent::Opened,
        WsEvent::Closed => WireEvent::Closed,
        WsEvent::Error(err) => {
            error!("{url}: {err:?}");
            WireEvent::Error(err)
        }
        WsEvent::Message(WsMessage::Text(txt)) => match RelayMessage::from_json(&txt) {
            Ok(msg) => WireEvent::Message(msg),
            Err(err) => {
                debug!("dropping unparseable message from {url}: {err}");
                return true;
            }
        },
        WsEvent::Message(WsMessage::Ping(bs)) => {
            debug!("pong {}", url);
            sender.send(WsMessage::Pong(bs));
            return true;
        }
        WsEvent::Message(_) => return true,
    };

    let finished = matches!(wire, WireEvent::Closed | WireEvent::Error(_));
    // a closed receiver means nobody cares about this socket anymore
    peer.events.send(wire).is_ok() && !finished
}

async fn pump(
    url: RelayUrl,
    mut sender: WsSender,
    receiver: WsReceiver,
    wakeup: Arc<Notify>,
    mut peer: ChannelPeer,
) {
    loop {
        while let Some(ev) = receiver.try_recv() {
            if !handle_ws_event(&url, &mut sender, &peer, ev) {
                debug!("websocket pump for {url} finished");
                return;
            }
        }

        tokio::select! {
            _ = wakeup.notified() => {}
            cmd = peer.commands.recv() => match cmd {
                Some(cmd) => send(&url, &mut sender, cmd),
                None => {
                    debug!("closing websocket to {url}");
                    return;
                }
            }
        }
    }
}
