use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::relay::health::{HealthMonitor, HealthSample};
use crate::relay::transport::{Channel, Transport, WireCommand, WireEvent};
use crate::relay::{LivenessSchedule, PoolEvent, RelayStatus};
use crate::{ClientMessage, Error, Event, Filter, RelayMessage, RelayReqId, RelayUrl, Result};

/// What a single REQ sees from its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqEvent {
    Event(Box<Event>),
    Eose,
    Closed(String),
}

pub(crate) enum ConnCommand {
    Req {
        sub_id: RelayReqId,
        filters: Vec<Filter>,
        tx: mpsc::UnboundedSender<ReqEvent>,
    },
    Close(RelayReqId),
    Ping,
    Shutdown,
}

pub(crate) struct ConnectionContext {
    pub url: RelayUrl,
    pub transport: Arc<dyn Transport>,
    pub health: Arc<HealthMonitor>,
    pub events: broadcast::Sender<PoolEvent>,
    pub schedule: LivenessSchedule,
}

/// Handle to the task that owns one relay's physical connection. Cheap to
/// clone; every clone talks to the same driver.
#[derive(Clone)]
pub(crate) struct RelayConnection {
    url: RelayUrl,
    status: watch::Receiver<RelayStatus>,
    commands: mpsc::UnboundedSender<ConnCommand>,
}

impl RelayConnection {
    pub fn spawn(ctx: ConnectionContext) -> Self {
        let (status_tx, status_rx) = watch::channel(RelayStatus::Connecting);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let url = ctx.url.clone();

        let driver = Driver {
            ctx,
            status: status_tx,
            commands: cmd_rx,
            routes: HashMap::new(),
            channel: None,
            attempt: None,
            finished: false,
        };
        tokio::spawn(driver.run());

        Self {
            url,
            status: status_rx,
            commands: cmd_tx,
        }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// The driver is gone, either because the attempt failed or the pool
    /// shut it down. A new attempt needs a new connection.
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn settled(&self) -> RelayStatus {
        let mut status = self.status.clone();
        let settled = match status.wait_for(|s| *s != RelayStatus::Connecting).await {
            Ok(s) => *s,
            Err(_) => RelayStatus::Failed,
        };
        settled
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<RelaySubscription> {
        let sub_id = RelayReqId::default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(ConnCommand::Req {
                sub_id: sub_id.clone(),
                filters,
                tx,
            })
            .map_err(|_| Error::connection(&self.url, "relay connection is closed"))?;

        Ok(RelaySubscription {
            url: self.url.clone(),
            sub_id,
            events: rx,
            commands: self.commands.clone(),
        })
    }

    pub fn ping(&self) {
        let _ = self.commands.send(ConnCommand::Ping);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ConnCommand::Shutdown);
    }
}

/// One open REQ. Dropping it sends CLOSE to the relay.
pub struct RelaySubscription {
    url: RelayUrl,
    sub_id: RelayReqId,
    events: mpsc::UnboundedReceiver<ReqEvent>,
    commands: mpsc::UnboundedSender<ConnCommand>,
}

impl RelaySubscription {
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn sub_id(&self) -> &RelayReqId {
        &self.sub_id
    }

    /// `None` once the connection behind this REQ is gone.
    pub async fn next(&mut self) -> Option<ReqEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ReqEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(ConnCommand::Close(self.sub_id.clone()));
    }
}

struct Route {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<ReqEvent>,
}

struct Attempt {
    started: Instant,
    next_check: usize,
}

enum Step {
    Command(Option<ConnCommand>),
    Wire(Option<WireEvent>),
    Check,
}

struct Driver {
    ctx: ConnectionContext,
    status: watch::Sender<RelayStatus>,
    commands: mpsc::UnboundedReceiver<ConnCommand>,
    routes: HashMap<RelayReqId, Route>,
    channel: Option<Channel>,
    attempt: Option<Attempt>,
    finished: bool,
}

async fn recv_wire(channel: &mut Option<Channel>) -> Option<WireEvent> {
    match channel {
        Some(channel) => channel.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        self.start_attempt();

        while !self.finished {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                ev = recv_wire(&mut self.channel) => Step::Wire(ev),
                _ = sleep_or_pending(deadline) => Step::Check,
            };

            match step {
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Command(None) => break,
                Step::Wire(ev) => self.handle_wire(ev),
                Step::Check => self.liveness_check(),
            }
        }

        self.channel = None;
        self.close_routes("connection closed");
        debug!("connection driver for {} finished", self.ctx.url);
    }

    fn broadcast(&self, ev: PoolEvent) {
        // nobody listening is fine
        let _ = self.ctx.events.send(ev);
    }

    fn set_status(&self, status: RelayStatus) {
        self.status.send_replace(status);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let attempt = self.attempt.as_ref()?;
        let offset = self.ctx.schedule.checks.get(attempt.next_check)?;
        Some(attempt.started + *offset)
    }

    fn start_attempt(&mut self) {
        let url = &self.ctx.url;
        debug!("connecting to {url}");
        self.set_status(RelayStatus::Connecting);
        self.broadcast(PoolEvent::Connecting(url.clone()));

        let started = Instant::now();
        match self.ctx.transport.open(url) {
            Ok(channel) => {
                self.channel = Some(channel);
                self.attempt = Some(Attempt {
                    started,
                    next_check: 0,
                });
            }
            Err(err) => {
                self.attempt = Some(Attempt {
                    started,
                    next_check: 0,
                });
                self.fail_attempt(err.to_string());
            }
        }
    }

    fn connected(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        let latency = attempt.started.elapsed();
        let url = self.ctx.url.clone();

        info!("connected to {url} in {latency:?}");
        self.set_status(RelayStatus::Connected);
        self.ctx
            .health
            .record_outcome(HealthSample::success(url.clone(), latency));
        self.ctx.health.record_liveness(&url, true);
        self.broadcast(PoolEvent::Connected { url, latency });

        // everything requested while we were connecting goes out now
        let reqs: Vec<ClientMessage> = self
            .routes
            .iter()
            .map(|(sub_id, route)| ClientMessage::req(sub_id.clone(), route.filters.clone()))
            .collect();
        for req in reqs {
            self.send(req);
        }
    }

    fn fail_attempt(&mut self, reason: String) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        let url = self.ctx.url.clone();

        warn!("connecting to {url} failed: {reason}");
        self.channel = None;
        self.set_status(RelayStatus::Failed);
        self.ctx.health.record_outcome(HealthSample::failure(
            url.clone(),
            attempt.started.elapsed(),
        ));
        self.ctx.health.record_liveness(&url, false);
        self.broadcast(PoolEvent::Failed {
            url,
            reason: reason.clone(),
        });
        self.close_routes(&reason);
        self.finished = true;
    }

    fn liveness_check(&mut self) {
        let checks = self.ctx.schedule.checks.len();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        attempt.next_check += 1;
        trace!(
            "liveness check {}/{} for {}: still connecting",
            attempt.next_check,
            checks,
            self.ctx.url
        );

        if attempt.next_check >= checks {
            let waited = attempt.started.elapsed();
            self.fail_attempt(format!("no response after {}s", waited.as_secs()));
        }
    }

    /// The socket went away. While connecting that fails the attempt; a
    /// connected relay gets one fresh attempt.
    fn lost(&mut self, reason: String) {
        self.channel = None;

        if self.attempt.is_some() {
            self.fail_attempt(reason);
            return;
        }

        let url = self.ctx.url.clone();
        info!("{url} disconnected: {reason}");
        self.ctx.health.record_liveness(&url, false);
        self.broadcast(PoolEvent::Disconnected {
            url,
            reason: reason.clone(),
        });
        self.close_routes("connection dropped");
        self.start_attempt();
    }

    fn handle_wire(&mut self, ev: Option<WireEvent>) {
        match ev {
            Some(WireEvent::Opened) => self.connected(),
            Some(WireEvent::Message(msg)) => self.route_message(msg),
            Some(WireEvent::Error(err)) => self.lost(err),
            Some(WireEvent::Closed) | None => self.lost("connection closed".to_owned()),
        }
    }

    fn handle_command(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Req {
                sub_id,
                filters,
                tx,
            } => {
                if self.is_connected() {
                    self.send(ClientMessage::req(sub_id.clone(), filters.clone()));
                }
                self.routes.insert(sub_id, Route { filters, tx });
            }
            ConnCommand::Close(sub_id) => {
                if self.routes.remove(&sub_id).is_some() && self.is_connected() {
                    self.send(ClientMessage::close(sub_id));
                }
            }
            ConnCommand::Ping => {
                if let Some(channel) = &self.channel {
                    if self.is_connected() {
                        let _ = channel.commands.send(WireCommand::Ping);
                    }
                }
            }
            ConnCommand::Shutdown => self.finished = true,
        }
    }

    fn route_message(&mut self, msg: RelayMessage) {
        let url = &self.ctx.url;
        match msg {
            RelayMessage::Event { sub_id, event } => {
                self.forward(&sub_id, ReqEvent::Event(event));
            }
            RelayMessage::Eose(sub_id) => {
                trace!("EOSE {sub_id} from {url}");
                self.forward(&sub_id, ReqEvent::Eose);
            }
            RelayMessage::Closed { sub_id, message } => {
                debug!("{url} closed {sub_id}: {message}");
                if let Some(route) = self.routes.remove(sub_id.as_str()) {
                    let _ = route.tx.send(ReqEvent::Closed(message));
                }
            }
            RelayMessage::Notice(message) => {
                info!("NOTICE from {url}: {message}");
                self.broadcast(PoolEvent::Notice {
                    url: url.clone(),
                    message,
                });
            }
            RelayMessage::Ok(result) => {
                debug!("OK from {url}: {result:?}");
            }
        }
    }

    fn forward(&mut self, sub_id: &str, ev: ReqEvent) {
        let Some(route) = self.routes.get(sub_id) else {
            trace!("dropping message for unknown subscription {sub_id}");
            return;
        };

        if route.tx.send(ev).is_err() {
            // the subscriber is gone without telling us
            self.routes.remove(sub_id);
            self.send(ClientMessage::close(RelayReqId::from(sub_id)));
        }
    }

    fn close_routes(&mut self, reason: &str) {
        for (_, route) in self.routes.drain() {
            let _ = route.tx.send(ReqEvent::Closed(reason.to_owned()));
        }
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow() == RelayStatus::Connected
    }

    fn send(&self, msg: ClientMessage) {
        if let Some(channel) = &self.channel {
            if channel.commands.send(WireCommand::Send(msg)).is_err() {
                debug!("transport for {} is gone", self.ctx.url);
            }
        }
    }
}
