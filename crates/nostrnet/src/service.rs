//! The event loop that owns the networking core.
//!
//! [`RelayService`] is a single tokio task holding the [`RelayPool`], the
//! [`PostBox`], the live subscriptions and any running negentropy
//! sessions. Everything else talks to it through a cloneable
//! [`RelayHandle`]. The loop wakes up on commands, on socket wakeups, on
//! the earliest pending deadline, and on a fixed housekeeping tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ewebsock::WsEvent;
use hashbrown::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use tokio::time::MissedTickBehavior;

use crate::config::ServiceConfig;
use crate::negentropy::{NegEvent, NegentropySupport, NegentropySync, SyncOutcome};
use crate::postbox::{CancelSendError, OnFlush, PostBox};
use crate::relay::message::{CommandResult, RelayMessage};
use crate::relay::websocket::{Connector, EwebsockConnector};
use crate::relay::{NetworkMonitor, PoolEvent, RelayDescriptor, RelayPool, RelayUrl};
use crate::subscription::{run_local_scan, StreamItem, SubscriptionManager};
use crate::waiter::WaiterMap;
use crate::{Error, Filter, Keypair, LocalIndex, Note, NoteId, NoteSigner, Result, SubId};

enum Command {
    AddRelay {
        descriptor: RelayDescriptor,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveRelay {
        url: RelayUrl,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect,
    Disconnect,
    EnsureConnected(Vec<RelayUrl>),
    NumConnected(oneshot::Sender<usize>),
    SetKeypair(Option<Keypair>),
    Send {
        note: Box<Note>,
        to: Option<Vec<RelayUrl>>,
        delay: Option<Duration>,
        on_flush: Option<OnFlush>,
        reply: oneshot::Sender<bool>,
    },
    CancelSend {
        id: NoteId,
        reply: oneshot::Sender<std::result::Result<(), CancelSendError>>,
    },
    Subscribe {
        sub_id: SubId,
        filters: Vec<Filter>,
        to: Option<Vec<RelayUrl>>,
        eose_timeout: Option<Duration>,
        reply: oneshot::Sender<UnboundedReceiver<StreamItem>>,
    },
    Unsubscribe(String),
    Sync {
        relay: RelayUrl,
        filter: Filter,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Shutdown,
}

struct SyncSession {
    sync: NegentropySync,
    reply: Option<oneshot::Sender<SyncOutcome>>,
    requested_at: Instant,
    finished: bool,
    stale: bool,
}

impl SyncSession {
    fn finish(&mut self, outcome: SyncOutcome) {
        self.finished = true;
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }

    /// Done answering and nothing left to close on the relay
    fn is_spent(&self) -> bool {
        self.finished && (self.stale || self.sync.pending_fetches() == 0)
    }
}

pub struct RelayService {
    pool: RelayPool,
    postbox: PostBox,
    subs: SubscriptionManager,
    index: Arc<dyn LocalIndex>,
    syncs: Vec<SyncSession>,
    support: NegentropySupport,
    open_waiters: Arc<WaiterMap<RelayUrl, ()>>,
    commands: UnboundedReceiver<Command>,
    wakeup: Arc<Notify>,
    config: ServiceConfig,
}

impl RelayService {
    /// Build a service around `connector`. The connector should poke the
    /// returned [`Notify`] through its wakeup when a socket has data;
    /// without that the loop still drains sockets on every tick.
    pub fn new(
        connector: Box<dyn Connector>,
        index: Arc<dyn LocalIndex>,
        config: ServiceConfig,
    ) -> (Self, RelayHandle) {
        Self::with_wakeup(connector, index, config, Arc::new(Notify::new()))
    }

    /// A service connecting through ewebsock, woken by socket activity
    pub fn with_ewebsock(index: Arc<dyn LocalIndex>, config: ServiceConfig) -> (Self, RelayHandle) {
        let wakeup = Arc::new(Notify::new());
        let notify = wakeup.clone();
        let connector = EwebsockConnector::new(move || notify.notify_one());
        Self::with_wakeup(Box::new(connector), index, config, wakeup)
    }

    fn with_wakeup(
        connector: Box<dyn Connector>,
        index: Arc<dyn LocalIndex>,
        config: ServiceConfig,
        wakeup: Arc<Notify>,
    ) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(connector, config.pool.clone());
        let postbox = PostBox::new(config.postbox.clone());
        let open_waiters = Arc::new(WaiterMap::new());

        let handle = RelayHandle {
            commands: tx,
            ok_waiters: postbox.ok_waiters().clone(),
            open_waiters: open_waiters.clone(),
            network: pool.network().clone(),
            wakeup: wakeup.clone(),
            ensure_connected_timeout: config.ensure_connected_timeout,
        };

        let service = Self {
            pool,
            postbox,
            subs: SubscriptionManager::new(),
            index,
            syncs: vec![],
            support: NegentropySupport::new(),
            open_waiters,
            commands: rx,
            wakeup,
            config,
        };

        (service, handle)
    }

    /// Verify incoming events and sign AUTH with `signer` instead of the
    /// built in secp256k1 one
    pub fn set_signer(&mut self, signer: Arc<dyn NoteSigner>) -> &mut Self {
        self.pool.set_signer(signer);
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until [`RelayHandle::shutdown`] or until every handle is gone
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("relay service started");

        loop {
            // past due deadlines that a step couldn't clear are left to
            // the ticker
            let now = Instant::now();
            let deadline = self.next_deadline().filter(|d| *d > now);
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            let cmd = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => Some(cmd),
                },
                _ = self.wakeup.notified() => None,
                _ = ticker.tick() => None,
                _ = sleep => None,
            };

            let now = Instant::now();
            if let Some(cmd) = cmd {
                self.handle_command(cmd, now);
            }
            self.step(now);
        }

        tracing::info!("relay service shutting down");
        self.pool.disconnect(None);
    }

    fn handle_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::AddRelay { descriptor, reply } => {
                let url = descriptor.url.clone();
                let res = self.pool.add_relay(descriptor);
                if res.is_ok() {
                    self.pool.ensure_connected(std::slice::from_ref(&url), now);
                }
                let _ = reply.send(res);
            }
            Command::RemoveRelay { url, reply } => {
                let res = self.pool.remove_relay(&url);
                if res.is_ok() {
                    self.support.forget(&url);
                }
                let _ = reply.send(res);
            }
            Command::Connect => self.pool.connect(now),
            Command::Disconnect => self.pool.disconnect(None),
            Command::EnsureConnected(urls) => {
                self.pool.ensure_connected(&urls, now);
                for url in urls.iter().filter(|u| self.pool.is_connected(u)) {
                    self.open_waiters.resolve(url, ());
                }
            }
            Command::NumConnected(reply) => {
                let _ = reply.send(self.pool.num_connected());
            }
            Command::SetKeypair(keypair) => {
                self.pool.set_keypair(keypair);
            }
            Command::Send {
                note,
                to,
                delay,
                on_flush,
                reply,
            } => {
                let posted = self
                    .postbox
                    .send(*note, to, delay, on_flush, &mut self.pool, now);
                let _ = reply.send(posted);
            }
            Command::CancelSend { id, reply } => {
                let _ = reply.send(self.postbox.cancel_send(&id));
            }
            Command::Subscribe {
                sub_id,
                filters,
                to,
                eose_timeout,
                reply,
            } => {
                let (stream, rx) = self.subs.subscribe(
                    sub_id,
                    filters,
                    to.as_deref(),
                    eose_timeout,
                    &mut self.pool,
                    now,
                );

                let index = self.index.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) = run_local_scan(&*index, &stream) {
                        tracing::error!("local scan for '{}' failed: {err}", stream.sub_id());
                    }
                });

                let _ = reply.send(rx);
            }
            Command::Unsubscribe(sub_id) => {
                self.subs.unsubscribe(&sub_id, &mut self.pool);
            }
            Command::Sync {
                relay,
                filter,
                reply,
            } => self.start_sync(relay, filter, reply, now),
            // handled by the loop
            Command::Shutdown => {}
        }
    }

    fn start_sync(
        &mut self,
        relay: RelayUrl,
        filter: Filter,
        reply: oneshot::Sender<SyncOutcome>,
        now: Instant,
    ) {
        if self.support.is_supported(&relay) == Some(false) {
            tracing::debug!("skipping negentropy with {}, known unsupported", relay);
            let _ = reply.send(SyncOutcome::Unsupported(
                "relay does not support negentropy".to_owned(),
            ));
            return;
        }

        self.pool.ensure_connected(std::slice::from_ref(&relay), now);

        let mut sync = NegentropySync::new(relay, filter, self.config.negentropy.clone());
        sync.trigger_now();
        self.syncs.push(SyncSession {
            sync,
            reply: Some(reply),
            requested_at: now,
            finished: false,
            stale: false,
        });
    }

    /// One pass over everything: pool housekeeping, inbound traffic,
    /// retries, negentropy sessions.
    #[profiling::function]
    fn step(&mut self, now: Instant) {
        self.pool.tick(now);

        let mut neg_events: HashMap<RelayUrl, Vec<NegEvent>> = HashMap::new();
        while let Some(ev) = self.pool.try_recv(now) {
            self.handle_pool_event(&ev, now);
            if let Some(neg) = NegEvent::from_pool_event(&ev) {
                neg_events.entry(ev.relay.clone()).or_default().push(neg);
            }
        }

        self.postbox.try_flushing_events(&mut self.pool, now);
        self.drive_syncs(neg_events, now);
        self.subs.prune_closed(&mut self.pool);
    }

    fn handle_pool_event(&mut self, ev: &PoolEvent, now: Instant) {
        if let WsEvent::Opened = ev.event {
            self.postbox.relay_connected(&ev.relay, &mut self.pool, now);
            self.open_waiters.resolve(&ev.relay, ());
        }

        match &ev.message {
            Some(RelayMessage::OK(result)) => self.postbox.handle_ok(&ev.relay, result),
            // the pool only decodes events that verified
            Some(RelayMessage::Event(_, note)) => {
                if let Err(err) = self.index.insert(note) {
                    tracing::error!("failed to store {}: {err}", note.id);
                }
            }
            _ => {}
        }

        self.subs.handle_pool_event(ev);
    }

    fn drive_syncs(&mut self, events: HashMap<RelayUrl, Vec<NegEvent>>, now: Instant) {
        for session in self.syncs.iter_mut() {
            // sessions on the same relay all see its events and pick
            // theirs by subscription id
            let relay = session.sync.relay().clone();
            let evs = events.get(&relay).cloned().unwrap_or_default();

            if session.finished {
                if evs.contains(&NegEvent::RelayOpened) {
                    // the id fetches died with the old socket
                    session.stale = true;
                    continue;
                }
                let evs = evs
                    .into_iter()
                    .filter(|e| matches!(e, NegEvent::SubDone { .. }))
                    .collect();
                session.sync.process(evs, &*self.index, &mut self.pool, now);
                continue;
            }

            for outcome in session.sync.process(evs, &*self.index, &mut self.pool, now) {
                self.support.record(&relay, &outcome);
                session.finish(outcome);
            }

            let never_started = !session.finished
                && !session.sync.is_reconciling()
                && now.saturating_duration_since(session.requested_at)
                    >= self.config.negentropy.first_response_timeout;
            if never_started {
                tracing::warn!("negentropy: {} never connected, giving up", relay);
                session.finish(SyncOutcome::Failed(format!("could not reach {relay}")));
            }
        }

        self.syncs.retain(|s| !s.is_spent());
    }

    fn next_deadline(&self) -> Option<Instant> {
        let syncs = self.syncs.iter().filter_map(|s| {
            if s.finished {
                None
            } else if s.sync.is_reconciling() {
                s.sync.next_deadline()
            } else {
                Some(s.requested_at + self.config.negentropy.first_response_timeout)
            }
        });

        [self.pool.next_deadline(), self.postbox.next_deadline()]
            .into_iter()
            .flatten()
            .chain(syncs)
            .min()
    }
}

/// The merged feed of one subscription. Dropping it closes the
/// subscription on the relays.
pub struct Subscription {
    sub_id: SubId,
    items: UnboundedReceiver<StreamItem>,
}

impl Subscription {
    pub fn sub_id(&self) -> &SubId {
        &self.sub_id
    }

    /// The next event or the combined EOSE. `None` once the service is gone.
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.items.recv().await
    }

    /// Everything up to and including the combined EOSE
    pub async fn stored(&mut self) -> Vec<Note> {
        let mut notes = vec![];
        while let Some(item) = self.next().await {
            match item {
                StreamItem::Event(note) => notes.push(*note),
                StreamItem::Eose => break,
            }
        }
        notes
    }
}

/// Cloneable async front for a running [`RelayService`]
#[derive(Clone)]
pub struct RelayHandle {
    commands: UnboundedSender<Command>,
    ok_waiters: Arc<WaiterMap<NoteId, CommandResult>>,
    open_waiters: Arc<WaiterMap<RelayUrl, ()>>,
    network: Arc<NetworkMonitor>,
    wakeup: Arc<Notify>,
    ensure_connected_timeout: Duration,
}

impl RelayHandle {
    fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| Error::ServiceStopped)?;
        self.wakeup.notify_one();
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    /// Reachability for the whole pool. Flip it from platform callbacks.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Add a relay and start connecting to it
    pub async fn add_relay(&self, descriptor: RelayDescriptor) -> Result<()> {
        self.request(|reply| Command::AddRelay { descriptor, reply })
            .await?
    }

    pub async fn remove_relay(&self, url: RelayUrl) -> Result<()> {
        self.request(|reply| Command::RemoveRelay { url, reply })
            .await?
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub async fn num_connected(&self) -> Result<usize> {
        self.request(Command::NumConnected).await
    }

    /// Used to sign AUTH challenges
    pub fn set_keypair(&self, keypair: Option<Keypair>) -> Result<()> {
        self.command(Command::SetKeypair(keypair))
    }

    /// Connect to each of `urls`, adding unknown ones as ephemeral relays,
    /// and wait for them to open. All relays share one deadline. Returns
    /// the relays that are up.
    pub async fn ensure_connected(&self, urls: Vec<RelayUrl>) -> Result<Vec<RelayUrl>> {
        let waiters: Vec<_> = urls
            .iter()
            .map(|url| (url.clone(), self.open_waiters.register(url.clone())))
            .collect();
        self.command(Command::EnsureConnected(urls))?;

        let deadline = tokio::time::Instant::now() + self.ensure_connected_timeout;
        let mut connected = vec![];
        for (url, waiter) in waiters {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if self.open_waiters.wait(waiter, left).await.is_some() {
                connected.push(url);
            }
        }

        Ok(connected)
    }

    /// Post `note`. Returns false when the same event is already pending.
    pub async fn send(
        &self,
        note: Note,
        to: Option<Vec<RelayUrl>>,
        delay: Option<Duration>,
        on_flush: Option<OnFlush>,
    ) -> Result<bool> {
        self.request(|reply| Command::Send {
            note: Box::new(note),
            to,
            delay,
            on_flush,
            reply,
        })
        .await
    }

    /// Post `note` and wait for the first relay to answer it
    pub async fn send_and_wait(
        &self,
        note: Note,
        to: Option<Vec<RelayUrl>>,
        timeout: Duration,
    ) -> Result<Option<CommandResult>> {
        let waiter = self.ok_waiters.register(note.id);
        self.send(note, to, None, None).await?;
        Ok(self.ok_waiters.wait(waiter, timeout).await)
    }

    pub async fn cancel_send(&self, id: NoteId) -> Result<()> {
        self.request(|reply| Command::CancelSend { id, reply })
            .await?
            .map_err(Error::from)
    }

    /// Subscribe on the relays and the local index at once
    pub async fn subscribe(
        &self,
        sub_id: SubId,
        filters: Vec<Filter>,
        to: Option<Vec<RelayUrl>>,
        eose_timeout: Option<Duration>,
    ) -> Result<Subscription> {
        let items = self
            .request(|reply| Command::Subscribe {
                sub_id: sub_id.clone(),
                filters,
                to,
                eose_timeout,
                reply,
            })
            .await?;
        Ok(Subscription { sub_id, items })
    }

    pub fn unsubscribe(&self, sub_id: &SubId) -> Result<()> {
        self.command(Command::Unsubscribe(sub_id.as_str().to_owned()))
    }

    /// Reconcile `filter` with `relay` over negentropy. Missing events are
    /// requested from the relay and land in the local index as they arrive.
    pub async fn sync(&self, relay: RelayUrl, filter: Filter) -> Result<SyncOutcome> {
        self.request(|reply| Command::Sync {
            relay,
            filter,
            reply,
        })
        .await
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}
