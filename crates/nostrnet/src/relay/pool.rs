use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ewebsock::{WsEvent, WsMessage};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;

use crate::config::PoolConfig;
use crate::relay::auth::{make_auth_request, AuthError, AuthState};
use crate::relay::connection::RelayConnection;
use crate::relay::message::RelayMessage;
use crate::relay::network::NetworkMonitor;
use crate::relay::queue::RequestQueue;
use crate::relay::websocket::Connector;
use crate::relay::{RelayDescriptor, RelayStatus, RelayUrl};
use crate::{ClientMessage, Error, Filter, Keypair, NoteId, NoteSigner, Result, SchnorrSigner};

/// A transport event from one relay. Text frames that parse as relay
/// messages are decoded once here so consumers don't have to. Events with
/// a bad id or signature are left undecoded.
#[derive(Debug)]
pub struct PoolEvent {
    pub relay: RelayUrl,
    pub event: WsEvent,
    pub message: Option<RelayMessage>,
}

/// What happened to a message handed to the pool for one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held until the relay connects
    Queued,
    /// The relay's queue was full
    Dropped,
    /// Not routed to this relay (unknown, disabled, or wrong read/write role)
    Skipped,
}

pub struct PoolRelay {
    pub descriptor: RelayDescriptor,
    pub connection: RelayConnection,
    pub auth: AuthState,
    auth_event: Option<NoteId>,
}

struct PoolSubscription {
    filters: Vec<Filter>,
    targets: Vec<RelayUrl>,
    /// Relays we still expect an EOSE from, and when we stop waiting
    eose_deadlines: HashMap<RelayUrl, Instant>,
    /// Relays we closed this subscription on after they timed out
    closed: HashSet<RelayUrl>,
    /// Relays whose REQ is still waiting in the request queue
    queued: HashSet<RelayUrl>,
}

pub struct RelayPool {
    relays: IndexMap<RelayUrl, PoolRelay>,
    connector: Box<dyn Connector>,
    queue: RequestQueue,
    subscriptions: IndexMap<String, PoolSubscription>,
    seen: HashMap<NoteId, HashSet<RelayUrl>>,
    /// Insertion order of `seen`, oldest first
    seen_order: VecDeque<NoteId>,
    counts: HashMap<RelayUrl, u64>,
    synthesized: VecDeque<PoolEvent>,
    keypair: Option<Keypair>,
    signer: Arc<dyn NoteSigner>,
    network: Arc<NetworkMonitor>,
    config: PoolConfig,
}

impl RelayPool {
    pub fn new(connector: Box<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            relays: IndexMap::new(),
            connector,
            queue: RequestQueue::new(config.max_queued_per_relay),
            subscriptions: IndexMap::new(),
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
            counts: HashMap::new(),
            synthesized: VecDeque::new(),
            keypair: None,
            signer: Arc::new(SchnorrSigner),
            network: Arc::new(NetworkMonitor::default()),
            config,
        }
    }

    /// Account used to answer NIP-42 challenges
    pub fn set_keypair(&mut self, keypair: Option<Keypair>) -> &mut Self {
        self.keypair = keypair;
        self
    }

    pub fn set_signer(&mut self, signer: Arc<dyn NoteSigner>) -> &mut Self {
        self.signer = signer;
        self
    }

    pub fn set_network_monitor(&mut self, network: Arc<NetworkMonitor>) -> &mut Self {
        self.network = network;
        self
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn has(&self, url: &RelayUrl) -> bool {
        self.relays.contains_key(url)
    }

    pub fn urls(&self) -> Vec<RelayUrl> {
        self.relays.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RelayDescriptor> {
        self.relays.values().map(|r| &r.descriptor)
    }

    pub fn relay(&self, url: &RelayUrl) -> Option<&PoolRelay> {
        self.relays.get(url)
    }

    pub fn status(&self, url: &RelayUrl) -> Option<RelayStatus> {
        self.relays.get(url).map(|r| r.connection.status())
    }

    pub fn is_connected(&self, url: &RelayUrl) -> bool {
        self.relays
            .get(url)
            .is_some_and(|r| r.connection.is_connected())
    }

    pub fn auth_state(&self, url: &RelayUrl) -> Option<AuthState> {
        self.relays.get(url).map(|r| r.auth)
    }

    pub fn num_connected(&self) -> usize {
        self.relays
            .values()
            .filter(|r| r.connection.is_connected())
            .count()
    }

    pub fn queued(&self, url: &RelayUrl) -> usize {
        self.queue.len(url)
    }

    pub fn add_relay(&mut self, descriptor: RelayDescriptor) -> Result<()> {
        if self.relays.contains_key(&descriptor.url) {
            return Err(Error::RelayAlreadyExists(descriptor.url));
        }

        tracing::debug!("adding relay {} to pool", descriptor.url);
        let connection = RelayConnection::new(descriptor.url.clone(), self.config.connection.clone());
        self.relays.insert(
            descriptor.url.clone(),
            PoolRelay {
                descriptor,
                connection,
                auth: AuthState::None,
                auth_event: None,
            },
        );
        Ok(())
    }

    pub fn remove_relay(&mut self, url: &RelayUrl) -> Result<()> {
        let Some(mut relay) = self.relays.shift_remove(url) else {
            return Err(Error::UnknownRelay(url.clone()));
        };

        tracing::info!("removing relay {} from pool", url);
        relay.connection.disconnect();
        self.queue.remove(url);
        self.counts.remove(url);
        self.seen.retain(|_, relays| {
            relays.remove(url);
            !relays.is_empty()
        });
        let seen = &self.seen;
        self.seen_order.retain(|id| seen.contains_key(id));

        // nobody is going to answer for this relay anymore
        let pending: Vec<String> = self
            .subscriptions
            .iter_mut()
            .filter_map(|(sub_id, sub)| {
                sub.targets.retain(|t| t != url);
                sub.queued.remove(url);
                sub.eose_deadlines.remove(url).map(|_| sub_id.clone())
            })
            .collect();
        for sub_id in pending {
            self.synthesize_eose(url.clone(), sub_id);
        }

        Ok(())
    }

    /// Connect every relay that isn't disabled
    pub fn connect(&mut self, now: Instant) {
        for relay in self.relays.values_mut() {
            relay.connection.connect(&*self.connector, false, now);
        }
    }

    /// Kick relays that are down right now, skipping any backoff wait
    pub fn connect_to_disconnected(&mut self, now: Instant) {
        for relay in self.relays.values_mut() {
            if relay.connection.status() == RelayStatus::Disconnected {
                relay.connection.connect(&*self.connector, false, now);
            }
        }
    }

    pub fn disconnect(&mut self, to: Option<&[RelayUrl]>) {
        for relay in self.relays.values_mut() {
            if targets(to, &relay.descriptor.url) {
                relay.connection.disconnect();
            }
        }
    }

    pub fn reconnect(&mut self, to: Option<&[RelayUrl]>, now: Instant) {
        for relay in self.relays.values_mut() {
            if targets(to, &relay.descriptor.url) {
                relay.connection.connect(&*self.connector, true, now);
            }
        }
    }

    /// Make sure each of `urls` is in the pool and on its way up. Missing
    /// ones are added as ephemeral relays. Returns the urls that were added.
    pub fn ensure_connected(&mut self, urls: &[RelayUrl], now: Instant) -> Vec<RelayUrl> {
        let mut added = vec![];
        for url in urls {
            if !self.relays.contains_key(url) {
                if self.add_relay(RelayDescriptor::ephemeral(url.clone())).is_ok() {
                    added.push(url.clone());
                }
            }

            if let Some(relay) = self.relays.get_mut(url) {
                relay.connection.connect(&*self.connector, false, now);
            }
        }
        added
    }

    /// Deliver `msg` to one relay, queueing it if the relay is down. Read
    /// and write roles are honored; ephemeral relays are fine since the
    /// caller named this one.
    pub fn send_to(&mut self, msg: &ClientMessage, url: &RelayUrl) -> Delivery {
        if let Some(delivery) = self.send_now(msg, url) {
            return delivery;
        }

        if self.queue.push(url, msg.clone()) {
            Delivery::Queued
        } else {
            Delivery::Dropped
        }
    }

    /// `None` when the relay is routable but not connected
    fn send_now(&mut self, msg: &ClientMessage, url: &RelayUrl) -> Option<Delivery> {
        let Some(relay) = self.relays.get_mut(url) else {
            tracing::debug!("not sending to unknown relay {}", url);
            return Some(Delivery::Skipped);
        };

        if !routes(&relay.descriptor, msg) || relay.connection.is_disabled() {
            return Some(Delivery::Skipped);
        }

        if !relay.connection.is_connected() {
            return None;
        }

        Some(if relay.connection.send(msg) {
            Delivery::Sent
        } else {
            Delivery::Dropped
        })
    }

    /// Fan `msg` out. With `to = None` every relay whose role fits gets it,
    /// except ephemeral ones.
    pub fn send(&mut self, msg: &ClientMessage, to: Option<&[RelayUrl]>) -> Vec<(RelayUrl, Delivery)> {
        let urls: Vec<RelayUrl> = match to {
            Some(to) => to.to_vec(),
            None => self
                .relays
                .values()
                .filter(|r| !r.descriptor.is_ephemeral())
                .map(|r| r.descriptor.url.clone())
                .collect(),
        };

        urls.into_iter()
            .map(|url| {
                let delivery = self.send_to(msg, &url);
                (url, delivery)
            })
            .collect()
    }

    /// Open a subscription. Relays that are down get the REQ queued behind
    /// whatever was sent to them before. Returns the relays the
    /// subscription targets.
    pub fn subscribe(
        &mut self,
        sub_id: String,
        filters: Vec<Filter>,
        to: Option<&[RelayUrl]>,
        eose_timeout: Option<Duration>,
        now: Instant,
    ) -> Vec<RelayUrl> {
        let req = ClientMessage::req(sub_id.clone(), filters.clone());
        let timeout = eose_timeout.unwrap_or(self.config.eose_timeout);

        let targets: Vec<RelayUrl> = self
            .relays
            .values()
            .filter(|r| match to {
                Some(to) => to.contains(&r.descriptor.url),
                None => !r.descriptor.is_ephemeral(),
            })
            .filter(|r| r.descriptor.read && !r.connection.is_disabled())
            .map(|r| r.descriptor.url.clone())
            .collect();

        tracing::info!(
            "sending '{}' subscription to {} relays: {:?}",
            sub_id,
            targets.len(),
            filters
        );

        let mut queued = HashSet::new();
        for url in &targets {
            if self.send_to(&req, url) == Delivery::Queued {
                queued.insert(url.clone());
            }
        }

        let eose_deadlines = targets.iter().map(|u| (u.clone(), now + timeout)).collect();
        self.subscriptions.insert(
            sub_id,
            PoolSubscription {
                filters,
                targets: targets.clone(),
                eose_deadlines,
                closed: HashSet::new(),
                queued,
            },
        );

        targets
    }

    pub fn unsubscribe(&mut self, sub_id: &str) {
        let Some(sub) = self.subscriptions.shift_remove(sub_id) else {
            return;
        };

        let close = ClientMessage::close(sub_id.to_owned());
        for url in &sub.targets {
            if sub.closed.contains(url) {
                continue;
            }
            if sub.queued.contains(url) {
                // never reached the relay, take the REQ back
                self.queue.retain(url, |msg| {
                    !matches!(msg, ClientMessage::Req { sub_id: id, .. } if id == sub_id)
                });
                continue;
            }
            // a relay that isn't connected has no subscription to close
            if let Some(relay) = self.relays.get_mut(url) {
                if relay.connection.is_connected() {
                    relay.connection.send(&close);
                }
            }
        }
    }

    pub fn subscription_targets(&self, sub_id: &str) -> Option<&[RelayUrl]> {
        self.subscriptions.get(sub_id).map(|s| s.targets.as_slice())
    }

    /// Relays the note with `id` has been received from. Only the most
    /// recent `max_seen_notes` ids are remembered.
    pub fn seen_on(&self, id: &NoteId) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self
            .seen
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        relays.sort();
        relays
    }

    /// Number of distinct notes received from `url`
    pub fn count(&self, url: &RelayUrl) -> u64 {
        self.counts.get(url).copied().unwrap_or(0)
    }

    /// Housekeeping: reachability driven reconnects, per relay reconnects
    /// and pings, and EOSE timeouts.
    pub fn tick(&mut self, now: Instant) {
        if self.network.take_reconnect_request() {
            tracing::info!("network is back, reconnecting disconnected relays");
            self.connect_to_disconnected(now);
        }

        for relay in self.relays.values_mut() {
            relay.connection.tick(&*self.connector, now);
        }

        self.expire_eose(now);
    }

    /// Earliest instant something in the pool needs a tick
    pub fn next_deadline(&self) -> Option<Instant> {
        let reconnects = self.relays.values().filter_map(|r| r.connection.reconnect_at());
        let eose = self
            .subscriptions
            .values()
            .flat_map(|s| s.eose_deadlines.values().copied());
        reconnects.chain(eose).min()
    }

    /// Attempts to receive a pool event from the relays in order. Synthesized
    /// EOSEs are handed out first.
    #[profiling::function]
    pub fn try_recv(&mut self, now: Instant) -> Option<PoolEvent> {
        if let Some(ev) = self.synthesized.pop_front() {
            return Some(ev);
        }

        for idx in 0..self.relays.len() {
            let Some((url, relay)) = self.relays.get_index_mut(idx) else {
                continue;
            };
            let Some(event) = relay.connection.try_recv(now) else {
                continue;
            };
            let url = url.clone();

            let message = match &event {
                WsEvent::Message(WsMessage::Text(text)) => match RelayMessage::from_json(text) {
                    Ok(RelayMessage::Event(_, note)) if note.verify(&*self.signer).is_err() => {
                        tracing::debug!("dropping event {} from {}: bad id or signature", note.id, url);
                        None
                    }
                    Ok(msg) => Some(msg),
                    Err(err) => {
                        tracing::debug!("unparseable frame from {}: {}", url, err);
                        None
                    }
                },
                _ => None,
            };

            match &event {
                WsEvent::Opened => self.on_open(&url),
                WsEvent::Closed | WsEvent::Error(_) => {
                    if let Some(relay) = self.relays.get_mut(&url) {
                        relay.auth = AuthState::None;
                        relay.auth_event = None;
                    }
                }
                WsEvent::Message(_) => {}
            }

            if let Some(msg) = &message {
                self.handle_message(&url, msg);
            }

            return Some(PoolEvent {
                relay: url,
                event,
                message,
            });
        }

        None
    }

    /// Subscriptions the relay already had go out again first, in the
    /// order they were opened. Then the queue, which only holds what was
    /// sent after they were.
    fn on_open(&mut self, url: &RelayUrl) {
        let queued = self.queue.take(url);
        let Some(relay) = self.relays.get_mut(url) else {
            return;
        };

        for (sub_id, sub) in self.subscriptions.iter_mut() {
            if !sub.targets.contains(url) || sub.closed.contains(url) {
                continue;
            }
            if sub.queued.remove(url) {
                continue;
            }
            tracing::debug!("resubscribing '{}' on {}", sub_id, url);
            relay
                .connection
                .send(&ClientMessage::req(sub_id.clone(), sub.filters.clone()));
        }

        if !queued.is_empty() {
            tracing::debug!("flushing {} queued requests to {}", queued.len(), url);
        }
        for msg in &queued {
            relay.connection.send(msg);
        }
    }

    fn handle_message(&mut self, url: &RelayUrl, msg: &RelayMessage) {
        match msg {
            RelayMessage::Event(_, note) => self.record_seen(url, note.id),
            RelayMessage::Eose(sub_id) | RelayMessage::Closed(sub_id, _) => {
                if let RelayMessage::Closed(_, reason) = msg {
                    tracing::warn!("relay {} closed subscription '{}': {}", url, sub_id, reason);
                }
                if let Some(sub) = self.subscriptions.get_mut(sub_id) {
                    sub.eose_deadlines.remove(url);
                }
            }
            RelayMessage::Notice(notice) => {
                tracing::warn!("NOTICE from {}: {}", url, notice);
            }
            RelayMessage::Auth(challenge) => self.handle_auth(url, challenge),
            RelayMessage::OK(result) => {
                let Some(relay) = self.relays.get_mut(url) else {
                    return;
                };
                if relay.auth_event != Some(result.event_id) {
                    return;
                }
                relay.auth_event = None;
                if result.status {
                    tracing::info!("authenticated to {}", url);
                    relay.auth = AuthState::Verified;
                } else {
                    tracing::warn!("auth rejected by {}: {}", url, result.message);
                    relay.auth = AuthState::None;
                }
            }
            RelayMessage::NegMsg(..) | RelayMessage::NegErr(..) => {}
        }
    }

    fn record_seen(&mut self, url: &RelayUrl, id: NoteId) {
        let relays = self.seen.entry(id).or_insert_with(|| {
            self.seen_order.push_back(id);
            HashSet::new()
        });
        if relays.insert(url.clone()) {
            *self.counts.entry(url.clone()).or_default() += 1;
        }

        while self.seen_order.len() > self.config.max_seen_notes {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn handle_auth(&mut self, url: &RelayUrl, challenge: &str) {
        let Some(relay) = self.relays.get_mut(url) else {
            return;
        };

        tracing::info!("received AUTH challenge from {}", url);
        match make_auth_request(self.keypair.as_ref(), url, challenge, &*self.signer) {
            Ok(note) => {
                relay.auth = AuthState::Pending;
                relay.auth_event = Some(note.id);
                relay.connection.send(&ClientMessage::auth(note));
            }
            Err(err) => {
                if err == AuthError::NoKey {
                    tracing::debug!("no account to answer AUTH from {}", url);
                } else {
                    tracing::warn!("can't answer AUTH from {}: {:?}", url, err);
                }
                relay.auth = AuthState::Error(err);
            }
        }
    }

    fn expire_eose(&mut self, now: Instant) {
        let mut expired = vec![];
        for (sub_id, sub) in self.subscriptions.iter_mut() {
            let due: Vec<RelayUrl> = sub
                .eose_deadlines
                .iter()
                .filter(|(_, deadline)| now >= **deadline)
                .map(|(url, _)| url.clone())
                .collect();

            for url in due {
                sub.eose_deadlines.remove(&url);
                expired.push((sub_id.clone(), url));
            }
        }

        for (sub_id, url) in expired {
            tracing::debug!("no EOSE from {} for '{}' in time", url, sub_id);
            if let Some(relay) = self.relays.get_mut(&url) {
                if relay.connection.is_connected() {
                    relay.connection.send(&ClientMessage::close(sub_id.clone()));
                    if let Some(sub) = self.subscriptions.get_mut(&sub_id) {
                        sub.closed.insert(url.clone());
                    }
                }
            }
            self.synthesize_eose(url, sub_id);
        }
    }

    fn synthesize_eose(&mut self, relay: RelayUrl, sub_id: String) {
        let text = serde_json::json!(["EOSE", sub_id]).to_string();
        self.synthesized.push_back(PoolEvent {
            relay,
            event: WsEvent::Message(WsMessage::Text(text)),
            message: Some(RelayMessage::eose(sub_id)),
        });
    }
}

fn targets(to: Option<&[RelayUrl]>, url: &RelayUrl) -> bool {
    to.map_or(true, |to| to.contains(url))
}

fn routes(descriptor: &RelayDescriptor, msg: &ClientMessage) -> bool {
    if msg.is_read() && !descriptor.read {
        return false;
    }
    if msg.is_write() && !descriptor.write {
        return false;
    }
    true
}
