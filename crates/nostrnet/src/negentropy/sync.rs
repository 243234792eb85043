//! Drives one NIP-77 session at a time against a single relay.
//!
//! The caller owns the pool and the local index; this only speaks the
//! protocol. Collect [`NegEvent`]s for the relay from the pool's event
//! stream and hand them to [`NegentropySync::process`]:
//!
//! ```ignore
//! let mut neg_events = Vec::new();
//! while let Some(ev) = pool.try_recv(now) {
//!     if ev.relay == *sync.relay() {
//!         neg_events.extend(NegEvent::from_pool_event(&ev));
//!     }
//! }
//! for outcome in sync.process(neg_events, &index, &mut pool, now) {
//!     support.record(sync.relay(), &outcome);
//! }
//! ```

use std::time::Instant;

use ewebsock::WsEvent;
use hashbrown::{HashMap, HashSet};

use super::{NegentropyConfig, NegentropyReconciler, NegentropyStorage};
use crate::relay::message::RelayMessage;
use crate::relay::{PoolEvent, RelayPool, RelayUrl};
use crate::{ClientMessage, Filter, LocalIndex, NoteId};

/// Maximum number of event IDs to request in a single REQ.
pub const FETCH_BATCH_SIZE: usize = 100;

#[derive(Debug, PartialEq, Eq)]
enum SyncState {
    Idle,
    Reconciling,
}

/// A negentropy-relevant event extracted from a relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegEvent {
    /// A NEG-MSG response from the relay.
    Msg { sub_id: String, payload: String },
    /// A NEG-ERR response from the relay.
    Err { sub_id: String, reason: String },
    /// EOSE or CLOSED for some subscription. Only matters when it is one
    /// of our id fetches.
    SubDone { sub_id: String },
    /// The relay (re)connected, which triggers an immediate sync.
    RelayOpened,
}

impl NegEvent {
    pub fn from_message(msg: &RelayMessage) -> Option<Self> {
        match msg {
            RelayMessage::NegMsg(sub_id, payload) => Some(NegEvent::Msg {
                sub_id: sub_id.clone(),
                payload: payload.clone(),
            }),
            RelayMessage::NegErr(sub_id, reason) => Some(NegEvent::Err {
                sub_id: sub_id.clone(),
                reason: reason.clone(),
            }),
            RelayMessage::Eose(sub_id) | RelayMessage::Closed(sub_id, _) => {
                Some(NegEvent::SubDone {
                    sub_id: sub_id.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn from_pool_event(ev: &PoolEvent) -> Option<Self> {
        match ev.event {
            WsEvent::Opened => Some(NegEvent::RelayOpened),
            _ => ev.message.as_ref().and_then(Self::from_message),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Sets reconciled. `need` has already been requested from the relay.
    Complete { have: Vec<NoteId>, need: Vec<NoteId> },
    /// The relay answered with NEG-ERR
    Unsupported(String),
    /// Either NEG-OPEN went unanswered or the session went quiet
    TimedOut { responded: bool },
    Failed(String),
}

/// Which relays are known to speak NIP-77
#[derive(Debug, Default, Clone)]
pub struct NegentropySupport {
    relays: HashMap<RelayUrl, bool>,
}

impl NegentropySupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until a session with the relay has finished one way or another
    pub fn is_supported(&self, relay: &RelayUrl) -> Option<bool> {
        self.relays.get(relay).copied()
    }

    pub fn mark(&mut self, relay: &RelayUrl, supported: bool) {
        self.relays.insert(relay.clone(), supported);
    }

    pub fn forget(&mut self, relay: &RelayUrl) {
        self.relays.remove(relay);
    }

    pub fn record(&mut self, relay: &RelayUrl, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Complete { .. } => self.mark(relay, true),
            SyncOutcome::Unsupported(_) | SyncOutcome::TimedOut { responded: false } => {
                self.mark(relay, false)
            }
            SyncOutcome::TimedOut { responded: true } | SyncOutcome::Failed(_) => {}
        }
    }
}

/// NIP-77 negentropy reconciliation state machine for one relay and filter.
///
/// Compares the local event set against the relay and fetches any missing
/// events. Missing events arrive as ordinary EVENT messages on the pool.
pub struct NegentropySync {
    relay: RelayUrl,
    filter: Filter,
    config: NegentropyConfig,
    state: SyncState,
    sub_id: Option<String>,
    neg: Option<NegentropyReconciler>,
    /// Whether a sync has been requested (startup, reconnect, or re-sync after fetch).
    sync_requested: bool,
    opened_at: Option<Instant>,
    last_activity: Option<Instant>,
    responded: bool,
    fetch_subs: HashSet<String>,
}

impl NegentropySync {
    pub fn new(relay: RelayUrl, filter: Filter, config: NegentropyConfig) -> Self {
        Self {
            relay,
            filter,
            config,
            state: SyncState::Idle,
            sub_id: None,
            neg: None,
            sync_requested: false,
            opened_at: None,
            last_activity: None,
            responded: false,
            fetch_subs: HashSet::new(),
        }
    }

    pub fn relay(&self) -> &RelayUrl {
        &self.relay
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn is_reconciling(&self) -> bool {
        self.state == SyncState::Reconciling
    }

    /// Subscription id of the running session
    pub fn sub_id(&self) -> Option<&str> {
        self.sub_id.as_deref()
    }

    /// Id fetches that haven't finished yet
    pub fn pending_fetches(&self) -> usize {
        self.fetch_subs.len()
    }

    /// Request a sync on the next `process()` call.
    pub fn trigger_now(&mut self) {
        self.sync_requested = true;
    }

    /// When `process` next needs to run for the timeout check
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != SyncState::Reconciling {
            return None;
        }
        if self.responded {
            self.last_activity.map(|t| t + self.config.inactivity_timeout)
        } else {
            self.opened_at.map(|t| t + self.config.first_response_timeout)
        }
    }

    /// Process collected relay events, enforce timeouts, and start a
    /// requested sync once the relay is connected and no session runs.
    pub fn process(
        &mut self,
        events: Vec<NegEvent>,
        index: &dyn LocalIndex,
        pool: &mut RelayPool,
        now: Instant,
    ) -> Vec<SyncOutcome> {
        let mut outcomes = vec![];

        for event in events {
            match event {
                NegEvent::RelayOpened => {
                    if self.state == SyncState::Reconciling {
                        tracing::debug!("negentropy: {} reconnected mid-session, restarting", self.relay);
                        self.reset();
                    }
                    self.fetch_subs.clear();
                    self.trigger_now();
                }
                NegEvent::Msg { sub_id, payload } => {
                    if self.sub_id.as_deref() != Some(&sub_id) {
                        continue;
                    }
                    outcomes.extend(self.handle_msg(&payload, pool, now));
                }
                NegEvent::Err { sub_id, reason } => {
                    if self.sub_id.as_deref() != Some(&sub_id) {
                        continue;
                    }
                    tracing::warn!("negentropy NEG-ERR from {}: {reason}", self.relay);
                    self.reset();
                    self.sync_requested = false;
                    outcomes.push(SyncOutcome::Unsupported(reason));
                }
                NegEvent::SubDone { sub_id } => {
                    if self.fetch_subs.remove(&sub_id) {
                        pool.send_to(&ClientMessage::close(sub_id), &self.relay);
                    }
                }
            }
        }

        if let Some(deadline) = self.next_deadline() {
            if now >= deadline {
                let responded = self.responded;
                tracing::warn!(
                    "negentropy: {} timed out {}",
                    self.relay,
                    if responded { "mid-session" } else { "waiting for first response" }
                );
                self.close_session(pool);
                self.reset();
                outcomes.push(SyncOutcome::TimedOut { responded });
            }
        }

        if self.sync_requested && self.state == SyncState::Idle && pool.is_connected(&self.relay) {
            self.sync_requested = false;
            match self.initiate(index, now) {
                Ok(open) => {
                    pool.send_to(&open, &self.relay);
                    tracing::info!("negentropy: initiated sync with {}", self.relay);
                }
                Err(err) => {
                    tracing::warn!("negentropy: could not start sync with {}: {err}", self.relay);
                    outcomes.push(SyncOutcome::Failed(err.to_string()));
                }
            }
        }

        outcomes
    }

    fn initiate(&mut self, index: &dyn LocalIndex, now: Instant) -> crate::Result<ClientMessage> {
        let storage = NegentropyStorage::from_index(index, std::slice::from_ref(&self.filter))?;
        tracing::debug!("negentropy: {} local items for {}", storage.len(), self.relay);

        let mut neg = NegentropyReconciler::new(storage, &self.config)?;
        let initial = neg.initiate_hex();
        let sub_id = uuid::Uuid::new_v4().to_string();

        self.neg = Some(neg);
        self.sub_id = Some(sub_id.clone());
        self.state = SyncState::Reconciling;
        self.opened_at = Some(now);
        self.last_activity = Some(now);
        self.responded = false;

        Ok(ClientMessage::NegOpen {
            sub_id,
            filter: self.filter.clone(),
            initial,
        })
    }

    fn handle_msg(&mut self, payload: &str, pool: &mut RelayPool, now: Instant) -> Option<SyncOutcome> {
        let (Some(neg), Some(sub_id)) = (self.neg.as_mut(), self.sub_id.clone()) else {
            tracing::warn!("negentropy: received msg with no active session");
            return None;
        };

        self.responded = true;
        self.last_activity = Some(now);

        match neg.reconcile_hex(payload) {
            Ok(Some(next)) => {
                pool.send_to(&ClientMessage::NegMsg { sub_id, payload: next }, &self.relay);
                None
            }
            Ok(None) => {
                let have = neg.have_ids().to_vec();
                let need = neg.need_ids().to_vec();

                self.close_session(pool);
                self.reset();

                if !need.is_empty() {
                    tracing::info!(
                        "negentropy: fetching {} missing events from {}",
                        need.len(),
                        self.relay
                    );
                    self.fetch_missing(&need, pool);
                }
                Some(SyncOutcome::Complete { have, need })
            }
            Err(e) => {
                tracing::warn!("negentropy reconcile with {}: {e}", self.relay);
                self.close_session(pool);
                self.reset();
                Some(SyncOutcome::Failed(e.to_string()))
            }
        }
    }

    fn close_session(&self, pool: &mut RelayPool) {
        if let Some(sub_id) = &self.sub_id {
            pool.send_to(
                &ClientMessage::NegClose {
                    sub_id: sub_id.clone(),
                },
                &self.relay,
            );
        }
    }

    fn reset(&mut self) {
        self.state = SyncState::Idle;
        self.sub_id = None;
        self.neg = None;
        self.opened_at = None;
        self.last_activity = None;
        self.responded = false;
    }

    fn fetch_missing(&mut self, ids: &[NoteId], pool: &mut RelayPool) {
        for chunk in ids.chunks(FETCH_BATCH_SIZE) {
            let sub_id = uuid::Uuid::new_v4().to_string();
            let filter = Filter::new().ids(chunk.iter().map(NoteId::bytes));
            pool.send_to(&ClientMessage::req(sub_id.clone(), vec![filter]), &self.relay);
            self.fetch_subs.insert(sub_id);
        }
    }
}
