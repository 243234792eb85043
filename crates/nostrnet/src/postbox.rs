//! Outgoing event delivery.
//!
//! Every posted event keeps one [`Relayer`] per relay it still expects an
//! `OK` from. Relayers are retried with a growing delay until the relay
//! answers; an answer of any kind (accepted, rejected, duplicate) retires
//! the relayer. The event is forgotten once nothing remains.
//!
//! Per relay, events go out in the order they were posted. When a relay
//! is down, anything it was already sent on the old socket is queued again
//! ahead of the new event, so the pool's FIFO replays the whole backlog in
//! posting order when the relay comes back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use thiserror::Error;

use crate::config::PostBoxConfig;
use crate::relay::message::CommandResult;
use crate::relay::{Delivery, RelayPool, RelayUrl};
use crate::waiter::WaiterMap;
use crate::{ClientMessage, Note, NoteId};

pub type FlushCallback = dyn FnMut(&RelayUrl, &CommandResult) + Send;

/// Completion notification for a posted event
pub enum OnFlush {
    /// Called once, on the relay answer that leaves nothing remaining
    Once(Box<dyn FnOnce(&RelayUrl, &CommandResult) + Send>),
    /// Called for every relay answer
    All(Box<FlushCallback>),
}

impl OnFlush {
    pub fn once(f: impl FnOnce(&RelayUrl, &CommandResult) + Send + 'static) -> Self {
        OnFlush::Once(Box::new(f))
    }

    pub fn all(f: impl FnMut(&RelayUrl, &CommandResult) + Send + 'static) -> Self {
        OnFlush::All(Box::new(f))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CancelSendError {
    #[error("event is not delayed or was already sent")]
    NotDelayed,
    #[error("no pending event with that id")]
    NothingToCancel,
}

/// Delivery state of one event towards one relay
#[derive(Debug, Clone, PartialEq)]
pub struct Relayer {
    pub relay: RelayUrl,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub retry_after: Duration,
    /// Sitting in the pool's queue for a relay that isn't up yet
    pub queued: bool,
    /// False once the pool refused to route to this relay
    routable: bool,
}

impl Relayer {
    fn new(relay: RelayUrl, config: &PostBoxConfig) -> Self {
        Self {
            relay,
            attempts: 0,
            last_attempt: None,
            retry_after: config.initial_retry_after,
            queued: false,
            routable: true,
        }
    }

    fn record_attempt(&mut self, now: Instant, config: &PostBoxConfig) {
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.retry_after = self
            .retry_after
            .mul_f64(config.retry_multiplier)
            .min(config.max_retry_after);
    }

    fn retry_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.retry_after,
        }
    }
}

pub struct PostedEvent {
    pub note: Note,
    pub remaining: Vec<Relayer>,
    on_flush: Option<OnFlush>,
    delay_until: Option<Instant>,
    transmitted: bool,
}

impl PostedEvent {
    pub fn is_delayed(&self) -> bool {
        self.delay_until.is_some()
    }
}

pub struct PostBox {
    events: IndexMap<NoteId, PostedEvent>,
    ok_waiters: Arc<WaiterMap<NoteId, CommandResult>>,
    config: PostBoxConfig,
}

impl Default for PostBox {
    fn default() -> Self {
        PostBox::new(PostBoxConfig::default())
    }
}

impl PostBox {
    pub fn new(config: PostBoxConfig) -> Self {
        Self {
            events: IndexMap::new(),
            ok_waiters: Arc::new(WaiterMap::new()),
            config,
        }
    }

    /// Waiters resolved with the first `OK` for an event
    pub fn ok_waiters(&self) -> &Arc<WaiterMap<NoteId, CommandResult>> {
        &self.ok_waiters
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_pending(&self, id: &NoteId) -> bool {
        self.events.contains_key(id)
    }

    pub fn event(&self, id: &NoteId) -> Option<&PostedEvent> {
        self.events.get(id)
    }

    pub fn relayer(&self, id: &NoteId, relay: &RelayUrl) -> Option<&Relayer> {
        self.events
            .get(id)?
            .remaining
            .iter()
            .find(|r| r.relay == *relay)
    }

    /// Post `note` to `to`, or to every regular write relay when `to` is
    /// `None`. Returns false, posting nothing, when the event is already
    /// pending or has no relay to go to.
    pub fn send(
        &mut self,
        note: Note,
        to: Option<Vec<RelayUrl>>,
        delay: Option<Duration>,
        on_flush: Option<OnFlush>,
        pool: &mut RelayPool,
        now: Instant,
    ) -> bool {
        if self.events.contains_key(&note.id) {
            tracing::debug!("event {} already pending, not sending again", note.id);
            return false;
        }

        let relays = to.unwrap_or_else(|| {
            pool.descriptors()
                .filter(|d| d.write && !d.is_ephemeral())
                .map(|d| d.url.clone())
                .collect()
        });

        if relays.is_empty() {
            tracing::debug!("no relays to send {} to", note.id);
            return false;
        }

        let id = note.id;
        let remaining = relays
            .into_iter()
            .map(|relay| Relayer::new(relay, &self.config))
            .collect();

        self.events.insert(
            id,
            PostedEvent {
                note,
                remaining,
                on_flush,
                delay_until: delay.map(|d| now + d),
                transmitted: false,
            },
        );

        if delay.is_none() {
            self.flush_event(&id, pool, now);
        }

        self.events.contains_key(&id)
    }

    /// Drop a delayed event before it goes out
    pub fn cancel_send(&mut self, id: &NoteId) -> Result<(), CancelSendError> {
        let Some(ev) = self.events.get(id) else {
            return Err(CancelSendError::NothingToCancel);
        };

        if !ev.is_delayed() || ev.transmitted {
            return Err(CancelSendError::NotDelayed);
        }

        tracing::info!("canceled delayed send of {}", id);
        self.events.shift_remove(id);
        Ok(())
    }

    /// A relay answered `OK` for one of our events
    pub fn handle_ok(&mut self, relay: &RelayUrl, result: &CommandResult) {
        let id = result.event_id;
        let Some(ev) = self.events.get_mut(&id) else {
            return;
        };
        let Some(pos) = ev.remaining.iter().position(|r| r.relay == *relay) else {
            return;
        };
        ev.remaining.remove(pos);

        if result.status || result.is_duplicate() {
            tracing::debug!("{} accepted {}", relay, id);
        } else {
            tracing::warn!("{} rejected {}: {}", relay, id, result.message);
        }

        self.ok_waiters.resolve(&id, result.clone());

        let done = ev.remaining.is_empty();
        match ev.on_flush.take() {
            Some(OnFlush::All(mut cb)) => {
                cb(relay, result);
                ev.on_flush = Some(OnFlush::All(cb));
            }
            Some(OnFlush::Once(cb)) if done => cb(relay, result),
            other => ev.on_flush = other,
        }

        if done {
            self.events.shift_remove(&id);
        }
    }

    /// Transmit delayed events that are due and retry relayers that have
    /// waited long enough on a connected relay.
    pub fn try_flushing_events(&mut self, pool: &mut RelayPool, now: Instant) {
        let due: Vec<NoteId> = self
            .events
            .iter()
            .filter(|(_, ev)| ev.delay_until.is_some_and(|at| now >= at))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.flush_event(&id, pool, now);
        }

        for ev in self.events.values_mut() {
            if !ev.transmitted {
                continue;
            }
            for relayer in ev.remaining.iter_mut() {
                if !pool.has(&relayer.relay) {
                    // removed from the pool while we waited on it
                    relayer.routable = false;
                    continue;
                }
                if !pool.is_connected(&relayer.relay) || !relayer.retry_due(now) {
                    continue;
                }
                tracing::debug!(
                    "retrying {} to {} (attempt {})",
                    ev.note.id,
                    relayer.relay,
                    relayer.attempts + 1
                );
                transmit(&ev.note, relayer, pool, now, &self.config);
            }
        }
        self.retire_unroutable();
    }

    /// `relay` just opened. Everything still waiting on it goes out again
    /// in the order it was posted.
    pub fn relay_connected(&mut self, relay: &RelayUrl, pool: &mut RelayPool, now: Instant) {
        for ev in self.events.values_mut() {
            if !ev.transmitted {
                continue;
            }
            let Some(relayer) = ev.remaining.iter_mut().find(|r| r.relay == *relay) else {
                continue;
            };

            if relayer.queued {
                // the pool already flushed it
                relayer.queued = false;
                relayer.last_attempt = Some(now);
                continue;
            }

            transmit(&ev.note, relayer, pool, now, &self.config);
        }
        self.retire_unroutable();
    }

    /// Earliest instant `try_flushing_events` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.events
            .values()
            .flat_map(|ev| {
                let retries = ev
                    .remaining
                    .iter()
                    .filter_map(|r| r.last_attempt.map(|at| at + r.retry_after));
                ev.delay_until.into_iter().chain(retries)
            })
            .min()
    }

    fn flush_event(&mut self, id: &NoteId, pool: &mut RelayPool, now: Instant) {
        let Some(ev) = self.events.get_mut(id) else {
            return;
        };

        ev.delay_until = None;
        ev.transmitted = true;
        let relays: Vec<RelayUrl> = ev.remaining.iter().map(|r| r.relay.clone()).collect();

        for relay in relays {
            if !pool.is_connected(&relay) {
                self.requeue_sent(&relay, pool, now);
            }
            let Some(ev) = self.events.get_mut(id) else {
                return;
            };
            if let Some(relayer) = ev.remaining.iter_mut().find(|r| r.relay == relay) {
                transmit(&ev.note, relayer, pool, now, &self.config);
            }
        }
        self.retire_unroutable();
    }

    /// `relay` is down. Whatever already went out to it on a previous
    /// socket and is still unanswered gets queued again, oldest first, so
    /// it stays ahead of anything posted after it.
    fn requeue_sent(&mut self, relay: &RelayUrl, pool: &mut RelayPool, now: Instant) {
        for ev in self.events.values_mut() {
            if !ev.transmitted {
                continue;
            }
            let Some(relayer) = ev.remaining.iter_mut().find(|r| r.relay == *relay) else {
                continue;
            };
            if relayer.queued || relayer.last_attempt.is_none() {
                continue;
            }
            transmit(&ev.note, relayer, pool, now, &self.config);
        }
    }

    /// Forget relayers the pool won't route to, and events left with none
    fn retire_unroutable(&mut self) {
        self.events.retain(|id, ev| {
            ev.remaining.retain(|r| {
                if r.routable {
                    return true;
                }
                tracing::warn!("{} can't be sent to {}, giving up on it", id, r.relay);
                false
            });
            if ev.remaining.is_empty() {
                tracing::warn!("no relay left to send {} to, dropping it", id);
                return false;
            }
            true
        });
    }
}

fn transmit(
    note: &Note,
    relayer: &mut Relayer,
    pool: &mut RelayPool,
    now: Instant,
    config: &PostBoxConfig,
) {
    let delivery = pool.send_to(&ClientMessage::event(note.clone()), &relayer.relay);
    relayer.queued = delivery == Delivery::Queued;
    if delivery == Delivery::Skipped {
        relayer.routable = false;
        return;
    }
    relayer.record_attempt(now, config);
}
