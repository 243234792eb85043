//! Subscriptions that merge a live relay feed with a local index scan.
//!
//! Each subscription gets one [`MergedStream`]. The local scan and the
//! relays feed it from different threads; a single mutex over its state
//! decides what gets emitted and when the combined EOSE fires.
//!
//! Until both sides are done, events are held back and deduplicated. When
//! the last side finishes the backlog goes out oldest first, followed by
//! one [`StreamItem::Eose`]. Later events stream through as they arrive,
//! deduplicated against the last [`LIVE_DEDUP_WINDOW`] ids.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::index::LocalIndex;
use crate::relay::message::RelayMessage;
use crate::relay::{PoolEvent, RelayPool, RelayUrl};
use crate::{Filter, Note, NoteId, Result, SubId};

/// Ids a stream remembers for deduplication once it is live
pub const LIVE_DEDUP_WINDOW: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(Box<Note>),
    /// Both the local index and every targeted relay are done with stored
    /// events. Sent exactly once.
    Eose,
}

#[derive(Default)]
struct StreamState {
    ndb_eose: bool,
    network_eose: bool,
    combined_sent: bool,
    latest_timestamp: Option<u64>,
    seen: HashSet<NoteId>,
    /// `seen` oldest first
    seen_order: VecDeque<NoteId>,
    backlog: Vec<Note>,
    relays: Vec<RelayUrl>,
    eosed: HashSet<RelayUrl>,
}

pub struct MergedStream {
    sub_id: SubId,
    filters: Vec<Filter>,
    state: Mutex<StreamState>,
    tx: UnboundedSender<StreamItem>,
}

impl MergedStream {
    /// A stream waiting on `relays` and a local scan. With no relays the
    /// network side counts as finished from the start.
    pub fn new(
        sub_id: SubId,
        filters: Vec<Filter>,
        relays: Vec<RelayUrl>,
    ) -> (Self, UnboundedReceiver<StreamItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StreamState {
            network_eose: relays.is_empty(),
            relays,
            ..Default::default()
        };

        (
            Self {
                sub_id,
                filters,
                state: Mutex::new(state),
                tx,
            },
            rx,
        )
    }

    pub fn sub_id(&self) -> &SubId {
        &self.sub_id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// True once the receiving side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_local_event(&self, note: &Note) {
        let mut state = self.state();
        self.push(&mut state, note.clone());
    }

    pub fn on_local_done(&self) {
        let mut state = self.state();
        if state.ndb_eose {
            return;
        }
        tracing::debug!("{}: local scan done", self.sub_id);
        state.ndb_eose = true;
        self.maybe_finish(&mut state);
    }

    pub fn on_network_event(&self, note: Note) {
        let mut state = self.state();
        self.push(&mut state, note);
    }

    /// `relay` sent (or was synthesized) an EOSE for this subscription
    pub fn on_relay_eose(&self, relay: &RelayUrl) {
        let mut state = self.state();
        if !state.relays.contains(relay) || !state.eosed.insert(relay.clone()) {
            return;
        }

        if !state.network_eose && state.eosed.len() == state.relays.len() {
            tracing::debug!("{}: all {} relays sent EOSE", self.sub_id, state.relays.len());
            state.network_eose = true;
            self.maybe_finish(&mut state);
        }
    }

    pub fn is_eose(&self) -> bool {
        self.state().combined_sent
    }

    pub fn latest_timestamp(&self) -> Option<u64> {
        self.state().latest_timestamp
    }

    /// The subscription's filters starting at the newest event seen so
    /// far, for resuming after a gap. `since` is inclusive so an event
    /// sharing the newest timestamp isn't lost.
    pub fn catch_up_filters(&self) -> Vec<Filter> {
        let latest = self.latest_timestamp();
        self.filters
            .iter()
            .cloned()
            .map(|f| match latest {
                Some(ts) => f.since(ts),
                None => f,
            })
            .collect()
    }

    fn push(&self, state: &mut StreamState, note: Note) {
        if !state.seen.insert(note.id) {
            return;
        }
        state.seen_order.push_back(note.id);
        if state.combined_sent {
            forget_oldest(state);
        }

        state.latest_timestamp = Some(
            state
                .latest_timestamp
                .map_or(note.created_at, |ts| ts.max(note.created_at)),
        );

        if state.combined_sent {
            self.emit(StreamItem::Event(Box::new(note)));
        } else {
            state.backlog.push(note);
        }
    }

    fn maybe_finish(&self, state: &mut StreamState) {
        if state.combined_sent || !state.ndb_eose || !state.network_eose {
            return;
        }

        state.combined_sent = true;
        forget_oldest(state);
        let mut backlog = std::mem::take(&mut state.backlog);
        backlog.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        tracing::debug!("{}: EOSE after {} stored events", self.sub_id, backlog.len());
        for note in backlog {
            self.emit(StreamItem::Event(Box::new(note)));
        }
        self.emit(StreamItem::Eose);
    }

    fn emit(&self, item: StreamItem) {
        // a dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(item);
    }
}

fn forget_oldest(state: &mut StreamState) {
    while state.seen_order.len() > LIVE_DEDUP_WINDOW {
        if let Some(id) = state.seen_order.pop_front() {
            state.seen.remove(&id);
        }
    }
}

/// Feed a stream's local side from `index`
pub fn run_local_scan(index: &dyn LocalIndex, stream: &MergedStream) -> Result<()> {
    let res = index.scan(stream.filters(), &mut |note| {
        stream.on_local_event(note);
        !stream.is_closed()
    });
    stream.on_local_done();
    res
}

/// Live merged streams by wire subscription id
#[derive(Default)]
pub struct SubscriptionManager {
    streams: HashMap<String, Arc<MergedStream>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, sub_id: &str) -> Option<&Arc<MergedStream>> {
        self.streams.get(sub_id)
    }

    /// Open `filters` on the pool and register a merged stream for it. The
    /// caller still has to run the local side, see [`run_local_scan`].
    pub fn subscribe(
        &mut self,
        sub_id: SubId,
        filters: Vec<Filter>,
        to: Option<&[RelayUrl]>,
        eose_timeout: Option<Duration>,
        pool: &mut RelayPool,
        now: Instant,
    ) -> (Arc<MergedStream>, UnboundedReceiver<StreamItem>) {
        let relays = pool.subscribe(
            sub_id.as_str().to_owned(),
            filters.clone(),
            to,
            eose_timeout,
            now,
        );

        let (stream, rx) = MergedStream::new(sub_id, filters, relays);
        let stream = Arc::new(stream);
        self.streams
            .insert(stream.sub_id().as_str().to_owned(), stream.clone());
        (stream, rx)
    }

    pub fn unsubscribe(&mut self, sub_id: &str, pool: &mut RelayPool) -> bool {
        pool.unsubscribe(sub_id);
        self.streams.remove(sub_id).is_some()
    }

    /// Route relay traffic to the stream it belongs to. Returns the note
    /// when the event was for one of our subscriptions.
    pub fn handle_pool_event<'a>(&self, ev: &'a PoolEvent) -> Option<&'a Note> {
        let msg = ev.message.as_ref()?;
        let stream = self.streams.get(msg.sub_id()?)?;

        match msg {
            RelayMessage::Event(_, note) => {
                stream.on_network_event((**note).clone());
                return Some(&**note);
            }
            RelayMessage::Eose(_) | RelayMessage::Closed(..) => stream.on_relay_eose(&ev.relay),
            _ => {}
        }

        None
    }

    /// Close subscriptions nobody reads anymore
    pub fn prune_closed(&mut self, pool: &mut RelayPool) {
        let closed: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for sub_id in closed {
            tracing::debug!("stream for '{}' dropped, unsubscribing", sub_id);
            self.unsubscribe(&sub_id, pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::index::MemoryIndex;
    use crate::relay::test_utils::MockConnector;
    use crate::relay::RelayDescriptor;
    use crate::Pubkey;
    use pretty_assertions::assert_eq;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn note(id: u8, created_at: u64) -> Note {
        Note {
            id: NoteId::new([id; 32]),
            pubkey: Pubkey::new([1; 32]),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<StreamItem>) -> Vec<StreamItem> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn ev(n: &Note) -> StreamItem {
        StreamItem::Event(Box::new(n.clone()))
    }

    #[test]
    fn combined_eose_local_first() {
        let (a, b) = (url("wss://a.io"), url("wss://b.io"));
        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], vec![a.clone(), b.clone()]);

        stream.on_local_event(&note(1, 30));
        stream.on_local_done();
        stream.on_network_event(note(2, 10));
        stream.on_relay_eose(&a);
        assert!(drain(&mut rx).is_empty());

        stream.on_network_event(note(1, 30));
        stream.on_relay_eose(&b);
        assert_eq!(
            drain(&mut rx),
            vec![ev(&note(2, 10)), ev(&note(1, 30)), StreamItem::Eose]
        );
        assert!(stream.is_eose());

        // late and repeated signals change nothing
        stream.on_relay_eose(&b);
        stream.on_local_done();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn combined_eose_network_first() {
        let a = url("wss://a.io");
        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], vec![a.clone()]);

        stream.on_network_event(note(3, 5));
        stream.on_relay_eose(&a);
        assert!(drain(&mut rx).is_empty());

        stream.on_local_event(&note(4, 1));
        stream.on_local_done();
        assert_eq!(
            drain(&mut rx),
            vec![ev(&note(4, 1)), ev(&note(3, 5)), StreamItem::Eose]
        );
    }

    #[test]
    fn live_events_after_eose_are_deduplicated() {
        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], vec![]);
        stream.on_local_event(&note(1, 1));
        stream.on_local_done();
        assert_eq!(drain(&mut rx), vec![ev(&note(1, 1)), StreamItem::Eose]);

        stream.on_network_event(note(1, 1));
        stream.on_network_event(note(2, 9));
        stream.on_network_event(note(2, 9));
        assert_eq!(drain(&mut rx), vec![ev(&note(2, 9))]);
    }

    #[test]
    fn eose_from_untargeted_relay_is_ignored() {
        let a = url("wss://a.io");
        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], vec![a]);
        stream.on_local_done();
        stream.on_relay_eose(&url("wss://other.io"));
        assert!(drain(&mut rx).is_empty());
        assert!(!stream.is_eose());
    }

    #[test]
    fn catch_up_uses_latest_timestamp_inclusive() {
        let filters = vec![Filter::new().kinds([1]), Filter::new().kinds([7]).since(3)];
        let (stream, _rx) = MergedStream::new(SubId::new("t"), filters, vec![]);
        assert_eq!(stream.catch_up_filters(), stream.filters().to_vec());

        stream.on_local_event(&note(1, 50));
        stream.on_network_event(note(2, 80));
        stream.on_network_event(note(3, 60));
        assert_eq!(stream.latest_timestamp(), Some(80));
        assert_eq!(
            stream.catch_up_filters(),
            vec![Filter::new().kinds([1]).since(80), Filter::new().kinds([7]).since(80)]
        );
    }

    #[test]
    fn concurrent_sides_fire_eose_once() {
        for _ in 0..50 {
            let relays: Vec<RelayUrl> = (0..4).map(|i| url(&format!("wss://r{i}.io"))).collect();
            let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], relays.clone());
            let stream = Arc::new(stream);

            let local = {
                let stream = stream.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        stream.on_local_event(&note(i, i as u64));
                    }
                    stream.on_local_done();
                })
            };
            let network: Vec<_> = relays
                .into_iter()
                .map(|relay| {
                    let stream = stream.clone();
                    std::thread::spawn(move || {
                        for i in 10..30 {
                            stream.on_network_event(note(i, i as u64));
                        }
                        stream.on_relay_eose(&relay);
                    })
                })
                .collect();

            local.join().unwrap();
            network.into_iter().for_each(|h| h.join().unwrap());

            let items = drain(&mut rx);
            assert_eq!(items.iter().filter(|i| **i == StreamItem::Eose).count(), 1);
            assert_eq!(items.len(), 31);
            assert_eq!(items.last(), Some(&StreamItem::Eose));
        }
    }

    #[test]
    fn run_local_scan_feeds_local_side() {
        let index = MemoryIndex::new();
        index.insert(&note(1, 10)).unwrap();
        index.insert(&note(2, 20)).unwrap();

        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![Filter::new().kinds([1])], vec![]);
        run_local_scan(&index, &stream).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![ev(&note(1, 10)), ev(&note(2, 20)), StreamItem::Eose]
        );
    }

    #[test]
    fn live_dedup_only_remembers_recent_ids() {
        let (stream, mut rx) = MergedStream::new(SubId::new("t"), vec![], vec![]);
        stream.on_local_done();
        assert_eq!(drain(&mut rx), vec![StreamItem::Eose]);

        let live: Vec<Note> = (0..=LIVE_DEDUP_WINDOW as u16)
            .map(|i| {
                let mut id = [0u8; 32];
                id[..2].copy_from_slice(&i.to_be_bytes());
                Note {
                    id: NoteId::new(id),
                    ..note(0, u64::from(i))
                }
            })
            .collect();
        for n in &live {
            stream.on_network_event(n.clone());
        }
        assert_eq!(drain(&mut rx).len(), live.len());

        // the newest is still known, the oldest has aged out
        stream.on_network_event(live[LIVE_DEDUP_WINDOW].clone());
        assert!(drain(&mut rx).is_empty());
        stream.on_network_event(live[0].clone());
        assert_eq!(drain(&mut rx), vec![ev(&live[0])]);
    }

    #[test]
    fn manager_routes_pool_traffic() {
        let connector = MockConnector::default();
        let mut pool = RelayPool::new(Box::new(connector.clone()), PoolConfig::default());
        let relay = url("wss://a.io");
        pool.add_relay(RelayDescriptor::new(relay.clone())).unwrap();
        let now = Instant::now();
        pool.connect(now);
        connector.latest(&relay).open();
        while pool.try_recv(now).is_some() {}

        let mut subs = SubscriptionManager::new();
        let sub_id = SubId::from_string("sub1", "test");
        let (stream, mut rx) = subs.subscribe(sub_id, vec![], None, None, &mut pool, now);
        stream.on_local_done();

        let n = crate::NoteBuilder::new(1)
            .content("hi")
            .sign(crate::FullKeypair::generate().to_filled(), &crate::SchnorrSigner)
            .unwrap();
        let socket = connector.latest(&relay);
        socket.text(format!(r#"["EVENT","sub1",{}]"#, n.json().unwrap()));
        socket.text(r#"["EVENT","other",{}]"#.to_string());
        socket.text(r#"["EOSE","sub1"]"#);

        let mut routed = 0;
        while let Some(ev) = pool.try_recv(now) {
            if subs.handle_pool_event(&ev).is_some() {
                routed += 1;
            }
        }
        assert_eq!(routed, 1);
        assert_eq!(drain(&mut rx), vec![ev(&n), StreamItem::Eose]);

        drop(rx);
        subs.prune_closed(&mut pool);
        assert!(subs.is_empty());
        assert_eq!(socket.sent_json().last().unwrap()[0], "CLOSE");
    }
}
