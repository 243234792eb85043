use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::relay::RelayUrl;
use crate::ClientMessage;

/// Requests waiting for a relay that isn't connected yet, flushed in order
/// as soon as it opens.
#[derive(Debug)]
pub struct RequestQueue {
    queues: HashMap<RelayUrl, VecDeque<ClientMessage>>,
    max_per_relay: usize,
}

impl RequestQueue {
    pub fn new(max_per_relay: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_relay,
        }
    }

    /// Returns false if the relay's queue is full and `msg` was dropped
    pub fn push(&mut self, relay: &RelayUrl, msg: ClientMessage) -> bool {
        let queue = self.queues.entry(relay.clone()).or_default();
        if queue.len() >= self.max_per_relay {
            tracing::warn!(
                "request queue for {} is full ({}), dropping message",
                relay,
                self.max_per_relay
            );
            return false;
        }

        queue.push_back(msg);
        true
    }

    pub fn take(&mut self, relay: &RelayUrl) -> VecDeque<ClientMessage> {
        self.queues.remove(relay).unwrap_or_default()
    }

    pub fn len(&self, relay: &RelayUrl) -> usize {
        self.queues.get(relay).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, relay: &RelayUrl) -> bool {
        self.len(relay) == 0
    }

    pub fn remove(&mut self, relay: &RelayUrl) {
        self.queues.remove(relay);
    }

    /// Drop the queued messages for `relay` that `keep` rejects
    pub fn retain(&mut self, relay: &RelayUrl, keep: impl FnMut(&ClientMessage) -> bool) {
        if let Some(queue) = self.queues.get_mut(relay) {
            queue.retain(keep);
        }
    }
}
