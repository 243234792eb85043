#![cfg(test)]
//! Scripted sockets for driving the pool without a network

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use ewebsock::{WsEvent, WsMessage};

use crate::relay::websocket::{Connector, WebsocketConn};
use crate::relay::RelayUrl;
use crate::{Error, Result};

#[derive(Default)]
struct SocketState {
    inbox: VecDeque<WsEvent>,
    sent: Vec<WsMessage>,
    closed: bool,
}

/// A fake websocket. Clones share state, so a test keeps one handle while
/// the connection owns another.
#[derive(Clone, Default)]
pub struct MockSocket {
    state: Arc<Mutex<SocketState>>,
}

impl MockSocket {
    pub fn push(&self, ev: WsEvent) {
        self.state.lock().unwrap().inbox.push_back(ev);
    }

    pub fn open(&self) {
        self.push(WsEvent::Opened);
    }

    pub fn error(&self, err: &str) {
        self.push(WsEvent::Error(err.to_owned()));
    }

    pub fn text(&self, text: impl Into<String>) {
        self.push(WsEvent::Message(WsMessage::Text(text.into())));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|m| match m {
                WsMessage::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sent text frames parsed as json arrays
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent_text()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn pings_sent(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|m| matches!(m, WsMessage::Ping(_)))
            .count()
    }

    pub fn pongs_sent(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|m| match m {
                WsMessage::Pong(bs) => Some(bs.clone()),
                _ => None,
            })
            .collect()
    }
}

impl WebsocketConn for MockSocket {
    fn send(&mut self, msg: WsMessage) {
        self.state.lock().unwrap().sent.push(msg);
    }

    fn try_recv(&mut self) -> Option<WsEvent> {
        self.state.lock().unwrap().inbox.pop_front()
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
struct ConnectorState {
    sockets: HashMap<RelayUrl, Vec<MockSocket>>,
    refused: HashSet<RelayUrl>,
}

/// Hands out [`MockSocket`]s and remembers every one per relay
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Make future connects to `url` fail outright
    pub fn refuse(&self, url: &RelayUrl) {
        self.state.lock().unwrap().refused.insert(url.clone());
    }

    pub fn allow(&self, url: &RelayUrl) {
        self.state.lock().unwrap().refused.remove(url);
    }

    pub fn connect_count(&self, url: &RelayUrl) -> usize {
        self.state
            .lock()
            .unwrap()
            .sockets
            .get(url)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn socket(&self, url: &RelayUrl, nth: usize) -> MockSocket {
        self.state.lock().unwrap().sockets[url][nth].clone()
    }

    /// The most recently opened socket for `url`
    pub fn latest(&self, url: &RelayUrl) -> MockSocket {
        self.state.lock().unwrap().sockets[url]
            .last()
            .cloned()
            .unwrap()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &RelayUrl) -> Result<Box<dyn WebsocketConn>> {
        let mut state = self.state.lock().unwrap();
        if state.refused.contains(url) {
            return Err(Error::Generic("connection refused".into()));
        }

        let socket = MockSocket::default();
        state
            .sockets
            .entry(url.clone())
            .or_default()
            .push(socket.clone());
        Ok(Box::new(socket))
    }
}
