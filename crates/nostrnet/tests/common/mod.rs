//! A scripted relay transport for driving the public API without a network
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostrnet::ewebsock::{WsEvent, WsMessage};
use nostrnet::{Connector, Error, RelayUrl, WebsocketConn};
use serde_json::Value;

#[derive(Default)]
struct SocketState {
    inbox: VecDeque<WsEvent>,
    sent: Vec<String>,
    read_pos: usize,
    closed: bool,
}

/// The relay's end of one websocket
#[derive(Clone, Default)]
pub struct FakeSocket {
    state: Arc<Mutex<SocketState>>,
}

impl FakeSocket {
    pub fn open(&self) {
        self.state.lock().unwrap().inbox.push_back(WsEvent::Opened);
    }

    pub fn drop_connection(&self) {
        self.state
            .lock()
            .unwrap()
            .inbox
            .push_back(WsEvent::Error("Connection reset by peer".to_owned()));
    }

    pub fn reply(&self, msg: Value) {
        self.state
            .lock()
            .unwrap()
            .inbox
            .push_back(WsEvent::Message(WsMessage::Text(msg.to_string())));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn sent(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<Value> {
        self.sent().into_iter().filter(|v| v[0] == kind).collect()
    }

    /// The next not yet seen frame of type `kind`, waiting up to 2s
    pub async fn expect(&self, kind: &str) -> Value {
        self.expect_any(&[kind]).await
    }

    pub async fn expect_any(&self, kinds: &[&str]) -> Value {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(v) = self.take_next(kinds) {
                    return v;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;

        match found {
            Ok(v) => v,
            Err(_) => panic!("relay never received any of {kinds:?}"),
        }
    }

    fn take_next(&self, kinds: &[&str]) -> Option<Value> {
        let mut state = self.state.lock().unwrap();
        let start = state.read_pos;
        for i in start..state.sent.len() {
            let v: Value = serde_json::from_str(&state.sent[i]).unwrap();
            if kinds.iter().any(|k| v[0] == *k) {
                state.read_pos = i + 1;
                return Some(v);
            }
        }
        None
    }
}

impl WebsocketConn for FakeSocket {
    fn send(&mut self, msg: WsMessage) {
        if let WsMessage::Text(text) = msg {
            self.state.lock().unwrap().sent.push(text);
        }
    }

    fn try_recv(&mut self) -> Option<WsEvent> {
        self.state.lock().unwrap().inbox.pop_front()
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    sockets: Arc<Mutex<HashMap<RelayUrl, Vec<FakeSocket>>>>,
}

impl FakeConnector {
    pub fn connects(&self, url: &RelayUrl) -> usize {
        self.sockets
            .lock()
            .unwrap()
            .get(url)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// The socket of the most recent connection to `url`
    pub fn socket(&self, url: &RelayUrl) -> FakeSocket {
        self.sockets.lock().unwrap()[url].last().cloned().unwrap()
    }

    /// Wait for the `nth` connection attempt to `url`
    pub async fn nth_socket(&self, url: &RelayUrl, nth: usize) -> FakeSocket {
        let res = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(s) = self
                    .sockets
                    .lock()
                    .unwrap()
                    .get(url)
                    .and_then(|s| s.get(nth))
                {
                    return s.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        match res {
            Ok(s) => s,
            Err(_) => panic!("connection #{nth} to {url} never happened"),
        }
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &RelayUrl) -> Result<Box<dyn WebsocketConn>, Error> {
        let socket = FakeSocket::default();
        self.sockets
            .lock()
            .unwrap()
            .entry(url.clone())
            .or_default()
            .push(socket.clone());
        Ok(Box::new(socket))
    }
}

pub fn url(s: &str) -> RelayUrl {
    RelayUrl::parse(s).unwrap()
}
