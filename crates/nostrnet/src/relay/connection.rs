use std::fmt;
use std::time::{Duration, Instant};

use ewebsock::{WsEvent, WsMessage};

use crate::config::ConnectionConfig;
use crate::relay::websocket::{Connector, WebsocketConn};
use crate::relay::{RelayStatus, RelayUrl};
use crate::ClientMessage;

/// Socket errors that show up during normal teardown. They say nothing
/// about the health of the relay.
pub fn is_transient_error(err: &str) -> bool {
    const TRANSIENT: [&str; 6] = [
        "os error 57",
        "os error 107",
        "socket is not connected",
        "transport endpoint is not connected",
        "cancelled",
        "canceled",
    ];

    let err = err.to_ascii_lowercase();
    TRANSIENT.iter().any(|pat| err.contains(pat))
}

/// One websocket to one relay, plus its reconnect and keepalive state.
///
/// Only the connection's own handlers mutate these fields; the pool reads
/// them through accessors.
pub struct RelayConnection {
    url: RelayUrl,
    socket: Option<Box<dyn WebsocketConn>>,
    is_connected: bool,
    is_connecting: bool,
    disabled: bool,
    backoff: Duration,
    last_pong: Option<Instant>,
    last_ping: Option<Instant>,
    ping_sent_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    config: ConnectionConfig,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("status", &self.status())
            .field("backoff", &self.backoff)
            .field("reconnect_at", &self.reconnect_at)
            .finish()
    }
}

impl RelayConnection {
    pub fn new(url: RelayUrl, config: ConnectionConfig) -> Self {
        Self {
            url,
            socket: None,
            is_connected: false,
            is_connecting: false,
            disabled: false,
            backoff: config.initial_backoff,
            last_pong: None,
            last_ping: None,
            ping_sent_at: None,
            reconnect_at: None,
            config,
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn status(&self) -> RelayStatus {
        if self.disabled {
            RelayStatus::Disabled
        } else if self.is_connected {
            RelayStatus::Connected
        } else if self.is_connecting {
            RelayStatus::Connecting
        } else {
            RelayStatus::Disconnected
        }
    }

    /// Open the socket. A no-op while connecting or connected unless
    /// `force`, and always a no-op once disabled.
    pub fn connect(&mut self, connector: &dyn Connector, force: bool, now: Instant) {
        if self.disabled {
            tracing::debug!("not connecting to disabled relay {}", self.url);
            return;
        }

        if !force && (self.is_connected || self.is_connecting) {
            return;
        }

        self.drop_socket();
        self.reconnect_at = None;

        match connector.connect(&self.url) {
            Ok(socket) => {
                tracing::debug!("connecting to {}", self.url);
                self.socket = Some(socket);
                self.is_connecting = true;
            }
            Err(err) => {
                tracing::error!("error connecting to relay {}: {}", self.url, err);
                self.is_connecting = true;
                self.fail(now);
            }
        }
    }

    /// Explicit close. Nothing is rescheduled.
    pub fn disconnect(&mut self) {
        self.drop_socket();
        self.reconnect_at = None;
    }

    /// Stop talking to this relay for good
    pub fn disable_permanently(&mut self) {
        tracing::info!("permanently disabling relay {}", self.url);
        self.disabled = true;
        self.disconnect();
    }

    /// Forward a frame to the socket. Only succeeds while connected;
    /// queueing for later is the pool's job.
    pub fn send_raw(&mut self, text: String) -> bool {
        if !self.is_connected {
            return false;
        }

        let Some(socket) = self.socket.as_mut() else {
            return false;
        };

        socket.send(WsMessage::Text(text));
        true
    }

    pub fn send(&mut self, msg: &ClientMessage) -> bool {
        let json = match msg.to_json() {
            Ok(json) => {
                tracing::debug!("sending {} to {}", json, self.url);
                json
            }
            Err(e) => {
                tracing::error!("error serializing json for {}: {e}", self.url);
                return false;
            }
        };

        self.send_raw(json)
    }

    /// Send a websocket ping. Returns false when not connected or a ping is
    /// already outstanding.
    pub fn ping(&mut self, now: Instant) -> bool {
        if !self.is_connected || self.ping_sent_at.is_some() {
            return false;
        }

        let Some(socket) = self.socket.as_mut() else {
            return false;
        };

        tracing::trace!("pinging {}", self.url);
        socket.send(WsMessage::Ping(vec![]));
        self.last_ping = Some(now);
        self.ping_sent_at = Some(now);
        true
    }

    /// Pull the next transport event, updating connection state on the way.
    /// The event itself is returned untouched for the pool.
    pub fn try_recv(&mut self, now: Instant) -> Option<WsEvent> {
        let event = self.socket.as_mut()?.try_recv()?;

        match &event {
            WsEvent::Opened => self.on_open(now),
            WsEvent::Closed => {
                tracing::info!("relay {} closed the connection", self.url);
                self.fail(now);
            }
            WsEvent::Error(err) => {
                if is_transient_error(err) {
                    tracing::trace!("ignoring transient error from {}: {}", self.url, err);
                } else {
                    tracing::error!("relay {} error: {:?}", self.url, err);
                    self.fail(now);
                }
            }
            WsEvent::Message(WsMessage::Ping(bs)) => {
                if let Some(socket) = self.socket.as_mut() {
                    tracing::trace!("pong {}", self.url);
                    socket.send(WsMessage::Pong(bs.clone()));
                }
            }
            WsEvent::Message(WsMessage::Pong(_)) => {
                self.last_pong = Some(now);
                self.ping_sent_at = None;
            }
            WsEvent::Message(_) => {}
        }

        Some(event)
    }

    /// Run scheduled reconnects and keepalive pings
    pub fn tick(&mut self, connector: &dyn Connector, now: Instant) {
        if self.disabled {
            return;
        }

        if let Some(at) = self.reconnect_at {
            if now >= at {
                tracing::info!("reconnecting to {} after {:?}", self.url, self.backoff);
                self.connect(connector, true, now);
            }
            return;
        }

        if !self.is_connected {
            return;
        }

        if let Some(sent) = self.ping_sent_at {
            if now.saturating_duration_since(sent) >= self.config.pong_timeout {
                tracing::warn!("relay {} did not answer ping, reconnecting", self.url);
                self.fail(now);
            }
            return;
        }

        let should_ping = self
            .last_ping
            .map(|t| now.saturating_duration_since(t) >= self.config.ping_rate)
            .unwrap_or(true);
        if should_ping {
            self.ping(now);
        }
    }

    fn on_open(&mut self, now: Instant) {
        tracing::info!("connected to {}", self.url);
        self.is_connected = true;
        self.is_connecting = false;
        self.backoff = self.config.initial_backoff;
        self.reconnect_at = None;
        self.last_ping = Some(now);
        self.ping_sent_at = None;
    }

    /// Grow the backoff and, if we were up or on our way up, schedule a
    /// reconnect that far out.
    fn fail(&mut self, now: Instant) {
        let was_active = self.is_connected || self.is_connecting;

        self.backoff = self
            .backoff
            .saturating_mul(2)
            .min(self.config.max_backoff);
        self.drop_socket();

        if was_active && !self.disabled {
            tracing::debug!("scheduling reconnect to {} in {:?}", self.url, self.backoff);
            self.reconnect_at = Some(now + self.backoff);
        }
    }

    fn drop_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.is_connected = false;
        self.is_connecting = false;
        self.ping_sent_at = None;
    }
}
