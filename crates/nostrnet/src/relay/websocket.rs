use crate::relay::RelayUrl;
use crate::Result;

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use std::fmt;

/// Something to poke when a socket has data, so the driver loop wakes up
/// and drains it.
pub trait Wakeup: Send + Sync + Clone + 'static {
    fn wake(&self);
}

impl<F> Wakeup for F
where
    F: Fn() + Send + Sync + Clone + 'static,
{
    fn wake(&self) {
        self()
    }
}

/// One open (or opening) websocket
pub trait WebsocketConn: Send {
    fn send(&mut self, msg: WsMessage);

    fn try_recv(&mut self) -> Option<WsEvent>;

    fn close(&mut self);
}

/// Opens websockets. The pool only ever talks to sockets through this, so
/// tests can hand it scripted ones.
pub trait Connector: Send {
    fn connect(&self, url: &RelayUrl) -> Result<Box<dyn WebsocketConn>>;
}

pub struct EwebsockConn {
    url: RelayUrl,
    sender: WsSender,
    receiver: WsReceiver,
}

impl fmt::Debug for EwebsockConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EwebsockConn")
            .field("url", &self.url)
            .finish()
    }
}

impl WebsocketConn for EwebsockConn {
    fn send(&mut self, msg: WsMessage) {
        self.sender.send(msg);
    }

    fn try_recv(&mut self) -> Option<WsEvent> {
        self.receiver.try_recv()
    }

    fn close(&mut self) {
        tracing::debug!("closing websocket to {}", self.url);
        self.sender.close();
    }
}

/// Production connector backed by ewebsock
#[derive(Clone)]
pub struct EwebsockConnector<W> {
    wakeup: W,
}

impl<W: Wakeup> EwebsockConnector<W> {
    pub fn new(wakeup: W) -> Self {
        Self { wakeup }
    }
}

impl<W: Wakeup> Connector for EwebsockConnector<W> {
    fn connect(&self, url: &RelayUrl) -> Result<Box<dyn WebsocketConn>> {
        let wakeup = self.wakeup.clone();
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.connect_str(), Options::default(), move || {
                wakeup.wake()
            })?;

        Ok(Box::new(EwebsockConn {
            url: url.clone(),
            sender,
            receiver,
        }))
    }
}
