mod client;
mod config;
mod error;
mod filter;
mod index;
mod keypair;
pub mod negentropy;
pub mod nip17;
mod note;
mod postbox;
mod pubkey;
mod relay;
mod service;
mod signer;
mod subid;
mod subscription;
mod waiter;

pub use client::{ClientMessage, EventClientMessage};
pub use config::{ConnectionConfig, PoolConfig, PostBoxConfig, ServiceConfig};
pub use error::Error;
pub use ewebsock;
pub use filter::Filter;
pub use index::{LocalIndex, MemoryIndex};
pub use keypair::{FilledKeypair, FullKeypair, Keypair};
pub use negentropy::{NegentropyConfig, NegentropyError};
pub use nostr::SecretKey;
pub use note::{unix_now, Note, NoteBuilder, NoteId, UnsignedNote};
pub use postbox::{CancelSendError, OnFlush, PostBox, PostedEvent, Relayer};
pub use pubkey::Pubkey;
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::websocket::{Connector, EwebsockConnector, Wakeup, WebsocketConn};
pub use relay::{
    make_auth_request, AuthError, AuthState, Delivery, NetworkMonitor, PathStatus, PoolEvent,
    RelayConnection, RelayDescriptor, RelayPool, RelayStatus, RelayUrl, RelayVariant, AUTH_KIND,
};
pub use service::{RelayHandle, RelayService, Subscription};
pub use signer::{NoteSigner, SchnorrSigner};
pub use subid::SubId;
pub use subscription::{
    run_local_scan, MergedStream, StreamItem, SubscriptionManager, LIVE_DEDUP_WINDOW,
};
pub use waiter::{Waiter, WaiterMap};

pub type Result<T> = std::result::Result<T, error::Error>;
