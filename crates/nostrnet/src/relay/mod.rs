use serde::{Deserialize, Serialize};

mod auth;
mod connection;
pub mod message;
mod network;
pub mod pool;
mod queue;
mod url;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_utils;

pub use auth::{make_auth_request, AuthError, AuthState, AUTH_KIND};
pub use connection::RelayConnection;
pub use network::{NetworkMonitor, PathStatus};
pub use pool::{Delivery, PoolEvent, RelayPool};
pub use url::RelayUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RelayVariant {
    #[default]
    Regular,
    /// Added on demand (for example to reach a recipient's DM relays) and
    /// only used when named explicitly
    Ephemeral,
}

/// A relay the pool knows about and what we use it for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub url: RelayUrl,
    pub read: bool,
    pub write: bool,
    #[serde(default)]
    pub variant: RelayVariant,
}

impl RelayDescriptor {
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: true,
            variant: RelayVariant::Regular,
        }
    }

    pub fn read_only(url: RelayUrl) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn write_only(url: RelayUrl) -> Self {
        Self {
            read: false,
            ..Self::new(url)
        }
    }

    pub fn ephemeral(url: RelayUrl) -> Self {
        Self {
            variant: RelayVariant::Ephemeral,
            ..Self::new(url)
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.variant == RelayVariant::Ephemeral
    }
}
