use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use url::Url;

use crate::Error;

/// A websocket relay address.
///
/// Two urls are the same relay when scheme, host, port and path agree
/// after collapsing a single trailing slash, so `wss://r.io` and
/// `wss://r.io/` share a socket while `wss://r.io/v1` and `wss://r.io/v2`
/// do not. The `url` crate lowercases scheme and host and elides default
/// ports before the key is built.
#[derive(Clone)]
pub struct RelayUrl {
    url: Url,
    key: String,
}

impl RelayUrl {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let url = Url::parse(s.trim()).map_err(|e| Error::InvalidRelayUrl(format!("{s}: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidRelayUrl(format!(
                "{s}: unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let Some(host) = url.host_str() else {
            return Err(Error::InvalidRelayUrl(format!("{s}: missing host")));
        };

        let mut key = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            key.push_str(&format!(":{port}"));
        }

        let path = url.path();
        key.push_str(path.strip_suffix('/').unwrap_or(path));

        if let Some(query) = url.query() {
            key.push('?');
            key.push_str(query);
        }

        Ok(Self { url, key })
    }

    /// The normalized key used for equality, hashing and display
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The address handed to the websocket layer
    pub fn connect_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

impl PartialEq for RelayUrl {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RelayUrl {}

impl Hash for RelayUrl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for RelayUrl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelayUrl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.key)
    }
}

impl std::str::FromStr for RelayUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        RelayUrl::parse(s)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.key)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RelayUrl::parse(&s).map_err(serde::de::Error::custom)
    }
}
