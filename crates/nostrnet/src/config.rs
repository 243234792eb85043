//! Tunables for the networking core.
//!
//! Everything has a `Default` matching what the app ships with, and every
//! struct can be loaded from json (durations are plain seconds) so a host
//! application can override a subset.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::negentropy::NegentropyConfig;

/// Serialize a `Duration` as fractional seconds
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Per-socket reconnect and keepalive behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Reconnect delay after the first failure. Doubles per failure.
    #[serde(with = "secs")]
    pub initial_backoff: Duration,
    #[serde(with = "secs")]
    pub max_backoff: Duration,
    /// How often an idle connected relay is pinged
    #[serde(with = "secs")]
    pub ping_rate: Duration,
    /// A ping without a pong for this long counts as a dead connection
    #[serde(with = "secs")]
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            ping_rate: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connection: ConnectionConfig,
    /// How long a subscription waits for a relay's EOSE before faking one
    #[serde(with = "secs")]
    pub eose_timeout: Duration,
    /// Requests held for a disconnected relay before new ones are dropped
    pub max_queued_per_relay: usize,
    /// Note ids remembered for `seen_on` statistics, oldest evicted first
    pub max_seen_notes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            eose_timeout: Duration::from_secs(5),
            max_queued_per_relay: 10,
            max_seen_notes: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostBoxConfig {
    #[serde(with = "secs")]
    pub initial_retry_after: Duration,
    pub retry_multiplier: f64,
    #[serde(with = "secs")]
    pub max_retry_after: Duration,
}

impl Default for PostBoxConfig {
    fn default() -> Self {
        Self {
            initial_retry_after: Duration::from_secs(10),
            retry_multiplier: 1.5,
            max_retry_after: Duration::from_secs(600),
        }
    }
}

/// Everything the [`crate::RelayService`] event loop needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub postbox: PostBoxConfig,
    pub negentropy: NegentropyConfig,
    /// Upper bound on time between housekeeping passes (retries, pings,
    /// reconnects, EOSE timeouts)
    #[serde(with = "secs")]
    pub tick_interval: Duration,
    #[serde(with = "secs")]
    pub ensure_connected_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            postbox: PostBoxConfig::default(),
            negentropy: NegentropyConfig::default(),
            tick_interval: Duration::from_secs(1),
            ensure_connected_timeout: Duration::from_secs(2),
        }
    }
}
