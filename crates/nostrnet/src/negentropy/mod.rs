//! NIP-77 negentropy: range based set reconciliation of (timestamp, id)
//! sets between us and a relay.
//!
//! [`NegentropyStorage`] holds the sealed local set, [`NegentropyReconciler`]
//! speaks the wire protocol over it, and [`NegentropySync`] drives a session
//! against one relay through the pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::secs;

mod encoding;
mod reconciler;
mod storage;
mod sync;

pub use encoding::{Bound, Mode, Range, RangePayload, PROTOCOL_VERSION};
pub use reconciler::NegentropyReconciler;
pub use storage::{Item, NegentropyStorage};
pub use sync::{NegEvent, NegentropySupport, NegentropySync, SyncOutcome, FETCH_BATCH_SIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegentropyError {
    #[error("storage is already sealed")]
    StorageAlreadySealed,
    #[error("storage is not sealed")]
    StorageNotSealed,
    #[error("unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("empty message")]
    EmptyMessage,
    #[error("message truncated")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("timestamp overflow")]
    TimestampOverflow,
    #[error("bound prefix of {0} bytes is longer than an id")]
    PrefixTooLong(u64),
    #[error("unknown range mode {0}")]
    UnknownMode(u64),
    #[error("too many ranges in message")]
    TooManyRanges,
    #[error("too many ids in range ({0})")]
    TooManyIds(u64),
    #[error("frame size limit must be 0 or at least 4096, got {0}")]
    InvalidFrameSizeLimit(u64),
    #[error("invalid hex payload")]
    InvalidHex,
}

/// Reconciliation tuning. The defaults match the reference implementation
/// so relays see the splits they expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegentropyConfig {
    /// Maximum message size in bytes, 0 for unlimited
    pub frame_size_limit: u64,
    /// Ranges with at most this many local items are answered with an id list
    pub id_list_threshold: usize,
    /// Number of fingerprint sub-ranges a larger mismatching range splits into
    pub split_count: usize,
    /// How long a relay gets to answer NEG-OPEN before we give up on it
    #[serde(with = "secs")]
    pub first_response_timeout: Duration,
    /// Silence allowed between messages once a session is running
    #[serde(with = "secs")]
    pub inactivity_timeout: Duration,
}

impl Default for NegentropyConfig {
    fn default() -> Self {
        Self {
            frame_size_limit: 0,
            id_list_threshold: 16,
            split_count: 16,
            first_response_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(30),
        }
    }
}
