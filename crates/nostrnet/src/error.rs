use std::array::TryFromSliceError;
use thiserror::Error;

use crate::negentropy::NegentropyError;
use crate::postbox::CancelSendError;
use crate::relay::RelayUrl;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("message is empty")]
    Empty,

    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    #[error("hex decoding failed")]
    HexDecodeFailed,

    #[error("invalid byte size")]
    InvalidByteSize,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),

    #[error("relay already exists: {0}")]
    RelayAlreadyExists(RelayUrl),

    #[error("unknown relay: {0}")]
    UnknownRelay(RelayUrl),

    #[error("json error: {0}")]
    Json(String),

    #[error("negentropy: {0}")]
    Negentropy(#[from] NegentropyError),

    #[error("cancel send: {0}")]
    Cancel(#[from] CancelSendError),

    #[error("relay service is not running")]
    ServiceStopped,

    #[error("{0}")]
    Generic(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Error::InvalidByteSize
    }
}

impl From<hex::FromHexError> for Error {
    fn from(_e: hex::FromHexError) -> Self {
        Error::HexDecodeFailed
    }
}
