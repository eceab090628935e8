use crate::{abort::AbortReason, net::BlockReason};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse classification of [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Disposed,
    AddressBlocked,
    AdmissionLimit,
    ContentLengthExceeded,
    TransportFailure,
    InvalidRequest,
    MalformedBody,
}

/// The admission limit that was in force when a caller was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// The rate pool quota for the current window is spent.
    RatePool { quota: usize },
    /// The concurrency cap is reached.
    MaxActive { max_active: usize },
}

impl core::fmt::Display for Limit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RatePool { quota } => write!(f, "rate pool quota of {quota} spent"),
            Self::MaxActive { max_active } => write!(f, "{max_active} requests already active"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentLengthError {
    #[error("response has no content-length")]
    Missing,
    #[error("response content-length is not a number")]
    Malformed,
    #[error("response content-length {length} exceeds limit of {max}")]
    Exceeded { length: u64, max: u64 },
}

#[derive(Error, Debug)]
pub enum Error {
    /// The gateway was disposed before or while the call was admitted.
    #[error("gateway disposed")]
    Disposed,

    /// Domain or address policy rejected the destination.
    #[error("address blocked: {host}: {reason}")]
    AddressBlocked { host: String, reason: BlockReason },

    /// The wait queue is full while a limit is in force.
    #[error("pool overflow: {max_awaiting} callers already waiting, {limit}")]
    AdmissionLimit { limit: Limit, max_awaiting: usize },

    #[error(transparent)]
    ContentLength(#[from] ContentLengthError),

    /// The transport call failed.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The transport call was cancelled by timeout or disposal.
    #[error("request aborted: {0}")]
    Aborted(AbortReason),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The response body does not match the negotiated representation.
    #[error("malformed response body: {0}")]
    MalformedBody(#[source] BoxError),
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Disposed => ErrorKind::Disposed,
            Self::AddressBlocked { .. } => ErrorKind::AddressBlocked,
            Self::AdmissionLimit { .. } => ErrorKind::AdmissionLimit,
            Self::ContentLength(_) => ErrorKind::ContentLengthExceeded,
            Self::Transport(_) | Self::Aborted(_) => ErrorKind::TransportFailure,
            Self::InvalidUrl(_) | Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::MalformedBody(_) => ErrorKind::MalformedBody,
        }
    }

    /// Why the call was cancelled, if it was.
    #[must_use]
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}
