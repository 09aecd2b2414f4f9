use crate::asset::{Asset, ProductFamily};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deribit JSON-RPC error code signalling the request rate limit was hit.
pub const RATE_LIMIT_ERROR_CODE: i64 = 10028;

/// Marker text upstream uses for rate limit rejections.
pub const RATE_LIMIT_MARKER: &str = "too_many_requests";

/// HTTP status line of a rate limited handshake, lowercased.
pub const RATE_LIMIT_HTTP_STATUS: &str = "429 too many requests";

/// Errors generated while running the upstream feed connection.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream rate limit hit: {0}")]
    RateLimited(String),

    #[error("authentication rejected (code {code}): {message}")]
    AuthRejected { code: i64, message: String },

    #[error("subscription to channel {channel} rejected: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    #[error("feed unavailable after {attempts} reconnection attempts")]
    Unavailable { attempts: u32 },
}

impl FeedError {
    /// Determine if an error requires the current connection to be torn down.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::RateLimited(_) => false,
            _ => true,
        }
    }

    /// Classify a raw transport error message, detecting upstream rate limiting.
    pub fn from_transport_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains(RATE_LIMIT_MARKER) || lower.contains(RATE_LIMIT_HTTP_STATUS) {
            FeedError::RateLimited(message)
        } else {
            FeedError::Transport(message)
        }
    }
}

impl From<TransportError> for FeedError {
    fn from(value: TransportError) -> Self {
        Self::from_transport_message(value.to_string())
    }
}

/// Errors produced by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("transport is not connected")]
    NotConnected,
}

/// Fatal configuration errors, raised at startup before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown product family: {0}")]
    UnknownProductFamily(String),

    #[error("asset {asset:?} is not a valid {family} identifier")]
    InvalidAsset { asset: String, family: ProductFamily },

    #[error("no assets configured")]
    NoAssets,

    #[error("asset configured more than once: {0}")]
    DuplicateAsset(Asset),

    #[error("lambda must lie strictly between 0 and 1, got {0}")]
    LambdaOutOfRange(f64),

    #[error("price window capacity must be greater than zero")]
    ZeroWindowCapacity,

    #[error("report threshold must be greater than zero")]
    ZeroReportThreshold,

    #[error("cadence interval must be greater than zero")]
    ZeroCadenceInterval,

    #[error("min_samples must lie within [2, {window_capacity}], got {min_samples}")]
    MinSamplesOutOfRange {
        min_samples: usize,
        window_capacity: usize,
    },

    #[error("rate limit cooldown must lie within [5s, 30s], got {0}s")]
    CooldownOutOfRange(u64),

    #[error("backoff cap must be greater than zero")]
    ZeroBackoffCap,

    #[error("read timeout must be greater than zero")]
    ZeroReadTimeout,

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("missing required value: {0}")]
    Missing(&'static str),
}

/// Rejection of a price before it enters a [`PriceWindow`](crate::window::PriceWindow).
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SampleError {
    #[error("price must be finite, got {0}")]
    NonFinitePrice(f64),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),
}

/// Errors generated while ingesting a tick into the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("tick for unknown asset: {0}")]
    UnknownAsset(Asset),

    #[error("rejected sample for {asset}: {error}")]
    Sample { asset: Asset, error: SampleError },
}

/// Inbound frames that cannot be decoded or routed. Always discarded, never fatal.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MessageError {
    #[error("invalid JSON frame: {0}")]
    Json(String),

    #[error("frame missing expected field: {0}")]
    MissingField(&'static str),

    #[error("notification on unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unrecognised frame: {0}")]
    Unrecognised(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value.to_string())
    }
}

/// Failure reported by a chart or report sink.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink full, batch of {0} points not accepted")]
    Full(usize),
}

/// Failure fetching historical prices for backfill.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BackfillError {
    #[error("history request failed: {0}")]
    Http(String),

    #[error("history request returned error status: {0}")]
    Status(String),

    #[error("failed to parse history response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for BackfillError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Parse(value.to_string())
        } else if value.is_status() {
            Self::Status(value.to_string())
        } else {
            Self::Http(value.to_string())
        }
    }
}
