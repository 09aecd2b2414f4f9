//! # Volstream
//! Streaming EWMA volatility estimation over a reconnecting JSON-RPC WebSocket tick feed.
//!
//! A single [`FeedSupervisor`] owns the upstream connection: it authenticates, subscribes one
//! ticker channel per configured [`Asset`], and routes every tick into the [`Engine`]. Each
//! asset has its own pipeline:
//! * [`PriceWindow`]: bounded FIFO of the most recent price samples.
//! * [`CadenceGate`]: rate limits estimation per asset.
//! * [`estimate`]: reseeds the variance from the full window then folds the EWMA update.
//! * [`ReportBuffer`]: accumulates points into fixed size report batches.
//!
//! Points are published to a [`ChartSink`] as they are produced, drained batches are handed to
//! a [`ReportSink`].
//!
//! Connection loss goes through an exponential backoff [`ReconnectPolicy`], upstream rate
//! limiting pauses outbound requests for a cooldown without dropping the connection.

/// [`Asset`], [`Channel`] & [`ProductFamily`] channel name construction.
pub mod asset;

/// Upstream authentication parameters.
pub mod auth;

/// Historical price backfill used to pre-seed windows.
pub mod backfill;

pub mod cadence;
pub mod clock;

/// Environment driven configuration.
pub mod config;

/// Per-asset estimation pipelines.
pub mod engine;

/// All errors generated in Volstream.
pub mod error;

pub mod estimator;

/// JSON-RPC request builders & inbound message decoding.
pub mod protocol;

pub mod report;

/// Chart & report consumers of produced [`VolatilityPoint`]s.
pub mod sink;

pub mod subscription;

/// Upstream connection lifecycle.
pub mod supervisor;

/// Text frame [`Transport`](transport::Transport) abstraction & WebSocket implementation.
pub mod transport;

pub mod window;

pub use asset::{Asset, AssetSpec, Channel, ProductFamily, TickerInterval};
pub use auth::{Authenticator, ClientCredentials};
pub use backfill::{DeribitHistory, HistoryFetcher};
pub use cadence::CadenceGate;
pub use clock::{Clock, SystemClock};
pub use config::{BackfillConfig, Config, EngineConfig, FeedConfig, ServerConfig};
pub use engine::{AssetPipeline, Engine, TickOutcome};
pub use estimator::{Estimate, EstimatorState, Lambda, VolatilityPoint, estimate};
pub use report::ReportBuffer;
pub use sink::{ChartSink, ReportBatch, ReportSink};
pub use subscription::SubscriptionManager;
pub use supervisor::{ConnectionState, FeedStatus, FeedSupervisor, ReconnectPolicy};
pub use transport::{Transport, TransportEvent, WebSocketTransport};
pub use window::{PriceSample, PriceWindow};
