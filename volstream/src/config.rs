//! Runtime configuration.
//!
//! Every value has a documented default and can be overridden through `VOLSTREAM_*` environment
//! variables. All values are validated at startup, an invalid value is a fatal [`ConfigError`].

use crate::{
    asset::{Asset, AssetSpec, ProductFamily, TickerInterval},
    auth::ClientCredentials,
    cadence::DEFAULT_CADENCE_INTERVAL,
    error::ConfigError,
    estimator::Lambda,
    protocol::PriceField,
    report::DEFAULT_REPORT_THRESHOLD,
    window::DEFAULT_WINDOW_CAPACITY,
};
use fnv::FnvHashSet;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use url::Url;

/// Default upstream WebSocket endpoint (Deribit test environment).
pub const DEFAULT_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

/// Default upstream REST endpoint used for backfill.
pub const DEFAULT_REST_URL: &str = "https://test.deribit.com/api/v2";

/// Top level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub feed: FeedConfig,
    pub engine: EngineConfig,
    pub backfill: BackfillConfig,
    pub server: ServerConfig,
    pub credentials: Option<ClientCredentials>,
}

/// Upstream connection configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Upstream WebSocket URL
    pub url: Url,
    /// Maximum consecutive reconnection attempts before the feed is declared unavailable
    pub max_reconnect_attempts: u32,
    /// Upper bound of the exponential reconnection backoff
    pub backoff_cap: Duration,
    /// Outbound pause after an upstream rate limit signal
    pub rate_limit_cooldown: Duration,
    /// Upstream heartbeat interval requested after authentication, `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Idle read timeout after which the connection is considered dead
    pub read_timeout: Duration,
    pub ticker_interval: TickerInterval,
    pub price_field: PriceField,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_url(DEFAULT_WS_URL),
            max_reconnect_attempts: 10,
            backoff_cap: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
            read_timeout: Duration::from_secs(120),
            ticker_interval: TickerInterval::default(),
            price_field: PriceField::default(),
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ..Default::default()
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_price_field(mut self, field: PriceField) -> Self {
        self.price_field = field;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_cap.is_zero() {
            return Err(ConfigError::ZeroBackoffCap);
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroReadTimeout);
        }
        let cooldown = self.rate_limit_cooldown.as_secs();
        if !(5..=30).contains(&cooldown) {
            return Err(ConfigError::CooldownOutOfRange(cooldown));
        }
        if !matches!(self.url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: self.url.to_string(),
                reason: "expected ws:// or wss:// scheme".to_string(),
            });
        }
        Ok(())
    }
}

/// Estimation engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub assets: Vec<AssetSpec>,
    /// Price window capacity per asset
    pub window_capacity: usize,
    /// Number of volatility points per report batch
    pub report_threshold: usize,
    pub lambda: Lambda,
    /// Minimum interval between estimation runs per asset
    pub cadence_interval: Duration,
    /// Samples required in the window before the first estimation
    pub min_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assets: vec![AssetSpec::new("BTC", ProductFamily::CryptoPerpetual)],
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            report_threshold: DEFAULT_REPORT_THRESHOLD,
            lambda: Lambda::default(),
            cadence_interval: DEFAULT_CADENCE_INTERVAL,
            min_samples: 2,
        }
    }
}

impl EngineConfig {
    pub fn new(assets: Vec<AssetSpec>) -> Self {
        Self {
            assets,
            ..Default::default()
        }
    }

    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    pub fn with_report_threshold(mut self, threshold: usize) -> Self {
        self.report_threshold = threshold;
        self
    }

    pub fn with_lambda(mut self, lambda: Lambda) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_cadence_interval(mut self, interval: Duration) -> Self {
        self.cadence_interval = interval;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn asset_ids(&self) -> impl Iterator<Item = &Asset> {
        self.assets.iter().map(|spec| &spec.asset)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assets.is_empty() {
            return Err(ConfigError::NoAssets);
        }
        let mut seen = FnvHashSet::default();
        for spec in &self.assets {
            spec.instrument_name()?;
            if !seen.insert(&spec.asset) {
                return Err(ConfigError::DuplicateAsset(spec.asset.clone()));
            }
        }
        if self.window_capacity == 0 {
            return Err(ConfigError::ZeroWindowCapacity);
        }
        if self.report_threshold == 0 {
            return Err(ConfigError::ZeroReportThreshold);
        }
        if self.cadence_interval.is_zero() {
            return Err(ConfigError::ZeroCadenceInterval);
        }
        if self.min_samples < 2 || self.min_samples > self.window_capacity {
            return Err(ConfigError::MinSamplesOutOfRange {
                min_samples: self.min_samples,
                window_capacity: self.window_capacity,
            });
        }
        Ok(())
    }
}

/// Historical backfill configuration.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub rest_url: Url,
    /// How far back history is requested
    pub lookback: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rest_url: default_url(DEFAULT_REST_URL),
            lookback: Duration::from_secs(3 * 60 * 60),
        }
    }
}

/// Chart broadcast & report writer configuration of the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub chart_addr: SocketAddr,
    /// Broadcast buffer of the chart channel
    pub chart_buffer: usize,
    /// Buffer of drained report batches awaiting the report writer
    pub report_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chart_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            chart_buffer: 10_000,
            report_buffer: 64,
        }
    }
}

impl Config {
    /// Load configuration from `VOLSTREAM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, falling back to defaults for absent keys.
    ///
    /// The returned configuration is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        // Feed
        if let Some(url) = get("VOLSTREAM_WS_URL") {
            config.feed.url = parse_url(&url)?;
        }
        if let Some(attempts) = parse(&get, "VOLSTREAM_MAX_RECONNECT_ATTEMPTS")? {
            config.feed.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = parse(&get, "VOLSTREAM_BACKOFF_CAP_SECS")? {
            config.feed.backoff_cap = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, "VOLSTREAM_RATE_LIMIT_COOLDOWN_SECS")? {
            config.feed.rate_limit_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "VOLSTREAM_HEARTBEAT_SECS")? {
            config.feed.heartbeat_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse(&get, "VOLSTREAM_READ_TIMEOUT_SECS")? {
            config.feed.read_timeout = Duration::from_secs(secs);
        }
        if let Some(interval) = get("VOLSTREAM_TICKER_INTERVAL") {
            config.feed.ticker_interval = interval.parse()?;
        }
        if let Some(field) = get("VOLSTREAM_PRICE_FIELD") {
            config.feed.price_field = field.parse()?;
        }

        // Engine
        let family = match get("VOLSTREAM_PRODUCT_FAMILY") {
            Some(family) => family.parse()?,
            None => ProductFamily::CryptoPerpetual,
        };
        if let Some(assets) = get("VOLSTREAM_ASSETS") {
            config.engine.assets = parse_assets(&assets, family)?;
        } else {
            for spec in &mut config.engine.assets {
                spec.family = family;
            }
        }
        if let Some(capacity) = parse(&get, "VOLSTREAM_WINDOW")? {
            config.engine.window_capacity = capacity;
        }
        if let Some(threshold) = parse(&get, "VOLSTREAM_REPORT_THRESHOLD")? {
            config.engine.report_threshold = threshold;
        }
        if let Some(lambda) = parse(&get, "VOLSTREAM_LAMBDA")? {
            config.engine.lambda = Lambda::new(lambda)?;
        }
        if let Some(secs) = parse::<f64>(&get, "VOLSTREAM_CADENCE_SECS")? {
            config.engine.cadence_interval =
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
                    key: "VOLSTREAM_CADENCE_SECS",
                    value: secs.to_string(),
                })?;
        }
        if let Some(min_samples) = parse(&get, "VOLSTREAM_MIN_SAMPLES")? {
            config.engine.min_samples = min_samples;
        }

        // Backfill
        if let Some(enabled) = get("VOLSTREAM_BACKFILL") {
            config.backfill.enabled = parse_bool("VOLSTREAM_BACKFILL", &enabled)?;
        }
        if let Some(url) = get("VOLSTREAM_REST_URL") {
            config.backfill.rest_url = parse_url(&url)?;
        }

        // Server
        if let Some(addr) = parse(&get, "VOLSTREAM_CHART_ADDR")? {
            config.server.chart_addr = addr;
        }
        if let Some(buffer) = parse(&get, "VOLSTREAM_CHART_BUFFER")? {
            config.server.chart_buffer = buffer;
        }
        if let Some(buffer) = parse(&get, "VOLSTREAM_REPORT_BUFFER")? {
            config.server.report_buffer = buffer;
        }

        config.credentials = match (get("VOLSTREAM_CLIENT_ID"), get("VOLSTREAM_CLIENT_SECRET")) {
            (Some(id), Some(secret)) => Some(ClientCredentials::new(id, secret)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("VOLSTREAM_CLIENT_SECRET")),
            (None, Some(_)) => return Err(ConfigError::Missing("VOLSTREAM_CLIENT_ID")),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed.validate()?;
        self.engine.validate()?;
        if self.server.chart_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VOLSTREAM_CHART_BUFFER",
                value: "0".to_string(),
            });
        }
        if self.server.report_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "VOLSTREAM_REPORT_BUFFER",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_url(url: &str) -> Url {
    // Compile time constants known to parse
    Url::parse(url).unwrap_or_else(|_| unreachable!("invalid default url {url}"))
}

fn parse_url(url: &str) -> Result<Url, ConfigError> {
    Url::parse(url.trim()).map_err(|error| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: error.to_string(),
    })
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
{
    get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { key, value })
        })
        .transpose()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Parse a comma separated asset list, each entry either "ASSET" or "ASSET=family".
fn parse_assets(list: &str, default_family: ProductFamily) -> Result<Vec<AssetSpec>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if entry.contains('=') {
                entry.parse::<AssetSpec>()
            } else {
                Ok(AssetSpec::new(entry, default_family))
            }
        })
        .collect()
}
