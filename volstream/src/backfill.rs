use crate::{asset::AssetSpec, error::BackfillError, protocol::RpcError, window::PriceSample};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const METHOD_CHART_DATA: &str = "public/get_tradingview_chart_data";

/// One minute candles.
const CHART_RESOLUTION: &str = "1";

/// Source of recent price history used to pre-seed a [`PriceWindow`](crate::window::PriceWindow).
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_recent_history(&self, spec: &AssetSpec)
    -> Result<Vec<PriceSample>, BackfillError>;
}

/// [`HistoryFetcher`] backed by Deribit's tradingview chart data endpoint.
///
/// Returns the closes of 1 minute candles over `lookback`, keeping only the newest
/// `window_capacity` of them.
#[derive(Debug, Clone)]
pub struct DeribitHistory {
    client: Client,
    rest_url: Url,
    lookback: Duration,
    window_capacity: usize,
}

impl DeribitHistory {
    pub fn new(rest_url: Url, lookback: Duration, window_capacity: usize) -> Self {
        Self {
            client: Client::new(),
            rest_url,
            lookback,
            window_capacity,
        }
    }

    fn request_url(&self, instrument: &str, end: DateTime<Utc>) -> Url {
        let lookback = TimeDelta::from_std(self.lookback).unwrap_or(TimeDelta::zero());
        let start = end - lookback;

        let mut url = self.rest_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(METHOD_CHART_DATA.split('/'));
        }
        url.query_pairs_mut()
            .append_pair("instrument_name", instrument)
            .append_pair("start_timestamp", &start.timestamp_millis().to_string())
            .append_pair("end_timestamp", &end.timestamp_millis().to_string())
            .append_pair("resolution", CHART_RESOLUTION);
        url
    }
}

#[async_trait]
impl HistoryFetcher for DeribitHistory {
    async fn fetch_recent_history(
        &self,
        spec: &AssetSpec,
    ) -> Result<Vec<PriceSample>, BackfillError> {
        let instrument = spec
            .instrument_name()
            .map_err(|error| BackfillError::Parse(error.to_string()))?;
        let url = self.request_url(&instrument, Utc::now());
        debug!(asset = %spec.asset, %url, "fetching price history");

        let response = self.client.get(url).send().await?;
        if let Err(status) = response.error_for_status_ref() {
            return Err(BackfillError::Status(status.to_string()));
        }

        let response = response.json::<ChartResponse>().await?;
        response.into_samples(self.window_capacity)
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(default)]
    result: Option<ChartData>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    status: String,
    #[serde(default)]
    ticks: Vec<i64>,
    #[serde(default)]
    close: Vec<f64>,
}

impl ChartResponse {
    fn into_samples(self, capacity: usize) -> Result<Vec<PriceSample>, BackfillError> {
        if let Some(error) = self.error {
            return Err(BackfillError::Status(format!(
                "code {}: {}",
                error.code, error.message
            )));
        }

        let data = self
            .result
            .ok_or_else(|| BackfillError::Parse("missing result".to_string()))?;
        if data.status == "no_data" {
            return Ok(Vec::new());
        }
        if data.ticks.len() != data.close.len() {
            return Err(BackfillError::Parse(format!(
                "{} ticks but {} closes",
                data.ticks.len(),
                data.close.len()
            )));
        }

        let mut samples = data
            .ticks
            .into_iter()
            .zip(data.close)
            .filter_map(|(tick, close)| {
                PriceSample::new(DateTime::from_timestamp_millis(tick)?, close).ok()
            })
            .collect::<Vec<_>>();
        samples.sort_by_key(|sample| sample.timestamp);

        let excess = samples.len().saturating_sub(capacity);
        Ok(samples.split_off(excess))
    }
}
