use crate::{
    asset::Asset,
    cadence::CadenceGate,
    config::EngineConfig,
    error::IngestError,
    estimator::{Estimate, EstimatorState, Lambda, VolatilityPoint, estimate},
    report::ReportBuffer,
    sink::{ChartSink, ReportSink},
    window::{PriceSample, PriceWindow},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// State owned by a single [`Asset`].
#[derive(Debug, Clone)]
pub struct AssetPipeline {
    pub window: PriceWindow,
    pub estimator: EstimatorState,
    pub report: ReportBuffer,
}

impl AssetPipeline {
    pub fn new(window_capacity: usize, report_threshold: usize) -> Self {
        Self {
            window: PriceWindow::new(window_capacity),
            estimator: EstimatorState::default(),
            report: ReportBuffer::new(report_threshold),
        }
    }
}

/// What happened to a single ingested tick.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum TickOutcome {
    /// Window holds fewer than `min_samples` samples.
    ///
    /// `progress` is the ratio towards `min_samples`, `window_fill` the
    /// [`PriceWindow::fill_ratio`](crate::window::PriceWindow::fill_ratio).
    WarmingUp { progress: f64, window_fill: f64 },
    /// Estimation not due yet for this asset.
    Gated,
    InsufficientData,
    FlatMarket,
    Estimated {
        point: VolatilityPoint,
        batch_emitted: bool,
    },
}

/// Per-asset estimation pipelines: window → cadence gate → estimator → chart & report sinks.
pub struct Engine {
    pipelines: FnvHashMap<Asset, AssetPipeline>,
    gate: CadenceGate,
    lambda: Lambda,
    min_samples: usize,
    chart: Arc<dyn ChartSink>,
    report: Arc<dyn ReportSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.pipelines)
            .field("gate", &self.gate)
            .field("lambda", &self.lambda)
            .field("min_samples", &self.min_samples)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        chart: Arc<dyn ChartSink>,
        report: Arc<dyn ReportSink>,
    ) -> Self {
        let pipelines = config
            .asset_ids()
            .map(|asset| {
                (
                    asset.clone(),
                    AssetPipeline::new(config.window_capacity, config.report_threshold),
                )
            })
            .collect();

        Self {
            pipelines,
            gate: CadenceGate::new(config.cadence_interval),
            lambda: config.lambda,
            min_samples: config.min_samples.max(2),
            chart,
            report,
        }
    }

    /// Ingest a price for `asset` received at `now`.
    pub fn ingest(
        &mut self,
        asset: &Asset,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, IngestError> {
        let pipeline = self
            .pipelines
            .get_mut(asset)
            .ok_or_else(|| IngestError::UnknownAsset(asset.clone()))?;

        let sample = PriceSample::new(now, price).map_err(|error| IngestError::Sample {
            asset: asset.clone(),
            error,
        })?;
        pipeline.window.push(sample);
        debug!(%asset, price, window = pipeline.window.len(), "tick");

        if pipeline.window.len() < self.min_samples {
            return Ok(TickOutcome::WarmingUp {
                progress: pipeline.window.len() as f64 / self.min_samples as f64,
                window_fill: pipeline.window.fill_ratio(),
            });
        }

        if !self.gate.should_run(asset, now) {
            return Ok(TickOutcome::Gated);
        }

        let (estimate, state) = estimate(&pipeline.window, pipeline.estimator, self.lambda, now);
        pipeline.estimator = state;

        let point = match estimate {
            Estimate::Point(point) => point,
            Estimate::InsufficientData => return Ok(TickOutcome::InsufficientData),
            Estimate::FlatMarket => {
                info!(%asset, window = pipeline.window.len(), "flat market, returns have zero variance");
                return Ok(TickOutcome::FlatMarket);
            }
        };

        info!(%asset, volatility = point.volatility, "volatility estimate");
        self.chart.publish(asset, &point);

        let batch_emitted = match pipeline.report.append(point) {
            Some(batch) => {
                match self.report.emit(asset, &batch) {
                    Ok(()) => info!(%asset, points = batch.len(), "report batch emitted"),
                    Err(error) => {
                        error!(%asset, points = batch.len(), %error, "report sink failed to accept batch")
                    }
                }
                true
            }
            None => false,
        };

        Ok(TickOutcome::Estimated {
            point,
            batch_emitted,
        })
    }

    /// Pre-seed an asset's window with historical samples, returning how many were accepted.
    ///
    /// No estimation runs. Only the newest samples that fit the window are retained.
    pub fn seed(&mut self, asset: &Asset, samples: impl IntoIterator<Item = PriceSample>) -> usize {
        let Some(pipeline) = self.pipelines.get_mut(asset) else {
            return 0;
        };

        samples
            .into_iter()
            .filter(|sample| PriceSample::new(sample.timestamp, sample.price).is_ok())
            .map(|sample| pipeline.window.push(sample))
            .count()
    }

    /// Drop an asset and all of its state.
    pub fn remove_asset(&mut self, asset: &Asset) -> bool {
        self.gate.forget(asset);
        self.pipelines.remove(asset).is_some()
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.pipelines.keys()
    }

    pub fn pipeline(&self, asset: &Asset) -> Option<&AssetPipeline> {
        self.pipelines.get(asset)
    }

    /// Points appended but not yet drained into a batch, per asset.
    pub fn pending_report_points(&self) -> impl Iterator<Item = (&Asset, usize)> {
        self.pipelines
            .iter()
            .map(|(asset, pipeline)| (asset, pipeline.report.len()))
    }
}
