use crate::{asset::Asset, error::SinkError, estimator::VolatilityPoint};
use serde::{Deserialize, Serialize};

/// Best-effort consumer of every [`VolatilityPoint`] as it is produced.
pub trait ChartSink: Send + Sync {
    fn publish(&self, asset: &Asset, point: &VolatilityPoint);
}

/// Consumer of drained report batches.
///
/// The engine logs an [`SinkError`] but never retries or re-appends a batch, any retry policy
/// lives behind this trait.
pub trait ReportSink: Send + Sync {
    fn emit(&self, asset: &Asset, batch: &[VolatilityPoint]) -> Result<(), SinkError>;
}

/// Owned report batch, convenient for forwarding across channels.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ReportBatch {
    pub asset: Asset,
    pub points: Vec<VolatilityPoint>,
}
