use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use volstream::{Asset, ChartSink, ReportBatch, ReportSink, VolatilityPoint, error::SinkError};

/// Volatility point wrapper for JSON serialization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub asset: Asset,
    pub timestamp: DateTime<Utc>,
    pub volatility: f64,
}

impl ChartMessage {
    pub fn new(asset: &Asset, point: &VolatilityPoint) -> Self {
        Self {
            kind: "volatility",
            asset: asset.clone(),
            timestamp: point.timestamp,
            volatility: point.volatility,
        }
    }
}

/// Latest [`VolatilityPoint`] per asset, read by the chart server for welcome snapshots.
pub type LatestPoints = Arc<RwLock<FnvHashMap<Asset, VolatilityPoint>>>;

/// [`ChartSink`] that broadcasts every point to connected chart clients.
#[derive(Debug, Clone)]
pub struct BroadcastChartSink {
    tx: broadcast::Sender<ChartMessage>,
    latest: LatestPoints,
}

impl BroadcastChartSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            latest: LatestPoints::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChartMessage> {
        self.tx.subscribe()
    }

    /// Snapshot of the latest point per asset, ordered by asset.
    pub fn snapshot(&self) -> Vec<ChartMessage> {
        let mut snapshot = self
            .latest
            .read()
            .iter()
            .map(|(asset, point)| ChartMessage::new(asset, point))
            .collect::<Vec<_>>();
        snapshot.sort_by(|a, b| a.asset.cmp(&b.asset));
        snapshot
    }
}

impl ChartSink for BroadcastChartSink {
    fn publish(&self, asset: &Asset, point: &VolatilityPoint) {
        self.latest.write().insert(asset.clone(), *point);

        // Ignore errors if no receivers
        match self.tx.send(ChartMessage::new(asset, point)) {
            Ok(receivers) => debug!(%asset, receivers, "volatility point broadcast"),
            Err(_) => debug!(%asset, "no chart clients connected"),
        }
    }
}

/// [`ReportSink`] forwarding batches over a bounded channel to the report writer task.
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    tx: mpsc::Sender<ReportBatch>,
    capacity: usize,
}

impl ChannelReportSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ReportBatch>) {
        let capacity = buffer.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }
}

impl ReportSink for ChannelReportSink {
    fn emit(&self, asset: &Asset, batch: &[VolatilityPoint]) -> Result<(), SinkError> {
        let batch = ReportBatch {
            asset: asset.clone(),
            points: batch.to_vec(),
        };
        self.tx.try_send(batch).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => SinkError::Full(self.capacity),
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Summary statistics of a [`ReportBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub count: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl ReportSummary {
    pub fn from_points(points: &[VolatilityPoint]) -> Option<Self> {
        let first = points.first()?;
        let last = points.last()?;

        let (min, max, sum) = points.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), point| {
                (
                    min.min(point.volatility),
                    max.max(point.volatility),
                    sum + point.volatility,
                )
            },
        );

        Some(Self {
            count: points.len(),
            first: first.timestamp,
            last: last.timestamp,
            min,
            mean: sum / points.len() as f64,
            max,
        })
    }
}

/// Consume report batches until every [`ChannelReportSink`] is dropped.
pub async fn run_report_writer(mut rx: mpsc::Receiver<ReportBatch>) {
    while let Some(batch) = rx.recv().await {
        let Some(summary) = ReportSummary::from_points(&batch.points) else {
            continue;
        };

        info!(
            asset = %batch.asset,
            count = summary.count,
            first = %summary.first,
            last = %summary.last,
            min = summary.min,
            mean = summary.mean,
            max = summary.max,
            "volatility report"
        );
        for point in &batch.points {
            debug!(
                asset = %batch.asset,
                timestamp = %point.timestamp,
                volatility = point.volatility,
                "report point"
            );
        }
    }

    info!("report channel closed, report writer stopping");
}
