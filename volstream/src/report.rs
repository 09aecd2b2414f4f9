use crate::estimator::VolatilityPoint;

/// Default number of [`VolatilityPoint`]s per emitted report batch.
pub const DEFAULT_REPORT_THRESHOLD: usize = 100;

/// Accumulates an asset's [`VolatilityPoint`]s and hands them out in batches of exactly
/// `threshold` points.
#[derive(Debug, Clone)]
pub struct ReportBuffer {
    threshold: usize,
    points: Vec<VolatilityPoint>,
}

impl ReportBuffer {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            points: Vec::with_capacity(threshold),
        }
    }

    /// Append a point, returning the drained batch once the threshold is reached.
    pub fn append(&mut self, point: VolatilityPoint) -> Option<Vec<VolatilityPoint>> {
        self.points.push(point);
        if self.points.len() < self.threshold {
            return None;
        }
        Some(std::mem::replace(
            &mut self.points,
            Vec::with_capacity(self.threshold),
        ))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for ReportBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_THRESHOLD)
    }
}
