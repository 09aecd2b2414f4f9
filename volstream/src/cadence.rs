use crate::asset::Asset;
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use std::time::Duration;

/// Default minimum interval between two estimation runs of the same asset.
pub const DEFAULT_CADENCE_INTERVAL: Duration = Duration::from_secs(10);

/// Per-asset rate limiter deciding when an estimation run is due.
///
/// Each asset is gated independently against its own last run time, so a burst of ticks on one
/// asset never shifts another asset's cadence.
#[derive(Debug, Clone)]
pub struct CadenceGate {
    interval: TimeDelta,
    last_run: FnvHashMap<Asset, DateTime<Utc>>,
}

impl CadenceGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            last_run: FnvHashMap::default(),
        }
    }

    /// Returns true, recording `now` as the asset's last run, if the asset has never run or at
    /// least one interval has elapsed since its last run.
    pub fn should_run(&mut self, asset: &Asset, now: DateTime<Utc>) -> bool {
        match self.last_run.get_mut(asset) {
            Some(last_run) if now.signed_duration_since(*last_run) < self.interval => false,
            Some(last_run) => {
                *last_run = now;
                true
            }
            None => {
                self.last_run.insert(asset.clone(), now);
                true
            }
        }
    }

    pub fn last_run(&self, asset: &Asset) -> Option<DateTime<Utc>> {
        self.last_run.get(asset).copied()
    }

    /// Drop the asset's cadence history.
    pub fn forget(&mut self, asset: &Asset) {
        self.last_run.remove(asset);
    }
}

impl Default for CadenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_CADENCE_INTERVAL)
    }
}
