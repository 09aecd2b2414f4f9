//! Bounded per-asset price buffer.
//!
//! Samples are kept in arrival order and evicted strictly oldest-first once the window reaches
//! its configured capacity.

use crate::error::SampleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default [`PriceWindow`] capacity.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// A single validated price observation, timestamped locally at receipt.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PriceSample {
    /// Construct a new [`PriceSample`], rejecting NaN, infinite and non-positive prices.
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Result<Self, SampleError> {
        if !price.is_finite() {
            return Err(SampleError::NonFinitePrice(price));
        }
        if price <= 0.0 {
            return Err(SampleError::NonPositivePrice(price));
        }
        Ok(Self { timestamp, price })
    }
}

/// Bounded FIFO of [`PriceSample`]s.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    capacity: usize,
    samples: VecDeque<PriceSample>,
}

impl PriceWindow {
    /// Create a new window holding at most `capacity` samples.
    ///
    /// Capacity is validated by [`EngineConfig`](crate::config::EngineConfig), a zero capacity
    /// here is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, returning the evicted oldest sample if the window was full.
    pub fn push(&mut self, sample: PriceSample) -> Option<PriceSample> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    /// Owned copy of the current samples, oldest first.
    pub fn snapshot(&self) -> Vec<PriceSample> {
        self.samples.iter().copied().collect()
    }

    pub fn prices(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|sample| sample.price)
    }

    pub fn latest(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity currently filled, in [0, 1].
    pub fn fill_ratio(&self) -> f64 {
        self.samples.len() as f64 / self.capacity as f64
    }
}

impl Default for PriceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}
