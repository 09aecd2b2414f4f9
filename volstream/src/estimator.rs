//! EWMA volatility estimation over a [`PriceWindow`].
//!
//! Every call re-seeds the variance from the sample variance of the window's log returns and then
//! folds the EWMA recursion over the whole window:
//!
//! ```text
//! r_i      = ln(p_i / p_{i-1})
//! var_0    = sample_variance(r)
//! var_i    = λ · var_{i-1} + (1 - λ) · r_i²
//! vol      = sqrt(var_n)
//! ```
//!
//! The previous call's variance is not carried forward, so the result depends only on the
//! window contents and λ.

use crate::{error::ConfigError, window::PriceWindow};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Default EWMA decay factor.
pub const DEFAULT_LAMBDA: f64 = 0.94;

/// EWMA decay factor, validated to lie strictly within (0, 1).
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Serialize)]
pub struct Lambda(f64);

impl Lambda {
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if value.is_finite() && value > 0.0 && value < 1.0 {
            Ok(Self(value))
        } else {
            Err(ConfigError::LambdaOutOfRange(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for Lambda {
    fn default() -> Self {
        Self(DEFAULT_LAMBDA)
    }
}

impl<'de> Deserialize<'de> for Lambda {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Lambda::new(value).map_err(serde::de::Error::custom)
    }
}

/// Running EWMA variance of an asset.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct EstimatorState {
    pub seeded: bool,
    pub variance: f64,
}

/// Volatility estimate produced at `timestamp`.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct VolatilityPoint {
    pub timestamp: DateTime<Utc>,
    pub volatility: f64,
}

/// Outcome of a single [`estimate`] call.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Estimate {
    /// Fewer than two samples, no return can be computed.
    InsufficientData,
    /// Every return in the window is identical, the market is flat.
    FlatMarket,
    Point(VolatilityPoint),
}

impl Estimate {
    pub fn point(self) -> Option<VolatilityPoint> {
        match self {
            Estimate::Point(point) => Some(point),
            Estimate::InsufficientData | Estimate::FlatMarket => None,
        }
    }
}

/// Estimate volatility over the whole `window`.
///
/// The input `state` is returned unchanged for [`Estimate::InsufficientData`] &
/// [`Estimate::FlatMarket`].
pub fn estimate(
    window: &PriceWindow,
    state: EstimatorState,
    lambda: Lambda,
    now: DateTime<Utc>,
) -> (Estimate, EstimatorState) {
    if window.len() < 2 {
        return (Estimate::InsufficientData, state);
    }

    let returns = log_returns(window.prices());

    let seed = sample_variance(&returns);
    if seed == 0.0 {
        return (Estimate::FlatMarket, state);
    }

    let lambda = lambda.value();
    let variance = returns
        .iter()
        .fold(seed, |variance, r| lambda * variance + (1.0 - lambda) * r * r);

    let point = VolatilityPoint {
        timestamp: now,
        volatility: variance.sqrt(),
    };

    (
        Estimate::Point(point),
        EstimatorState {
            seeded: true,
            variance,
        },
    )
}

/// Log returns between consecutive prices.
pub fn log_returns(prices: impl Iterator<Item = f64>) -> Vec<f64> {
    prices
        .tuple_windows()
        .map(|(prev, next)| (next / prev).ln())
        .collect()
}

/// Unbiased sample variance (n - 1 denominator).
///
/// A single return has no spread to measure, so its zero-mean estimate r² is used instead.
pub fn sample_variance(returns: &[f64]) -> f64 {
    match returns {
        [] => 0.0,
        [single] => single * single,
        _ => {
            let n = returns.len() as f64;
            let mean = returns.iter().sum::<f64>() / n;
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0)
        }
    }
}
