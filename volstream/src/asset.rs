use crate::error::ConfigError;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{borrow::Borrow, str::FromStr};

/// Opaque identifier of a traded instrument (eg/ "BTC", "EURR_USDC", "PAXG").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct Asset(pub SmolStr);

impl Asset {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Asset {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for Asset {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Asset {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Upstream feed channel name (eg/ "ticker.BTC-PERPETUAL.raw").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct Channel(pub SmolStr);

impl Channel {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Channel {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Asset class an [`Asset`] belongs to, selecting its instrument & channel name template.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductFamily {
    /// Perpetual futures quoted on a crypto base currency, eg/ "BTC" -> "BTC-PERPETUAL".
    CryptoPerpetual,
    /// Spot FX style pair given in full, eg/ "EURR_USDC".
    FxPair,
    /// Tokenised commodity quoted against USDC, eg/ "PAXG" -> "PAXG_USDC".
    Commodity,
}

impl ProductFamily {
    /// Quote currency used for [`ProductFamily::Commodity`] instruments.
    pub const COMMODITY_QUOTE: &'static str = "USDC";

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductFamily::CryptoPerpetual => "crypto_perpetual",
            ProductFamily::FxPair => "fx_pair",
            ProductFamily::Commodity => "commodity",
        }
    }

    /// Build the upstream instrument name for an [`Asset`] of this family.
    pub fn instrument_name(&self, asset: &Asset) -> Result<String, ConfigError> {
        let id = asset.as_str();
        let invalid = || ConfigError::InvalidAsset {
            asset: id.to_string(),
            family: *self,
        };

        if id.is_empty() || id.chars().any(|c| c == '.' || c.is_whitespace()) {
            return Err(invalid());
        }

        match self {
            ProductFamily::CryptoPerpetual => {
                if id.contains('_') || id.contains('-') {
                    return Err(invalid());
                }
                Ok(format!("{}-PERPETUAL", id.to_uppercase()))
            }
            ProductFamily::FxPair => match id.split_once('_') {
                Some((base, quote))
                    if !base.is_empty() && !quote.is_empty() && !quote.contains('_') =>
                {
                    Ok(id.to_uppercase())
                }
                _ => Err(invalid()),
            },
            ProductFamily::Commodity => {
                if id.contains('_') || id.contains('-') {
                    return Err(invalid());
                }
                Ok(format!("{}_{}", id.to_uppercase(), Self::COMMODITY_QUOTE))
            }
        }
    }
}

impl std::fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProductFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "crypto_perpetual" | "perpetual" => Ok(ProductFamily::CryptoPerpetual),
            "fx_pair" | "fx" => Ok(ProductFamily::FxPair),
            "commodity" => Ok(ProductFamily::Commodity),
            _ => Err(ConfigError::UnknownProductFamily(s.to_string())),
        }
    }
}

/// Ticker notification interval requested in the channel name.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
pub enum TickerInterval {
    /// Every update, requires an authenticated connection.
    #[default]
    Raw,
    /// Aggregated updates every 100ms.
    Ms100,
}

impl TickerInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerInterval::Raw => "raw",
            TickerInterval::Ms100 => "100ms",
        }
    }
}

impl FromStr for TickerInterval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "raw" => Ok(TickerInterval::Raw),
            "100ms" => Ok(TickerInterval::Ms100),
            other => Err(ConfigError::InvalidValue {
                key: "ticker_interval",
                value: other.to_string(),
            }),
        }
    }
}

/// A configured [`Asset`] together with the [`ProductFamily`] used to address it upstream.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct AssetSpec {
    pub asset: Asset,
    pub family: ProductFamily,
}

impl AssetSpec {
    pub fn new(asset: impl Into<Asset>, family: ProductFamily) -> Self {
        Self {
            asset: asset.into(),
            family,
        }
    }

    pub fn instrument_name(&self) -> Result<String, ConfigError> {
        self.family.instrument_name(&self.asset)
    }

    /// Ticker [`Channel`] name for this asset, eg/ "ticker.BTC-PERPETUAL.raw".
    pub fn channel(&self, interval: TickerInterval) -> Result<Channel, ConfigError> {
        let instrument = self.instrument_name()?;
        Ok(Channel(SmolStr::new(format!(
            "ticker.{instrument}.{}",
            interval.as_str()
        ))))
    }
}

impl FromStr for AssetSpec {
    type Err = ConfigError;

    /// Parse "ASSET=family". A bare "ASSET" is rejected here, see
    /// [`Config::from_lookup`](crate::config::Config::from_lookup) for default family handling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (asset, family) = s.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "asset",
            value: s.to_string(),
        })?;
        Ok(Self::new(asset.trim(), family.parse()?))
    }
}
