use crate::{
    asset::{Asset, AssetSpec, Channel, TickerInterval},
    error::{ConfigError, FeedError},
    protocol::{JsonRpcRequest, RequestIds, RpcError},
};
use fnv::FnvHashMap;
use serde_json::Value;
use tracing::{debug, warn};

/// Subscription status of a [`Channel`] on the live connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SubscriptionState {
    /// Subscribe request sent with this id, awaiting acknowledgement.
    Pending(u64),
    Confirmed,
}

/// Outcome of acknowledging a subscribe response.
#[derive(Clone, PartialEq, Debug)]
pub enum Acknowledgement {
    /// Response id does not belong to a pending subscribe request.
    Unknown,
    Confirmed(Vec<Channel>),
    /// Subscribe was rate limited, the channels are unsubscribed again and may be re-requested.
    RateLimited(Vec<Channel>),
    Rejected(FeedError),
}

/// Tracks which configured asset channels are subscribed on the current connection.
///
/// Channel names are resolved once at construction, so unknown product families or malformed
/// asset identifiers surface as [`ConfigError`]s before any connection is attempted.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    channels: FnvHashMap<Asset, Channel>,
    routes: FnvHashMap<Channel, Asset>,
    subscribed: FnvHashMap<Channel, SubscriptionState>,
    pending: FnvHashMap<u64, Vec<Channel>>,
}

impl SubscriptionManager {
    pub fn new<'a>(
        specs: impl IntoIterator<Item = &'a AssetSpec>,
        interval: TickerInterval,
    ) -> Result<Self, ConfigError> {
        let mut channels = FnvHashMap::default();
        let mut routes = FnvHashMap::default();

        for spec in specs {
            let channel = spec.channel(interval)?;
            if channels.insert(spec.asset.clone(), channel.clone()).is_some() {
                return Err(ConfigError::DuplicateAsset(spec.asset.clone()));
            }
            routes.insert(channel, spec.asset.clone());
        }

        Ok(Self {
            channels,
            routes,
            subscribed: FnvHashMap::default(),
            pending: FnvHashMap::default(),
        })
    }

    pub fn channel(&self, asset: &Asset) -> Option<&Channel> {
        self.channels.get(asset)
    }

    /// Resolve the [`Asset`] a notification channel belongs to.
    pub fn asset_for_channel(&self, channel: &str) -> Option<&Asset> {
        self.routes.get(channel)
    }

    /// Build one subscribe request per asset whose channel is not yet in the subscription set.
    ///
    /// Every returned channel is recorded as [`SubscriptionState::Pending`] immediately, so
    /// repeated calls only ever yield requests for the delta.
    pub fn ensure_subscribed<'a>(
        &mut self,
        assets: impl IntoIterator<Item = &'a Asset>,
        ids: &mut RequestIds,
    ) -> Vec<JsonRpcRequest> {
        let mut requests = Vec::new();

        for asset in assets {
            let Some(channel) = self.channels.get(asset) else {
                warn!(%asset, "cannot subscribe unconfigured asset");
                continue;
            };
            if self.subscribed.contains_key(channel) {
                continue;
            }

            let id = ids.next_id();
            debug!(%asset, %channel, id, "subscribing");
            self.subscribed
                .insert(channel.clone(), SubscriptionState::Pending(id));
            self.pending.insert(id, vec![channel.clone()]);
            requests.push(JsonRpcRequest::subscribe(id, std::slice::from_ref(channel)));
        }

        requests
    }

    /// Apply a subscribe response.
    ///
    /// A successful result lists the subscribed channels, any requested channel missing from it
    /// is treated as rejected.
    pub fn acknowledge(&mut self, id: u64, outcome: &Result<Value, RpcError>) -> Acknowledgement {
        let Some(requested) = self.pending.remove(&id) else {
            return Acknowledgement::Unknown;
        };

        match outcome {
            Ok(result) => {
                let granted: Vec<&str> = result
                    .as_array()
                    .map(|channels| channels.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();

                if let Some(missing) = requested
                    .iter()
                    .find(|channel| !granted.contains(&channel.as_str()))
                {
                    let error = FeedError::SubscriptionRejected {
                        channel: missing.to_string(),
                        reason: format!("not acknowledged in result {result}"),
                    };
                    self.release(&requested);
                    return Acknowledgement::Rejected(error);
                }

                for channel in &requested {
                    self.subscribed
                        .insert(channel.clone(), SubscriptionState::Confirmed);
                }
                Acknowledgement::Confirmed(requested)
            }
            Err(error) if error.is_rate_limit() => {
                self.release(&requested);
                Acknowledgement::RateLimited(requested)
            }
            Err(error) => {
                self.release(&requested);
                Acknowledgement::Rejected(FeedError::SubscriptionRejected {
                    channel: requested
                        .iter()
                        .map(Channel::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                    reason: format!("code {}: {}", error.code, error.message),
                })
            }
        }
    }

    fn release(&mut self, channels: &[Channel]) {
        for channel in channels {
            self.subscribed.remove(channel);
        }
    }

    /// True once every configured asset's channel is confirmed.
    pub fn all_confirmed(&self) -> bool {
        self.channels.values().all(|channel| {
            matches!(
                self.subscribed.get(channel),
                Some(SubscriptionState::Confirmed)
            )
        })
    }

    pub fn state(&self, channel: &Channel) -> Option<SubscriptionState> {
        self.subscribed.get(channel).copied()
    }

    pub fn subscribed_len(&self) -> usize {
        self.subscribed.len()
    }

    /// Forget every subscription, server side subscriptions do not survive a new connection.
    pub fn reset(&mut self) {
        self.subscribed.clear();
        self.pending.clear();
    }
}
