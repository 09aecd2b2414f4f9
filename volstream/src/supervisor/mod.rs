use crate::{
    asset::{Asset, AssetSpec},
    auth::Authenticator,
    backfill::HistoryFetcher,
    clock::{Clock, SystemClock},
    config::{EngineConfig, FeedConfig},
    engine::{Engine, TickOutcome},
    error::{ConfigError, FeedError},
    protocol::{
        AUTH_REQUEST_ID, HeartbeatKind, InboundMessage, JsonRpcRequest, RequestIds, RpcError,
    },
    sink::{ChartSink, ReportSink},
    subscription::{Acknowledgement, SubscriptionManager},
    transport::{CLOSE_CODE_NORMAL, Transport, TransportEvent},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, trace, warn};

/// [`ConnectionState`](state::ConnectionState) machine & operator facing [`FeedStatus`].
pub mod state;

/// Exponential backoff [`ReconnectPolicy`].
pub mod reconnect;

/// Rate limit aware outbound frame queue.
pub mod outbound;

pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use state::{ConnectionEvent, ConnectionState, ConnectionTracker, FeedStatus};

use outbound::OutboundQueue;

/// Why a single connection session ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SessionEnd {
    /// Connection lost or torn down, consult the [`ReconnectPolicy`].
    Disconnected,
    /// Connection refused or lost while upstream rate limits us, reconnect once the cooldown
    /// elapses without counting an attempt.
    RateLimited,
    Shutdown,
}

/// Owns the single logical upstream feed connection and drives authentication, subscription,
/// message dispatch and recovery.
///
/// All per-asset state lives in the owned [`Engine`], which is only ever mutated from the
/// supervisor's task.
pub struct FeedSupervisor<T> {
    transport: T,
    config: FeedConfig,
    specs: Vec<AssetSpec>,
    engine: Engine,
    subscriptions: SubscriptionManager,
    authenticator: Arc<dyn Authenticator>,
    clock: Arc<dyn Clock>,
    history: Option<Arc<dyn HistoryFetcher>>,
    policy: ReconnectPolicy,
    tracker: ConnectionTracker,
    ids: RequestIds,
    outbound: OutboundQueue,
    status: watch::Sender<FeedStatus>,
    shutdown: watch::Receiver<bool>,
}

impl<T> std::fmt::Debug for FeedSupervisor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSupervisor")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl<T> FeedSupervisor<T>
where
    T: Transport,
{
    /// Validates both configurations and resolves every asset channel before returning.
    pub fn new(
        transport: T,
        feed: FeedConfig,
        engine: &EngineConfig,
        chart: Arc<dyn ChartSink>,
        report: Arc<dyn ReportSink>,
        authenticator: Arc<dyn Authenticator>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        feed.validate()?;
        engine.validate()?;

        let subscriptions = SubscriptionManager::new(&engine.assets, feed.ticker_interval)?;
        let tracker = ConnectionTracker::new();
        let (status, _) = watch::channel(FeedStatus::from(&tracker));

        Ok(Self {
            transport,
            policy: ReconnectPolicy::from(&feed),
            config: feed,
            specs: engine.assets.clone(),
            engine: Engine::new(engine, chart, report),
            subscriptions,
            authenticator,
            clock: Arc::new(SystemClock),
            history: None,
            tracker,
            ids: RequestIds::new(),
            outbound: OutboundQueue::new(),
            status,
            shutdown,
        })
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    /// Pre-seed every asset's window from `history` before the first connection.
    pub fn with_backfill(self, history: Arc<dyn HistoryFetcher>) -> Self {
        Self {
            history: Some(history),
            ..self
        }
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status.subscribe()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run until shutdown, a clean upstream close, or reconnect attempts are exhausted.
    ///
    /// Only exhaustion is an error: [`FeedError::Unavailable`].
    pub async fn run(mut self) -> Result<(), FeedError> {
        self.backfill().await;

        loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested before connecting");
                break;
            }

            self.transition(ConnectionEvent::Connect);
            match self.session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::RateLimited => {
                    if self.wait_out_cooldown().await == SessionEnd::Shutdown {
                        break;
                    }
                    continue;
                }
                SessionEnd::Disconnected => {}
            }

            match self.policy.decide(&mut self.tracker) {
                ReconnectDecision::Stop => {
                    info!("feed closed cleanly by upstream, not reconnecting");
                    self.publish_status();
                    break;
                }
                ReconnectDecision::RetryAfter(delay) => {
                    info!(
                        delay_secs = delay.as_secs(),
                        attempt = self.tracker.reconnect_attempts(),
                        max_attempts = self.policy.max_attempts,
                        "reconnecting after backoff"
                    );
                    self.publish_status();

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(&mut self.shutdown) => {
                            info!("shutdown requested during backoff");
                            break;
                        }
                    }
                }
                ReconnectDecision::Exhausted => {
                    let attempts = self.tracker.reconnect_attempts();
                    error!(attempts, "reconnect attempts exhausted, feed unavailable");
                    self.status.send_replace(FeedStatus::Unavailable { attempts });
                    self.log_pending_reports();
                    return Err(FeedError::Unavailable { attempts });
                }
            }
        }

        self.log_pending_reports();
        Ok(())
    }

    async fn backfill(&mut self) {
        let Some(history) = self.history.clone() else {
            return;
        };

        for spec in &self.specs {
            match history.fetch_recent_history(spec).await {
                Ok(samples) => {
                    let seeded = self.engine.seed(&spec.asset, samples);
                    info!(asset = %spec.asset, seeded, "price window pre-seeded from history");
                }
                Err(error) => {
                    warn!(asset = %spec.asset, %error, "history backfill failed, continuing without")
                }
            }
        }
    }

    /// Drive one connection from connect until it ends.
    async fn session(&mut self) -> SessionEnd {
        self.subscriptions.reset();
        self.outbound.clear();

        if let Err(error) = self.transport.connect(&self.config.url).await {
            return match FeedError::from(error) {
                FeedError::RateLimited(message) => {
                    warn!(%message, "feed connect rate limited");
                    self.transition(ConnectionEvent::Closed(None));
                    self.rate_limited();
                    SessionEnd::RateLimited
                }
                error => {
                    warn!(%error, "feed connect failed");
                    self.transition(ConnectionEvent::Closed(None));
                    SessionEnd::Disconnected
                }
            };
        }
        self.transition(ConnectionEvent::Connected);

        let auth = JsonRpcRequest::auth(self.authenticator.auth_params());
        if let Err(end) = self.send(auth).await {
            return end;
        }

        loop {
            let cooldown = self.outbound.paused_until();

            let result = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut self.shutdown) => {
                    info!("shutdown requested, closing feed connection");
                    self.transition(ConnectionEvent::Shutdown);
                    self.transport.close().await;
                    self.transition(ConnectionEvent::Closed(None));
                    return SessionEnd::Shutdown;
                }

                _ = tokio::time::sleep_until(cooldown.unwrap_or_else(Instant::now)), if cooldown.is_some() => {
                    self.resume().await
                }

                event = self.transport.next_event() => self.handle_event(event).await,
            };

            if let Err(end) = result {
                return end;
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<(), SessionEnd> {
        match event {
            TransportEvent::Message(text) => self.handle_message(&text).await,
            TransportEvent::Closed { code, reason } => {
                info!(?code, %reason, state = %self.tracker.state(), "feed connection closed");
                self.transition(ConnectionEvent::Closed(code));
                if code != Some(CLOSE_CODE_NORMAL) && self.outbound.is_paused() {
                    Err(SessionEnd::RateLimited)
                } else {
                    Err(SessionEnd::Disconnected)
                }
            }
            TransportEvent::Error(message) => match FeedError::from_transport_message(message) {
                FeedError::RateLimited(message) => {
                    warn!(%message, "transport reported rate limiting");
                    self.rate_limited();
                    Ok(())
                }
                error => Err(self.disconnect(error).await),
            },
        }
    }

    async fn handle_message(&mut self, text: &str) -> Result<(), SessionEnd> {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, payload = %text, "discarding unparsable feed message");
                return Ok(());
            }
        };

        match message {
            InboundMessage::Response { id, outcome } if id == AUTH_REQUEST_ID => {
                self.handle_auth(outcome).await
            }
            InboundMessage::Response { id, outcome } => self.handle_response(id, outcome).await,
            InboundMessage::Subscription { channel, data } => {
                self.handle_tick(&channel, &data);
                Ok(())
            }
            InboundMessage::Heartbeat(HeartbeatKind::TestRequest) => {
                trace!("answering heartbeat test request");
                let test = JsonRpcRequest::test(self.ids.next_id());
                self.send(test).await
            }
            InboundMessage::Heartbeat(HeartbeatKind::Heartbeat) => {
                trace!("heartbeat");
                Ok(())
            }
        }
    }

    async fn handle_auth(&mut self, outcome: Result<Value, RpcError>) -> Result<(), SessionEnd> {
        match outcome {
            Ok(_) => {
                info!("feed authenticated");
                self.transition(ConnectionEvent::Authenticated);

                if let Some(interval) = self.config.heartbeat_interval {
                    let heartbeat =
                        JsonRpcRequest::set_heartbeat(self.ids.next_id(), interval.as_secs());
                    self.send(heartbeat).await?;
                }
                self.subscribe().await
            }
            Err(error) if error.is_rate_limit() => {
                warn!(message = %error.message, "authentication rate limited, retrying after cooldown");
                self.rate_limited();
                let auth = JsonRpcRequest::auth(self.authenticator.auth_params());
                self.send(auth).await
            }
            Err(error) => Err(self
                .disconnect(FeedError::AuthRejected {
                    code: error.code,
                    message: error.message,
                })
                .await),
        }
    }

    async fn handle_response(
        &mut self,
        id: u64,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), SessionEnd> {
        match self.subscriptions.acknowledge(id, &outcome) {
            Acknowledgement::Confirmed(channels) => {
                info!(?channels, "subscription confirmed");
                if self.tracker.state() == ConnectionState::Subscribing
                    && self.subscriptions.all_confirmed()
                {
                    info!(
                        channels = self.subscriptions.subscribed_len(),
                        "all subscriptions confirmed, streaming"
                    );
                    self.transition(ConnectionEvent::SubscriptionsConfirmed);
                }
                Ok(())
            }
            Acknowledgement::RateLimited(channels) => {
                warn!(?channels, "subscription rate limited, retrying after cooldown");
                self.rate_limited();
                Ok(())
            }
            Acknowledgement::Rejected(error) => Err(self.disconnect(error).await),
            Acknowledgement::Unknown => {
                match outcome {
                    Err(error) if error.is_rate_limit() => {
                        warn!(id, message = %error.message, "request rate limited");
                        self.rate_limited();
                    }
                    Err(error) => warn!(id, code = error.code, message = %error.message, "request failed"),
                    Ok(_) => trace!(id, "request acknowledged"),
                }
                Ok(())
            }
        }
    }

    fn handle_tick(&mut self, channel: &str, data: &Value) {
        if !matches!(
            self.tracker.state(),
            ConnectionState::Subscribing | ConnectionState::Streaming
        ) {
            debug!(%channel, state = %self.tracker.state(), "ignoring tick outside of subscription");
            return;
        }

        let Some(asset) = self.subscriptions.asset_for_channel(channel).cloned() else {
            debug!(%channel, "ignoring notification for unknown channel");
            return;
        };

        let price = match self.config.price_field.extract(data) {
            Ok(price) => price,
            Err(error) => {
                warn!(%asset, %error, "discarding tick without price");
                return;
            }
        };

        match self.engine.ingest(&asset, price, self.clock.now()) {
            Ok(outcome) => log_outcome(&asset, outcome),
            Err(error) => warn!(%error, "discarding tick"),
        }
    }

    /// Issue subscribe requests for every asset not yet subscribed on this connection.
    async fn subscribe(&mut self) -> Result<(), SessionEnd> {
        let requests = self
            .subscriptions
            .ensure_subscribed(self.engine.assets(), &mut self.ids);

        for request in requests {
            self.send(request).await?;
        }
        Ok(())
    }

    async fn send(&mut self, request: JsonRpcRequest) -> Result<(), SessionEnd> {
        let Some(frame) = self.outbound.submit(request.to_frame()) else {
            debug!(method = %request.method, id = request.id, "outbound paused, request queued");
            return Ok(());
        };
        self.send_frame(frame).await
    }

    async fn send_frame(&mut self, frame: String) -> Result<(), SessionEnd> {
        match self.transport.send(frame).await {
            Ok(()) => Ok(()),
            Err(error) => Err(self.disconnect(FeedError::from(error)).await),
        }
    }

    fn rate_limited(&mut self) {
        let cooldown = self.config.rate_limit_cooldown;
        self.outbound.pause(Instant::now() + cooldown);

        let until = self.clock.now()
            + chrono::TimeDelta::from_std(cooldown).unwrap_or(chrono::TimeDelta::zero());
        warn!(cooldown_secs = cooldown.as_secs(), "rate limited, pausing outbound requests");
        self.status.send_replace(FeedStatus::RateLimited { until });
    }

    /// Sleep until the active rate limit cooldown ends, aborted by shutdown.
    async fn wait_out_cooldown(&mut self) -> SessionEnd {
        let until = self.outbound.paused_until().unwrap_or_else(Instant::now);
        let remaining = until.saturating_duration_since(Instant::now());
        info!(
            remaining_secs = remaining.as_secs(),
            "reconnecting once rate limit cooldown elapses"
        );
        self.status.send_replace(FeedStatus::RateLimited {
            until: self.clock.now()
                + chrono::TimeDelta::from_std(remaining).unwrap_or(chrono::TimeDelta::zero()),
        });

        tokio::select! {
            _ = tokio::time::sleep_until(until) => {
                self.outbound.clear();
                SessionEnd::RateLimited
            }
            _ = wait_for_shutdown(&mut self.shutdown) => {
                info!("shutdown requested during rate limit cooldown");
                SessionEnd::Shutdown
            }
        }
    }

    /// Cooldown elapsed: flush queued requests and re-issue rate limited subscriptions.
    async fn resume(&mut self) -> Result<(), SessionEnd> {
        let queued = self.outbound.resume();
        info!(queued = queued.len(), "rate limit cooldown over, resuming outbound requests");
        self.publish_status();

        for frame in queued {
            self.send_frame(frame).await?;
        }

        // Subscribing is only entered once authenticated
        if matches!(
            self.tracker.state(),
            ConnectionState::Subscribing | ConnectionState::Streaming
        ) {
            self.subscribe().await?;
        }
        Ok(())
    }

    /// Tear down the current connection after an error that is terminal for it.
    async fn disconnect(&mut self, error: FeedError) -> SessionEnd {
        error!(%error, state = %self.tracker.state(), "feed connection failed");
        self.transport.close().await;
        self.transition(ConnectionEvent::Closed(None));
        SessionEnd::Disconnected
    }

    fn transition(&mut self, event: ConnectionEvent) {
        match self.tracker.apply(event) {
            Ok(state) => {
                debug!(%state, ?event, "feed connection transition");
                self.publish_status();
            }
            Err(error) => warn!(%error, "ignoring feed connection transition"),
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(FeedStatus::from(&self.tracker));
    }

    fn log_pending_reports(&self) {
        for (asset, pending) in self.engine.pending_report_points() {
            if pending > 0 {
                info!(%asset, pending, "dropping undrained report points");
            }
        }
    }
}

fn log_outcome(asset: &Asset, outcome: TickOutcome) {
    match outcome {
        TickOutcome::WarmingUp {
            progress,
            window_fill,
        } => debug!(%asset, progress, window_fill, "warming up"),
        TickOutcome::Gated => trace!(%asset, "estimation not due"),
        TickOutcome::InsufficientData => debug!(%asset, "insufficient data for estimate"),
        TickOutcome::FlatMarket | TickOutcome::Estimated { .. } => {}
    }
}

/// Completes once shutdown is signalled, or the shutdown sender is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asset::ProductFamily,
        auth::ClientCredentials,
        backfill::HistoryFetcher,
        engine::tests::RecordingSink,
        error::{BackfillError, TransportError},
        transport::mock::{MockHandle, MockTransport, Responder},
        window::PriceSample,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    const BTC_CHANNEL: &str = "ticker.BTC-PERPETUAL.raw";

    struct TokioClock {
        start: Instant,
        epoch: DateTime<Utc>,
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.epoch + TimeDelta::from_std(self.start.elapsed()).unwrap()
        }
    }

    /// Replies to every request like the upstream would, optionally rejecting auth or rate
    /// limiting the first subscribe.
    fn responder(auth_error: Option<i64>, rate_limit_first_subscribe: bool) -> Responder {
        let mut limited = false;

        Box::new(move |frame| {
            let request = serde_json::from_str::<Value>(frame).unwrap();
            let id = request["id"].as_u64().unwrap();

            let reply = match request["method"].as_str().unwrap() {
                METHOD_AUTH => match auth_error {
                    Some(code) => json!({"id": id, "error": {"code": code, "message": "invalid_credentials"}}),
                    None => json!({"id": id, "result": {"access_token": "token", "expires_in": 900}}),
                },
                METHOD_SUBSCRIBE if rate_limit_first_subscribe && !limited => {
                    limited = true;
                    json!({"id": id, "error": {"code": 10028, "message": "too_many_requests"}})
                }
                METHOD_SUBSCRIBE => json!({"id": id, "result": request["params"]["channels"]}),
                _ => json!({"id": id, "result": "ok"}),
            };

            vec![TransportEvent::Message(reply.to_string())]
        })
    }

    fn ticker(channel: &str, price: f64) -> TransportEvent {
        TransportEvent::Message(
            json!({
                "jsonrpc": "2.0",
                "method": "subscription",
                "params": {
                    "channel": channel,
                    "data": {"mark_price": price, "last_price": price + 1.0, "timestamp": 1}
                }
            })
            .to_string(),
        )
    }

    fn supervisor(
        transport: MockTransport,
        sink: &Arc<RecordingSink>,
        max_attempts: u32,
    ) -> (FeedSupervisor<MockTransport>, watch::Sender<bool>) {
        supervisor_for(transport, sink, max_attempts, &["BTC"])
    }

    fn supervisor_for(
        transport: MockTransport,
        sink: &Arc<RecordingSink>,
        max_attempts: u32,
        assets: &[&str],
    ) -> (FeedSupervisor<MockTransport>, watch::Sender<bool>) {
        let feed = FeedConfig::new(Url::parse("wss://feed.test/ws/api/v2").unwrap())
            .with_max_reconnect_attempts(max_attempts);
        let specs = assets
            .iter()
            .map(|asset| AssetSpec::new(*asset, ProductFamily::CryptoPerpetual))
            .collect();
        let engine = EngineConfig::new(specs)
            .with_report_threshold(2)
            .with_cadence_interval(Duration::from_secs(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = FeedSupervisor::new(
            transport,
            feed,
            &engine,
            sink.clone(),
            sink.clone(),
            Arc::new(ClientCredentials::new("id", "secret")),
            shutdown_rx,
        )
        .unwrap()
        .with_clock(Arc::new(TokioClock {
            start: Instant::now(),
            epoch: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }));

        (supervisor, shutdown_tx)
    }

    async fn wait_for_state(
        status: &mut watch::Receiver<FeedStatus>,
        state: ConnectionState,
        attempts: u32,
    ) {
        status
            .wait_for(|status| {
                *status
                    == FeedStatus::Connection {
                        state,
                        reconnect_attempts: attempts,
                    }
            })
            .await
            .unwrap();
    }

    fn count(handle: &MockHandle, method: &str) -> usize {
        handle
            .sent_methods()
            .iter()
            .filter(|sent| sent.as_str() == method)
            .count()
    }

    use crate::protocol::{METHOD_AUTH, METHOD_SET_HEARTBEAT, METHOD_SUBSCRIBE, METHOD_TEST};

    #[tokio::test(start_paused = true)]
    async fn test_handshake_and_tick_dispatch() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, false));
        let (supervisor, shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;
        assert_eq!(
            handle.sent_methods(),
            vec![METHOD_AUTH, METHOD_SET_HEARTBEAT, METHOD_SUBSCRIBE]
        );
        let auth = serde_json::from_str::<Value>(&handle.sent()[0]).unwrap();
        assert_eq!(auth["id"], json!(AUTH_REQUEST_ID));
        assert_eq!(auth["params"]["grant_type"], json!("client_credentials"));

        handle.push(ticker(BTC_CHANNEL, 100.0));
        handle.push(ticker(BTC_CHANNEL, 101.0));
        handle.push(TransportEvent::Message("not json".to_string()));
        handle.push(ticker("ticker.ETH-PERPETUAL.raw", 2000.0));
        handle.push(TransportEvent::Message(
            json!({"method": "subscription", "params": {"channel": BTC_CHANNEL, "data": {}}})
                .to_string(),
        ));
        handle.push(ticker(BTC_CHANNEL, 102.0));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // First estimate at the second tick, third tick gated
        assert_eq!(sink.charts.lock().unwrap().len(), 1);

        handle.push(ticker(BTC_CHANNEL, 103.0));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.charts.lock().unwrap().len(), 2);
        assert_eq!(sink.reports.lock().unwrap().len(), 1);

        handle.push(TransportEvent::Message(
            json!({"method": "heartbeat", "params": {"type": "test_request"}}).to_string(),
        ));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count(&handle, METHOD_TEST), 1);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.connect_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_back_off_until_unavailable() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new(
            std::iter::repeat_n(Err(TransportError::NotConnected), 4),
            responder(None, false),
        );
        let (supervisor, _shutdown) = supervisor(transport, &sink, 3);
        let status = supervisor.status();

        assert_eq!(
            supervisor.run().await,
            Err(FeedError::Unavailable { attempts: 3 })
        );
        assert_eq!(*status.borrow(), FeedStatus::Unavailable { attempts: 3 });

        let connects = handle.connect_times();
        let delays = connects
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_does_not_reconnect() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, false));
        let (supervisor, _shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;
        handle.push(TransportEvent::Closed {
            code: Some(1000),
            reason: "normal".to_string(),
        });

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.connect_times().len(), 1);
        assert_eq!(
            *status.borrow(),
            FeedStatus::Connection {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_and_resubscribes() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, false));
        let (supervisor, shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;
        handle.push(TransportEvent::Closed {
            code: Some(1006),
            reason: "abnormal".to_string(),
        });

        wait_for_state(&mut status, ConnectionState::Disconnected, 1).await;
        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;

        let connects = handle.connect_times();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1] - connects[0], Duration::from_secs(1));
        assert_eq!(count(&handle, METHOD_AUTH), 2);
        assert_eq!(count(&handle, METHOD_SUBSCRIBE), 2);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_subscribe_pauses_then_resubscribes() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, true));
        let (supervisor, shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|status| matches!(status, FeedStatus::RateLimited { .. }))
            .await
            .unwrap();

        // Outbound requests are queued during the cooldown
        handle.push(TransportEvent::Message(
            json!({"method": "heartbeat", "params": {"type": "test_request"}}).to_string(),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&handle, METHOD_TEST), 0);

        let paused = Instant::now();
        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;
        assert!(paused.elapsed() >= Duration::from_secs(8));

        assert_eq!(
            handle.sent_methods(),
            vec![
                METHOD_AUTH,
                METHOD_SET_HEARTBEAT,
                METHOD_SUBSCRIBE,
                METHOD_TEST,
                METHOD_SUBSCRIBE
            ]
        );
        assert_eq!(handle.connect_times().len(), 1);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_goes_through_backoff() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(Some(13004), false));
        let (supervisor, _shutdown) = supervisor(transport, &sink, 2);

        assert_eq!(
            supervisor.run().await,
            Err(FeedError::Unavailable { attempts: 2 })
        );
        assert_eq!(handle.connect_times().len(), 3);
        assert_eq!(count(&handle, METHOD_AUTH), 3);
        assert_eq!(count(&handle, METHOD_SUBSCRIBE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_backoff() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new(
            std::iter::repeat_n(Err(TransportError::NotConnected), 10),
            responder(None, false),
        );
        let (supervisor, shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Disconnected, 1).await;
        shutdown.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.connect_times().len(), 1);
    }

    fn rate_limited_connect() -> Result<(), TransportError> {
        Err(TransportError::Connect {
            url: "wss://feed.test/ws/api/v2".to_string(),
            reason: "HTTP error: 429 Too Many Requests".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_connect_waits_cooldown_without_attempts() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new(
            std::iter::repeat_with(rate_limited_connect).take(3),
            responder(None, false),
        );
        // Any reconnect attempt would exhaust immediately
        let (supervisor, shutdown) = supervisor(transport, &sink, 0);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|status| matches!(status, FeedStatus::RateLimited { .. }))
            .await
            .unwrap();
        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;

        let connects = handle.connect_times();
        let delays = connects
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![10, 10, 10]);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_transport_error_reconnects_after_cooldown() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, false));
        let (supervisor, shutdown) = supervisor(transport, &sink, 0);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;

        // WebSocketTransport drops the connection after any read error
        handle.push(TransportEvent::Error(
            "WebSocket protocol error: too_many_requests".to_string(),
        ));
        handle.push(TransportEvent::Closed {
            code: None,
            reason: "transport is not connected".to_string(),
        });

        status
            .wait_for(|status| matches!(status, FeedStatus::RateLimited { .. }))
            .await
            .unwrap();
        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;

        let connects = handle.connect_times();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1] - connects[0], Duration::from_secs(10));
        assert_eq!(count(&handle, METHOD_AUTH), 2);
        assert_eq!(count(&handle, METHOD_SUBSCRIBE), 2);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_rate_limit_cooldown() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new(
            std::iter::repeat_with(rate_limited_connect).take(10),
            responder(None, false),
        );
        let (supervisor, shutdown) = supervisor(transport, &sink, 10);
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        status
            .wait_for(|status| matches!(status, FeedStatus::RateLimited { .. }))
            .await
            .unwrap();
        shutdown.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.connect_times().len(), 1);
    }

    struct StaticHistory;

    #[async_trait]
    impl HistoryFetcher for StaticHistory {
        async fn fetch_recent_history(
            &self,
            spec: &AssetSpec,
        ) -> Result<Vec<PriceSample>, BackfillError> {
            if spec.asset.as_str() != "BTC" {
                return Err(BackfillError::Http("unreachable".to_string()));
            }
            let start = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
            Ok((0..5)
                .map(|i| PriceSample {
                    timestamp: start + TimeDelta::minutes(i),
                    price: 100.0 + i as f64,
                })
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_preseeds_windows() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, _handle) = MockTransport::new([], responder(None, false));
        let (supervisor, _shutdown) = supervisor(transport, &sink, 10);
        let mut supervisor = supervisor.with_backfill(Arc::new(StaticHistory));

        supervisor.backfill().await;

        let window = &supervisor.engine().pipeline(&Asset::new("BTC")).unwrap().window;
        assert_eq!(window.len(), 5);
        assert!(sink.charts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backfill_does_not_block_live_ingestion() {
        let sink = Arc::new(RecordingSink::default());
        let (transport, handle) = MockTransport::new([], responder(None, false));
        let (supervisor, shutdown) = supervisor_for(transport, &sink, 10, &["BTC", "ETH"]);
        let supervisor = supervisor.with_backfill(Arc::new(StaticHistory));
        let mut status = supervisor.status();
        let task = tokio::spawn(supervisor.run());

        wait_for_state(&mut status, ConnectionState::Streaming, 0).await;
        assert_eq!(count(&handle, METHOD_SUBSCRIBE), 2);

        // BTC is pre-seeded so estimates on its first live tick, ETH warms up from live ticks
        handle.push(ticker(BTC_CHANNEL, 106.0));
        handle.push(ticker("ticker.ETH-PERPETUAL.raw", 2000.0));
        handle.push(ticker("ticker.ETH-PERPETUAL.raw", 2010.0));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let charted = sink
            .charts
            .lock()
            .unwrap()
            .iter()
            .map(|(asset, _)| asset.clone())
            .collect::<Vec<_>>();
        assert_eq!(charted, vec![Asset::new("BTC"), Asset::new("ETH")]);

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }
}
