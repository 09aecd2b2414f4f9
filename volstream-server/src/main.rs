use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use volstream::{
    Config, DeribitHistory, FeedStatus, FeedSupervisor, WebSocketTransport, error::ConfigError,
};

mod chart_server;
mod sink;

use sink::{BroadcastChartSink, ChannelReportSink, run_report_writer};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    init_logging();

    info!("Starting volstream server");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let Some(credentials) = config.credentials.clone() else {
        error!(
            error = %ConfigError::Missing("VOLSTREAM_CLIENT_ID"),
            "API credentials are required"
        );
        return ExitCode::FAILURE;
    };

    let assets = config
        .engine
        .assets
        .iter()
        .map(|spec| format!("{}={}", spec.asset, spec.family))
        .collect::<Vec<_>>();
    info!(
        url = %config.feed.url,
        ?assets,
        window = config.engine.window_capacity,
        lambda = config.engine.lambda.value(),
        cadence_secs = config.engine.cadence_interval.as_secs_f64(),
        report_threshold = config.engine.report_threshold,
        "volstream configuration loaded"
    );

    // Chart clients
    info!(buffer = config.server.chart_buffer, "chart broadcast buffer size");
    let chart = BroadcastChartSink::new(config.server.chart_buffer);
    let chart_addr = config.server.chart_addr;
    let server_sink = chart.clone();
    tokio::spawn(async move {
        if let Err(error) = chart_server::start_chart_server(chart_addr, server_sink).await {
            error!(%chart_addr, %error, "chart server failed");
        }
    });

    // Reports
    let (report, report_rx) = ChannelReportSink::new(config.server.report_buffer);
    let report_writer = tokio::spawn(run_report_writer(report_rx));

    // Shutdown on ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(error) => warn!(%error, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let transport = WebSocketTransport::new(config.feed.read_timeout);
    let supervisor = match FeedSupervisor::new(
        transport,
        config.feed.clone(),
        &config.engine,
        Arc::new(chart),
        Arc::new(report),
        Arc::new(credentials),
        shutdown_rx,
    ) {
        Ok(supervisor) => supervisor,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = if config.backfill.enabled {
        supervisor.with_backfill(Arc::new(DeribitHistory::new(
            config.backfill.rest_url.clone(),
            config.backfill.lookback,
            config.engine.window_capacity,
        )))
    } else {
        supervisor
    };

    // Log every feed status change
    let mut status = supervisor.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            match current {
                FeedStatus::Unavailable { attempts } => error!(attempts, "feed unavailable"),
                other => info!(status = %other, "feed status"),
            }
        }
    });

    let result = supervisor.run().await;

    // Supervisor owned the last report sink, the writer drains and stops
    if let Err(error) = report_writer.await {
        warn!(%error, "report writer task failed");
    }

    match result {
        Ok(()) => {
            info!("volstream server stopped");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "volstream server stopping");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
