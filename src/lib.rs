pub mod commands;
pub mod error;
pub mod market;
pub mod state;

pub use error::AppError;

use commands::{
    health::health,
    live_stream::{
        load_history, start_alerts, start_live_analytics, start_live_candles, stop_all_streams,
    },
    upload_stream::clear_upload,
};
use market::types::{DashboardConfig, SubscribeArgs};
use state::AppState;
use std::time::Duration;
use tracing::{info, warn};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .compact()
        .init()
}

pub fn run() -> Result<(), AppError> {
    init_logging();
    let config = DashboardConfig::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: DashboardConfig) -> Result<(), AppError> {
    info!(
        api = %config.api_base_url,
        ws = %config.ws_base_url,
        symbol = %config.symbol,
        timeframe = config.timeframe.as_str(),
        "starting dashboard stream"
    );
    let state = AppState::new(config)?;
    let args = SubscribeArgs {
        symbol: Some(state.config.symbol.clone()),
        timeframe: Some(state.config.timeframe),
        ..Default::default()
    };

    if let Err(error) = load_history(&state, Some(args.clone())).await {
        warn!(error = %error, "initial history load failed; continuing with live bars only");
    }
    start_live_candles(&state, Some(args.clone())).await?;
    start_live_analytics(&state, Some(args)).await?;
    start_alerts(&state, None).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let report = health(&state);
                for connection in &report.connections {
                    info!(
                        key = %connection.key,
                        state = connection.state.as_str(),
                        attempt = connection.attempt,
                        reason = ?connection.reason,
                        "connection status"
                    );
                }
                info!(
                    status = report.status,
                    uptime_ms = report.uptime_ms as u64,
                    alerts = state.live.alerts().len(),
                    "dashboard stream health"
                );
            }
        }
    }

    let stopped = stop_all_streams(&state).await;
    clear_upload(&state).await;
    state.registry.shutdown().await;
    info!(stopped, "dashboard stream stopped");
    Ok(())
}
