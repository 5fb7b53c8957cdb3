use crate::error::AppError;
use crate::market::api::{
    alerts_stream_endpoint, analytics_stream_endpoint, fetch_analytics, fetch_ohlc_history,
    fetch_pair_analytics, fetch_symbols, ohlc_stream_endpoint, pair_stream_endpoint,
};
use crate::market::registry::Subscription;
use crate::market::router::{route_live_frame, LiveChannel};
use crate::market::store::LiveStore;
use crate::market::supervisor::{ReconnectPolicy, StreamEvent};
use crate::market::transport::{TransportFactory, WebSocketFactory};
use crate::market::types::{
    Alert, AnalyticsSnapshot, Bar, ChannelArgs, ConnectionKey, ConnectionStatusSnapshot,
    PairSubscribeArgs, SubscribeArgs,
};
use crate::state::{AppState, StreamHandle};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStreamSession {
    pub key: ConnectionKey,
    pub endpoint: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLoadResult {
    pub key: ConnectionKey,
    pub received: usize,
    pub kept: usize,
}

pub async fn start_live_candles(
    state: &AppState,
    args: Option<SubscribeArgs>,
) -> Result<LiveStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::ohlc(&config.symbol, config.timeframe);
    let endpoint =
        ohlc_stream_endpoint(&state.config.ws_base_url, &config.symbol, config.timeframe);

    start_stream_with_factory(
        state,
        key,
        LiveChannel::Candles,
        Arc::new(WebSocketFactory::new(endpoint)),
        config.reconnect,
        config.channel_buffer_size,
    )
    .await
}

pub async fn start_live_analytics(
    state: &AppState,
    args: Option<SubscribeArgs>,
) -> Result<LiveStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::analytics(&config.symbol);
    let endpoint = analytics_stream_endpoint(&state.config.ws_base_url, &config.symbol);

    start_stream_with_factory(
        state,
        key,
        LiveChannel::Analytics,
        Arc::new(WebSocketFactory::new(endpoint)),
        config.reconnect,
        config.channel_buffer_size,
    )
    .await
}

pub async fn start_pair_analytics(
    state: &AppState,
    args: Option<PairSubscribeArgs>,
) -> Result<LiveStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::pair(&config.symbol_a, &config.symbol_b);
    let endpoint =
        pair_stream_endpoint(&state.config.ws_base_url, &config.symbol_a, &config.symbol_b);

    start_stream_with_factory(
        state,
        key,
        LiveChannel::Analytics,
        Arc::new(WebSocketFactory::new(endpoint)),
        config.reconnect,
        config.channel_buffer_size,
    )
    .await
}

pub async fn start_alerts(
    state: &AppState,
    args: Option<ChannelArgs>,
) -> Result<LiveStreamSession, AppError> {
    let (channel_buffer_size, reconnect) = args.unwrap_or_default().normalize()?;
    let endpoint = alerts_stream_endpoint(&state.config.ws_base_url);

    start_stream_with_factory(
        state,
        ConnectionKey::alerts(),
        LiveChannel::Alerts,
        Arc::new(WebSocketFactory::new(endpoint)),
        reconnect,
        channel_buffer_size,
    )
    .await
}

/// Replaces any consumer already running for `key`, then opens the key and
/// routes its frames into the live store.
pub(crate) async fn start_stream_with_factory(
    state: &AppState,
    key: ConnectionKey,
    channel: LiveChannel,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    channel_buffer_size: usize,
) -> Result<LiveStreamSession, AppError> {
    let existing_handle = {
        let mut streams = state.live_streams.lock().await;
        streams.remove(&key)
    };
    if let Some(handle) = existing_handle {
        handle.stop().await;
    }

    let endpoint = factory.endpoint().to_string();
    let subscription = state
        .registry
        .open(key.clone(), factory, policy, channel_buffer_size);
    let generation = subscription.generation();

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let live = Arc::clone(&state.live);
    let join_handle = tokio::spawn(async move {
        run_live_consumer(subscription, channel, live, task_token).await;
    });

    {
        let mut streams = state.live_streams.lock().await;
        streams.insert(
            key.clone(),
            StreamHandle {
                cancellation_token,
                join_handle,
            },
        );
    }

    Ok(LiveStreamSession {
        key,
        endpoint,
        generation,
    })
}

async fn run_live_consumer(
    mut subscription: Subscription,
    channel: LiveChannel,
    live: Arc<LiveStore>,
    cancellation_token: CancellationToken,
) {
    let key = subscription.key().clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            event = subscription.next_event() => event,
        };

        match event {
            Some(StreamEvent::Frame(frame)) => {
                if let Some(event) = route_live_frame(channel, frame) {
                    live.apply(&key, event);
                }
            }
            Some(StreamEvent::Status(status)) => {
                debug!(
                    key = %key,
                    state = status.state.as_str(),
                    attempt = status.attempt,
                    reason = ?status.reason,
                    "stream status"
                );
            }
            None => break,
        }
    }

    debug!(key = %key, "live consumer stopped");
}

/// Bulk initial load over REST; replaces the key's series wholesale.
pub async fn load_history(
    state: &AppState,
    args: Option<SubscribeArgs>,
) -> Result<HistoryLoadResult, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::ohlc(&config.symbol, config.timeframe);

    let bars = fetch_ohlc_history(
        &state.http_client,
        &state.config.api_base_url,
        &config.symbol,
        config.timeframe,
        config.history_limit,
    )
    .await?;
    let received = bars.len();
    let kept = state.live.set_series(&key, bars);
    info!(key = %key, received, kept, "history loaded");

    Ok(HistoryLoadResult {
        key,
        received,
        kept,
    })
}

/// Seeds the analytics snapshot over REST before the push channel delivers.
pub async fn load_analytics(
    state: &AppState,
    args: Option<SubscribeArgs>,
) -> Result<Option<AnalyticsSnapshot>, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::analytics(&config.symbol);
    let snapshot =
        fetch_analytics(&state.http_client, &state.config.api_base_url, &config.symbol).await?;
    state.live.apply_analytics(&key, snapshot);
    Ok(state.live.analytics(&key))
}

pub async fn load_pair_analytics(
    state: &AppState,
    args: Option<PairSubscribeArgs>,
) -> Result<Option<AnalyticsSnapshot>, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = ConnectionKey::pair(&config.symbol_a, &config.symbol_b);
    let snapshot = fetch_pair_analytics(
        &state.http_client,
        &state.config.api_base_url,
        &config.symbol_a,
        &config.symbol_b,
    )
    .await?;
    state.live.apply_analytics(&key, snapshot);
    Ok(state.live.analytics(&key))
}

pub async fn live_symbols(state: &AppState) -> Result<Vec<String>, AppError> {
    fetch_symbols(&state.http_client, &state.config.api_base_url).await
}

pub async fn stop_stream(state: &AppState, key: &ConnectionKey) -> StreamStopResult {
    let existing_handle = {
        let mut streams = state.live_streams.lock().await;
        streams.remove(key)
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.stop().await;
        true
    } else {
        false
    };
    let closed = state.registry.close(key);

    StreamStopResult {
        stopped: stopped || closed,
    }
}

pub async fn stop_all_streams(state: &AppState) -> usize {
    let handles: Vec<StreamHandle> = {
        let mut streams = state.live_streams.lock().await;
        streams.drain().map(|(_, handle)| handle).collect()
    };

    let stopped = handles.len();
    for handle in handles {
        handle.stop().await;
    }
    stopped
}

pub fn series_snapshot(state: &AppState, key: &ConnectionKey) -> Vec<Bar> {
    state.live.series_snapshot(key)
}

pub fn analytics_snapshot(state: &AppState, key: &ConnectionKey) -> Option<AnalyticsSnapshot> {
    state.live.analytics(key)
}

pub fn alerts_snapshot(state: &AppState) -> Vec<Alert> {
    state.live.alerts()
}

pub fn stream_status(
    state: &AppState,
    key: &ConnectionKey,
) -> Result<ConnectionStatusSnapshot, AppError> {
    state
        .registry
        .status(key)
        .ok_or_else(|| AppError::UnknownKey(key.to_string()))
}
