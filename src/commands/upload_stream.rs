use crate::error::AppError;
use crate::market::api::{fetch_upload_symbols, upload_stream_endpoint, UploadedSymbolInfo};
use crate::market::registry::Subscription;
use crate::market::router::route_upload_frame;
use crate::market::supervisor::{ReconnectPolicy, StreamEvent};
use crate::market::transport::{SseFactory, TransportFactory};
use crate::market::types::{
    normalize_symbol, ConnectionKey, ConnectionState, DEFAULT_CHANNEL_BUFFER_SIZE,
    UPLOAD_SYMBOL_PREFIX,
};
use crate::market::upload::{UploadSession, UploadSnapshot};
use crate::state::{AppState, StreamHandle, UploadStreamHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStreamSession {
    pub key: ConnectionKey,
    pub symbol: String,
    pub endpoint: String,
    pub epoch: u64,
}

fn upload_symbol(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let prefixed = if trimmed
        .get(..UPLOAD_SYMBOL_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(UPLOAD_SYMBOL_PREFIX))
    {
        trimmed.to_string()
    } else {
        format!("{UPLOAD_SYMBOL_PREFIX}{trimmed}")
    };
    normalize_symbol(&prefixed)
}

/// Switches the dashboard to an uploaded dataset: tears down the previous
/// upload stream, resets the session, and streams the new dataset's analytics.
pub async fn select_upload(
    state: &AppState,
    symbol: &str,
) -> Result<UploadStreamSession, AppError> {
    let symbol = upload_symbol(symbol)?;
    let endpoint = upload_stream_endpoint(&state.config.api_base_url, &symbol);
    let factory = Arc::new(SseFactory::new(state.http_client.clone(), endpoint));
    start_upload_with_factory(state, symbol, factory).await
}

/// The handle slot stays locked from teardown of the previous stream until the
/// new handle is stored, so overlapping selections run one after another.
pub(crate) async fn start_upload_with_factory(
    state: &AppState,
    symbol: String,
    factory: Arc<dyn TransportFactory>,
) -> Result<UploadStreamSession, AppError> {
    let mut upload_stream = state.upload_stream.lock().await;
    stop_upload_handle(upload_stream.take()).await;

    let epoch = {
        let mut session = state.upload.lock();
        let epoch = session.reset(Some(symbol.clone()));
        session.begin_streaming(epoch);
        epoch
    };

    let key = ConnectionKey::upload(&symbol);
    let endpoint = factory.endpoint().to_string();
    let subscription = state.registry.open(
        key.clone(),
        factory,
        ReconnectPolicy::disabled(),
        DEFAULT_CHANNEL_BUFFER_SIZE,
    );

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let session = Arc::clone(&state.upload);
    let join_handle = tokio::spawn(async move {
        run_upload_consumer(subscription, session, epoch, task_token).await;
    });

    *upload_stream = Some(UploadStreamHandle {
        epoch,
        stream: StreamHandle {
            cancellation_token,
            join_handle,
        },
    });
    drop(upload_stream);

    info!(key = %key, epoch, "upload stream started");
    Ok(UploadStreamSession {
        key,
        symbol,
        endpoint,
        epoch,
    })
}

/// A consumer is done once its session is terminal or a newer selection has
/// reset the session.
fn consumer_done(session: &UploadSession, epoch: u64) -> bool {
    session.epoch() != epoch || session.status().is_terminal()
}

/// Returns once the session is terminal, superseded, or the stream is torn
/// down. Dropping the subscription on the way out closes the transport.
async fn run_upload_consumer(
    mut subscription: Subscription,
    session: Arc<Mutex<UploadSession>>,
    epoch: u64,
    cancellation_token: CancellationToken,
) {
    let key = subscription.key().clone();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            event = subscription.next_event() => event,
        };

        let done = match event {
            Some(StreamEvent::Frame(frame)) => {
                let Some(event) = route_upload_frame(frame) else {
                    continue;
                };
                let mut session = session.lock();
                session.apply(epoch, event);
                consumer_done(&session, epoch)
            }
            Some(StreamEvent::Status(status)) => {
                let mut session = session.lock();
                if matches!(
                    status.state,
                    ConnectionState::Error
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected
                ) {
                    session.fail(epoch, status.reason);
                }
                consumer_done(&session, epoch)
            }
            None => {
                session
                    .lock()
                    .fail(epoch, Some("upload stream ended".to_string()));
                true
            }
        };

        if done {
            break;
        }
    }

    debug!(key = %key, epoch, "upload consumer stopped");
}

async fn stop_upload_handle(handle: Option<UploadStreamHandle>) -> bool {
    match handle {
        Some(handle) => {
            debug!(epoch = handle.epoch, "stopping upload stream");
            handle.stream.stop().await;
            true
        }
        None => false,
    }
}

/// Returns to live data: stops any upload stream and fully resets the session.
pub async fn clear_upload(state: &AppState) -> UploadSnapshot {
    let mut upload_stream = state.upload_stream.lock().await;
    stop_upload_handle(upload_stream.take()).await;
    let mut session = state.upload.lock();
    session.reset(None);
    session.snapshot()
}

pub fn upload_snapshot(state: &AppState) -> UploadSnapshot {
    state.upload.lock().snapshot()
}

pub async fn uploaded_symbols(state: &AppState) -> Result<Vec<UploadedSymbolInfo>, AppError> {
    fetch_upload_symbols(&state.http_client, &state.config.api_base_url).await
}
