use crate::error::AppError;
use crate::market::registry::ConnectionRegistry;
use crate::market::store::LiveStore;
use crate::market::types::{ConnectionKey, DashboardConfig};
use crate::market::upload::UploadSession;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer task that owns one key's subscription.
pub struct StreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

impl StreamHandle {
    /// Cancels the consumer and waits for it to drop its subscription.
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}

pub struct UploadStreamHandle {
    pub epoch: u64,
    pub stream: StreamHandle,
}

/// Composition root shared by every command.
pub struct AppState {
    pub started_at: Instant,
    pub config: DashboardConfig,
    pub http_client: Client,
    pub registry: ConnectionRegistry,
    pub live: Arc<LiveStore>,
    pub live_streams: Mutex<HashMap<ConnectionKey, StreamHandle>>,
    pub upload: Arc<parking_lot::Mutex<UploadSession>>,
    pub upload_stream: Mutex<Option<UploadStreamHandle>>,
}

impl AppState {
    pub fn new(config: DashboardConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(config, http_client))
    }

    pub fn with_client(config: DashboardConfig, http_client: Client) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            http_client,
            registry: ConnectionRegistry::new(),
            live: Arc::new(LiveStore::new()),
            live_streams: Mutex::new(HashMap::new()),
            upload: Arc::new(parking_lot::Mutex::new(UploadSession::new())),
            upload_stream: Mutex::new(None),
        }
    }
}
