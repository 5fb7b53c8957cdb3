use crate::error::AppError;
use crate::market::supervisor::{Backoff, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_PAIR_SYMBOL: &str = "ETHUSDT";
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M1;
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_HISTORY_LIMIT: u16 = 500;
pub const MIN_HISTORY_LIMIT: u16 = 1;
pub const MAX_HISTORY_LIMIT: u16 = 1_500;
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_024;
pub const MIN_CHANNEL_BUFFER_SIZE: usize = 16;
pub const MAX_CHANNEL_BUFFER_SIZE: usize = 65_536;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const UPLOAD_SYMBOL_PREFIX: &str = "UPLOAD:";
const UPLOAD_KEY_PREFIX: &str = "upload:";

/// Close code sent by a peer that ends the link on purpose. Every other code
/// is treated as an abnormal drop.
pub const NORMAL_CLOSURE_CODE: u16 = 1000;
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        }
    }

    /// No further automatic activity follows these states.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

/// Identifies one logical subscription, e.g. `ohlc:BTCUSDT:1m`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn ohlc(symbol: &str, timeframe: Timeframe) -> Self {
        Self(format!("ohlc:{symbol}:{}", timeframe.as_str()))
    }

    pub fn analytics(symbol: &str) -> Self {
        Self(format!("analytics:{symbol}"))
    }

    pub fn pair(symbol_a: &str, symbol_b: &str) -> Self {
        Self(format!("pair:{symbol_a}:{symbol_b}"))
    }

    pub fn alerts() -> Self {
        Self("alerts".to_string())
    }

    pub fn upload(symbol: &str) -> Self {
        Self(format!("{UPLOAD_KEY_PREFIX}{symbol}"))
    }

    /// Upload keys are one per dataset and are not kept once released.
    pub fn is_transient(&self) -> bool {
        self.0.starts_with(UPLOAD_KEY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusSnapshot {
    pub key: ConnectionKey,
    pub state: ConnectionState,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl ConnectionStatusSnapshot {
    pub fn idle(key: ConnectionKey) -> Self {
        Self {
            key,
            state: ConnectionState::Idle,
            attempt: 0,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M5 => "5m",
        }
    }

    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        match raw.trim() {
            "1s" => Ok(Self::S1),
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}', expected one of 1s, 1m, 5m"
            ))),
        }
    }
}

/// One OHLCV interval sample. `time` is in unix seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    pub fn is_valid(&self) -> bool {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        positive(self.low)
            && positive(self.open)
            && positive(self.high)
            && positive(self.close)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

/// Point of an append-only analytic sub-series (spread, z-score, volatility).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub time: i64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
}

/// Single-symbol or pair analytics snapshot. The pair-only fields stay `None`
/// on the single-symbol channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub pair_symbol: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub z_score: Option<f64>,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub hedge_ratio: Option<f64>,
    #[serde(default)]
    pub correlation: Option<f64>,
    #[serde(default)]
    pub adf_statistic: Option<f64>,
    #[serde(default)]
    pub adf_pvalue: Option<f64>,
    #[serde(default)]
    pub is_stationary: Option<bool>,
    #[serde(default)]
    pub validity_status: Option<String>,
    #[serde(default)]
    pub data_freshness_ms: Option<i64>,
    #[serde(default)]
    pub tick_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub symbol: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(default = "default_alert_severity")]
    pub severity: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

fn default_alert_severity() -> String {
    "info".to_string()
}

pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let (prefix, body) = match trimmed.get(..UPLOAD_SYMBOL_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(UPLOAD_SYMBOL_PREFIX) => {
            (UPLOAD_SYMBOL_PREFIX, &trimmed[UPLOAD_SYMBOL_PREFIX.len()..])
        }
        _ => ("", trimmed),
    };
    let body = body.to_ascii_uppercase();

    let allowed = |ch: char| {
        ch.is_ascii_alphanumeric() || (!prefix.is_empty() && (ch == '_' || ch == '-'))
    };
    if body.is_empty() || !body.chars().all(allowed) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }

    Ok(format!("{prefix}{body}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectArgs {
    pub max_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    /// When set, the delay doubles per attempt up to this cap.
    pub max_reconnect_delay_ms: Option<u64>,
}

impl ReconnectArgs {
    pub fn normalize(self) -> Result<ReconnectPolicy, AppError> {
        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(AppError::InvalidArgument(format!(
                "maxAttempts must be at most {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let reconnect_delay_ms = self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let policy =
            ReconnectPolicy::fixed(max_attempts, Duration::from_millis(reconnect_delay_ms));
        let Some(cap_ms) = self.max_reconnect_delay_ms else {
            return Ok(policy);
        };
        if !(reconnect_delay_ms..=MAX_RECONNECT_DELAY_MS).contains(&cap_ms) {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectDelayMs must be between reconnectDelayMs and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        Ok(policy.with_backoff(Backoff::Exponential {
            cap: Duration::from_millis(cap_ms),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeArgs {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub history_limit: Option<u16>,
    pub channel_buffer_size: Option<usize>,
    pub reconnect: Option<ReconnectArgs>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub history_limit: u16,
    pub channel_buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl SubscribeArgs {
    pub fn normalize(self) -> Result<SubscriptionConfig, AppError> {
        let symbol = normalize_symbol(self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL))?;
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let channel_buffer_size = normalize_channel_buffer_size(self.channel_buffer_size)?;
        let reconnect = self.reconnect.unwrap_or_default().normalize()?;

        Ok(SubscriptionConfig {
            symbol,
            timeframe,
            history_limit,
            channel_buffer_size,
            reconnect,
        })
    }
}

fn normalize_channel_buffer_size(raw: Option<usize>) -> Result<usize, AppError> {
    let channel_buffer_size = raw.unwrap_or(DEFAULT_CHANNEL_BUFFER_SIZE);
    if !(MIN_CHANNEL_BUFFER_SIZE..=MAX_CHANNEL_BUFFER_SIZE).contains(&channel_buffer_size) {
        return Err(AppError::InvalidArgument(format!(
            "channelBufferSize must be between {MIN_CHANNEL_BUFFER_SIZE} and {MAX_CHANNEL_BUFFER_SIZE}"
        )));
    }
    Ok(channel_buffer_size)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PairSubscribeArgs {
    pub symbol_a: Option<String>,
    pub symbol_b: Option<String>,
    pub channel_buffer_size: Option<usize>,
    pub reconnect: Option<ReconnectArgs>,
}

#[derive(Debug, Clone)]
pub struct PairSubscriptionConfig {
    pub symbol_a: String,
    pub symbol_b: String,
    pub channel_buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl PairSubscribeArgs {
    pub fn normalize(self) -> Result<PairSubscriptionConfig, AppError> {
        let symbol_a = normalize_symbol(self.symbol_a.as_deref().unwrap_or(DEFAULT_SYMBOL))?;
        let symbol_b =
            normalize_symbol(self.symbol_b.as_deref().unwrap_or(DEFAULT_PAIR_SYMBOL))?;
        if symbol_a == symbol_b {
            return Err(AppError::InvalidArgument(
                "pair symbols must differ".to_string(),
            ));
        }

        Ok(PairSubscriptionConfig {
            symbol_a,
            symbol_b,
            channel_buffer_size: normalize_channel_buffer_size(self.channel_buffer_size)?,
            reconnect: self.reconnect.unwrap_or_default().normalize()?,
        })
    }
}

/// Options for channels that carry no symbol, such as alerts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelArgs {
    pub channel_buffer_size: Option<usize>,
    pub reconnect: Option<ReconnectArgs>,
}

impl ChannelArgs {
    pub fn normalize(self) -> Result<(usize, ReconnectPolicy), AppError> {
        Ok((
            normalize_channel_buffer_size(self.channel_buffer_size)?,
            self.reconnect.unwrap_or_default().normalize()?,
        ))
    }
}

/// Process-level endpoints and defaults, read from `DASHBOARD_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: DEFAULT_WS_URL.to_string(),
            symbol: DEFAULT_SYMBOL.to_string(),
            timeframe: DEFAULT_TIMEFRAME,
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_base_url = read("DASHBOARD_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "DASHBOARD_API_URL must use http:// or https://".to_string(),
            ));
        }

        let ws_base_url = read("DASHBOARD_WS_URL")
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(ws_base_url.starts_with("ws://") || ws_base_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "DASHBOARD_WS_URL must use ws:// or wss://".to_string(),
            ));
        }

        let symbol = normalize_symbol(
            read("DASHBOARD_SYMBOL")
                .as_deref()
                .unwrap_or(DEFAULT_SYMBOL),
        )?;
        let timeframe = match read("DASHBOARD_TIMEFRAME") {
            Some(raw) => Timeframe::parse_str(&raw)?,
            None => DEFAULT_TIMEFRAME,
        };

        Ok(Self {
            api_base_url,
            ws_base_url,
            symbol,
            timeframe,
        })
    }
}
