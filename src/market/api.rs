use crate::error::AppError;
use crate::market::types::{AnalyticsSnapshot, Bar, Timeframe, UPLOAD_SYMBOL_PREFIX};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub fn ohlc_stream_endpoint(ws_base_url: &str, symbol: &str, timeframe: Timeframe) -> String {
    format!("{ws_base_url}/ohlc/{symbol}?interval={}", timeframe.as_str())
}

pub fn analytics_stream_endpoint(ws_base_url: &str, symbol: &str) -> String {
    format!("{ws_base_url}/analytics/{symbol}")
}

pub fn pair_stream_endpoint(ws_base_url: &str, symbol_a: &str, symbol_b: &str) -> String {
    format!("{ws_base_url}/pair/{symbol_a}/{symbol_b}")
}

pub fn alerts_stream_endpoint(ws_base_url: &str) -> String {
    format!("{ws_base_url}/alerts")
}

/// The server accepts upload symbols with or without the prefix; the bare
/// name keeps the path free of `:`.
pub fn upload_stream_endpoint(api_base_url: &str, symbol: &str) -> String {
    let name = symbol.strip_prefix(UPLOAD_SYMBOL_PREFIX).unwrap_or(symbol);
    format!("{api_base_url}/api/upload/{name}/stream")
}

fn ohlc_history_endpoint(
    api_base_url: &str,
    symbol: &str,
    timeframe: Timeframe,
    limit: u16,
) -> String {
    format!(
        "{api_base_url}/api/ohlc/{symbol}?interval={}&limit={limit}",
        timeframe.as_str()
    )
}

fn analytics_endpoint(api_base_url: &str, symbol: &str) -> String {
    format!("{api_base_url}/api/analytics/{symbol}")
}

fn pair_analytics_endpoint(api_base_url: &str, symbol_a: &str, symbol_b: &str) -> String {
    format!("{api_base_url}/api/analytics/pair/{symbol_a}/{symbol_b}")
}

fn symbols_endpoint(api_base_url: &str) -> String {
    format!("{api_base_url}/api/symbols")
}

fn upload_symbols_endpoint(api_base_url: &str) -> String {
    format!("{api_base_url}/api/upload/symbols")
}

/// Bulk bars for the initial load. Returned as sent; ordering and validity
/// are enforced by `Series::set_series`.
pub async fn fetch_ohlc_history(
    client: &Client,
    api_base_url: &str,
    symbol: &str,
    timeframe: Timeframe,
    limit: u16,
) -> Result<Vec<Bar>, AppError> {
    let endpoint = ohlc_history_endpoint(api_base_url, symbol, timeframe, limit);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<Bar>>().await?;
    Ok(payload)
}

pub async fn fetch_analytics(
    client: &Client,
    api_base_url: &str,
    symbol: &str,
) -> Result<AnalyticsSnapshot, AppError> {
    let endpoint = analytics_endpoint(api_base_url, symbol);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    Ok(response.json::<AnalyticsSnapshot>().await?)
}

pub async fn fetch_pair_analytics(
    client: &Client,
    api_base_url: &str,
    symbol_a: &str,
    symbol_b: &str,
) -> Result<AnalyticsSnapshot, AppError> {
    let endpoint = pair_analytics_endpoint(api_base_url, symbol_a, symbol_b);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    Ok(response.json::<AnalyticsSnapshot>().await?)
}

#[derive(Debug, Deserialize)]
struct SymbolInfoWire {
    symbol: String,
    is_active: bool,
}

/// Active live symbols, sorted.
pub async fn fetch_symbols(client: &Client, api_base_url: &str) -> Result<Vec<String>, AppError> {
    let endpoint = symbols_endpoint(api_base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<SymbolInfoWire>>().await?;

    let mut symbols: Vec<String> = payload
        .into_iter()
        .filter(|entry| entry.is_active)
        .map(|entry| entry.symbol)
        .collect();
    symbols.sort_unstable();
    symbols.dedup();
    Ok(symbols)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct UploadedSymbolInfo {
    pub symbol: String,
    pub display_name: String,
    pub tick_count: u64,
    #[serde(default)]
    pub first_ts: Option<i64>,
    #[serde(default)]
    pub last_ts: Option<i64>,
    pub uploaded_at: i64,
    #[serde(default = "default_is_uploaded")]
    pub is_uploaded: bool,
}

fn default_is_uploaded() -> bool {
    true
}

pub async fn fetch_upload_symbols(
    client: &Client,
    api_base_url: &str,
) -> Result<Vec<UploadedSymbolInfo>, AppError> {
    let endpoint = upload_symbols_endpoint(api_base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let mut payload = response.json::<Vec<UploadedSymbolInfo>>().await?;
    payload.sort_by(|left, right| right.uploaded_at.cmp(&left.uploaded_at));
    Ok(payload)
}
