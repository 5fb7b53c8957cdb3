use crate::error::AppError;
use crate::market::types::{Alert, AnalyticsSnapshot, Bar, SeriesPoint};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use simd_json::OwnedValue;
use tracing::{debug, warn};

/// Payload kind carried by a single-type push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveChannel {
    Candles,
    Analytics,
    Alerts,
}

impl LiveChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candles => "candles",
            Self::Analytics => "analytics",
            Self::Alerts => "alerts",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Bar(Bar),
    Analytics(AnalyticsSnapshot),
    Alert(Alert),
}

/// Decoded upload stream frame. Each variant maps to one session mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Status(String),
    Ohlc { bars: Vec<Bar>, complete: bool },
    Stats(OwnedValue),
    Spread { points: Vec<SeriesPoint>, complete: bool },
    ZScore { points: Vec<SeriesPoint>, complete: bool },
    Volatility { points: Vec<SeriesPoint>, complete: bool },
    Complete(Option<String>),
    Error(String),
}

impl UploadEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Ohlc { .. } => "ohlc",
            Self::Stats(_) => "stats",
            Self::Spread { .. } => "spread",
            Self::ZScore { .. } => "zscore",
            Self::Volatility { .. } => "volatility",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadFrameWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<OwnedValue>,
    #[serde(default)]
    complete: bool,
}

pub fn decode_frame<T: DeserializeOwned>(frame: String) -> Result<T, AppError> {
    let mut payload = frame.into_bytes();
    Ok(simd_json::serde::from_slice::<T>(payload.as_mut_slice())?)
}

/// Decodes one frame of a single-type channel. Malformed payloads are logged
/// and dropped; they never affect the connection.
pub fn route_live_frame(channel: LiveChannel, frame: String) -> Option<LiveEvent> {
    let decoded = match channel {
        LiveChannel::Candles => decode_frame::<Bar>(frame).map(LiveEvent::Bar),
        LiveChannel::Analytics => {
            decode_frame::<AnalyticsSnapshot>(frame).map(LiveEvent::Analytics)
        }
        LiveChannel::Alerts => decode_frame::<Alert>(frame).map(LiveEvent::Alert),
    };

    match decoded {
        Ok(event) => Some(event),
        Err(error) => {
            warn!(channel = channel.as_str(), error = %error, "dropping malformed frame");
            None
        }
    }
}

/// Decodes a batch element by element. An element that fails to decode, such
/// as a bar whose price was sent as `null`, is dropped on its own.
fn batch<T: DeserializeOwned>(tag: &str, data: Option<OwnedValue>) -> Result<Vec<T>, AppError> {
    let Some(value) = data else {
        return Ok(Vec::new());
    };
    let items: Vec<OwnedValue> = simd_json::serde::from_owned_value(value)?;

    let total = items.len();
    let decoded: Vec<T> = items
        .into_iter()
        .filter_map(|item| match simd_json::serde::from_owned_value::<T>(item) {
            Ok(decoded) => Some(decoded),
            Err(error) => {
                debug!(tag, error = %error, "dropping undecodable batch element");
                None
            }
        })
        .collect();

    if decoded.len() < total {
        warn!(tag, dropped = total - decoded.len(), total, "upload batch had invalid elements");
    }
    Ok(decoded)
}

/// `Ok(None)` for tags this client does not know.
pub fn decode_upload_frame(frame: String) -> Result<Option<UploadEvent>, AppError> {
    let wire: UploadFrameWire = decode_frame(frame)?;
    let complete = wire.complete;

    let event = match wire.kind.as_str() {
        "status" => UploadEvent::Status(wire.message.unwrap_or_default()),
        "ohlc" => UploadEvent::Ohlc {
            bars: batch("ohlc", wire.data)?,
            complete,
        },
        "stats" => UploadEvent::Stats(wire.data.ok_or_else(|| {
            AppError::EventStream("stats frame without data".to_string())
        })?),
        "spread" => UploadEvent::Spread {
            points: batch("spread", wire.data)?,
            complete,
        },
        "zscore" => UploadEvent::ZScore {
            points: batch("zscore", wire.data)?,
            complete,
        },
        "volatility" => UploadEvent::Volatility {
            points: batch("volatility", wire.data)?,
            complete,
        },
        "complete" => UploadEvent::Complete(wire.message),
        "error" => UploadEvent::Error(wire.message.unwrap_or_default()),
        other => {
            warn!(tag = other, "ignoring unknown upload frame type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

pub fn route_upload_frame(frame: String) -> Option<UploadEvent> {
    match decode_upload_frame(frame) {
        Ok(event) => event,
        Err(error) => {
            warn!(channel = "upload", error = %error, "dropping malformed frame");
            None
        }
    }
}
