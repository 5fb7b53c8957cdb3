use crate::market::router::UploadEvent;
use crate::market::series::Series;
use crate::market::types::{Bar, SeriesPoint};
use serde::Serialize;
use simd_json::OwnedValue;
use tracing::{debug, info, warn};

pub const UPLOAD_COMPLETE_MESSAGE: &str = "All analytics computed";
pub const UPLOAD_CONNECTION_LOST_MESSAGE: &str = "Upload stream connection lost";
const UPLOAD_SERVER_ERROR_MESSAGE: &str = "Upload analytics failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Idle,
    Streaming,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedSeries {
    pub ohlc: bool,
    pub spread: bool,
    pub zscore: bool,
    pub volatility: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub epoch: u64,
    pub symbol_key: Option<String>,
    pub status: UploadStatus,
    pub progress_message: Option<String>,
    pub ohlc_series: Vec<Bar>,
    pub stats_snapshot: Option<OwnedValue>,
    pub spread_series: Vec<SeriesPoint>,
    pub zscore_series: Vec<SeriesPoint>,
    pub volatility_series: Vec<SeriesPoint>,
    pub finished: FinishedSeries,
    pub error_detail: Option<String>,
}

/// Reconciliation context for one uploaded-dataset replay.
///
/// `idle -> streaming -> {complete | error}`. Terminal states accept nothing
/// until the next `reset`. Every reset bumps `epoch`, which consumers compare
/// against to ignore events from a stream that belonged to an earlier
/// selection.
#[derive(Debug, Clone)]
pub struct UploadSession {
    epoch: u64,
    symbol_key: Option<String>,
    status: UploadStatus,
    progress_message: Option<String>,
    ohlc_series: Series,
    stats_snapshot: Option<OwnedValue>,
    spread_series: Vec<SeriesPoint>,
    zscore_series: Vec<SeriesPoint>,
    volatility_series: Vec<SeriesPoint>,
    finished: FinishedSeries,
    error_detail: Option<String>,
}

impl Default for UploadSession {
    fn default() -> Self {
        Self {
            epoch: 0,
            symbol_key: None,
            status: UploadStatus::Idle,
            progress_message: None,
            ohlc_series: Series::new(),
            stats_snapshot: None,
            spread_series: Vec::new(),
            zscore_series: Vec::new(),
            volatility_series: Vec::new(),
            finished: FinishedSeries::default(),
            error_detail: None,
        }
    }
}

impl UploadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn symbol_key(&self) -> Option<&str> {
        self.symbol_key.as_deref()
    }

    pub fn ohlc_series(&self) -> &Series {
        &self.ohlc_series
    }

    fn clear_data(&mut self) {
        self.progress_message = None;
        self.ohlc_series.clear();
        self.stats_snapshot = None;
        self.spread_series.clear();
        self.zscore_series.clear();
        self.volatility_series.clear();
        self.finished = FinishedSeries::default();
        self.error_detail = None;
    }

    /// Full reset on selection change. `None` means a live symbol was
    /// selected. Returns the new epoch.
    pub fn reset(&mut self, symbol_key: Option<String>) -> u64 {
        self.clear_data();
        self.status = UploadStatus::Idle;
        self.symbol_key = symbol_key;
        self.epoch += 1;
        debug!(epoch = self.epoch, symbol = ?self.symbol_key, "upload session reset");
        self.epoch
    }

    /// `idle -> streaming`, starting from empty. Ignored in any other state.
    pub fn begin_streaming(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.status != UploadStatus::Idle {
            return false;
        }
        self.clear_data();
        self.status = UploadStatus::Streaming;
        true
    }

    /// Applies one routed frame. Returns whether the session changed.
    pub fn apply(&mut self, epoch: u64, event: UploadEvent) -> bool {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "ignoring event from superseded upload stream");
            return false;
        }
        if self.status != UploadStatus::Streaming {
            debug!(status = ?self.status, tag = event.tag(), "upload session not streaming");
            return false;
        }

        match event {
            UploadEvent::Status(message) => {
                self.progress_message = Some(message);
            }
            UploadEvent::Ohlc { bars, complete } => {
                for bar in bars {
                    self.ohlc_series.append(bar);
                }
                self.finished.ohlc |= complete;
            }
            UploadEvent::Stats(stats) => {
                self.stats_snapshot = Some(stats);
            }
            UploadEvent::Spread { points, complete } => {
                self.spread_series.extend(points);
                self.finished.spread |= complete;
            }
            UploadEvent::ZScore { points, complete } => {
                self.zscore_series.extend(points);
                self.finished.zscore |= complete;
            }
            UploadEvent::Volatility { points, complete } => {
                self.volatility_series.extend(points);
                self.finished.volatility |= complete;
            }
            UploadEvent::Complete(_) => {
                self.status = UploadStatus::Complete;
                self.progress_message = Some(UPLOAD_COMPLETE_MESSAGE.to_string());
                info!(
                    symbol = ?self.symbol_key,
                    bars = self.ohlc_series.len(),
                    "upload analytics complete"
                );
            }
            UploadEvent::Error(detail) => {
                warn!(symbol = ?self.symbol_key, detail = %detail, "upload stream reported error");
                self.status = UploadStatus::Error;
                self.progress_message = Some(UPLOAD_SERVER_ERROR_MESSAGE.to_string());
                self.error_detail = Some(detail);
            }
        }
        true
    }

    /// Terminal error raised by the transport side, e.g. a lost stream.
    pub fn fail(&mut self, epoch: u64, detail: Option<String>) -> bool {
        if epoch != self.epoch || self.status.is_terminal() {
            return false;
        }
        warn!(symbol = ?self.symbol_key, detail = ?detail, "upload stream lost");
        self.status = UploadStatus::Error;
        self.progress_message = Some(UPLOAD_CONNECTION_LOST_MESSAGE.to_string());
        self.error_detail = detail;
        true
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            epoch: self.epoch,
            symbol_key: self.symbol_key.clone(),
            status: self.status,
            progress_message: self.progress_message.clone(),
            ohlc_series: self.ohlc_series.render_snapshot(),
            stats_snapshot: self.stats_snapshot.clone(),
            spread_series: self.spread_series.clone(),
            zscore_series: self.zscore_series.clone(),
            volatility_series: self.volatility_series.clone(),
            finished: self.finished,
            error_detail: self.error_detail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::router::route_upload_frame;
    use simd_json::json;

    fn bar_at(time: i64) -> Bar {
        Bar {
            time,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 1.0,
        }
    }

    fn point_at(time: i64) -> SeriesPoint {
        SeriesPoint {
            time,
            value: 0.5,
            mean: None,
        }
    }

    fn streaming_session(symbol: &str) -> (UploadSession, u64) {
        let mut session = UploadSession::new();
        let epoch = session.reset(Some(symbol.to_string()));
        assert!(session.begin_streaming(epoch));
        (session, epoch)
    }

    #[test]
    fn full_stream_reaches_complete() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");

        assert!(session.apply(epoch, UploadEvent::Status("Computing OHLC candles...".to_string())));
        for time in [60, 120, 180] {
            assert!(session.apply(
                epoch,
                UploadEvent::Ohlc {
                    bars: vec![bar_at(time)],
                    complete: time == 180,
                }
            ));
        }
        assert!(session.apply(epoch, UploadEvent::Stats(json!({"tick_count": 3}))));
        assert!(session.apply(epoch, UploadEvent::Complete(None)));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Complete);
        assert_eq!(snapshot.ohlc_series.len(), 3);
        assert!(snapshot.stats_snapshot.is_some());
        assert_eq!(
            snapshot.progress_message.as_deref(),
            Some(UPLOAD_COMPLETE_MESSAGE)
        );
        assert!(snapshot.finished.ohlc);
        assert!(!snapshot.finished.spread);
    }

    #[test]
    fn routed_batch_keeps_valid_bars_around_a_null_price() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        let frame = r#"{"type":"ohlc","data":[{"time":60,"open":1.0,"high":2.0,"low":1.0,"close":2.0,"volume":1.0},{"time":120,"open":1.0,"high":2.0,"low":null,"close":2.0,"volume":1.0},{"time":180,"open":2.0,"high":3.0,"low":2.0,"close":3.0,"volume":1.0}],"complete":true}"#;

        let event = route_upload_frame(frame.to_string()).expect("batch should route");
        assert!(session.apply(epoch, event));

        let snapshot = session.snapshot();
        let times: Vec<i64> = snapshot.ohlc_series.iter().map(|bar| bar.time).collect();
        assert_eq!(times, vec![60, 180]);
        assert!(snapshot.finished.ohlc);
    }

    #[test]
    fn terminal_state_rejects_further_events() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        session.apply(epoch, UploadEvent::Complete(None));

        assert!(!session.apply(
            epoch,
            UploadEvent::Ohlc {
                bars: vec![bar_at(60)],
                complete: false
            }
        ));
        assert!(!session.fail(epoch, None));
        assert_eq!(session.status(), UploadStatus::Complete);
        assert!(session.ohlc_series().is_empty());
    }

    #[test]
    fn switching_dataset_never_leaks_previous_points() {
        let (mut session, epoch_a) = streaming_session("UPLOAD:A");
        for time in 1..=5 {
            session.apply(
                epoch_a,
                UploadEvent::Ohlc {
                    bars: vec![bar_at(time * 60)],
                    complete: false,
                },
            );
        }
        session.apply(
            epoch_a,
            UploadEvent::Spread {
                points: vec![point_at(60)],
                complete: false,
            },
        );
        assert_eq!(session.ohlc_series().len(), 5);

        let epoch_b = session.reset(Some("UPLOAD:B".to_string()));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Idle);
        assert!(snapshot.ohlc_series.is_empty());
        assert!(snapshot.spread_series.is_empty());
        assert_eq!(snapshot.symbol_key.as_deref(), Some("UPLOAD:B"));

        // A late frame from A's stream must not land in B's session.
        assert!(session.begin_streaming(epoch_b));
        assert!(!session.apply(
            epoch_a,
            UploadEvent::Ohlc {
                bars: vec![bar_at(999)],
                complete: false
            }
        ));
        assert_eq!(session.status(), UploadStatus::Streaming);
        assert!(session.ohlc_series().is_empty());
    }

    #[test]
    fn ohlc_batches_append_in_arrival_order() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        session.apply(
            epoch,
            UploadEvent::Ohlc {
                bars: vec![bar_at(120), bar_at(60)],
                complete: false,
            },
        );

        let times: Vec<i64> = session.ohlc_series().bars().iter().map(|bar| bar.time).collect();
        assert_eq!(times, vec![120, 60]);
    }

    #[test]
    fn sub_series_are_append_only_and_track_completion() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        session.apply(
            epoch,
            UploadEvent::ZScore {
                points: vec![point_at(1), point_at(2)],
                complete: false,
            },
        );
        session.apply(
            epoch,
            UploadEvent::ZScore {
                points: vec![point_at(3)],
                complete: true,
            },
        );
        session.apply(
            epoch,
            UploadEvent::Volatility {
                points: vec![point_at(1)],
                complete: true,
            },
        );

        let snapshot = session.snapshot();
        assert_eq!(snapshot.zscore_series.len(), 3);
        assert_eq!(snapshot.volatility_series.len(), 1);
        assert!(snapshot.finished.zscore);
        assert!(snapshot.finished.volatility);
        assert!(!snapshot.finished.ohlc);
    }

    #[test]
    fn stats_replace_wholesale() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        session.apply(epoch, UploadEvent::Stats(json!({"tick_count": 1, "vwap": 2.0})));
        session.apply(epoch, UploadEvent::Stats(json!({"tick_count": 9})));

        assert_eq!(
            session.snapshot().stats_snapshot,
            Some(json!({"tick_count": 9}))
        );
    }

    #[test]
    fn server_error_and_lost_stream_use_fixed_messages() {
        let (mut session, epoch) = streaming_session("UPLOAD:A");
        assert!(session.apply(epoch, UploadEvent::Error("division by zero".to_string())));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Error);
        assert_eq!(
            snapshot.progress_message.as_deref(),
            Some(UPLOAD_SERVER_ERROR_MESSAGE)
        );
        assert_eq!(snapshot.error_detail.as_deref(), Some("division by zero"));

        let (mut session, epoch) = streaming_session("UPLOAD:B");
        assert!(session.fail(epoch, Some("closed with code 1006".to_string())));
        assert_eq!(
            session.snapshot().progress_message.as_deref(),
            Some(UPLOAD_CONNECTION_LOST_MESSAGE)
        );
    }

    #[test]
    fn begin_streaming_requires_idle_and_current_epoch() {
        let mut session = UploadSession::new();
        let epoch = session.reset(Some("UPLOAD:A".to_string()));
        assert!(!session.begin_streaming(epoch + 1));
        assert!(session.begin_streaming(epoch));
        assert!(!session.begin_streaming(epoch));
    }
}
