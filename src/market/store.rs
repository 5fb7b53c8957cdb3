use crate::market::router::LiveEvent;
use crate::market::series::{MergeOutcome, Series};
use crate::market::types::{Alert, AnalyticsSnapshot, Bar, ConnectionKey};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

pub const ALERT_FEED_CAPACITY: usize = 50;

/// UI-facing state for the live channels. Each key has a single writer, its
/// consumer task; readers only ever receive copies.
#[derive(Default)]
pub struct LiveStore {
    series: Mutex<HashMap<ConnectionKey, Series>>,
    analytics: Mutex<HashMap<ConnectionKey, AnalyticsSnapshot>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl LiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_bar(&self, key: &ConnectionKey, bar: Bar) -> MergeOutcome {
        self.series
            .lock()
            .entry(key.clone())
            .or_default()
            .merge(bar)
    }

    /// Bulk replacement used by the REST history load.
    pub fn set_series(&self, key: &ConnectionKey, bars: Vec<Bar>) -> usize {
        self.series
            .lock()
            .entry(key.clone())
            .or_default()
            .set_series(bars)
    }

    pub fn series_snapshot(&self, key: &ConnectionKey) -> Vec<Bar> {
        self.series
            .lock()
            .get(key)
            .map(Series::render_snapshot)
            .unwrap_or_default()
    }

    /// Keeps the stored snapshot unless the incoming one is strictly newer.
    pub fn apply_analytics(&self, key: &ConnectionKey, snapshot: AnalyticsSnapshot) -> bool {
        let mut analytics = self.analytics.lock();
        if let Some(current) = analytics.get(key) {
            if snapshot.timestamp <= current.timestamp {
                debug!(
                    key = %key,
                    incoming = snapshot.timestamp,
                    current = current.timestamp,
                    "ignoring stale analytics snapshot"
                );
                return false;
            }
        }
        analytics.insert(key.clone(), snapshot);
        true
    }

    pub fn analytics(&self, key: &ConnectionKey) -> Option<AnalyticsSnapshot> {
        self.analytics.lock().get(key).cloned()
    }

    pub fn push_alert(&self, alert: Alert) {
        let mut alerts = self.alerts.lock();
        alerts.push_front(alert);
        alerts.truncate(ALERT_FEED_CAPACITY);
    }

    /// Most recent first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn apply(&self, key: &ConnectionKey, event: LiveEvent) -> bool {
        match event {
            LiveEvent::Bar(bar) => !matches!(
                self.merge_bar(key, bar),
                MergeOutcome::Discarded { .. } | MergeOutcome::Rejected
            ),
            LiveEvent::Analytics(snapshot) => self.apply_analytics(key, snapshot),
            LiveEvent::Alert(alert) => {
                self.push_alert(alert);
                true
            }
        }
    }
}
