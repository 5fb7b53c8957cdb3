use crate::market::types::Bar;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// The incoming bar superseded the still-forming last bar.
    Replaced,
    /// Late bar older than the last entry; the series never reorders.
    Discarded { incoming: i64, last: i64 },
    Rejected,
}

/// Ascending, unique-by-time sequence of bars.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Series {
    bars: Vec<Bar>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }

    /// Reconciles one pushed bar into the series in O(1).
    pub fn merge(&mut self, bar: Bar) -> MergeOutcome {
        if !bar.is_valid() {
            warn!(time = bar.time, low = bar.low, "dropping invalid bar");
            return MergeOutcome::Rejected;
        }

        match self.bars.last_mut() {
            Some(last) if last.time == bar.time => {
                *last = bar;
                MergeOutcome::Replaced
            }
            Some(last) if bar.time < last.time => {
                debug!(
                    incoming = bar.time,
                    last = last.time,
                    "discarding out-of-order bar"
                );
                MergeOutcome::Discarded {
                    incoming: bar.time,
                    last: last.time,
                }
            }
            _ => {
                self.bars.push(bar);
                MergeOutcome::Appended
            }
        }
    }

    /// Appends without time reconciliation. Used for bounded replays whose
    /// producer already emits bars in final order; invalid bars still drop.
    pub fn append(&mut self, bar: Bar) -> bool {
        if !bar.is_valid() {
            warn!(time = bar.time, low = bar.low, "dropping invalid bar");
            return false;
        }
        self.bars.push(bar);
        true
    }

    /// Bulk replacement for initial loads. Returns how many bars were kept.
    pub fn set_series(&mut self, bars: Vec<Bar>) -> usize {
        let received = bars.len();
        let mut valid: Vec<Bar> = bars.into_iter().filter(Bar::is_valid).collect();
        valid.sort_by_key(|bar| bar.time);

        let mut unique: Vec<Bar> = Vec::with_capacity(valid.len());
        for bar in valid {
            match unique.last_mut() {
                Some(last) if last.time == bar.time => *last = bar,
                _ => unique.push(bar),
            }
        }

        if unique.len() != received {
            debug!(
                received,
                kept = unique.len(),
                "filtered bulk series load"
            );
        }
        self.bars = unique;
        self.bars.len()
    }

    /// Copy handed to the renderer: re-filters invalid lows and re-sorts by
    /// time even though `merge` already upholds both.
    pub fn render_snapshot(&self) -> Vec<Bar> {
        let mut snapshot: Vec<Bar> = self
            .bars
            .iter()
            .filter(|bar| bar.low.is_finite() && bar.low > 0.0)
            .copied()
            .collect();
        snapshot.sort_by_key(|bar| bar.time);
        snapshot
    }
}
