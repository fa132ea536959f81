//! Post-load reconciliation of source and sink counts

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Source count versus sink distinct count. Reported, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub source_count: u64,
    pub sink_count: u64,
    /// `source_count - sink_count`
    pub delta: i64,
    pub mismatch: bool,
}

impl ReconciliationResult {
    pub fn new(source_count: u64, sink_count: u64) -> Self {
        let delta = (i128::from(source_count) - i128::from(sink_count))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        Self {
            source_count,
            sink_count,
            delta,
            mismatch: delta != 0,
        }
    }

    /// Log the outcome; a mismatch is a warning, not a failure
    pub fn report(&self, table: &str) {
        if self.mismatch {
            warn!(
                table,
                source = self.source_count,
                sink = self.sink_count,
                delta = self.delta,
                "Row count mismatch after load"
            );
        } else {
            info!(
                table,
                rows = self.source_count,
                "Row counts reconciled"
            );
        }
    }
}

impl fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source={} sink={} delta={}{}",
            self.source_count,
            self.sink_count,
            self.delta,
            if self.mismatch { " (mismatch)" } else { "" }
        )
    }
}
