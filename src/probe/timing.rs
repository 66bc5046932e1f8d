//! Phase decomposition of a single transfer.
//!
//! libcurl reports cumulative timestamps measured from the start of the
//! request; we turn them into per-phase durations in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cumulative phase marks, each measured from request start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseMarks {
    pub namelookup: Duration,
    pub connect: Duration,
    /// TLS handshake done (zero for plain HTTP).
    pub appconnect: Duration,
    pub pretransfer: Duration,
    pub starttransfer: Duration,
    pub total: Duration,
}

/// Per-phase durations in milliseconds. Serialized as the `timing_info` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub dns: f64,
    pub tcp: f64,
    pub ssl: f64,
    pub initial: f64,
    /// Request sent → first response byte. Persisted as `latency(ms)`.
    pub waiting: f64,
    pub download: f64,
    pub total: f64,
}

fn ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

impl PhaseTimings {
    pub fn from_marks(marks: &PhaseMarks) -> Self {
        let connect = ms(marks.connect);
        let pretransfer = ms(marks.pretransfer);
        let starttransfer = ms(marks.starttransfer);
        let total = ms(marks.total);

        Self {
            dns: ms(marks.namelookup),
            tcp: connect,
            ssl: (ms(marks.appconnect) - connect).max(0.0),
            initial: pretransfer,
            waiting: (starttransfer - pretransfer).max(0.0),
            download: (total - starttransfer).max(0.0),
            total,
        }
    }
}

/// Round to the persisted precision (0.1 ms).
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
