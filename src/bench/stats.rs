// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stats surface: connect-latency accounting and the per-tick record
//! handed to external formatters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Bound on the latency sample buffer used for percentiles.
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Sentinel meaning "no latency recorded yet".
const MIN_UNSET: i64 = i64::MAX;

/// Connect-latency accumulator. Sum/count/min/max are atomics updated from
/// every session task; the sample buffer is a bounded mutex-protected vector
/// (writers are O(sessions/second), contention is negligible).
#[derive(Debug, Default)]
pub(crate) struct LatencyRecorder {
    sum_ms: AtomicI64,
    count: AtomicI64,
    min_ms: AtomicI64,
    max_ms: AtomicI64,
    samples: Mutex<Vec<f64>>,
}

impl LatencyRecorder {
    pub(crate) fn new() -> Self {
        let r = Self::default();
        r.min_ms.store(MIN_UNSET, Ordering::Relaxed);
        r
    }

    pub(crate) fn record(&self, latency: std::time::Duration) {
        let ms = latency.as_millis() as i64;
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut cur = self.min_ms.load(Ordering::Relaxed);
        while ms < cur {
            match self
                .min_ms
                .compare_exchange_weak(cur, ms, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        let mut cur = self.max_ms.load(Ordering::Relaxed);
        while ms > cur {
            match self
                .max_ms
                .compare_exchange_weak(cur, ms, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let mut samples = self.samples.lock().unwrap();
        if samples.len() < MAX_LATENCY_SAMPLES {
            samples.push(ms as f64);
        }
    }

    /// Average/min/max from the atomics; p95 from a sorted copy of the
    /// sample buffer. Min reads 0 until a sample displaces the sentinel.
    pub(crate) fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        let avg = if count > 0 {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        } else {
            0.0
        };
        let min = match self.min_ms.load(Ordering::Relaxed) {
            MIN_UNSET => 0.0,
            v => v as f64,
        };
        let max = self.max_ms.load(Ordering::Relaxed) as f64;
        let p95 = {
            let samples = self.samples.lock().unwrap();
            percentile(&samples, 95.0)
        };
        LatencySummary { avg, min, max, p95 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

/// One stats-surface tick: everything an external text or JSON formatter
/// needs. Plain data; no formatting lives in the core.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsRecord {
    /// Currently active sessions (bad clients included).
    pub active: i64,
    /// Sessions that completed a TCP connect.
    pub total_connects: i64,
    /// Sessions that failed (establishment or mid-stream, excluding
    /// cancellation).
    pub total_failures: i64,
    /// Real-world mode target; 0 in fixed-target mode.
    pub target: i64,
    pub connect_ms: LatencySummary,
    pub rtp_packets: u64,
    pub rtp_lost: u64,
    pub rtp_bytes: u64,
    pub bad_clients: i64,
    pub bad_client_types: BTreeMap<String, i64>,
}

impl StatsRecord {
    /// Fraction of expected packets lost, in `[0, 1]`.
    pub fn loss_rate(&self) -> f64 {
        let expected = self.rtp_packets + self.rtp_lost;
        if expected == 0 {
            return 0.0;
        }
        self.rtp_lost as f64 / expected as f64
    }

    pub fn bitrate_mbps(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return 0.0;
        }
        self.rtp_bytes as f64 * 8.0 / seconds / 1e6
    }
}

/// Nth percentile over a copy of `values`, linearly interpolating between
/// neighbors. Returns 0 for an empty slice.
pub(crate) fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = index as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[lower];
    }
    let weight = index - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percentile_empty_and_single() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[42.0], 95.0), 42.0);
    }

    #[test]
    fn percentile_interpolates() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let p95 = percentile(&values, 95.0);
        assert!((p95 - 95.05).abs() < 1e-9, "p95 {p95}");
        assert_eq!(percentile(&values, 100.0), 100.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
    }

    #[test]
    fn recorder_tracks_min_max_avg() {
        let r = LatencyRecorder::new();
        assert_eq!(r.summary().min, 0.0);
        for ms in [30u64, 10, 20] {
            r.record(Duration::from_millis(ms));
        }
        let s = r.summary();
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 30.0);
        assert!((s.avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn record_serializes_to_json() {
        let mut record = StatsRecord::default();
        record.active = 3;
        record.rtp_packets = 100;
        record.rtp_lost = 25;
        record.bad_client_types.insert("garbage-sender".into(), 2);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["active"], 3);
        assert_eq!(json["bad_client_types"]["garbage-sender"], 2);
        assert!((record.loss_rate() - 0.2).abs() < 1e-9);
    }
}
