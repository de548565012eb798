// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP sequence-number accounting; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! [`SequenceTracker`] detects loss and absorbs reordering for one track.
//! [`Aggregator`] is the process-wide sink every session feeds; its counters
//! are plain atomics so tens of thousands of sessions can update it without
//! coordination.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-track 16-bit sequence number tracker.
///
/// Mirrors RFC 3550's forward-only accounting, without probation: the test
/// targets are known servers, so the first packet initializes tracking
/// directly. Backward jumps (delta ≥ 0x8000) are treated as reordering and
/// never counted as loss; a real gap behind a reordered packet shows up as a
/// forward delta on a later packet.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    initialized: bool,
    last_seq: u16,
    /// Number of 16-bit wraps observed.
    cycles: u32,
    /// `cycles << 16 | last_seq`.
    max_seq_extended: u32,
    total_packets: u64,
    total_lost: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one sequence number and returns the packets newly inferred
    /// lost by this call.
    pub fn push(&mut self, seq: u16) -> u64 {
        if !self.initialized {
            self.initialized = true;
            self.last_seq = seq;
            self.cycles = 0;
            self.max_seq_extended = u32::from(seq);
            self.total_packets = 1;
            return 0;
        }

        let delta = seq.wrapping_sub(self.last_seq);
        if delta >= 0x8000 {
            // Backward region: reordering. Leave all state untouched.
            return 0;
        }
        if delta == 0 {
            // Duplicate.
            return 0;
        }

        let lost = u64::from(delta) - 1;
        if seq < self.last_seq {
            // Forward delta with a smaller raw value means we wrapped.
            self.cycles += 1;
        }
        self.last_seq = seq;
        self.max_seq_extended = self.cycles << 16 | u32::from(seq);
        self.total_packets += 1;
        self.total_lost += lost;
        lost
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_lost(&self) -> u64 {
        self.total_lost
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Extended highest sequence number received, as in RFC 3550 §6.4.1.
    pub fn max_seq_extended(&self) -> u32 {
        self.max_seq_extended
    }
}

/// Process-wide media counters, shared by every session.
///
/// Updates are unordered `fetch_add`s; [`Aggregator::snapshot`] is three
/// independent loads and deliberately not a consistent cut. Rates are
/// computed over deltas between snapshots, so this is fine.
#[derive(Debug, Default)]
pub struct Aggregator {
    packets: AtomicU64,
    lost: AtomicU64,
    bytes: AtomicU64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packets(&self, n: u64) {
        if n > 0 {
            self.packets.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_loss(&self, n: u64) {
        if n > 0 {
            self.lost.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_bytes(&self, n: u64) {
        if n > 0 {
            self.bytes.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            packets: self.packets.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an [`Aggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub packets: u64,
    pub lost: u64,
    pub bytes: u64,
}

impl Snapshot {
    /// Fraction of expected packets that were lost, in `[0, 1]`.
    pub fn loss_rate(&self) -> f64 {
        let expected = self.packets + self.lost;
        if expected == 0 {
            return 0.0;
        }
        self.lost as f64 / expected as f64
    }

    pub fn packet_rate(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return 0.0;
        }
        self.packets as f64 / seconds
    }

    pub fn bitrate_mbps(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / seconds / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_all(t: &mut SequenceTracker, seqs: &[u16]) -> u64 {
        seqs.iter().map(|&s| t.push(s)).sum()
    }

    #[test]
    fn first_packet_initializes() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.push(1000), 0);
        assert_eq!(t.total_packets(), 1);
        assert_eq!(t.total_lost(), 0);
        assert_eq!(t.cycles(), 0);
    }

    #[test]
    fn in_order_stream_has_no_loss() {
        let mut t = SequenceTracker::new();
        assert_eq!(push_all(&mut t, &[10, 11, 12, 13, 14]), 0);
        assert_eq!(t.total_packets(), 5);
        assert_eq!(t.total_lost(), 0);
    }

    #[test]
    fn forward_gap_counts_loss() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.push(100), 0);
        assert_eq!(t.push(105), 4);
        assert_eq!(t.total_lost(), 4);
        assert_eq!(t.total_packets(), 2);
    }

    #[test]
    fn clean_wrap() {
        let mut t = SequenceTracker::new();
        push_all(&mut t, &[65534, 65535, 0, 1]);
        assert_eq!(t.total_packets(), 4);
        assert_eq!(t.total_lost(), 0);
        assert_eq!(t.cycles(), 1);
        assert_eq!(t.max_seq_extended(), 1 << 16 | 1);
    }

    #[test]
    fn wrap_with_gap() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.push(65533), 0);
        assert_eq!(t.push(2), 4);
        assert_eq!(t.total_lost(), 4);
        assert_eq!(t.cycles(), 1);
    }

    #[test]
    fn reordering_is_absorbed() {
        let mut t = SequenceTracker::new();
        t.push(100);
        assert_eq!(t.push(99), 0);
        assert_eq!(t.total_lost(), 0);
        assert_eq!(t.total_packets(), 1);
        // The reordered packet's slot was already counted lost if a gap
        // preceded it; a later in-order packet exposes nothing new.
        assert_eq!(t.push(101), 0);
        assert_eq!(t.total_packets(), 2);
    }

    #[test]
    fn duplicate_is_ignored() {
        let mut t = SequenceTracker::new();
        t.push(100);
        assert_eq!(t.push(100), 0);
        assert_eq!(t.total_packets(), 1);
        assert_eq!(t.total_lost(), 0);
    }

    #[test]
    fn duplicate_anywhere_leaves_totals_unchanged() {
        let stream = [5u16, 6, 9, 10];
        let mut plain = SequenceTracker::new();
        push_all(&mut plain, &stream);

        for dup_after in 0..stream.len() {
            let mut t = SequenceTracker::new();
            for (i, &s) in stream.iter().enumerate() {
                t.push(s);
                if i == dup_after {
                    t.push(t.last_seq);
                }
            }
            assert_eq!(t.total_packets(), plain.total_packets());
            assert_eq!(t.total_lost(), plain.total_lost());
        }
    }

    #[test]
    fn aggregator_sums_and_rates() {
        let a = Aggregator::new();
        a.add_packets(300);
        a.add_loss(0); // no-op
        a.add_loss(100);
        a.add_bytes(1_000_000);
        let s = a.snapshot();
        assert_eq!(s.packets, 300);
        assert_eq!(s.lost, 100);
        assert_eq!(s.bytes, 1_000_000);
        assert!((s.loss_rate() - 0.25).abs() < 1e-9);
        assert!((s.bitrate_mbps(8.0) - 1.0).abs() < 1e-9);
        assert_eq!(s.packet_rate(0.0), 0.0);
    }
}
