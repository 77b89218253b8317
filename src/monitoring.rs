//! In this module, we implement all the monitoring logic for capture scans.
//! This covers the per-file fault counters, the live progress counters workers
//! publish while they run, and the end-of-run summary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::validator::{SequencePosition, Transition};

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Tallies of everything that went wrong (or right) in one stream
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub packets: u64,
    pub faulty: u64,
    pub zeroed: u64,
    pub complete_frames: u64,
    pub incomplete_frames: u64,
    /// Capture records that couldn't hold a CODIF packet
    pub skipped_frames: u64,
}

impl StreamStats {
    pub fn record(&mut self, transition: Transition) {
        self.packets += 1;
        match transition {
            Transition::InOrder => {}
            Transition::Faulty => self.faulty += 1,
            Transition::Zeroed => self.zeroed += 1,
        }
    }

    pub fn merge(&mut self, other: &StreamStats) {
        self.packets += other.packets;
        self.faulty += other.faulty;
        self.zeroed += other.zeroed;
        self.complete_frames += other.complete_frames;
        self.incomplete_frames += other.incomplete_frames;
        self.skipped_frames += other.skipped_frames;
    }

    /// What was tallied after `earlier`, an older snapshot of the same counters
    pub fn since(&self, earlier: &StreamStats) -> StreamStats {
        StreamStats {
            packets: self.packets - earlier.packets,
            faulty: self.faulty - earlier.faulty,
            zeroed: self.zeroed - earlier.zeroed,
            complete_frames: self.complete_frames - earlier.complete_frames,
            incomplete_frames: self.incomplete_frames - earlier.incomplete_frames,
            skipped_frames: self.skipped_frames - earlier.skipped_frames,
        }
    }

    pub fn fault_percent(&self) -> f64 {
        percent(self.faulty, self.packets)
    }

    pub fn zero_percent(&self) -> f64 {
        percent(self.zeroed, self.packets)
    }
}

/// One out-of-order packet, kept for later inspection
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Zero-based index of the packet in its file
    pub packet_index: u64,
    pub transition: Transition,
    pub observed: SequencePosition,
    pub reference: Option<SequencePosition>,
}

/// Bounded list of fault records
#[derive(Clone, Debug, Default)]
pub struct FaultLog {
    records: Vec<FaultRecord>,
    limit: usize,
    dropped: u64,
}

impl FaultLog {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: FaultRecord) {
        if self.records.len() < self.limit {
            self.records.push(record);
        } else {
            self.dropped += 1;
        }
    }

    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }

    /// Faults that didn't fit under the limit
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_records(self) -> Vec<FaultRecord> {
        self.records
    }
}

/// Counters a worker updates while it scans a file, readable from any thread
#[derive(Debug, Default)]
pub struct Progress {
    expected: AtomicU64,
    packets: AtomicU64,
    faulty: AtomicU64,
    zeroed: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    pub fn set_expected(&self, packets: u64) {
        self.expected.store(packets, Ordering::Relaxed);
    }

    pub fn expected(&self) -> Option<u64> {
        match self.expected.load(Ordering::Relaxed) {
            0 => None,
            expected => Some(expected),
        }
    }

    pub fn record(&self, transition: Transition) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        match transition {
            Transition::InOrder => {}
            Transition::Faulty => {
                self.faulty.fetch_add(1, Ordering::Relaxed);
            }
            Transition::Zeroed => {
                self.zeroed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            packets: self.packets.load(Ordering::Relaxed),
            faulty: self.faulty.load(Ordering::Relaxed),
            zeroed: self.zeroed.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Share of the expected packets read so far, when the total is known
    pub fn completion_percent(&self) -> Option<f64> {
        self.expected()
            .map(|expected| percent(self.packets.load(Ordering::Relaxed), expected))
    }
}

/// Aggregate over every file of a run
#[derive(Clone, Debug, Default, Serialize)]
pub struct Summary {
    pub files: usize,
    pub failed_files: usize,
    pub expected_packets: u64,
    pub stats: StreamStats,
}

impl Summary {
    pub fn add(&mut self, stats: &StreamStats, expected_packets: Option<u64>) {
        self.files += 1;
        self.stats.merge(stats);
        self.expected_packets += expected_packets.unwrap_or(stats.packets);
    }

    pub fn add_failure(&mut self, expected_packets: Option<u64>) {
        self.files += 1;
        self.failed_files += 1;
        self.expected_packets += expected_packets.unwrap_or(0);
    }

    pub fn completion_percent(&self) -> f64 {
        percent(self.stats.packets, self.expected_packets)
    }

    pub fn log(&self) {
        info!(
            files = self.files,
            failed = self.failed_files,
            packets = self.stats.packets,
            skipped = self.stats.skipped_frames,
            "Total: {:.2}% read, {:.2}% faulty, {:.2}% zeroed",
            self.completion_percent(),
            self.stats.fault_percent(),
            self.stats.zero_percent()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let mut stats = StreamStats::default();
        for t in [
            Transition::InOrder,
            Transition::Faulty,
            Transition::Zeroed,
            Transition::InOrder,
        ] {
            stats.record(t);
        }
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.fault_percent(), 25.0);
        assert_eq!(stats.zero_percent(), 25.0);
        assert_eq!(StreamStats::default().fault_percent(), 0.0);
    }

    #[test]
    fn test_stats_since() {
        let mut stats = StreamStats::default();
        stats.record(Transition::InOrder);
        stats.complete_frames += 1;
        let earlier = stats.clone();
        stats.record(Transition::Faulty);
        stats.incomplete_frames += 1;
        let delta = stats.since(&earlier);
        assert_eq!(delta.packets, 1);
        assert_eq!(delta.faulty, 1);
        assert_eq!(delta.complete_frames, 0);
        assert_eq!(delta.incomplete_frames, 1);
    }

    #[test]
    fn test_progress() {
        let progress = Progress::default();
        assert_eq!(progress.completion_percent(), None);
        progress.set_expected(8);
        progress.record(Transition::InOrder);
        progress.record(Transition::Faulty);
        assert_eq!(progress.completion_percent(), Some(25.0));
        assert_eq!(progress.snapshot().faulty, 1);
    }

    #[test]
    fn test_fault_log_limit() {
        let mut log = FaultLog::new(1);
        let record = FaultRecord {
            packet_index: 3,
            transition: Transition::Faulty,
            observed: SequencePosition::default(),
            reference: None,
        };
        log.push(record.clone());
        log.push(record);
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.dropped(), 1);
    }

    #[test]
    fn test_summary() {
        let mut summary = Summary::default();
        let stats = StreamStats {
            packets: 50,
            faulty: 5,
            ..Default::default()
        };
        summary.add(&stats, Some(100));
        summary.add_failure(Some(100));
        assert_eq!(summary.files, 2);
        assert_eq!(summary.completion_percent(), 25.0);
        assert_eq!(summary.stats.fault_percent(), 10.0);
    }
}
