//! Runs the per-file pipelines over a set of capture files.
//!
//! Validation scans are independent per file and fan out over a worker pool fed
//! by a shared queue. ACM computation folds every file into the same
//! accumulators, so it walks the files one after another.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    acm::{AcmAccumulator, Integration},
    assembler::{AssembledFrame, FrameAssembler},
    capture::{self, CaptureKind, PacketSource},
    error::Result,
    header::LightHeader,
    monitoring::{FaultLog, FaultRecord, Progress, StreamStats, Summary},
    validator::{SequenceValidator, Transition},
    StreamConfig,
};

pub const DEFAULT_FAULT_RECORDS: usize = 1024;

#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Capture kind of every file, guessed per file from its extension if unset
    pub kind: Option<CaptureKind>,
    pub threads: usize,
    /// Stop each file after this many packets
    pub packet_limit: Option<u64>,
    pub max_fault_records: usize,
    /// How often running scans log their progress
    pub progress_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            kind: None,
            threads: 1,
            packet_limit: None,
            max_fault_records: DEFAULT_FAULT_RECORDS,
            progress_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AcmOptions {
    pub kind: Option<CaptureKind>,
    pub integration: Integration,
}

fn kind_for(path: &Path, kind: Option<CaptureKind>) -> CaptureKind {
    kind.unwrap_or_else(|| CaptureKind::from_path(path))
}

/// Outcome of one file's pipeline
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub expected_packets: Option<u64>,
    pub stats: StreamStats,
    pub faults: Vec<FaultRecord>,
    /// Faults beyond the record limit
    pub dropped_faults: u64,
    pub cancelled: bool,
    /// Set when the file's pipeline was aborted
    pub error: Option<String>,
}

impl FileReport {
    fn failed(
        path: &Path,
        stats: StreamStats,
        expected_packets: Option<u64>,
        error: String,
    ) -> Self {
        Self {
            path: path.to_owned(),
            expected_packets,
            stats,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn log(&self) {
        let path = self.path.display();
        match &self.error {
            Some(e) => error!(%path, packets = self.stats.packets, "Aborted: {}", e),
            None => info!(
                %path,
                packets = self.stats.packets,
                skipped = self.stats.skipped_frames,
                cancelled = self.cancelled,
                "{:.2}% faulty, {:.2}% zeroed",
                self.stats.fault_percent(),
                self.stats.zero_percent()
            ),
        }
    }
}

/// Result of scanning a single source
#[derive(Debug)]
pub struct SourceScan {
    pub stats: StreamStats,
    pub faults: FaultLog,
    pub cancelled: bool,
}

/// Run the sequence checks over every packet of `source`, reading headers only.
///
/// Counters are mirrored into `progress` as the scan goes. The scan stops early
/// at the packet limit or once `cancel` is raised.
pub fn validate_source<S: PacketSource + ?Sized>(
    source: &mut S,
    config: &StreamConfig,
    options: &ScanOptions,
    progress: &Progress,
    cancel: &AtomicBool,
) -> Result<SourceScan> {
    let mut validator = SequenceValidator::new(config)?;
    let mut scan = SourceScan {
        stats: StreamStats::default(),
        faults: FaultLog::new(options.max_fault_records),
        cancelled: false,
    };
    if let Some(count) = source.packet_count() {
        progress.set_expected(options.packet_limit.map_or(count, |limit| limit.min(count)));
    }
    let mut index = 0u64;
    while let Some(bytes) = source.next_packet(true)? {
        let header = LightHeader::decode(bytes)?;
        let reference = validator.reference();
        let transition = validator.classify(&header);
        scan.stats.record(transition);
        progress.record(transition);
        if transition != Transition::InOrder {
            scan.faults.push(FaultRecord {
                packet_index: index,
                transition,
                observed: (&header).into(),
                reference,
            });
        }
        index += 1;
        if options.packet_limit.map_or(false, |limit| index >= limit) {
            debug!(index, "Reached packet limit");
            break;
        }
        if cancel.load(Ordering::Relaxed) {
            scan.cancelled = true;
            break;
        }
    }
    scan.stats.skipped_frames = source.skipped_frames();
    Ok(scan)
}

/// Open and scan one file. Failures end up in the report.
pub fn validate_file(
    path: &Path,
    config: &StreamConfig,
    options: &ScanOptions,
    progress: &Progress,
    cancel: &AtomicBool,
) -> FileReport {
    let result = capture::open(path, kind_for(path, options.kind)).and_then(|mut source| {
        validate_source(source.as_mut(), config, options, progress, cancel)
    });
    progress.finish();
    match result {
        Ok(scan) => FileReport {
            path: path.to_owned(),
            expected_packets: progress.expected(),
            stats: scan.stats,
            dropped_faults: scan.faults.dropped(),
            faults: scan.faults.into_records(),
            cancelled: scan.cancelled,
            error: None,
        },
        // Keep what was counted before the failure
        Err(e) => FileReport::failed(path, progress.snapshot(), progress.expected(), e.to_string()),
    }
}

/// Periodically log the state of every unfinished scan until `done` closes
fn watch(paths: &[PathBuf], progress: &[Progress], done: Receiver<()>, interval: Duration) {
    let ticker = tick(interval);
    let mut last = vec![(Instant::now(), 0u64); paths.len()];
    loop {
        select! {
            recv(ticker) -> _ => {
                for ((path, p), (at, packets)) in paths.iter().zip(progress).zip(last.iter_mut()) {
                    if p.is_finished() {
                        continue;
                    }
                    let snapshot = p.snapshot();
                    let rate = (snapshot.packets - *packets) as f64 / at.elapsed().as_secs_f64();
                    *at = Instant::now();
                    *packets = snapshot.packets;
                    info!(
                        path = %path.display(),
                        packets = snapshot.packets,
                        faulty = snapshot.faulty,
                        zeroed = snapshot.zeroed,
                        "{:.2}% read at {:.1} pkt/s",
                        p.completion_percent().unwrap_or(0.0),
                        rate
                    );
                }
            }
            recv(done) -> _ => break,
        }
    }
}

/// Validate many files on a pool of `options.threads` workers.
///
/// Reports come back in the order of `paths`. A file that fails doesn't stop
/// the others.
pub fn validate_files(
    paths: &[PathBuf],
    config: &StreamConfig,
    options: &ScanOptions,
    cancel: &AtomicBool,
) -> Vec<FileReport> {
    let progress: Vec<Progress> = paths.iter().map(|_| Progress::default()).collect();
    let progress = &progress;
    let (job_tx, job_rx) = unbounded();
    for job in paths.iter().enumerate() {
        // The receiver is still alive, so this can't fail
        let _ = job_tx.send(job);
    }
    drop(job_tx);
    let (report_tx, report_rx) = unbounded();
    let (done_tx, done_rx) = bounded::<()>(0);
    let workers = options.threads.clamp(1, paths.len().max(1));
    info!(files = paths.len(), workers, "Starting validation");

    thread::scope(|s| {
        s.spawn(move || watch(paths, progress, done_rx, options.progress_interval));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let jobs = job_rx.clone();
                let reports = report_tx.clone();
                s.spawn(move || {
                    for (i, path) in jobs {
                        let report = validate_file(path, config, options, &progress[i], cancel);
                        report.log();
                        let _ = reports.send((i, report));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Validation worker panicked");
            }
        }
        drop(done_tx);
    });
    drop(report_tx);

    let mut reports: Vec<Option<FileReport>> = vec![None; paths.len()];
    for (i, report) in report_rx.try_iter() {
        reports[i] = Some(report);
    }
    reports
        .into_iter()
        .zip(paths)
        .map(|(report, path)| {
            report.unwrap_or_else(|| {
                FileReport::failed(path, StreamStats::default(), None, "worker died".to_owned())
            })
        })
        .collect()
}

/// Accumulated ACMs of a run, one accumulator per frequency group
#[derive(Debug, Default)]
pub struct AcmRun {
    pub accumulators: BTreeMap<u16, AcmAccumulator>,
    pub reports: Vec<FileReport>,
    pub cancelled: bool,
}

fn accumulate_source<S: PacketSource + ?Sized>(
    source: &mut S,
    assembler: &mut FrameAssembler,
    accumulators: &mut BTreeMap<u16, AcmAccumulator>,
    config: &StreamConfig,
    integration: Integration,
    cancel: &AtomicBool,
) -> Result<bool> {
    while let Some(frame) = assembler.next_frame(source)? {
        if let AssembledFrame::Complete(frame) = frame {
            accumulators
                .entry(frame.freq_group)
                .or_insert_with(|| AcmAccumulator::new(config, integration))
                .accumulate(&frame)?;
        }
        if cancel.load(Ordering::Relaxed) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fold every complete frame of every file into per-group ACM sums.
///
/// Files are read in order as one stream, so a frame split across two files is
/// still assembled. One that can't be opened or read is reported and skipped;
/// frames it contributed before failing stay in the sums, and the sequence
/// starts over with the next file.
pub fn compute_acm(
    paths: &[PathBuf],
    config: &StreamConfig,
    options: &AcmOptions,
    cancel: &AtomicBool,
) -> Result<AcmRun> {
    let mut assembler = FrameAssembler::new(config)?;
    let mut run = AcmRun::default();
    for path in paths {
        if cancel.load(Ordering::Relaxed) {
            run.cancelled = true;
            warn!(path = %path.display(), "Cancelled before reading");
            break;
        }
        let before = assembler.stats().clone();
        let mut expected_packets = None;
        let mut skipped_frames = 0;
        let result = capture::open(path, kind_for(path, options.kind)).and_then(|mut source| {
            expected_packets = source.packet_count();
            let cancelled = accumulate_source(
                source.as_mut(),
                &mut assembler,
                &mut run.accumulators,
                config,
                options.integration,
                cancel,
            );
            skipped_frames = source.skipped_frames();
            cancelled
        });
        if result.is_err() {
            assembler.reset();
        }
        let mut stats = assembler.stats().since(&before);
        stats.skipped_frames = skipped_frames;
        let report = match result {
            Ok(cancelled) => {
                run.cancelled |= cancelled;
                FileReport {
                    path: path.to_owned(),
                    expected_packets,
                    stats,
                    cancelled,
                    ..Default::default()
                }
            }
            Err(e) => FileReport::failed(path, stats, expected_packets, e.to_string()),
        };
        report.log();
        run.reports.push(report);
        if run.cancelled {
            break;
        }
    }
    // Whatever is left never got its last element
    if assembler.flush().is_some() {
        if let Some(last) = run.reports.last_mut() {
            last.stats.incomplete_frames += 1;
        }
    }
    for (group, acc) in &run.accumulators {
        info!(group, frames = acc.frame_count(), "Accumulated frequency group");
    }
    Ok(run)
}

pub fn summarize(reports: &[FileReport]) -> Summary {
    let mut summary = Summary::default();
    for report in reports {
        if report.is_ok() {
            summary.add(&report.stats, report.expected_packets);
        } else {
            summary.add_failure(report.expected_packets);
        }
    }
    summary
}
