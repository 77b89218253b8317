use std::{fs, path::Path, sync::atomic::AtomicBool};

use codif_acm::{
    complex::{ComplexAcc, ComplexSample},
    coordinator::{self, AcmOptions, ScanOptions},
    exfil::{AcmContainer, AcmCycle},
    AcmAccumulator, AssembledFrame, CaptureKind, CodifHeader, CodifPacket, FrameAssembler,
    HeaderlessCapture, Integration, Payload, StreamConfig, CHANNELS, DADA_HEADER_SIZE,
    ETHERNET_HEADER_SIZE, IPV4_HEADER_SIZE, SAMPLES_PER_PACKET, UDP_HEADER_SIZE,
};

const N: usize = 4;

/// Packets of `frames` consecutive frames. Element 0 carries 1+0j on
/// polarization 0 of channel 0, everything else is zero.
fn packets(frames: u32) -> Vec<Vec<u8>> {
    let mut out = vec![];
    for frame_number in 0..frames {
        for beam_id in 0..N as u16 {
            let header = CodifHeader {
                beam_id,
                frame_number,
                epoch_seconds: 1_000,
                freq_group: 21,
                period: 27,
                intervals_per_period: 250_000,
                ..Default::default()
            };
            let mut payload = Payload::zeroed();
            if beam_id == 0 {
                for t in 0..SAMPLES_PER_PACKET {
                    payload.set_sample(t, 0, 0, ComplexSample::new(1, 0));
                }
            }
            out.push(CodifPacket::new(header, payload).encode());
        }
    }
    out
}

fn write_dada(path: &Path, frames: u32) {
    let mut bytes = b"HDR_VERSION 1.0\nHDR_SIZE 4096\n".to_vec();
    bytes.resize(DADA_HEADER_SIZE, 0);
    for packet in packets(frames) {
        bytes.extend(packet);
    }
    fs::write(path, bytes).unwrap();
}

/// Classic little-endian pcap with every packet behind Ethernet/IPv4/UDP, led
/// by one short frame of unrelated traffic
fn write_pcap(path: &Path, frames: u32) {
    let mut bytes = vec![];
    bytes.extend(0xa1b2_c3d4u32.to_le_bytes());
    bytes.extend(2u16.to_le_bytes());
    bytes.extend(4u16.to_le_bytes());
    bytes.extend(0i32.to_le_bytes());
    bytes.extend(0u32.to_le_bytes());
    bytes.extend(65_535u32.to_le_bytes());
    bytes.extend(1u32.to_le_bytes());
    let prefix = ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE;
    let mut records = vec![vec![0u8; 60 - prefix]];
    records.extend(packets(frames));
    for (i, packet) in records.into_iter().enumerate() {
        let len = (prefix + packet.len()) as u32;
        bytes.extend((i as u32).to_le_bytes());
        bytes.extend(0u32.to_le_bytes());
        bytes.extend(len.to_le_bytes());
        bytes.extend(len.to_le_bytes());
        bytes.extend(vec![0u8; prefix]);
        bytes.extend(packet);
    }
    fs::write(path, bytes).unwrap();
}

fn assert_single_entry(acc: &AcmAccumulator, value: f64) {
    for (channel, matrix) in acc.matrices().iter().enumerate() {
        for i in 0..2 * N {
            for j in 0..2 * N {
                let expected = if (channel, i, j) == (0, 0, 0) {
                    ComplexAcc::new(value, 0.0)
                } else {
                    ComplexAcc::new(0.0, 0.0)
                };
                assert_eq!(matrix.get(i, j), expected, "channel {} ({}, {})", channel, i, j);
            }
        }
    }
}

#[test]
fn test_three_frames_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.dada");
    write_dada(&path, 3);

    let config = StreamConfig::new(N);
    let mut source = HeaderlessCapture::open(&path).unwrap();
    let mut assembler = FrameAssembler::new(&config).unwrap();
    let mut acc = AcmAccumulator::new(&config, Integration::FirstSample);
    while let Some(frame) = assembler.next_frame(&mut source).unwrap() {
        match frame {
            AssembledFrame::Complete(frame) => acc.accumulate(&frame).unwrap(),
            AssembledFrame::Incomplete(frame) => panic!("frame {} incomplete", frame.frame_number),
        }
    }
    assert_eq!(acc.frame_count(), 3);
    assert_eq!(acc.matrices().len(), CHANNELS);
    assert_single_entry(&acc, 3.0);
    assert_eq!(assembler.stats().faulty, 0);
}

#[test]
fn test_compute_acm_all_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.dada");
    write_dada(&path, 3);

    let options = AcmOptions {
        kind: Some(CaptureKind::Headerless),
        integration: Integration::AllSamples,
    };
    let run = coordinator::compute_acm(
        &[path],
        &StreamConfig::new(N),
        &options,
        &AtomicBool::new(false),
    )
    .unwrap();
    let acc = &run.accumulators[&21];
    assert_single_entry(acc, 3.0 * SAMPLES_PER_PACKET as f64);
    assert_eq!(acc.mean().unwrap()[0].get(0, 0), ComplexAcc::new(1.0, 0.0));

    let cycle = AcmCycle::from_accumulators(&run.accumulators, &Default::default());
    assert_eq!(cycle.sky_frequency[0], 21.0);
    let container = AcmContainer::new(vec![cycle]).normalized(10);
    assert_eq!(container.cycles[0].data[0][0][0], ComplexAcc::new(1.0, 0.0));

    let path = dir.path().join("acm.json");
    container.save_json(&path).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    // [cycle][frequency][row][col]
    assert_eq!(value["ACMdata"][0][0][0][0][0], 1.0);
    assert_eq!(value["ACMcount"][0][0], 3 * SAMPLES_PER_PACKET as u64);
    assert_eq!(value["skyFrequency"][0][0], 21.0);
}

#[test]
fn test_network_capture_matches_headerless() {
    let dir = tempfile::tempdir().unwrap();
    let dada = dir.path().join("capture.dada");
    let pcap = dir.path().join("capture.pcap");
    write_dada(&dada, 2);
    write_pcap(&pcap, 2);

    let config = StreamConfig::new(N);
    let run = coordinator::compute_acm(
        &[dada, pcap.clone()],
        &config,
        &AcmOptions::default(),
        &AtomicBool::new(false),
    )
    .unwrap();
    assert!(run.reports.iter().all(|r| r.is_ok()));
    assert_eq!(run.reports[1].stats.complete_frames, 2);
    assert_eq!(run.reports[0].stats.skipped_frames, 0);
    assert_eq!(run.reports[1].stats.skipped_frames, 1);
    assert_single_entry(&run.accumulators[&21], 4.0);

    let reports = coordinator::validate_files(
        &[pcap],
        &config,
        &ScanOptions::default(),
        &AtomicBool::new(false),
    );
    assert_eq!(reports[0].stats.packets, 8);
    assert_eq!(reports[0].stats.skipped_frames, 1);
    assert_eq!(coordinator::summarize(&reports).stats.skipped_frames, 1);
}

#[test]
fn test_validation_scan() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.dada");
    write_dada(&path, 6);

    let options = ScanOptions {
        threads: 4,
        ..Default::default()
    };
    let reports = coordinator::validate_files(
        &[path.clone(), path],
        &StreamConfig::new(N),
        &options,
        &AtomicBool::new(false),
    );
    let summary = coordinator::summarize(&reports);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.stats.packets, 48);
    assert_eq!(summary.stats.faulty, 0);
    assert_eq!(summary.completion_percent(), 100.0);
}
