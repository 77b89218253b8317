use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use codif_acm::{
    capture::{self, HeaderlessCapture},
    coordinator::{self, AcmOptions, ScanOptions},
    exfil::{AcmContainer, AcmCycle, FrequencyPlan},
    CaptureKind, CodifError, CodifHeader, PacketSource, Result,
};
use serde::Serialize;
use tracing::{debug, info, warn};

mod args;

use args::{convert_filter, Args, Command};

#[derive(Serialize)]
struct InspectedPacket<'a> {
    index: u64,
    timestamp: Option<String>,
    #[serde(flatten)]
    header: &'a CodifHeader,
}

fn inspect(file: &Path, kind: CaptureKind, start: u64, count: u64, json: bool) -> Result<()> {
    let mut source: Box<dyn PacketSource> = match kind {
        CaptureKind::Headerless => {
            let capture = HeaderlessCapture::open(file)?;
            for (key, value) in capture.metadata() {
                debug!(%key, %value, "Container header");
            }
            Box::new(capture)
        }
        CaptureKind::Network => capture::open(file, kind)?,
    };
    if start > 0 {
        source.seek_to_packet(start, 0)?;
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for index in start..start + count {
        let header = match source.next_packet(true)? {
            Some(bytes) => CodifHeader::decode(bytes)?,
            None => break,
        };
        let timestamp = header.timestamp().map(|t| t.to_rfc3339());
        if json {
            let packet = InspectedPacket {
                index,
                timestamp,
                header: &header,
            };
            serde_json::to_writer(&mut out, &packet)?;
            writeln!(out)?;
        } else {
            writeln!(
                out,
                "{:>10} beam {:>4} frame {:>7} epoch {:>10} group {:>5} {}",
                index,
                header.beam_id,
                header.frame_number,
                header.epoch_seconds,
                header.freq_group,
                timestamp.as_deref().unwrap_or("-")
            )?;
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

fn main() -> std::result::Result<(), CodifError> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    // Workers poll this between packets
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, finishing the current packet");
        flag.store(true, Ordering::Relaxed);
    }) {
        warn!("Couldn't install the Ctrl-C handler: {}", e);
    }

    match args.command {
        Command::Inspect {
            file,
            kind,
            start,
            count,
            json,
        } => {
            let kind = kind.map_or_else(|| CaptureKind::from_path(&file), Into::into);
            inspect(&file, kind, start, count, json)?;
        }
        Command::Validate {
            files,
            stream,
            threads,
            packets,
            faults,
            max_faults,
        } => {
            let config = stream.config()?;
            let options = ScanOptions {
                kind: stream.kind(),
                threads: threads as usize,
                packet_limit: packets,
                max_fault_records: max_faults,
                ..Default::default()
            };
            let reports = coordinator::validate_files(&files, &config, &options, &cancel);
            coordinator::summarize(&reports).log();
            if let Some(path) = faults {
                write_json(&path, &reports)?;
                info!(path = %path.display(), "Wrote file reports");
            }
        }
        Command::Acm {
            files,
            stream,
            integration,
            output,
            raw,
            normalize,
            min_count,
            first_channel_mhz,
            channel_width_mhz,
        } => {
            let config = stream.config()?;
            let options = AcmOptions {
                kind: stream.kind(),
                integration: integration.map(Into::into).unwrap_or_default(),
            };
            let run = coordinator::compute_acm(&files, &config, &options, &cancel)?;
            coordinator::summarize(&run.reports).log();
            if run.accumulators.is_empty() {
                warn!("No complete frames were found");
            }
            let plan = FrequencyPlan {
                first_channel_mhz,
                channel_width_mhz,
            };
            // One run is one integration cycle
            let cycle = AcmCycle::from_accumulators(&run.accumulators, &plan);
            let mut container = AcmContainer::new(vec![cycle]);
            if normalize {
                container = container.normalized(min_count);
            }
            if let Some(path) = output {
                container.save_json(&path)?;
            }
            if let Some(path) = raw {
                save_raw(&path, &container)?;
            }
        }
    }
    Ok(())
}

fn save_raw(path: &Path, container: &AcmContainer) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    container.write_raw(&mut writer)?;
    writer.flush()?;
    info!(path = %path.display(), "Wrote raw matrices");
    Ok(())
}
