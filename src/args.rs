//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use codif_acm::{
    coordinator::DEFAULT_FAULT_RECORDS, exfil::MIN_COUNT, CaptureKind, CodifError, Integration,
    StreamConfig, FRAME_PERIOD, N_ELEMENTS,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the headers of packets in a capture
    Inspect {
        file: PathBuf,
        #[clap(short, long, value_enum)]
        kind: Option<Kind>,
        /// Packet to start from (headerless captures only)
        #[clap(short, long, default_value_t = 0)]
        start: u64,
        /// Number of packets to print
        #[clap(short = 'n', long, default_value_t = 10)]
        count: u64,
        /// One JSON object per line instead of a table
        #[clap(long)]
        json: bool,
    },
    /// Check packet ordering in many captures at once
    Validate {
        #[clap(required = true)]
        files: Vec<PathBuf>,
        #[clap(flatten)]
        stream: StreamArgs,
        /// Worker threads
        #[clap(short, long, default_value_t = 1)]
        #[clap(value_parser = clap::value_parser!(u64).range(1..))]
        threads: u64,
        /// Stop each file after this many packets
        #[clap(short, long)]
        packets: Option<u64>,
        /// Write per-file reports with fault records to this JSON file
        #[clap(short, long)]
        faults: Option<PathBuf>,
        /// Fault records kept per file
        #[clap(long, default_value_t = DEFAULT_FAULT_RECORDS)]
        max_faults: usize,
    },
    /// Accumulate array covariance matrices over captures
    Acm {
        #[clap(required = true)]
        files: Vec<PathBuf>,
        #[clap(flatten)]
        stream: StreamArgs,
        /// Time samples of each frame that feed the matrices
        #[clap(short, long, value_enum)]
        integration: Option<IntegrationMode>,
        /// Write the matrices as a JSON container
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Write the matrices as raw native-endian f64 pairs
        #[clap(long)]
        raw: Option<PathBuf>,
        /// Divide by integration count, zeroing matrices with too few
        #[clap(long)]
        normalize: bool,
        /// Integration counts at or below this are zeroed when normalizing
        #[clap(long, default_value_t = MIN_COUNT)]
        min_count: u64,
        /// Sky frequency of channel 0 (MHz)
        #[clap(long, default_value_t = 0.0)]
        first_channel_mhz: f64,
        /// Channel spacing (MHz)
        #[clap(long, default_value_t = 1.0)]
        channel_width_mhz: f64,
    },
}

#[derive(clap::Args, Debug)]
pub struct StreamArgs {
    /// Capture kind, guessed from the file extension if unset
    #[clap(short, long, value_enum)]
    pub kind: Option<Kind>,
    /// Number of array elements (beam ids) per frame
    #[clap(short, long, default_value_t = N_ELEMENTS)]
    pub elements: usize,
    /// Frame number wraparound
    #[clap(long, default_value_t = FRAME_PERIOD)]
    pub frame_period: u32,
}

impl StreamArgs {
    pub fn config(&self) -> Result<StreamConfig, CodifError> {
        let config = StreamConfig::new(self.elements).with_frame_period(self.frame_period);
        config.validate()?;
        Ok(config)
    }

    pub fn kind(&self) -> Option<CaptureKind> {
        self.kind.map(Into::into)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Kind {
    /// DADA file: metadata block followed by raw packets
    Dada,
    /// libpcap capture of the UDP stream
    Pcap,
}

impl From<Kind> for CaptureKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Dada => CaptureKind::Headerless,
            Kind::Pcap => CaptureKind::Network,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum IntegrationMode {
    /// First time sample of every frame
    First,
    /// Every time sample
    All,
}

impl From<IntegrationMode> for Integration {
    fn from(mode: IntegrationMode) -> Self {
        match mode {
            IntegrationMode::First => Integration::FirstSample,
            IntegrationMode::All => Integration::AllSamples,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
