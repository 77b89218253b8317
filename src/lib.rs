//! Reading CODIF packet streams from capture files and turning them into
//! array covariance matrices.

pub mod acm;
pub mod assembler;
pub mod capture;
pub mod complex;
pub mod coordinator;
pub mod error;
pub mod exfil;
pub mod header;
pub mod monitoring;
pub mod packet;
pub mod payload;
pub mod validator;

pub use acm::{AcmAccumulator, ChannelMatrix, Integration};
pub use assembler::{AssembledFrame, CompleteFrame, DataFrame, FrameAssembler};
pub use capture::{open, CaptureKind, HeaderlessCapture, NetworkCapture, PacketSource};
pub use error::{CodifError, Result};
pub use header::{CodifHeader, LightHeader};
pub use packet::CodifPacket;
pub use payload::Payload;
pub use validator::{SequenceValidator, Transition};

// Wire sizes
pub const HEADER_SIZE: usize = 64;
pub const LIGHT_HEADER_SIZE: usize = 32;
pub const WORD_SIZE: usize = 8;
pub const PAYLOAD_SIZE: usize = 7168;
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

// Lower protocol layers that may precede a CODIF header in a network capture
pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// Leading metadata block of a headerless (DADA) capture file
pub const DADA_HEADER_SIZE: usize = 4096;

// Payload geometry
pub const SAMPLES_PER_PACKET: usize = 128;
pub const CHANNELS: usize = 7;
pub const POLARIZATIONS: usize = 2;
pub const SAMPLE_SIZE: usize = 4;

// Defaults of the reference array
pub const N_ELEMENTS: usize = 36;
pub const FRAME_PERIOD: u32 = 250_000;

/// Read-only stream geometry shared by every stage of the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Number of elements (distinct beam ids) in one data frame
    pub n_elements: usize,
    /// Frame numbers run from 0 to `frame_period - 1` within an epoch period
    pub frame_period: u32,
    pub channels: usize,
    pub polarizations: usize,
}

impl StreamConfig {
    pub fn new(n_elements: usize) -> Self {
        Self {
            n_elements,
            ..Default::default()
        }
    }

    pub fn with_frame_period(mut self, frame_period: u32) -> Self {
        self.frame_period = frame_period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_elements == 0 || self.n_elements > u16::MAX as usize + 1 {
            return Err(CodifError::InvalidConfig(format!(
                "element count must be within 1..=65536, got {}",
                self.n_elements
            )));
        }
        if self.frame_period == 0 {
            return Err(CodifError::InvalidConfig(
                "frame period must be positive".to_owned(),
            ));
        }
        if self.channels != CHANNELS || self.polarizations != POLARIZATIONS {
            return Err(CodifError::InvalidConfig(format!(
                "payload geometry is fixed at {} channels and {} polarizations",
                CHANNELS, POLARIZATIONS
            )));
        }
        Ok(())
    }

    /// Length of the per-channel element/polarization vector
    pub fn vector_len(&self) -> usize {
        self.n_elements * self.polarizations
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            n_elements: N_ELEMENTS,
            frame_period: FRAME_PERIOD,
            channels: CHANNELS,
            polarizations: POLARIZATIONS,
        }
    }
}
