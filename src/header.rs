//! CODIF header codec.
//!
//! The header is eight big-endian 64-bit words. Bit positions below count from
//! the most significant bit of each word (bit 63).
//!
//! ```text
//! Word  Bits    Field
//! ----  ------  -----
//! 0     63      invalid
//! 0     62      is_complex
//! 0     61-32   epoch_seconds
//! 0     31-0    frame_number
//! 1     63-61   version
//! 1     60-56   bits_per_sample
//! 1     55-32   array_length
//! 1     31-26   ref_epoch_period
//! 1     25-22   sample_representation
//! 1     21-16   unassigned
//! 1     15-0    station_id
//! 2     63-48   block_length
//! 2     47-32   channels_per_thread
//! 2     31-16   freq_group
//! 2     15-0    beam_id
//! 3     63-48   reserved16
//! 3     47-32   period
//! 3     31-0    reserved32
//! 4     63-0    intervals_per_period
//! 5     63-32   sync_seq
//! 5     31-0    reserved32
//! 6     63-56   ext_data_version
//! 6     55-0    ext_user_data (high part)
//! 7     63-0    ext_user_data (low part)
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;

use crate::{
    error::{CodifError, Result},
    HEADER_SIZE, LIGHT_HEADER_SIZE, WORD_SIZE,
};

const fn mask(bits: u32) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[inline]
fn field(word: u64, shift: u32, bits: u32) -> u64 {
    (word >> shift) & mask(bits)
}

#[inline]
fn put(value: u64, shift: u32, bits: u32) -> u64 {
    (value & mask(bits)) << shift
}

fn read_words<const N: usize>(bytes: &[u8]) -> [u64; N] {
    let mut words = [0u64; N];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD_SIZE)) {
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(chunk);
        *word = u64::from_be_bytes(buf);
    }
    words
}

/// Every field of a CODIF header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CodifHeader {
    pub invalid: bool,
    pub is_complex: bool,
    /// Seconds since the reference epoch (30 bits)
    pub epoch_seconds: u32,
    /// Frame counter within the current period
    pub frame_number: u32,
    pub version: u8,
    pub bits_per_sample: u8,
    pub array_length: u32,
    /// Six-month periods since 2000-01-01
    pub ref_epoch_period: u8,
    pub sample_representation: u8,
    pub unassigned: u8,
    pub station_id: u16,
    pub block_length: u16,
    pub channels_per_thread: u16,
    /// Base channel index of the block (thread id)
    pub freq_group: u16,
    /// Element index, cycling 0..N-1 within a data frame
    pub beam_id: u16,
    pub reserved16: u16,
    /// Seconds covered by one frame-number period
    pub period: u16,
    pub reserved32_w3: u32,
    pub intervals_per_period: u64,
    pub sync_seq: u32,
    pub reserved32_w5: u32,
    pub ext_data_version: u8,
    /// Upper 56 bits of the extended user data (word 6)
    pub ext_user_data_hi: u64,
    /// Lower 64 bits of the extended user data (word 7)
    pub ext_user_data_lo: u64,
}

impl CodifHeader {
    /// Decode all header fields from the first 64 bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodifError::MalformedHeader {
                needed: HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let w: [u64; 8] = read_words(&bytes[..HEADER_SIZE]);
        Ok(Self {
            invalid: field(w[0], 63, 1) == 1,
            is_complex: field(w[0], 62, 1) == 1,
            epoch_seconds: field(w[0], 32, 30) as u32,
            frame_number: field(w[0], 0, 32) as u32,
            version: field(w[1], 61, 3) as u8,
            bits_per_sample: field(w[1], 56, 5) as u8,
            array_length: field(w[1], 32, 24) as u32,
            ref_epoch_period: field(w[1], 26, 6) as u8,
            sample_representation: field(w[1], 22, 4) as u8,
            unassigned: field(w[1], 16, 6) as u8,
            station_id: field(w[1], 0, 16) as u16,
            block_length: field(w[2], 48, 16) as u16,
            channels_per_thread: field(w[2], 32, 16) as u16,
            freq_group: field(w[2], 16, 16) as u16,
            beam_id: field(w[2], 0, 16) as u16,
            reserved16: field(w[3], 48, 16) as u16,
            period: field(w[3], 32, 16) as u16,
            reserved32_w3: field(w[3], 0, 32) as u32,
            intervals_per_period: w[4],
            sync_seq: field(w[5], 32, 32) as u32,
            reserved32_w5: field(w[5], 0, 32) as u32,
            ext_data_version: field(w[6], 56, 8) as u8,
            ext_user_data_hi: field(w[6], 0, 56),
            ext_user_data_lo: w[7],
        })
    }

    /// Pack the header back into its 64-byte wire form.
    /// Fields wider than their slot are truncated to the slot width.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let words = [
            put(self.invalid as u64, 63, 1)
                | put(self.is_complex as u64, 62, 1)
                | put(self.epoch_seconds as u64, 32, 30)
                | put(self.frame_number as u64, 0, 32),
            put(self.version as u64, 61, 3)
                | put(self.bits_per_sample as u64, 56, 5)
                | put(self.array_length as u64, 32, 24)
                | put(self.ref_epoch_period as u64, 26, 6)
                | put(self.sample_representation as u64, 22, 4)
                | put(self.unassigned as u64, 16, 6)
                | put(self.station_id as u64, 0, 16),
            put(self.block_length as u64, 48, 16)
                | put(self.channels_per_thread as u64, 32, 16)
                | put(self.freq_group as u64, 16, 16)
                | put(self.beam_id as u64, 0, 16),
            put(self.reserved16 as u64, 48, 16)
                | put(self.period as u64, 32, 16)
                | put(self.reserved32_w3 as u64, 0, 32),
            self.intervals_per_period,
            put(self.sync_seq as u64, 32, 32) | put(self.reserved32_w5 as u64, 0, 32),
            put(self.ext_data_version as u64, 56, 8) | put(self.ext_user_data_hi, 0, 56),
            self.ext_user_data_lo,
        ];
        let mut bytes = [0u8; HEADER_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(WORD_SIZE).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn light(&self) -> LightHeader {
        LightHeader {
            epoch_seconds: self.epoch_seconds,
            frame_number: self.frame_number,
            freq_group: self.freq_group,
            beam_id: self.beam_id,
            period: self.period,
        }
    }

    /// Start of the reference epoch this header counts from
    pub fn reference_epoch(&self) -> Option<DateTime<Utc>> {
        let year = 2000 + (self.ref_epoch_period / 2) as i32;
        let month = if self.ref_epoch_period % 2 == 0 { 1 } else { 7 };
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
    }

    /// UTC time of the first sample in this packet.
    /// `None` when the header doesn't say how long a frame lasts.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if self.intervals_per_period == 0 {
            return None;
        }
        let frame_ns = (self.frame_number as u128 * self.period as u128 * 1_000_000_000)
            / self.intervals_per_period as u128;
        let offset = Duration::seconds(self.epoch_seconds as i64)
            + Duration::nanoseconds(i64::try_from(frame_ns).ok()?);
        Some(self.reference_epoch()? + offset)
    }
}

/// The header fields the sequencing stages look at.
///
/// Decoding stops after word 3, so this is cheap enough to run on every packet
/// of a multi-terabyte scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LightHeader {
    pub epoch_seconds: u32,
    pub frame_number: u32,
    pub freq_group: u16,
    pub beam_id: u16,
    pub period: u16,
}

impl LightHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LIGHT_HEADER_SIZE {
            return Err(CodifError::MalformedHeader {
                needed: LIGHT_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let w: [u64; 4] = read_words(&bytes[..LIGHT_HEADER_SIZE]);
        Ok(Self {
            epoch_seconds: field(w[0], 32, 30) as u32,
            frame_number: field(w[0], 0, 32) as u32,
            freq_group: field(w[2], 16, 16) as u16,
            beam_id: field(w[2], 0, 16) as u16,
            period: field(w[3], 32, 16) as u16,
        })
    }

    /// All-zero sentinel written by the recorder when no data arrived
    pub fn is_zeroed(&self) -> bool {
        self.beam_id == 0 && self.epoch_seconds == 0 && self.frame_number == 0
    }
}
