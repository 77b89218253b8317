//! CODIF payload codec.
//!
//! A payload holds 128 time samples of 7 channels in 2 polarizations. Each
//! sample is 4 bytes on the wire: two big-endian 16-bit halves, real first.
//! The recorder writes the halves as unsigned 16-bit words; they are
//! reinterpreted here as two's complement.

use crate::{
    complex::ComplexSample,
    error::{CodifError, Result},
    CHANNELS, PAYLOAD_SIZE, POLARIZATIONS, SAMPLES_PER_PACKET, SAMPLE_SIZE,
};

const N_SAMPLES: usize = SAMPLES_PER_PACKET * CHANNELS * POLARIZATIONS;

#[inline]
fn index(time: usize, channel: usize, pol: usize) -> usize {
    (time * CHANNELS + channel) * POLARIZATIONS + pol
}

/// Samples indexed by `[time][channel][polarization]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    samples: Box<[ComplexSample]>,
}

impl Payload {
    pub fn zeroed() -> Self {
        Self {
            samples: vec![ComplexSample::default(); N_SAMPLES].into_boxed_slice(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAYLOAD_SIZE {
            return Err(CodifError::MalformedPayload {
                needed: PAYLOAD_SIZE,
                got: bytes.len(),
            });
        }
        // Wire order is time, then channel, then polarization, which is also
        // our storage order
        let samples = bytes[..PAYLOAD_SIZE]
            .chunks_exact(SAMPLE_SIZE)
            .map(|s| {
                let re = u16::from_be_bytes([s[0], s[1]]);
                let im = u16::from_be_bytes([s[2], s[3]]);
                ComplexSample::new(re as i16, im as i16)
            })
            .collect();
        Ok(Self { samples })
    }

    pub fn encode(&self) -> [u8; PAYLOAD_SIZE] {
        let mut bytes = [0u8; PAYLOAD_SIZE];
        for (chunk, sample) in bytes.chunks_exact_mut(SAMPLE_SIZE).zip(self.samples.iter()) {
            chunk[..2].copy_from_slice(&(sample.re as u16).to_be_bytes());
            chunk[2..].copy_from_slice(&(sample.im as u16).to_be_bytes());
        }
        bytes
    }

    pub fn sample(&self, time: usize, channel: usize, pol: usize) -> ComplexSample {
        self.samples[index(time, channel, pol)]
    }

    pub fn set_sample(&mut self, time: usize, channel: usize, pol: usize, value: ComplexSample) {
        self.samples[index(time, channel, pol)] = value;
    }

    pub fn samples(&self) -> &[ComplexSample] {
        &self.samples
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::zeroed()
    }
}
