//! Array covariance matrix (ACM) accumulation.
//!
//! For every channel of a block, the samples of all elements are stacked into
//! one vector, first polarization first:
//!
//! ```text
//! v = [x_0 .. x_{N-1}, y_0 .. y_{N-1}]
//! ```
//!
//! and the channel's matrix accumulates `v v^H`. The matrices hold raw sums;
//! normalisation is left to the caller (see [`AcmAccumulator::mean`]).

use num_traits::Zero;
use rayon::prelude::*;
use serde::Serialize;
use tracing::trace;

use crate::{
    assembler::CompleteFrame,
    complex::{widen, ComplexAcc},
    error::{CodifError, Result},
    payload::Payload,
    StreamConfig, SAMPLES_PER_PACKET,
};

/// Which time samples of a frame contribute to the accumulation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Integration {
    /// One snapshot per frame, taken from the first time sample
    #[default]
    FirstSample,
    /// Every time sample of the frame is a snapshot
    AllSamples,
}

impl Integration {
    fn snapshots(&self) -> usize {
        match self {
            Self::FirstSample => 1,
            Self::AllSamples => SAMPLES_PER_PACKET,
        }
    }
}

/// Square complex matrix, row-major
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelMatrix {
    dim: usize,
    data: Vec<ComplexAcc>,
}

impl ChannelMatrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![ComplexAcc::zero(); dim * dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> ComplexAcc {
        self.data[row * self.dim + col]
    }

    pub fn data(&self) -> &[ComplexAcc] {
        &self.data
    }

    /// `self += v v^H`
    pub fn add_outer(&mut self, v: &[ComplexAcc]) {
        assert_eq!(v.len(), self.dim);
        for (row, vi) in self.data.chunks_exact_mut(self.dim).zip(v) {
            if vi.is_zero() {
                continue;
            }
            for (acc, vj) in row.iter_mut().zip(v) {
                *acc += vi * vj.conj();
            }
        }
    }

    pub fn add(&mut self, other: &ChannelMatrix) {
        assert_eq!(self.dim, other.dim);
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            dim: self.dim,
            data: self.data.iter().map(|&x| x * factor).collect(),
        }
    }

    pub fn is_hermitian(&self, tolerance: f64) -> bool {
        (0..self.dim).all(|i| {
            (i..self.dim).all(|j| (self.get(i, j) - self.get(j, i).conj()).norm() <= tolerance)
        })
    }
}

/// Running ACM sums for one channel block
#[derive(Clone, Debug)]
pub struct AcmAccumulator {
    n_elements: usize,
    polarizations: usize,
    integration: Integration,
    freq_group: Option<u16>,
    matrices: Vec<ChannelMatrix>,
    frame_count: u64,
    snapshot_count: u64,
}

impl AcmAccumulator {
    pub fn new(config: &StreamConfig, integration: Integration) -> Self {
        Self {
            n_elements: config.n_elements,
            polarizations: config.polarizations,
            integration,
            freq_group: None,
            matrices: vec![ChannelMatrix::zeros(config.vector_len()); config.channels],
            frame_count: 0,
            snapshot_count: 0,
        }
    }

    /// Fold one complete frame into the running sums
    pub fn accumulate(&mut self, frame: &CompleteFrame) -> Result<()> {
        if frame.packets.len() != self.n_elements {
            return Err(CodifError::InvalidConfig(format!(
                "frame holds {} elements, accumulator expects {}",
                frame.packets.len(),
                self.n_elements
            )));
        }
        match self.freq_group {
            Some(group) if group != frame.freq_group => {
                return Err(CodifError::InvalidConfig(format!(
                    "frame of frequency group {} fed to accumulator of group {}",
                    frame.freq_group, group
                )))
            }
            _ => {}
        }
        let payloads = frame
            .packets
            .iter()
            .map(|p| {
                p.payload.as_ref().ok_or(CodifError::MissingPayload {
                    beam_id: p.header.beam_id,
                })
            })
            .collect::<Result<Vec<&Payload>>>()?;

        let n = self.n_elements;
        let dim = n * self.polarizations;
        let snapshots = self.integration.snapshots();
        // Channels are independent, each matrix is only touched by one task
        self.matrices
            .par_iter_mut()
            .enumerate()
            .for_each(|(channel, acm)| {
                let mut v = vec![ComplexAcc::zero(); dim];
                for time in 0..snapshots {
                    for (element, payload) in payloads.iter().enumerate() {
                        for pol in 0..self.polarizations {
                            v[pol * n + element] = widen(payload.sample(time, channel, pol));
                        }
                    }
                    acm.add_outer(&v);
                }
            });

        self.freq_group = Some(frame.freq_group);
        self.frame_count += 1;
        self.snapshot_count += snapshots as u64;
        trace!(
            frame = frame.frame_number,
            frames = self.frame_count,
            "Accumulated frame"
        );
        Ok(())
    }

    /// Add the sums of another accumulator over the same geometry
    pub fn merge(&mut self, other: &AcmAccumulator) -> Result<()> {
        if other.n_elements != self.n_elements
            || other.matrices.len() != self.matrices.len()
            || other.integration != self.integration
        {
            return Err(CodifError::InvalidConfig(
                "can't merge accumulators of different shape".to_owned(),
            ));
        }
        if let (Some(a), Some(b)) = (self.freq_group, other.freq_group) {
            if a != b {
                return Err(CodifError::InvalidConfig(format!(
                    "can't merge frequency groups {} and {}",
                    a, b
                )));
            }
        }
        for (mine, theirs) in self.matrices.iter_mut().zip(&other.matrices) {
            mine.add(theirs);
        }
        self.freq_group = self.freq_group.or(other.freq_group);
        self.frame_count += other.frame_count;
        self.snapshot_count += other.snapshot_count;
        Ok(())
    }

    /// Raw sums, one matrix per channel
    pub fn matrices(&self) -> &[ChannelMatrix] {
        &self.matrices
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count
    }

    pub fn freq_group(&self) -> Option<u16> {
        self.freq_group
    }

    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    /// Sums divided by the number of snapshots, `None` before the first frame
    pub fn mean(&self) -> Option<Vec<ChannelMatrix>> {
        if self.snapshot_count == 0 {
            return None;
        }
        let scale = 1.0 / self.snapshot_count as f64;
        Some(self.matrices.iter().map(|m| m.scaled(scale)).collect())
    }
}
