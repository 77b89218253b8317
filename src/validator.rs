//! Packet ordering checks.
//!
//! Packets arrive element by element: beam ids 0..N-1 of one frame, then beam 0
//! of the next frame. Frame numbers wrap to 0 at the end of each period, at which
//! point the epoch seconds advance by the header's `period`.

use serde::Serialize;
use tracing::debug;

use crate::{error::Result, header::LightHeader, StreamConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Transition {
    InOrder,
    /// Lost, duplicated or reordered packet
    Faulty,
    /// All-zero sentinel packet
    Zeroed,
}

/// Where the last observed packet sat in the stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SequencePosition {
    pub beam_id: u16,
    pub frame_number: u32,
    pub epoch_seconds: u32,
}

impl From<&LightHeader> for SequencePosition {
    fn from(header: &LightHeader) -> Self {
        Self {
            beam_id: header.beam_id,
            frame_number: header.frame_number,
            epoch_seconds: header.epoch_seconds,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SequenceValidator {
    n_elements: u32,
    frame_period: u32,
    reference: Option<SequencePosition>,
}

impl SequenceValidator {
    /// Fails if `config` has no elements or a zero frame period
    pub fn new(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            n_elements: config.n_elements as u32,
            frame_period: config.frame_period,
            reference: None,
        })
    }

    /// Classify the step from the last observed packet to `header`.
    ///
    /// The reference always advances to `header`, fault or not. The first packet
    /// seen is in order by definition.
    pub fn classify(&mut self, header: &LightHeader) -> Transition {
        let transition = match self.reference {
            None => Transition::InOrder,
            Some(reference) => {
                if self.follows(&reference, header) {
                    Transition::InOrder
                } else if header.is_zeroed() {
                    Transition::Zeroed
                } else {
                    debug!(
                        beam = header.beam_id,
                        frame = header.frame_number,
                        epoch = header.epoch_seconds,
                        ref_beam = reference.beam_id,
                        ref_frame = reference.frame_number,
                        ref_epoch = reference.epoch_seconds,
                        "Packet not in order"
                    );
                    Transition::Faulty
                }
            }
        };
        self.reference = Some(header.into());
        transition
    }

    fn follows(&self, reference: &SequencePosition, header: &LightHeader) -> bool {
        let beam = header.beam_id as u32;
        let ref_beam = reference.beam_id as u32;
        if beam == ref_beam + 1 {
            // Next element of the same frame
            header.frame_number == reference.frame_number
                && header.epoch_seconds == reference.epoch_seconds
        } else if ref_beam == self.n_elements - 1 && beam == 0 {
            // First element of the next frame
            let next_frame = header.frame_number == reference.frame_number.wrapping_add(1)
                && header.epoch_seconds == reference.epoch_seconds;
            let next_period = header.frame_number == 0
                && reference.frame_number == self.frame_period - 1
                && header.epoch_seconds
                    == reference.epoch_seconds.wrapping_add(header.period as u32);
            next_frame || next_period
        } else {
            false
        }
    }

    /// The last observed packet, if any
    pub fn reference(&self) -> Option<SequencePosition> {
        self.reference
    }

    /// Forget the reference, so the next packet starts a fresh sequence
    pub fn reset(&mut self) {
        self.reference = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::CodifError, FRAME_PERIOD};

    const N: usize = 8;

    fn header(beam_id: u16, frame_number: u32, epoch_seconds: u32) -> LightHeader {
        LightHeader {
            beam_id,
            frame_number,
            epoch_seconds,
            period: 27,
            ..Default::default()
        }
    }

    fn validator() -> SequenceValidator {
        SequenceValidator::new(&StreamConfig::new(N)).unwrap()
    }

    #[test]
    fn test_rejects_degenerate_config() {
        assert!(matches!(
            SequenceValidator::new(&StreamConfig::new(0)),
            Err(CodifError::InvalidConfig(_))
        ));
        let config = StreamConfig::new(N).with_frame_period(0);
        assert!(SequenceValidator::new(&config).is_err());
    }

    #[test]
    fn test_reset_forgets_reference() {
        let mut v = validator();
        v.classify(&header(2, 10, 1000));
        v.reset();
        assert!(v.reference().is_none());
        // Anything is in order straight after a reset
        assert_eq!(v.classify(&header(6, 40, 2000)), Transition::InOrder);
        assert_eq!(v.classify(&header(0, 40, 2000)), Transition::Faulty);
    }

    #[test]
    fn test_first_packet_in_order() {
        let mut v = validator();
        assert_eq!(v.classify(&header(5, 99, 1000)), Transition::InOrder);
        assert_eq!(v.reference().unwrap().beam_id, 5);
    }

    #[test]
    fn test_consecutive_frames() {
        let mut v = validator();
        for frame in 10..13 {
            for beam in 0..N as u16 {
                assert_eq!(v.classify(&header(beam, frame, 1000)), Transition::InOrder);
            }
        }
    }

    #[test]
    fn test_dropped_packet() {
        let mut v = validator();
        for beam in 0..=3 {
            v.classify(&header(beam, 10, 1000));
        }
        assert_eq!(v.classify(&header(5, 10, 1000)), Transition::Faulty);
        // The reference advanced, so the stream is in order again from here
        assert_eq!(v.classify(&header(6, 10, 1000)), Transition::InOrder);
    }

    #[test]
    fn test_mismatched_frame() {
        let mut v = validator();
        v.classify(&header(2, 10, 1000));
        assert_eq!(v.classify(&header(3, 11, 1000)), Transition::Faulty);
        let mut v = validator();
        v.classify(&header(7, 10, 1000));
        assert_eq!(v.classify(&header(0, 12, 1000)), Transition::Faulty);
    }

    #[test]
    fn test_epoch_rollover() {
        let mut v = validator();
        v.classify(&header(7, FRAME_PERIOD - 1, 1000));
        assert_eq!(v.classify(&header(0, 0, 1027)), Transition::InOrder);
        // Wrapping without the epoch moving on is a fault
        let mut v = validator();
        v.classify(&header(7, FRAME_PERIOD - 1, 1000));
        assert_eq!(v.classify(&header(0, 0, 1000)), Transition::Faulty);
    }

    #[test]
    fn test_zeroed_packet() {
        let mut v = validator();
        v.classify(&header(3, 10, 1000));
        let zero = LightHeader::default();
        assert_eq!(v.classify(&zero), Transition::Zeroed);
        assert_eq!(v.classify(&zero), Transition::Zeroed);
        // Coming back from zeros is a genuine break in the stream
        assert_eq!(v.classify(&header(4, 10, 1000)), Transition::Faulty);
    }

    #[test]
    fn test_zero_header_in_order_when_expected() {
        // Frame 0 of epoch 0 following the end of the previous period is data
        let mut v = validator();
        let mut last = header(7, FRAME_PERIOD - 1, 0);
        last.period = 0;
        v.classify(&last);
        let mut zero = LightHeader::default();
        zero.period = 0;
        assert_eq!(v.classify(&zero), Transition::InOrder);
    }
}
