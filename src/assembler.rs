//! Groups the per-element packet stream into data frames.

use tracing::{debug, trace};

use crate::{
    capture::PacketSource,
    error::Result,
    header::LightHeader,
    monitoring::StreamStats,
    packet::CodifPacket,
    validator::{SequenceValidator, Transition},
    StreamConfig,
};

/// A frame under construction, or one that never got all of its elements
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub epoch_seconds: u32,
    pub frame_number: u32,
    pub freq_group: u16,
    /// Indexed by beam id
    pub slots: Vec<Option<CodifPacket>>,
}

impl DataFrame {
    fn new(header: &LightHeader, n_elements: usize) -> Self {
        Self {
            epoch_seconds: header.epoch_seconds,
            frame_number: header.frame_number,
            freq_group: header.freq_group,
            slots: vec![None; n_elements],
        }
    }

    fn key(&self) -> (u32, u32) {
        (self.epoch_seconds, self.frame_number)
    }

    /// Number of elements present
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// A frame with exactly one packet per element, in beam id order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteFrame {
    pub epoch_seconds: u32,
    pub frame_number: u32,
    pub freq_group: u16,
    pub packets: Vec<CodifPacket>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssembledFrame {
    Complete(CompleteFrame),
    Incomplete(DataFrame),
}

impl AssembledFrame {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

pub struct FrameAssembler {
    n_elements: usize,
    skip_payload: bool,
    validator: SequenceValidator,
    working: Option<DataFrame>,
    pending: Option<AssembledFrame>,
    stats: StreamStats,
}

impl FrameAssembler {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            n_elements: config.n_elements,
            skip_payload: false,
            validator: SequenceValidator::new(config)?,
            working: None,
            pending: None,
            stats: StreamStats::default(),
        })
    }

    /// Build frames from headers only. Frames assembled this way can be counted
    /// but not accumulated.
    pub fn skip_payload(mut self, skip: bool) -> Self {
        self.skip_payload = skip;
        self
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Pull packets from `source` until a frame can be emitted.
    ///
    /// A frame is emitted when its last element arrives, or as `Incomplete` when
    /// a packet of a different frame shows up before that. Returns `None` once
    /// the source runs dry. A partial frame left at that point is kept, so the
    /// next source can finish it; call [`FrameAssembler::flush`] after the last
    /// one.
    pub fn next_frame<S: PacketSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<AssembledFrame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        loop {
            let bytes = match source.next_packet(self.skip_payload)? {
                Some(bytes) => bytes,
                None => return Ok(None),
            };
            let light = LightHeader::decode(bytes)?;
            let transition = self.validator.classify(&light);
            self.stats.record(transition);
            if transition == Transition::Zeroed {
                continue;
            }
            let beam = light.beam_id as usize;
            if beam >= self.n_elements {
                trace!(beam, "Beam id outside of the array");
                continue;
            }
            let packet = CodifPacket::decode(bytes, self.skip_payload)?;

            let key = (light.epoch_seconds, light.frame_number);
            let interrupted = self.working.as_ref().map_or(false, |w| w.key() != key);
            let stale = if interrupted { self.working.take() } else { None };
            let n_elements = self.n_elements;
            let working = self
                .working
                .get_or_insert_with(|| DataFrame::new(&light, n_elements));
            working.slots[beam] = Some(packet);

            let emitted = if beam == self.n_elements - 1 {
                self.working.take().map(|frame| self.finish(frame))
            } else {
                None
            };
            match (stale, emitted) {
                (Some(stale), emitted) => {
                    debug!(
                        frame = stale.frame_number,
                        filled = stale.filled(),
                        "Frame interrupted by the next one"
                    );
                    self.stats.incomplete_frames += 1;
                    self.pending = emitted;
                    return Ok(Some(AssembledFrame::Incomplete(stale)));
                }
                (None, Some(frame)) => return Ok(Some(frame)),
                (None, None) => continue,
            }
        }
    }

    /// Give up on the frame being built, counting it as incomplete
    pub fn flush(&mut self) -> Option<AssembledFrame> {
        let partial = self.working.take()?;
        debug!(
            frame = partial.frame_number,
            filled = partial.filled(),
            "Flushing partial frame"
        );
        self.stats.incomplete_frames += 1;
        Some(AssembledFrame::Incomplete(partial))
    }

    /// Flush and forget the sequence reference. Used when the stream breaks off,
    /// e.g. a file failing partway through.
    pub fn reset(&mut self) -> Option<AssembledFrame> {
        self.validator.reset();
        self.flush()
    }

    fn finish(&mut self, frame: DataFrame) -> AssembledFrame {
        if !frame.is_complete() {
            self.stats.incomplete_frames += 1;
            return AssembledFrame::Incomplete(frame);
        }
        self.stats.complete_frames += 1;
        AssembledFrame::Complete(CompleteFrame {
            epoch_seconds: frame.epoch_seconds,
            frame_number: frame.frame_number,
            freq_group: frame.freq_group,
            packets: frame.slots.into_iter().flatten().collect(),
        })
    }
}
