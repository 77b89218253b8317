//! Error types for capture reading and CODIF decoding.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodifError>;

#[derive(Debug, Error)]
pub enum CodifError {
    /// The capture file could not be opened or read
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The capture library refused the file or a frame
    #[error("Capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("Malformed header: need {needed} bytes, got {got}")]
    MalformedHeader { needed: usize, got: usize },

    #[error("Malformed payload: need {needed} bytes, got {got}")]
    MalformedPayload { needed: usize, got: usize },

    /// A capability was requested from a source kind that does not have it
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A frame read with payload skipping can't feed the accumulator
    #[error("Packet for beam {beam_id} carries no payload")]
    MissingPayload { beam_id: u16 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An exported ACM container is missing a dataset or has the wrong shape
    #[error("Malformed ACM container: {0}")]
    MalformedContainer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
