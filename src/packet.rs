use crate::{error::Result, header::CodifHeader, payload::Payload, HEADER_SIZE, PACKET_SIZE};

/// One decoded CODIF packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodifPacket {
    pub header: CodifHeader,
    /// `None` when the payload was skipped while reading
    pub payload: Option<Payload>,
}

impl CodifPacket {
    pub fn new(header: CodifHeader, payload: Payload) -> Self {
        Self {
            header,
            payload: Some(payload),
        }
    }

    /// Decode a packet from a buffer starting at the CODIF header
    pub fn decode(bytes: &[u8], skip_payload: bool) -> Result<Self> {
        let header = CodifHeader::decode(bytes)?;
        let payload = if skip_payload {
            None
        } else {
            Some(Payload::decode(&bytes[HEADER_SIZE..])?)
        };
        Ok(Self { header, payload })
    }

    /// Wire form of the packet; a skipped payload is written as zeros
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(&self.header.encode());
        match &self.payload {
            Some(payload) => bytes.extend_from_slice(&payload.encode()),
            None => bytes.resize(PACKET_SIZE, 0),
        }
        bytes
    }
}
