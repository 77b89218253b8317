//! Packet sources over the two capture shapes we get CODIF data in.
//!
//! A headerless (DADA) capture is a 4096-byte ASCII metadata block followed by
//! back-to-back CODIF packets. A network capture is a pcap file whose frames may
//! still carry Ethernet, IPv4 and UDP headers in front of the CODIF header; which
//! of those are present is inferred from the frame length.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use tracing::{debug, trace};

use crate::{
    error::{CodifError, Result},
    DADA_HEADER_SIZE, ETHERNET_HEADER_SIZE, HEADER_SIZE, IPV4_HEADER_SIZE, PACKET_SIZE,
    PAYLOAD_SIZE, UDP_HEADER_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureKind {
    /// Metadata block + raw packets, as written by the disk recorder
    Headerless,
    /// libpcap capture of the UDP stream
    Network,
}

impl CaptureKind {
    /// Guess the kind from the file extension, defaulting to headerless
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pcap") => Self::Network,
            _ => Self::Headerless,
        }
    }
}

/// A lazy sequence of raw CODIF packet buffers.
///
/// Buffers returned by `next_packet` start at the CODIF header. With
/// `skip_payload` set they hold only the 64 header bytes.
pub trait PacketSource {
    fn next_packet(&mut self, skip_payload: bool) -> Result<Option<&[u8]>>;

    /// Reposition to packet `n` plus `byte_offset` bytes
    fn seek_to_packet(&mut self, _n: u64, _byte_offset: u64) -> Result<()> {
        Err(CodifError::UnsupportedOperation(
            "seeking is only supported on headerless captures",
        ))
    }

    fn at_end(&self) -> bool;

    /// Number of packets in the source, when it can be known up front
    fn packet_count(&self) -> Option<u64> {
        None
    }

    /// Records passed over because they couldn't hold a CODIF packet
    fn skipped_frames(&self) -> u64 {
        0
    }
}

/// Open `path` as a packet source of the given kind
pub fn open<P: AsRef<Path>>(path: P, kind: CaptureKind) -> Result<Box<dyn PacketSource>> {
    Ok(match kind {
        CaptureKind::Headerless => Box::new(HeaderlessCapture::open(path)?),
        CaptureKind::Network => Box::new(NetworkCapture::open(path)?),
    })
}

/// Read until `buf` is full or the reader is exhausted, returning the count
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub struct HeaderlessCapture<R> {
    reader: R,
    container_header: Vec<u8>,
    buf: Vec<u8>,
    size: u64,
    exhausted: bool,
}

impl HeaderlessCapture<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened headerless capture");
        Self::new(BufReader::with_capacity(4 * PACKET_SIZE, file))
    }
}

impl<R: Read + Seek> HeaderlessCapture<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let mut container_header = vec![0u8; DADA_HEADER_SIZE];
        reader.read_exact(&mut container_header)?;
        Ok(Self {
            reader,
            container_header,
            buf: vec![0u8; PACKET_SIZE],
            size,
            exhausted: false,
        })
    }

    /// The raw leading metadata block
    pub fn container_header(&self) -> &[u8] {
        &self.container_header
    }

    /// The leading metadata block as key/value pairs
    pub fn metadata(&self) -> BTreeMap<String, String> {
        parse_dada_header(&self.container_header)
    }
}

impl<R: Read + Seek> PacketSource for HeaderlessCapture<R> {
    fn next_packet(&mut self, skip_payload: bool) -> Result<Option<&[u8]>> {
        if self.exhausted {
            return Ok(None);
        }
        // Skip mode still reads the payload, it just isn't handed out
        let got = read_full(&mut self.reader, &mut self.buf)?;
        if got == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if got < HEADER_SIZE {
            self.exhausted = true;
            return Err(CodifError::MalformedHeader {
                needed: HEADER_SIZE,
                got,
            });
        }
        if got < PACKET_SIZE {
            self.exhausted = true;
            return Err(CodifError::MalformedPayload {
                needed: PAYLOAD_SIZE,
                got: got - HEADER_SIZE,
            });
        }
        let wanted = if skip_payload { HEADER_SIZE } else { PACKET_SIZE };
        Ok(Some(&self.buf[..wanted]))
    }

    /// Packet `n` counts from the end of the metadata block
    fn seek_to_packet(&mut self, n: u64, byte_offset: u64) -> Result<()> {
        let position = DADA_HEADER_SIZE as u64 + n * PACKET_SIZE as u64 + byte_offset;
        self.reader.seek(SeekFrom::Start(position))?;
        self.exhausted = false;
        Ok(())
    }

    fn at_end(&self) -> bool {
        self.exhausted
    }

    fn packet_count(&self) -> Option<u64> {
        Some(self.size.saturating_sub(DADA_HEADER_SIZE as u64) / PACKET_SIZE as u64)
    }
}

/// Parse the ASCII `KEY value` lines of a DADA metadata block
pub fn parse_dada_header(block: &[u8]) -> BTreeMap<String, String> {
    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    String::from_utf8_lossy(&block[..end])
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next()?;
            let value = parts.next().unwrap_or("").trim();
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Frame lengths at which each set of lower layers is present
const UDP_FRAME: usize = PACKET_SIZE + UDP_HEADER_SIZE;
const IPV4_FRAME: usize = UDP_FRAME + IPV4_HEADER_SIZE;
const ETHERNET_FRAME: usize = IPV4_FRAME + ETHERNET_HEADER_SIZE;

/// Drop the Ethernet/IPv4/UDP prefix from a captured frame, if its length says
/// one is there
pub fn strip_link_layers(frame: &[u8]) -> &[u8] {
    match frame.len() {
        ETHERNET_FRAME => &frame[ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE..],
        IPV4_FRAME => &frame[IPV4_HEADER_SIZE + UDP_HEADER_SIZE..],
        UDP_FRAME => &frame[UDP_HEADER_SIZE..],
        _ => frame,
    }
}

pub struct NetworkCapture {
    capture: pcap::Capture<pcap::Offline>,
    buf: Vec<u8>,
    skipped_frames: u64,
    exhausted: bool,
}

impl NetworkCapture {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let capture = pcap::Capture::from_file(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened network capture");
        Ok(Self {
            capture,
            buf: Vec::with_capacity(PACKET_SIZE),
            skipped_frames: 0,
            exhausted: false,
        })
    }
}

impl PacketSource for NetworkCapture {
    fn next_packet(&mut self, skip_payload: bool) -> Result<Option<&[u8]>> {
        if self.exhausted {
            return Ok(None);
        }
        let wanted = if skip_payload { HEADER_SIZE } else { PACKET_SIZE };
        loop {
            match self.capture.next() {
                Ok(packet) => {
                    let codif = strip_link_layers(packet.data);
                    if codif.len() < wanted {
                        // Other traffic on the wire; each frame stands alone so
                        // there's no alignment to lose
                        trace!(len = packet.data.len(), "Skipping non-CODIF frame");
                        self.skipped_frames += 1;
                        continue;
                    }
                    self.buf.clear();
                    self.buf.extend_from_slice(&codif[..wanted]);
                    return Ok(Some(&self.buf[..]));
                }
                Err(pcap::Error::NoMorePackets) => {
                    self.exhausted = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn at_end(&self) -> bool {
        self.exhausted
    }

    fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }
}
