//! Inbound frame reassembly
//!
//! Serial reads deliver arbitrary chunks, so a response may be split across
//! several reads or several responses may arrive in one. [`FrameAssembler`]
//! uses the payload length field to cut the byte stream into whole frames.
//! [`ChunkCodec`] keeps the simpler behaviour of treating each read as one frame.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Raw header byte of a successful response
const SUCCESS_BYTE: u8 = 0xAA;
/// Raw header byte of an error response
const ERROR_BYTE: u8 = 0xEE;
/// Header, address, register and the two length bytes
const PREFIX_LEN: usize = 6;
/// Trailing checksum byte
const CHECKSUM_LEN: usize = 1;

/// Default upper bound on the payload length field, in 16-bit words
pub const DEFAULT_MAX_PAYLOAD_WORDS: u16 = 16;

/// One unit produced by an inbound codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes forming one frame
    Frame(Vec<u8>),
    /// Bytes skipped while searching for a frame header
    Discarded(Vec<u8>),
}

/// Length-driven reassembler for JRT response frames
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    max_payload_words: u16,
}

impl FrameAssembler {
    /// Create an assembler rejecting length fields above `max_payload_words`
    pub fn new(max_payload_words: u16) -> Self {
        Self { max_payload_words }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_WORDS)
    }
}

impl Decoder for FrameAssembler {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        // Never return Err here: that would end the read loop on line noise.
        match src
            .iter()
            .position(|b| *b == SUCCESS_BYTE || *b == ERROR_BYTE)
        {
            Some(0) => {}
            Some(n) => return Ok(Some(Inbound::Discarded(src.split_to(n).to_vec()))),
            None if src.is_empty() => return Ok(None),
            None => return Ok(Some(Inbound::Discarded(src.split().to_vec()))),
        }

        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let words = u16::from_be_bytes([src[4], src[5]]);
        if words > self.max_payload_words {
            // Not a real header; drop it and resync on the next candidate.
            return Ok(Some(Inbound::Discarded(src.split_to(1).to_vec())));
        }

        let total = PREFIX_LEN + 2 * words as usize + CHECKSUM_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(Inbound::Frame(src.split_to(total).to_vec())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(Inbound::Discarded(src.split().to_vec()))),
        }
    }
}

/// Treats every chunk read from the port as one complete frame
#[derive(Debug, Clone, Default)]
pub struct ChunkCodec;

impl Decoder for ChunkCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(Inbound::Frame(src.split().to_vec())))
    }
}

/// Codec selected by [`SensorConfig::reassemble_frames`](crate::config::SensorConfig)
#[derive(Debug, Clone)]
pub enum InboundCodec {
    /// Reassemble frames by their length field
    Assemble(FrameAssembler),
    /// One read, one frame
    Chunk(ChunkCodec),
}

impl InboundCodec {
    /// Codec for the given configuration flags
    pub fn new(reassemble: bool, max_payload_words: u16) -> Self {
        if reassemble {
            InboundCodec::Assemble(FrameAssembler::new(max_payload_words))
        } else {
            InboundCodec::Chunk(ChunkCodec)
        }
    }
}

impl Decoder for InboundCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        match self {
            InboundCodec::Assemble(codec) => codec.decode(src),
            InboundCodec::Chunk(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        match self {
            InboundCodec::Assemble(codec) => codec.decode_eof(src),
            InboundCodec::Chunk(codec) => codec.decode_eof(src),
        }
    }
}
