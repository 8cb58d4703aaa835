//! Framing for the v1 p2p transport.
//!
//! Every message on the wire is a 24-byte header followed by the payload:
//!
//! ```text
//! | magic (4) | command (12, NUL padded) | length (4, LE) | checksum (4) | payload (length) |
//! ```
//!
//! where `checksum` is the first four bytes of `sha256d(payload)`. A TCP read may end anywhere,
//! so [`FrameCodec`] buffers whatever it is fed and only hands out a [`Frame`] once the header and
//! the whole payload are there. Payload (de)serialization by command name is delegated to
//! rust-bitcoin's [`NetworkMessage`].

use bitcoin::consensus::deserialize;
use bitcoin::consensus::deserialize_partial;
use bitcoin::consensus::encode;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::Magic;
use bitcoin::Network;
use thiserror::Error;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 24;

/// Maximum payload we are willing to buffer. Anything bigger is a protocol violation.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Checksum mismatch: header has {expected:02x?}, payload hashes to {found:02x?}")]
    ChecksumMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("Magic bits mismatch: expected {expected:02x?}, got {found:02x?}")]
    MagicMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("Payload of {0} bytes is over the size limit")]
    OversizedPayload(usize),

    #[error("Invalid command name {0:?}")]
    InvalidCommand(String),

    #[error("Couldn't deserialize payload: {0}")]
    Payload(#[from] encode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed message header
pub struct FrameHeader {
    pub magic: Magic,
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl Decodable for FrameHeader {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let magic = Magic::consensus_decode(reader)?;
        let command = <[u8; 12]>::consensus_decode(reader)?;
        let length = u32::consensus_decode(reader)?;
        let checksum = <[u8; 4]>::consensus_decode(reader)?;

        Ok(FrameHeader {
            magic,
            command,
            length,
            checksum,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One complete, checksum-verified message, not yet decoded
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// The command name, without the NUL padding
    pub fn command(&self) -> String {
        self.header
            .command
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect()
    }

    /// The exact bytes this frame had on the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.magic.to_bytes());
        bytes.extend_from_slice(&self.header.command);
        bytes.extend_from_slice(&self.header.length.to_le_bytes());
        bytes.extend_from_slice(&self.header.checksum);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Returns the first four bytes of `sha256d(payload)`
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload).to_byte_array();
    [hash[0], hash[1], hash[2], hash[3]]
}

#[derive(Debug, Clone)]
/// Encodes messages into frames, and reassembles frames out of an arbitrarily split byte
/// stream.
pub struct FrameCodec {
    magic: Magic,
    buffer: Vec<u8>,
}

impl FrameCodec {
    pub fn new(magic: Magic) -> Self {
        FrameCodec {
            magic,
            buffer: Vec::new(),
        }
    }

    pub fn for_network(network: Network) -> Self {
        FrameCodec::new(network.magic())
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// How many bytes are waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Serializes a message into a full frame
    pub fn encode(&self, message: &NetworkMessage) -> Vec<u8> {
        // rust-bitcoin only knows how to serialize whole frames, so we take the payload and the
        // command it wrote, and build our own header around it
        let raw = serialize(&RawNetworkMessage::new(self.magic, message.clone()));
        let mut command = [0u8; 12];
        command.copy_from_slice(&raw[4..16]);

        self.frame(command, &raw[HEADER_SIZE..])
    }

    /// Frames an already serialized payload
    pub fn encode_frame(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if command.len() > 12 || !command.is_ascii() {
            return Err(CodecError::InvalidCommand(command.to_string()));
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::OversizedPayload(payload.len()));
        }

        let mut padded = [0u8; 12];
        padded[..command.len()].copy_from_slice(command.as_bytes());

        Ok(self.frame(padded, payload))
    }

    fn frame(&self, command: [u8; 12], payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&self.magic.to_bytes());
        bytes.extend_from_slice(&command);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&checksum(payload));
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Buffers `bytes` and returns the first complete frame, if there is one.
    ///
    /// A single read may carry more than one frame, callers should keep calling
    /// [`FrameCodec::next_frame`] until it returns `None`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Frame>, CodecError> {
        self.buffer.extend_from_slice(bytes);
        self.next_frame()
    }

    /// Takes the next complete frame out of the buffer, without reading anything new
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header: FrameHeader = deserialize_partial(&self.buffer[..HEADER_SIZE])?.0;
        let length = header.length as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(CodecError::OversizedPayload(length));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        self.buffer.drain(..HEADER_SIZE + length);

        if header.magic != self.magic {
            return Err(CodecError::MagicMismatch {
                expected: self.magic.to_bytes(),
                found: header.magic.to_bytes(),
            });
        }

        let found = checksum(&payload);
        if found != header.checksum {
            return Err(CodecError::ChecksumMismatch {
                expected: header.checksum,
                found,
            });
        }

        Ok(Some(Frame { header, payload }))
    }

    /// Decodes the payload of a frame according to its command. Commands we don't know about
    /// become [`NetworkMessage::Unknown`].
    pub fn decode(&self, frame: &Frame) -> Result<NetworkMessage, CodecError> {
        let raw: RawNetworkMessage = deserialize(&frame.to_bytes())?;
        Ok(raw.into_payload())
    }
}
