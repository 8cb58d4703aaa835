//! A fixed-width representation for 256-bit block and transaction identifiers.
//!
//! Users can refer to a block either by the usual big-endian hex string (what block explorers
//! show) or by a native integer. Both end up as a [`Hash256`], which stores the value as 32
//! little-endian bytes. That is also the internal byte order of rust-bitcoin hashes, so locators
//! built from a [`Hash256`] serialize as eight little-endian 32-bit chunks, least significant
//! chunk first.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use bitcoin::hashes::Hash as _;
use bitcoin::BlockHash;
use bitcoin::Txid;

/// A 256-bit unsigned integer, stored little-endian.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Errors returned while parsing a hex string into a [`Hash256`]
pub enum HashParseError {
    /// The string has no digits
    Empty,

    /// More than 64 hex digits, doesn't fit in 256 bits
    TooLong(usize),

    /// rust-bitcoin's hex decoder refused the digits
    InvalidHex(String),
}

impl Display for HashParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HashParseError::Empty => write!(f, "Empty hash string"),
            HashParseError::TooLong(len) => {
                write!(f, "Hash has {len} hex digits, at most 64 are allowed")
            }
            HashParseError::InvalidHex(err) => write!(f, "Invalid hex: {err}"),
        }
    }
}

impl std::error::Error for HashParseError {}

impl Hash256 {
    /// The all-zeros hash, used as the `stop_hash` of locator requests
    pub const ZERO: Hash256 = Hash256([0; 32]);

    /// Builds a hash from its little-endian byte representation
    pub const fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    /// Returns the little-endian byte representation
    pub const fn to_le_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Builds a hash from four 64-bit limbs, least significant limb first
    pub fn from_limbs(limbs: [u64; 4]) -> Self {
        let mut bytes = [0u8; 32];
        for (chunk, limb) in bytes.chunks_exact_mut(8).zip(limbs.iter()) {
            chunk.copy_from_slice(&limb.to_le_bytes());
        }
        Hash256(bytes)
    }

    /// Splits this hash into the eight little-endian 32-bit words used on the wire, least
    /// significant word first
    pub fn to_le_chunks(&self) -> [u32; 8] {
        let mut chunks = [0u32; 8];
        for (word, bytes) in chunks.iter_mut().zip(self.0.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        chunks
    }

    /// Parses a big-endian hex string, as displayed by block explorers.
    ///
    /// An optional `0x` prefix is accepted, and strings shorter than 64 digits are treated as
    /// numbers, that is, zero-extended on the most significant side.
    pub fn from_be_hex(s: &str) -> Result<Self, HashParseError> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if digits.is_empty() {
            return Err(HashParseError::Empty);
        }

        if digits.len() > 64 {
            return Err(HashParseError::TooLong(digits.len()));
        }

        // `BlockHash` parses exactly 64 digits in display order
        let padded = format!("{digits:0>64}");
        let hash = BlockHash::from_str(&padded)
            .map_err(|e| HashParseError::InvalidHex(e.to_string()))?;

        Ok(Hash256::from(hash))
    }
}

impl FromStr for Hash256 {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash256::from_be_hex(s)
    }
}

impl Display for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BlockHash::from(*self))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl From<u64> for Hash256 {
    fn from(value: u64) -> Self {
        Hash256::from_limbs([value, 0, 0, 0])
    }
}

impl From<u128> for Hash256 {
    fn from(value: u128) -> Self {
        Hash256::from_limbs([value as u64, (value >> 64) as u64, 0, 0])
    }
}

impl From<[u64; 4]> for Hash256 {
    fn from(limbs: [u64; 4]) -> Self {
        Hash256::from_limbs(limbs)
    }
}

impl From<BlockHash> for Hash256 {
    fn from(hash: BlockHash) -> Self {
        Hash256(hash.to_byte_array())
    }
}

impl From<Txid> for Hash256 {
    fn from(txid: Txid) -> Self {
        Hash256(txid.to_byte_array())
    }
}

impl From<Hash256> for BlockHash {
    fn from(hash: Hash256) -> Self {
        BlockHash::from_byte_array(hash.0)
    }
}

impl From<Hash256> for Txid {
    fn from(hash: Hash256) -> Self {
        Txid::from_byte_array(hash.0)
    }
}
